//! Deterministic `authorized_keys` renderer (component D).
//!
//! Pure, plain string composition and sorted collections for stable
//! output — no templating engine — the same style as the teacher's
//! `deployment/mod.rs` result-message formatting.

use std::collections::BTreeSet;

use crate::keycodec::{render_serial_header, ParsedKey};
use crate::store::models::PublicKey;

pub const SYSTEM_KEY_RESTRICTIONS: &str =
    "command=\"internal-sftp\",no-port-forwarding,no-x11-forwarding,no-agent-forwarding,no-pty";
pub const SYSTEM_KEY_COMMENT: &str = "keymaster-system-key";

/// Renders the canonical `authorized_keys` body for one account.
///
/// `system_key_algorithm`/`system_key_data` describe the active system key;
/// `serial` is that key's serial. `global_keys` and `account_keys` are each
/// filtered for expiry and sorted by comment independently, then emitted
/// global-group-first, account-group-second, for byte-stable output with
/// group precedence preserved. `exclude` (used by decommission's keep-file
/// mode) drops matching key ids from the user-key section while the
/// system-key line is always present.
pub fn build_authorized_keys(
    serial: i64,
    system_key_algorithm: &str,
    system_key_data: &str,
    global_keys: &[PublicKey],
    account_keys: &[PublicKey],
    now: chrono::DateTime<chrono::Utc>,
    exclude: &BTreeSet<i64>,
) -> String {
    let mut out = String::new();
    out.push_str(&render_serial_header(serial as u64));
    out.push('\n');

    let system_line = ParsedKey {
        algorithm: system_key_algorithm.to_string(),
        key_data: system_key_data.to_string(),
        comment: String::new(),
    }
    .to_restricted_line(SYSTEM_KEY_RESTRICTIONS, SYSTEM_KEY_COMMENT);
    out.push_str(&system_line);
    out.push('\n');
    out.push('\n');

    let select = |keys: &[PublicKey]| -> Vec<&PublicKey> {
        let mut selected: Vec<&PublicKey> = keys
            .iter()
            .filter(|k| !exclude.contains(&k.id))
            .filter(|k| !is_expired(k, now))
            .collect();
        selected.sort_by(|a, b| a.comment.cmp(&b.comment));
        selected
    };

    for key in select(global_keys).into_iter().chain(select(account_keys)) {
        out.push_str(&format!("{} {} {}\n", key.algorithm, key.key_data, key.comment));
    }

    out
}

fn is_expired(key: &PublicKey, now: chrono::DateTime<chrono::Utc>) -> bool {
    match &key.expires_at {
        Some(ts) => match chrono::DateTime::parse_from_rfc3339(ts) {
            Ok(expiry) => expiry.with_timezone(&chrono::Utc) <= now,
            Err(_) => false,
        },
        None => false,
    }
}

/// Strips the Keymaster-managed block (serial header, system-key line, the
/// blank separator, and any key line whose comment is in `managed_comments`)
/// out of previously-deployed content, leaving any lines a human added by
/// hand untouched. Used by decommission's keep-file mode so the remote file
/// is not wiped wholesale.
pub fn strip_keymaster_block(content: &str, managed_comments: &BTreeSet<String>) -> String {
    let mut lines = content.lines().peekable();
    let mut kept: Vec<&str> = Vec::new();
    let mut saw_header = false;

    if let Some(first) = lines.peek() {
        if render_serial_header_matches(first) {
            saw_header = true;
            lines.next();
        }
    }

    for line in lines {
        let trimmed = line.trim();
        if saw_header && trimmed.is_empty() {
            saw_header = false;
            continue;
        }
        match crate::keycodec::ParsedKey::parse(trimmed) {
            Ok(parsed) if parsed.comment == SYSTEM_KEY_COMMENT || managed_comments.contains(&parsed.comment) => {
                continue;
            }
            _ => kept.push(line),
        }
    }

    kept.join("\n")
}

fn render_serial_header_matches(line: &str) -> bool {
    crate::keycodec::parse_serial_header(line).is_some()
}

/// Normalizes remote content for byte-for-byte strict-audit comparison:
/// CRLF to LF, trailing whitespace trimmed per line.
pub fn normalize_for_audit(content: &str) -> String {
    content
        .replace("\r\n", "\n")
        .lines()
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: i64, comment: &str, expires_at: Option<&str>) -> PublicKey {
        PublicKey {
            id,
            algorithm: "ssh-ed25519".into(),
            key_data: "AAAAC3NzaC1lZDI1NTE5AAAAI".into(),
            comment: comment.into(),
            is_global: false,
            expires_at: expires_at.map(str::to_string),
        }
    }

    #[test]
    fn renders_header_system_line_and_sorted_keys() {
        let now = chrono::Utc::now();
        // Global keys deliberately inserted out of comment order, and an
        // account key that would sort before them alphabetically, to pin
        // down that groups never interleave: every global key precedes
        // every account key regardless of comment.
        let global = vec![key(1, "zebra", None), key(3, "alice", None)];
        let account = vec![key(2, "alpha", None)];
        let rendered = build_authorized_keys(
            7,
            "ssh-ed25519",
            "AAAASYSTEMKEY",
            &global,
            &account,
            now,
            &BTreeSet::new(),
        );
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines[0], "# Keymaster Managed Keys (Serial: 7)");
        assert!(lines[1].starts_with(SYSTEM_KEY_RESTRICTIONS));
        assert!(lines[1].ends_with(SYSTEM_KEY_COMMENT));
        assert_eq!(lines[2], "");
        assert!(lines[3].ends_with("alice"));
        assert!(lines[4].ends_with("zebra"));
        assert!(lines[5].ends_with("alpha"));
    }

    #[test]
    fn expired_keys_are_skipped() {
        let now = chrono::Utc::now();
        let past = (now - chrono::Duration::days(1)).to_rfc3339();
        let global = vec![key(1, "stale", Some(&past))];
        let rendered = build_authorized_keys(
            1,
            "ssh-ed25519",
            "AAAASYSTEMKEY",
            &global,
            &[],
            now,
            &BTreeSet::new(),
        );
        assert!(!rendered.contains("stale"));
    }

    #[test]
    fn identical_inputs_produce_identical_bytes() {
        let now = chrono::Utc::now();
        let global = vec![key(1, "a", None)];
        let a = build_authorized_keys(1, "ssh-ed25519", "AAAA", &global, &[], now, &BTreeSet::new());
        let b = build_authorized_keys(1, "ssh-ed25519", "AAAA", &global, &[], now, &BTreeSet::new());
        assert_eq!(a, b);
    }

    #[test]
    fn exclude_set_removes_only_requested_keys() {
        let now = chrono::Utc::now();
        let account = vec![key(1, "alpha", None), key(2, "beta", None)];
        let mut exclude = BTreeSet::new();
        exclude.insert(1);
        let rendered =
            build_authorized_keys(1, "ssh-ed25519", "AAAA", &[], &account, now, &exclude);
        assert!(!rendered.contains("alpha"));
        assert!(rendered.contains("beta"));
    }

    #[test]
    fn normalize_strips_crlf_and_trailing_whitespace() {
        let raw = "line one  \r\nline two\r\n";
        assert_eq!(normalize_for_audit(raw), "line one\nline two");
    }

    #[test]
    fn strip_keymaster_block_preserves_hand_added_lines() {
        let now = chrono::Utc::now();
        let account = vec![key(1, "alpha", None)];
        let rendered = build_authorized_keys(3, "ssh-ed25519", "AAAASYSTEMKEY", &[], &account, now, &BTreeSet::new());
        let deployed = format!("{rendered}ssh-rsa AAAAHANDADDED human-added\n");

        let mut managed = BTreeSet::new();
        managed.insert("alpha".to_string());
        let stripped = strip_keymaster_block(&deployed, &managed);

        assert!(!stripped.contains(SYSTEM_KEY_COMMENT));
        assert!(!stripped.contains("alpha"));
        assert!(stripped.contains("human-added"));
    }
}
