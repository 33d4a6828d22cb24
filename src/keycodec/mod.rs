//! OpenSSH public-key line codec, strength classification and fingerprinting.
//!
//! Grounded in the teacher's enum-with-`From<&str>`-and-`Display` pattern
//! (`AgentStatus`, `DeploymentStrategy` in `db/models.rs` / `deployment/mod.rs`):
//! a small closed enum with explicit string round-tripping rather than a
//! derive macro, kept here because the wire format (an OpenSSH key line) is
//! not itself JSON/serde-shaped.

use crate::error::{KeymasterError, Result};
use base64::Engine;
use sha2::{Digest, Sha256};
use std::fmt;

/// Recognized OpenSSH public-key algorithm prefixes and their strength band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StrengthBand {
    Weak,
    Acceptable,
    Strong,
}

impl fmt::Display for StrengthBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrengthBand::Weak => write!(f, "weak"),
            StrengthBand::Acceptable => write!(f, "acceptable"),
            StrengthBand::Strong => write!(f, "strong"),
        }
    }
}

/// Classify an algorithm name into its strength band.
///
/// `ssh-rsa`/`ssh-dss` are weak; `ecdsa-sha2-nistp*` are acceptable;
/// `ssh-ed25519` (and its certificate variant) are strong.
pub fn classify_algorithm(algorithm: &str) -> Result<StrengthBand> {
    match algorithm {
        "ssh-rsa" | "ssh-dss" => Ok(StrengthBand::Weak),
        "ecdsa-sha2-nistp256" | "ecdsa-sha2-nistp384" | "ecdsa-sha2-nistp521" => {
            Ok(StrengthBand::Acceptable)
        }
        "ssh-ed25519" => Ok(StrengthBand::Strong),
        a if a.starts_with("ssh-ed25519-cert-v01@") => Ok(StrengthBand::Strong),
        other => Err(KeymasterError::UnknownAlgorithm(other.to_string())),
    }
}

/// A parsed OpenSSH public key: `<algorithm> <base64-key-data> [comment]`,
/// with an optional leading restrictions/options prefix stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedKey {
    pub algorithm: String,
    pub key_data: String,
    pub comment: String,
}

impl ParsedKey {
    /// Parse a single `authorized_keys`-style line. Leading whitespace-only or
    /// comment (`#`) lines are rejected by the caller, not here; this parses
    /// exactly one key line, tolerating a restrictions prefix (anything
    /// before the first recognized algorithm token).
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        if line.is_empty() {
            return Err(KeymasterError::MalformedKey("empty line".to_string()));
        }

        let tokens: Vec<&str> = line.split_whitespace().collect();
        let algo_idx = tokens
            .iter()
            .position(|t| is_known_algorithm_prefix(t))
            .ok_or_else(|| KeymasterError::MalformedKey("no algorithm token found".to_string()))?;

        let algorithm = tokens[algo_idx].to_string();
        let key_data = tokens
            .get(algo_idx + 1)
            .ok_or_else(|| KeymasterError::MalformedKey("missing key data".to_string()))?
            .to_string();

        validate_base64(&key_data)?;

        let comment = tokens[(algo_idx + 2).min(tokens.len())..].join(" ");

        Ok(Self {
            algorithm,
            key_data,
            comment,
        })
    }

    /// Emit a bare `authorized_keys`-format line: `<algorithm> <key_data> <comment>`.
    pub fn to_line(&self) -> String {
        if self.comment.is_empty() {
            format!("{} {}", self.algorithm, self.key_data)
        } else {
            format!("{} {} {}", self.algorithm, self.key_data, self.comment)
        }
    }

    /// Emit a line with a restrictions prefix and a forced trailing comment,
    /// as used for the system-key line in the rendered `authorized_keys`.
    pub fn to_restricted_line(&self, restrictions: &str, comment: &str) -> String {
        format!("{} {} {} {}", restrictions, self.algorithm, self.key_data, comment)
    }

    pub fn strength(&self) -> Result<StrengthBand> {
        classify_algorithm(&self.algorithm)
    }

    /// SHA-256 fingerprint in the canonical `SHA256:<base64-nopad>` form.
    pub fn fingerprint(&self) -> Result<Fingerprint> {
        fingerprint_key_data(&self.algorithm, &self.key_data)
    }
}

fn is_known_algorithm_prefix(token: &str) -> bool {
    matches!(
        token,
        "ssh-rsa" | "ssh-dss" | "ssh-ed25519" | "ecdsa-sha2-nistp256" | "ecdsa-sha2-nistp384"
            | "ecdsa-sha2-nistp521"
    ) || token.starts_with("ssh-ed25519-cert-v01@")
}

fn validate_base64(data: &str) -> Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| KeymasterError::MalformedKey(format!("invalid base64: {}", e)))
}

/// SHA-256 fingerprint of the raw (decoded) key material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint(String);

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SHA256:{}", self.0)
    }
}

/// Compute the fingerprint for an algorithm + base64 key-data pair, used both
/// by the codec and by host-key pinning comparisons.
pub fn fingerprint_key_data(algorithm: &str, key_data: &str) -> Result<Fingerprint> {
    let raw = validate_base64(key_data)?;
    let mut hasher = Sha256::new();
    hasher.update(&raw);
    let digest = hasher.finalize();
    let encoded = base64::engine::general_purpose::STANDARD_NO_PAD.encode(digest);
    let _ = algorithm; // algorithm participates only in display/context, not the digest
    Ok(Fingerprint(encoded))
}

/// Extract the serial from a Keymaster header line of the exact shape
/// `# Keymaster Managed Keys (Serial: N)` (case-sensitive, one ASCII space
/// around `:`).
pub fn parse_serial_header(line: &str) -> Option<u64> {
    const PREFIX: &str = "# Keymaster Managed Keys (Serial: ";
    const SUFFIX: &str = ")";
    let line = line.strip_suffix(SUFFIX)?;
    let digits = line.strip_prefix(PREFIX)?;
    digits.parse().ok()
}

/// Render the Keymaster header line for a given serial.
pub fn render_serial_header(serial: u64) -> String {
    format!("# Keymaster Managed Keys (Serial: {})", serial)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ED25519_SAMPLE: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIBbFIY6iamgzm3f20bnMJ5rZVnGZ5JUqMUV6VVN99SAH alice@example.com";

    #[test]
    fn parses_plain_key_line() {
        let parsed = ParsedKey::parse(ED25519_SAMPLE).unwrap();
        assert_eq!(parsed.algorithm, "ssh-ed25519");
        assert_eq!(parsed.comment, "alice@example.com");
    }

    #[test]
    fn parses_key_with_restrictions_prefix() {
        let line = format!(
            "no-pty,no-agent-forwarding {}",
            ED25519_SAMPLE
        );
        let parsed = ParsedKey::parse(&line).unwrap();
        assert_eq!(parsed.algorithm, "ssh-ed25519");
        assert_eq!(parsed.comment, "alice@example.com");
    }

    #[test]
    fn rejects_malformed_base64() {
        let line = "ssh-ed25519 not!base64!!! alice";
        assert!(matches!(
            ParsedKey::parse(line),
            Err(KeymasterError::MalformedKey(_))
        ));
    }

    #[test]
    fn rejects_unknown_algorithm() {
        let err = classify_algorithm("ssh-made-up").unwrap_err();
        assert!(matches!(err, KeymasterError::UnknownAlgorithm(_)));
    }

    #[test]
    fn classifies_strength_bands() {
        assert_eq!(classify_algorithm("ssh-rsa").unwrap(), StrengthBand::Weak);
        assert_eq!(classify_algorithm("ssh-dss").unwrap(), StrengthBand::Weak);
        assert_eq!(
            classify_algorithm("ecdsa-sha2-nistp256").unwrap(),
            StrengthBand::Acceptable
        );
        assert_eq!(
            classify_algorithm("ssh-ed25519").unwrap(),
            StrengthBand::Strong
        );
    }

    #[test]
    fn serial_header_round_trips() {
        for n in [0u64, 1, 42, 999_999] {
            let header = render_serial_header(n);
            assert_eq!(parse_serial_header(&header), Some(n));
        }
    }

    #[test]
    fn serial_header_rejects_wrong_shape() {
        assert_eq!(parse_serial_header("# Keymaster Managed Keys (Serial:3)"), None);
        assert_eq!(parse_serial_header("#Keymaster Managed Keys (Serial: 3)"), None);
        assert_eq!(parse_serial_header("# keymaster managed keys (Serial: 3)"), None);
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let parsed = ParsedKey::parse(ED25519_SAMPLE).unwrap();
        let a = parsed.fingerprint().unwrap();
        let b = parsed.fingerprint().unwrap();
        assert_eq!(a, b);
        assert!(a.to_string().starts_with("SHA256:"));
    }
}
