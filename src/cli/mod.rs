//! CLI front-end: a thin `clap`-derived layer over the facade. No HTTP hop —
//! every subcommand calls directly into `Facade`, replacing the teacher's
//! `cli/mod.rs` `CliClient`-talks-to-API shape now that there is no server
//! process to talk to.

use std::fs::File;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use keymaster::deploy::{AuditResult, DecommissionMode, DecommissionOptions};
use keymaster::facade::{CancellationToken, Facade};
use keymaster::store::models::Account;

#[derive(Parser, Debug)]
#[command(name = "keymaster")]
#[command(author = "Keymaster Contributors")]
#[command(version)]
#[command(about = "Centralized authorized_keys management over plain SSH/SFTP", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Override the store DSN (sqlite://, postgres://, mysql://).
    #[arg(long, global = true, env = "KEYMASTER_DSN")]
    pub dsn: Option<String>,

    /// Port used to reach managed hosts over SSH.
    #[arg(long, default_value = "22", global = true)]
    pub ssh_port: u16,

    /// Username recorded in the audit log for actions taken from this run.
    #[arg(long, default_value = "cli-user", env = "KEYMASTER_USER", global = true)]
    pub user: String,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Push the expected authorized_keys content to one or all accounts.
    Deploy {
        #[arg(long = "target")]
        target: Option<String>,
        #[arg(long)]
        force: bool,
    },
    /// Compare remote state against expectation.
    Audit {
        #[arg(long = "mode", default_value = "serial")]
        mode: AuditMode,
        #[arg(long = "target")]
        target: Option<String>,
    },
    /// Fetch and optionally persist a host's SSH host key.
    TrustHost {
        identifier: String,
        #[arg(long)]
        save: bool,
    },
    /// Import public keys from a plain-text authorized_keys-style file.
    Import { path: PathBuf },
    /// Export an SSH client config covering every active account.
    ExportSshClientConfig { path: PathBuf },
    /// Write a compressed backup of the whole store.
    Backup { out: Option<PathBuf> },
    /// Restore or merge a backup file.
    Restore {
        file: PathBuf,
        #[arg(long)]
        full: bool,
    },
    /// Copy the store to a different SQL engine.
    Migrate {
        #[arg(long = "type")]
        engine: String,
        #[arg(long)]
        dsn: String,
    },
    /// Remove an account, optionally cleaning up the remote file first.
    Decommission {
        identifier: Option<String>,
        #[arg(long)]
        tag: Option<String>,
        #[arg(long = "keep-file")]
        keep_file: bool,
        #[arg(long = "skip-remote")]
        skip_remote: bool,
        #[arg(long)]
        force: bool,
    },
    /// Rotate the active system key.
    RotateKey {
        #[arg(long)]
        passphrase: bool,
    },
    /// Store maintenance operations.
    Db {
        #[command(subcommand)]
        command: DbCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum DbCommands {
    Maintain {
        #[arg(long = "skip-integrity")]
        skip_integrity: bool,
    },
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum AuditMode {
    Serial,
    Strict,
}

pub async fn run(command: Commands, facade: Arc<Facade>, _user: &str) -> anyhow::Result<()> {
    match command {
        Commands::Deploy { target, force } => run_deploy(facade, target.as_deref(), force).await,
        Commands::Audit { mode, target } => run_audit(facade, mode, target.as_deref()).await,
        Commands::TrustHost { identifier, save } => run_trust_host(&facade, &identifier, save).await,
        Commands::Import { path } => run_import(&facade, &path).await,
        Commands::ExportSshClientConfig { path } => run_export_ssh_config(&facade, &path).await,
        Commands::Backup { out } => run_backup(&facade, out).await,
        Commands::Restore { file, full } => run_restore(&facade, &file, full).await,
        Commands::Migrate { engine: _, dsn } => run_migrate(&facade, &dsn).await,
        Commands::Decommission {
            identifier,
            tag,
            keep_file,
            skip_remote,
            force,
        } => run_decommission(&facade, identifier.as_deref(), tag.as_deref(), keep_file, skip_remote, force).await,
        Commands::RotateKey { passphrase } => run_rotate_key(&facade, passphrase).await,
        Commands::Db { command: DbCommands::Maintain { skip_integrity } } => {
            facade.run_db_maintenance(skip_integrity).await?;
            println!("maintenance complete");
            Ok(())
        }
    }
}

async fn run_deploy(facade: Arc<Facade>, target: Option<&str>, force: bool) -> anyhow::Result<()> {
    let accounts = resolve_targets(&facade, target).await?;
    let cancel = CancellationToken::new();

    let results = facade
        .parallel_run(accounts, cancel, move |account, _cancel| {
            let facade = facade.clone();
            async move {
                let result = facade.deploy(&account, force).await;
                (account.identifier(), result)
            }
        })
        .await;

    let mut failures = 0;
    for (identifier, result) in results {
        match result {
            Ok(outcome) if outcome.skipped => println!("{identifier}: skipped (up to date)"),
            Ok(outcome) => println!("{identifier}: deployed (serial {:?})", outcome.new_serial),
            Err(e) => {
                failures += 1;
                eprintln!("{identifier}: failed: {e}");
            }
        }
    }
    if failures > 0 {
        anyhow::bail!("{failures} account(s) failed to deploy");
    }
    Ok(())
}

async fn run_audit(facade: Arc<Facade>, mode: AuditMode, target: Option<&str>) -> anyhow::Result<()> {
    let accounts = resolve_targets(&facade, target).await?;
    let strict = matches!(mode, AuditMode::Strict);

    let mut drifted = 0;
    for account in accounts {
        match facade.audit(&account, strict).await {
            Ok(AuditResult::Match) => println!("{}: match", account.identifier()),
            Ok(AuditResult::Drift) => {
                drifted += 1;
                println!("{}: drift", account.identifier());
            }
            Err(e) => eprintln!("{}: error: {e}", account.identifier()),
        }
    }
    if drifted > 0 {
        anyhow::bail!("{drifted} account(s) drifted");
    }
    Ok(())
}

async fn run_trust_host(facade: &Facade, identifier: &str, save: bool) -> anyhow::Result<()> {
    let line = facade.trust_host(identifier, save).await?;
    println!("{line}");
    Ok(())
}

async fn run_import(facade: &Facade, path: &PathBuf) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(path)?;
    let imported = facade.import_authorized_keys(&text).await?;
    println!("imported {} key(s)", imported.len());
    Ok(())
}

async fn run_export_ssh_config(facade: &Facade, path: &PathBuf) -> anyhow::Result<()> {
    let config = facade.export_ssh_client_config().await?;
    std::fs::write(path, config)?;
    Ok(())
}

async fn run_backup(facade: &Facade, out: Option<PathBuf>) -> anyhow::Result<()> {
    let path = out.unwrap_or_else(|| PathBuf::from("keymaster-backup.zst"));
    let file = File::create(&path)?;
    facade.backup(file).await?;
    println!("wrote {}", path.display());
    Ok(())
}

async fn run_restore(facade: &Facade, file: &PathBuf, full: bool) -> anyhow::Result<()> {
    let reader = File::open(file)?;
    facade.restore(reader, full).await?;
    println!("restore complete");
    Ok(())
}

async fn run_migrate(facade: &Facade, dsn: &str) -> anyhow::Result<()> {
    facade.migrate(dsn).await?;
    println!("migrated to {dsn}");
    Ok(())
}

async fn run_decommission(
    facade: &Facade,
    identifier: Option<&str>,
    tag: Option<&str>,
    keep_file: bool,
    skip_remote: bool,
    force: bool,
) -> anyhow::Result<()> {
    let mode = if skip_remote {
        DecommissionMode::SkipRemote
    } else if keep_file {
        DecommissionMode::KeepFile
    } else {
        DecommissionMode::Full
    };
    let opts = DecommissionOptions { mode_force: force };

    if let Some(identifier) = identifier {
        let account = facade
            .find_account_by_identifier(identifier)
            .await?
            .ok_or_else(|| anyhow::anyhow!("no account matches {identifier}"))?;
        facade.decommission(&account, mode, opts).await?;
        println!("decommissioned {identifier}");
        return Ok(());
    }

    if let Some(tag) = tag {
        let (key, value) = tag
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("--tag expects key:value"))?;
        let accounts = facade.list_accounts_by_tag(key, value).await?;
        let counts = facade.decommission_bulk(&accounts, mode, opts).await;
        println!(
            "decommissioned {} succeeded, {} failed, {} skipped",
            counts.successful, counts.failed, counts.skipped
        );
        return Ok(());
    }

    anyhow::bail!("decommission requires an identifier or --tag")
}

async fn run_rotate_key(facade: &Facade, passphrase: bool) -> anyhow::Result<()> {
    let passphrase = if passphrase {
        Some(rpassword_prompt())
    } else {
        None
    };
    let serial = facade.rotate_key(passphrase.as_deref()).await?;
    println!("rotated; new serial {serial}");
    Ok(())
}

fn rpassword_prompt() -> String {
    print!("passphrase: ");
    let _ = std::io::stdout().flush();
    let mut line = String::new();
    let _ = std::io::stdin().read_line(&mut line);
    line.trim_end().to_string()
}

async fn resolve_targets(facade: &Facade, target: Option<&str>) -> anyhow::Result<Vec<Account>> {
    match target {
        Some(identifier) => {
            let account = facade
                .find_account_by_identifier(identifier)
                .await?
                .ok_or_else(|| anyhow::anyhow!("no account matches {identifier}"))?;
            Ok(vec![account])
        }
        None => Ok(facade.list_active_accounts().await?),
    }
}
