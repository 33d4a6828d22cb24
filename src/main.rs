//! Keymaster — centralized `authorized_keys` management for a fleet of
//! UNIX hosts over plain SSH/SFTP.

use std::path::PathBuf;

use clap::Parser;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

mod cli;

use keymaster::bootstrap::BootstrapEngine;
use keymaster::config::{self, PoolConfig};
use keymaster::deploy::DeployEngine;
use keymaster::facade::{Facade, DEFAULT_PARALLEL_CAP};
use keymaster::rotation::RotationEngine;
use keymaster::store::Database;
use keymaster::transport::russh_transport::RusshTransportFactory;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let file_config = config::load_file_config();
    let dsn = cli
        .dsn
        .clone()
        .or(file_config.dsn.clone())
        .unwrap_or_else(default_dsn);

    let pool_config = PoolConfig::from_env();
    let store = Database::connect(&dsn, &pool_config)
        .await
        .map_err(|e| anyhow::anyhow!("failed to open store at {dsn}: {e}"))?;

    let transports = std::sync::Arc::new(RusshTransportFactory::new(store.clone(), cli.ssh_port));
    let deploy = DeployEngine::new(store.clone(), transports.clone());
    let bootstrap = BootstrapEngine::new(store.clone(), transports);
    let rotation = RotationEngine::new(store.clone());

    let default_fan_out = file_config.default_fan_out.unwrap_or(DEFAULT_PARALLEL_CAP);
    let facade = std::sync::Arc::new(
        Facade::new(store, deploy, bootstrap, rotation).with_parallel_cap(default_fan_out),
    );

    cli::run(cli.command, facade, &cli.user).await
}

/// `$KEYMASTER_DATA_DIR` > `~/.local/share/keymaster` > `./data`, mirroring
/// the ambient data-directory precedence the teacher uses in `get_data_dir()`.
fn default_dsn() -> String {
    if let Ok(dir) = std::env::var("KEYMASTER_DATA_DIR") {
        return format!("sqlite://{}/keymaster.db?mode=rwc", dir.trim_end_matches('/'));
    }

    if let Some(data_dir) = dirs::data_dir() {
        let keymaster_dir = data_dir.join("keymaster");
        if std::fs::create_dir_all(&keymaster_dir).is_ok() {
            return format!("sqlite://{}/keymaster.db?mode=rwc", keymaster_dir.display());
        }
    }

    let local_dir: PathBuf = PathBuf::from("./data");
    let _ = std::fs::create_dir_all(&local_dir);
    format!("sqlite://{}/keymaster.db?mode=rwc", local_dir.display())
}
