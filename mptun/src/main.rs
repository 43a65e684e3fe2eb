//! Combined mptun client/server/relay binary.

use anyhow::Result;
use clap::{Parser, Subcommand};
use mptun_core::config_file::{self, RoleConfig};
use mptun_core::control::{ClientConfig, RelayConfig, ServerConfig};
use std::path::PathBuf;
use tokio::sync::watch;

/// mptun - multipath UDP tunnel
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Override config file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Spread local UDP traffic over the configured relay links
    Client {
        #[command(subcommand)]
        subcommand: Option<RoleCommand>,
    },
    /// Reassemble relay links and deliver to the remote service
    Server {
        #[command(subcommand)]
        subcommand: Option<RoleCommand>,
    },
    /// Convert one path between TCP and UDP
    Relay {
        #[command(subcommand)]
        subcommand: Option<RoleCommand>,
    },
}

#[derive(Subcommand, Debug, Clone)]
enum RoleCommand {
    /// Print the config file path
    PrintConfigPath,
    /// Initialize a default config file
    InitConfig {
        /// Overwrite existing config
        #[arg(short, long)]
        force: bool,
    },
    /// Run in the foreground (default)
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    match cli.command {
        Command::Client { subcommand } => run_client_mode(cli.config, subcommand).await,
        Command::Server { subcommand } => {
            let path = config_file::resolve_path::<ServerConfig>(cli.config)?;
            if let Some(cfg) = prepare_role::<ServerConfig>(path, subcommand)? {
                let (_stop_tx, stop_rx) = watch::channel(false);
                mptun_server::runtime::run_server(cfg, stop_rx, Box::new(|m| tracing::info!("{m}")))
                    .await?;
            }
            Ok(())
        }
        Command::Relay { subcommand } => {
            let path = config_file::resolve_path::<RelayConfig>(cli.config)?;
            if let Some(cfg) = prepare_role::<RelayConfig>(path, subcommand)? {
                let (_stop_tx, stop_rx) = watch::channel(false);
                mptun_server::relay::run_relay(cfg, stop_rx, Box::new(|m| tracing::info!("{m}")))
                    .await?;
            }
            Ok(())
        }
    }
}

async fn run_client_mode(
    config_override: Option<PathBuf>,
    subcommand: Option<RoleCommand>,
) -> Result<()> {
    let config_path = config_file::resolve_path::<ClientConfig>(config_override)?;

    match subcommand.unwrap_or(RoleCommand::Run) {
        RoleCommand::PrintConfigPath => {
            println!("{}", config_path.display());
            Ok(())
        }
        RoleCommand::InitConfig { force } => {
            config_file::save(&config_path, &ClientConfig::default(), force)?;
            println!("Wrote default config to {}", config_path.display());
            Ok(())
        }
        RoleCommand::Run => {
            let cfg: ClientConfig = config_file::load(&config_path)?;
            let (_stop_tx, stop_rx) = watch::channel(false);
            mptun_client::runtime::run_client(cfg, stop_rx, Box::new(|m| tracing::info!("{m}")))
                .await
        }
    }
}

/// Server and relay share their config handling; `Some` means run.
fn prepare_role<T: RoleConfig>(
    config_path: PathBuf,
    subcommand: Option<RoleCommand>,
) -> Result<Option<T>> {
    match subcommand.unwrap_or(RoleCommand::Run) {
        RoleCommand::PrintConfigPath => {
            println!("{}", config_path.display());
            Ok(None)
        }
        RoleCommand::InitConfig { force } => {
            config_file::save(&config_path, &T::default(), force)?;
            println!("Wrote default config to {}", config_path.display());
            Ok(None)
        }
        RoleCommand::Run => Ok(Some(config_file::load(&config_path)?)),
    }
}
