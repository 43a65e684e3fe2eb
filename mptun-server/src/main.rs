use anyhow::Result;
use std::path::Path;

mod cli;
mod relay;
mod runtime;

use mptun_core::config_file::{self, RoleConfig};
use mptun_core::control::{RelayConfig, ServerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = <cli::Cli as clap::Parser>::parse();
    let command = cli.command.unwrap_or(cli::Command::Run);
    if cli.relay {
        let path = config_file::resolve_path::<RelayConfig>(cli.config)?;
        if let Some(cfg) = prepare::<RelayConfig>(&path, command)? {
            let (_stop_tx, stop_rx) = tokio::sync::watch::channel(false);
            relay::run_relay(cfg, stop_rx, Box::new(|m| tracing::info!("{m}"))).await?;
        }
    } else {
        let path = config_file::resolve_path::<ServerConfig>(cli.config)?;
        if let Some(cfg) = prepare::<ServerConfig>(&path, command)? {
            let (_stop_tx, stop_rx) = tokio::sync::watch::channel(false);
            runtime::run_server(cfg, stop_rx, Box::new(|m| tracing::info!("{m}"))).await?;
        }
    }
    Ok(())
}

/// Handle the config subcommands; returns the loaded config for `run`.
fn prepare<T: RoleConfig>(path: &Path, command: cli::Command) -> Result<Option<T>> {
    match command {
        cli::Command::PrintConfigPath => {
            println!("{}", path.display());
            Ok(None)
        }
        cli::Command::InitConfig { force } => {
            config_file::save(path, &T::default(), force)?;
            println!("Wrote default config to {}", path.display());
            Ok(None)
        }
        cli::Command::Run => Ok(Some(config_file::load(path)?)),
    }
}
