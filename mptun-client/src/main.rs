use anyhow::Result;
use mptun_core::config_file;
use mptun_core::control::ClientConfig;

mod cli;
mod runtime;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = <cli::Cli as clap::Parser>::parse();
    let config_path = config_file::resolve_path::<ClientConfig>(cli.config)?;

    match cli.command.unwrap_or(cli::Command::Run) {
        cli::Command::PrintConfigPath => {
            println!("{}", config_path.display());
            Ok(())
        }
        cli::Command::InitConfig { force } => {
            config_file::save(&config_path, &ClientConfig::default(), force)?;
            println!("Wrote default config to {}", config_path.display());
            Ok(())
        }
        cli::Command::Run => {
            let cfg: ClientConfig = config_file::load(&config_path)?;
            let (_stop_tx, stop_rx) = tokio::sync::watch::channel(false);
            runtime::run_client(cfg, stop_rx, Box::new(|m| tracing::info!("{m}"))).await
        }
    }
}
