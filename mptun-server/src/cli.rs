use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "mptun-server",
    version,
    about = "mptun server: reassembles relay links and delivers to a UDP service"
)]
pub struct Cli {
    /// Path to config file (TOML)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Act as a transport-converting relay instead of a server
    #[arg(long)]
    pub relay: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run in the foreground (default)
    Run,

    /// Write a default config file (does not overwrite unless --force)
    InitConfig {
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },

    /// Print the resolved config file path
    PrintConfigPath,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_flag_and_default_command() {
        let cli = Cli::try_parse_from(["mptun-server", "--relay"]).unwrap();
        assert!(cli.relay);
        assert!(cli.command.is_none());

        let cli = Cli::try_parse_from(["mptun-server", "init-config", "--force"]).unwrap();
        assert!(!cli.relay);
        assert!(matches!(cli.command, Some(Command::InitConfig { force: true })));
    }
}
