pub mod config;
pub mod status;

use clap::{Parser, Subcommand};

/// continuum: keeps a messaging-source connection alive and captures
/// everything it delivers.
#[derive(Debug, Parser)]
#[command(name = "continuum", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the capture daemon (default when no subcommand is given).
    Serve,
    /// Configuration utilities.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print the status snapshot of a running daemon.
    Status {
        /// Base URL of the daemon (defaults to the configured server address).
        #[arg(long)]
        url: Option<String>,
        /// Print the raw snapshot JSON.
        #[arg(long)]
        json: bool,
    },
    /// Print version information.
    Version,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Parse the config file and report any errors.
    Validate,
    /// Dump the resolved configuration (with defaults) as TOML.
    Show,
}

// ── Config loading helper ─────────────────────────────────────────────

/// Load the configuration from the path in `CT_CONFIG` (or `config.toml`).
/// A missing file yields the defaults. Returns the config and the path
/// that was used.
pub fn load_config() -> anyhow::Result<(ct_domain::config::Config, String)> {
    let config_path = std::env::var("CT_CONFIG").unwrap_or_else(|_| "config.toml".into());

    let config = if std::path::Path::new(&config_path).exists() {
        let raw = std::fs::read_to_string(&config_path)
            .map_err(|e| anyhow::anyhow!("reading {config_path}: {e}"))?;
        toml::from_str(&raw).map_err(|e| anyhow::anyhow!("parsing {config_path}: {e}"))?
    } else {
        ct_domain::config::Config::default()
    };

    Ok((config, config_path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_subcommand_means_serve() {
        let cli = Cli::try_parse_from(["continuum"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn status_flags() {
        let cli =
            Cli::try_parse_from(["continuum", "status", "--url", "http://h:1", "--json"]).unwrap();
        match cli.command {
            Some(Command::Status { url, json }) => {
                assert_eq!(url.as_deref(), Some("http://h:1"));
                assert!(json);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn config_subcommands() {
        let cli = Cli::try_parse_from(["continuum", "config", "validate"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Command::Config(ConfigCommand::Validate))
        ));
    }
}
