//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// CI join service - exchange CI platform identity tokens for cluster credentials
#[derive(Parser, Debug)]
#[command(name = "ci-join")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "CI_JOIN_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "CI_JOIN_LOG_LEVEL", global = true)]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "CI_JOIN_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the join server (default)
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind to
        #[arg(long)]
        host: Option<String>,
    },

    /// Load the configuration, validate policies and print a summary
    Check,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_subcommand_defaults_to_none() {
        let cli = Cli::try_parse_from(["ci-join"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn serve_accepts_host_and_port() {
        let cli =
            Cli::try_parse_from(["ci-join", "serve", "--port", "9000", "--host", "0.0.0.0"])
                .unwrap();

        match cli.command {
            Some(Command::Serve { port, host }) => {
                assert_eq!(port, Some(9000));
                assert_eq!(host.as_deref(), Some("0.0.0.0"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn global_config_after_subcommand() {
        let cli = Cli::try_parse_from(["ci-join", "check", "--config", "join.yaml"]).unwrap();

        assert!(matches!(cli.command, Some(Command::Check)));
        assert_eq!(cli.config, Some(PathBuf::from("join.yaml")));
    }
}
