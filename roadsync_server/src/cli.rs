use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "roadsync",
    version,
    about = "HubSpot deal enrichment for roadmap cards"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the HTTP API server.
    Serve {
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        #[arg(long, default_value_t = 8000)]
        port: u16,

        /// SQLite database file.
        #[arg(long, env = "ROADSYNC_DB_PATH", default_value = ".roadsync/sync.db")]
        db_path: PathBuf,
    },
    /// Load configuration from the environment and report what is enabled.
    CheckConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_no_subcommand() {
        let cli = Cli::try_parse_from(["roadsync"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn parses_serve_flags() {
        let cli = Cli::try_parse_from([
            "roadsync",
            "serve",
            "--port",
            "9100",
            "--db-path",
            "/tmp/rs.db",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Serve {
                host,
                port,
                db_path,
            }) => {
                assert_eq!(host, "0.0.0.0");
                assert_eq!(port, 9100);
                assert_eq!(db_path, PathBuf::from("/tmp/rs.db"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
