use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use ferry_core::protocol::DEFAULT_CHUNK_UNIT;
use ferry_core::{SendOptions, SessionConfig};
use ferry_server::{resolve_upload_dir, ServerConfig, DEFAULT_PORT, DEFAULT_WORKERS};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ferry")]
#[command(version, about = "Single-file transfers over plain TCP", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a file to a ferry server
    Client {
        /// Server host name or address
        host: String,

        /// Server port
        port: u16,

        /// Path to the file to send
        path: PathBuf,

        /// Chunk size in KB
        #[arg(long, default_value_t = DEFAULT_CHUNK_UNIT, value_parser = clap::value_parser!(u8).range(1..))]
        chunk_unit: u8,

        /// Don't send an MD5 digest after the last chunk
        #[arg(long)]
        no_hash: bool,
    },

    /// Receive files into the upload directory
    Server {
        /// Port to listen on
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Maximum number of transfers running at once
        #[arg(short, long, default_value_t = DEFAULT_WORKERS as u64, value_parser = clap::value_parser!(u64).range(1..))]
        workers: u64,

        /// Upload directory (defaults to $FERRY_UPLOAD_DIR, then ./uploads)
        #[arg(short, long)]
        upload_dir: Option<PathBuf>,

        /// Seconds between throughput reports
        #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u64).range(1..))]
        tick_secs: u64,

        /// Don't compare the digest sent by clients
        #[arg(long)]
        no_verify: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match cli.command {
        Commands::Client {
            host,
            port,
            path,
            chunk_unit,
            no_hash,
        } => {
            let options = SendOptions {
                chunk_unit,
                hash: !no_hash,
            };
            ferry_cli::run_send(host, port, path, options).await?;
        }
        Commands::Server {
            port,
            workers,
            upload_dir,
            tick_secs,
            no_verify,
        } => {
            let workers = usize::try_from(workers)?;
            let config = ServerConfig {
                addr: ([0, 0, 0, 0], port).into(),
                workers,
                session: SessionConfig {
                    upload_dir: resolve_upload_dir(upload_dir),
                    tick_period: Duration::from_secs(tick_secs),
                    verify_hash: !no_verify,
                },
            };
            ferry_server::run_server(config).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_server_defaults() {
        let cli = Cli::try_parse_from(["ferry", "server"]).unwrap();
        match cli.command {
            Commands::Server {
                port,
                workers,
                tick_secs,
                no_verify,
                ..
            } => {
                assert_eq!(port, DEFAULT_PORT);
                assert_eq!(workers, DEFAULT_WORKERS as u64);
                assert_eq!(tick_secs, 1);
                assert!(!no_verify);
            }
            _ => panic!("expected server"),
        }
    }

    #[test]
    fn test_server_workers_flag() {
        let cli = Cli::try_parse_from(["ferry", "server", "--workers", "8"]).unwrap();
        assert!(matches!(cli.command, Commands::Server { workers: 8, .. }));
        assert!(Cli::try_parse_from(["ferry", "server", "--workers", "0"]).is_err());
    }

    #[test]
    fn test_client_arguments() {
        let cli = Cli::try_parse_from([
            "ferry",
            "client",
            "localhost",
            "3000",
            "notes.txt",
            "--chunk-unit",
            "4",
            "--no-hash",
        ])
        .unwrap();
        match cli.command {
            Commands::Client {
                host,
                port,
                path,
                chunk_unit,
                no_hash,
            } => {
                assert_eq!(host, "localhost");
                assert_eq!(port, 3000);
                assert_eq!(path, PathBuf::from("notes.txt"));
                assert_eq!(chunk_unit, 4);
                assert!(no_hash);
            }
            _ => panic!("expected client"),
        }
    }

    #[test]
    fn test_malformed_invocations_rejected() {
        assert!(Cli::try_parse_from(["ferry"]).is_err());
        assert!(Cli::try_parse_from(["ferry", "client", "localhost", "3000"]).is_err());
        assert!(Cli::try_parse_from(["ferry", "client", "localhost", "port", "f"]).is_err());
        assert!(
            Cli::try_parse_from(["ferry", "client", "h", "1", "f", "--chunk-unit", "0"]).is_err()
        );
    }
}
