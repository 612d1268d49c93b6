// src/cli/mod.rs — CLI definition (clap derive)

pub mod client;
pub mod doctor;
pub mod serve;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "handoff",
    about = "One-off file transfers over ephemeral SSH credentials",
    version
)]
pub struct Cli {
    /// Config file path
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// Log more (repeat for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the broker and its HTTP API
    Serve {
        /// Address to bind (overrides config)
        #[arg(long)]
        bind: Option<String>,
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Check that the job runner and playbooks are usable
    Doctor,
    /// Open a transfer session on a running broker and print the share link
    Create {
        /// Source path on the sender (repeatable)
        #[arg(long = "src", required = true)]
        source_paths: Vec<String>,
        /// Destination path on the receiver
        #[arg(long = "dest")]
        destination_path: String,
        /// Broker base URL (defaults to server.public_url)
        #[arg(long)]
        server: Option<String>,
    },
    /// Show a session's state and logs
    Status {
        /// Session id
        id: String,
        /// Broker base URL (defaults to server.public_url)
        #[arg(long)]
        server: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_create() {
        let cli = Cli::try_parse_from([
            "handoff", "create", "--src", "/a", "--src", "/b", "--dest", "/remote",
        ])
        .unwrap();
        match cli.command {
            Commands::Create {
                source_paths,
                destination_path,
                server,
            } => {
                assert_eq!(source_paths, vec!["/a", "/b"]);
                assert_eq!(destination_path, "/remote");
                assert!(server.is_none());
            }
            _ => panic!("expected create"),
        }
    }

    #[test]
    fn test_create_requires_source() {
        assert!(Cli::try_parse_from(["handoff", "create", "--dest", "/remote"]).is_err());
    }

    #[test]
    fn test_global_flags() {
        let cli = Cli::try_parse_from(["handoff", "serve", "-vv", "--config", "/etc/h.toml"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.config.as_deref(), Some("/etc/h.toml"));
    }
}
