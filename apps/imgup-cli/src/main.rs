//! imgup command-line entry point.

mod commands;
mod config;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use imgup_hasher::ContentHash;

#[derive(Parser, Debug)]
#[command(name = "imgup")]
#[command(about = "Hash, chunk, and track resumable image uploads")]
struct Cli {
    /// Config file (default: <config dir>/imgup/config.json)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Directory holding upload sessions
    #[arg(long, global = true, value_name = "DIR")]
    session_dir: Option<PathBuf>,

    /// Maximum number of hashing worker threads
    #[arg(long, global = true, value_name = "N")]
    max_workers: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the content digest of one or more files
    Hash {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Split a file into chunks and print their digests
    Split {
        path: PathBuf,

        /// Chunk size in bytes
        #[arg(long, value_name = "BYTES")]
        chunk_size: Option<u64>,

        /// Create or resume an upload session for the file
        #[arg(long)]
        track: bool,
    },

    /// Check a file against an expected digest
    Verify {
        path: PathBuf,
        digest: ContentHash,
    },

    /// Manage resumable upload sessions
    Sessions {
        #[command(subcommand)]
        command: SessionsCommand,
    },

    /// Show configuration and worker pool status
    Status,
}

#[derive(Subcommand, Debug)]
enum SessionsCommand {
    /// List sessions with chunks left to upload
    List {
        /// Include completed sessions
        #[arg(long)]
        all: bool,
    },

    /// Print one session as JSON
    Show { id: String },

    /// Mark chunks as uploaded
    Ack {
        id: String,
        #[arg(required = true)]
        chunks: Vec<u64>,
    },

    /// Delete one session
    Remove { id: String },

    /// Delete expired sessions
    Sweep,

    /// Delete all sessions
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = config::CliConfig::load(cli.config.as_deref());
    if cli.max_workers.is_some() {
        config.max_workers = cli.max_workers;
    }
    if cli.session_dir.is_some() {
        config.session_dir = cli.session_dir;
    }

    let ctx = commands::Context::new(config);
    match cli.command {
        Command::Hash { paths } => commands::hash(&ctx, paths).await,
        Command::Split {
            path,
            chunk_size,
            track,
        } => commands::split(&ctx, path, chunk_size, track).await,
        Command::Verify { path, digest } => commands::verify(&ctx, path, digest).await,
        Command::Sessions { command } => match command {
            SessionsCommand::List { all } => commands::sessions_list(&ctx, all),
            SessionsCommand::Show { id } => commands::sessions_show(&ctx, &id),
            SessionsCommand::Ack { id, chunks } => commands::sessions_ack(&ctx, &id, &chunks),
            SessionsCommand::Remove { id } => commands::sessions_remove(&ctx, &id),
            SessionsCommand::Sweep => commands::sessions_sweep(&ctx),
            SessionsCommand::Clear => commands::sessions_clear(&ctx),
        },
        Command::Status => commands::status(&ctx),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_split_with_global_flags() {
        let cli = Cli::try_parse_from([
            "imgup",
            "split",
            "photo.png",
            "--chunk-size",
            "1024",
            "--track",
            "--max-workers",
            "2",
        ])
        .unwrap();
        assert_eq!(cli.max_workers, Some(2));
        match cli.command {
            Command::Split {
                path,
                chunk_size,
                track,
            } => {
                assert_eq!(path, PathBuf::from("photo.png"));
                assert_eq!(chunk_size, Some(1024));
                assert!(track);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn verify_rejects_malformed_digest() {
        assert!(Cli::try_parse_from(["imgup", "verify", "a.png", "not-a-digest"]).is_err());
    }
}
