//! Command-line interface for stepchain.
//!
//! Inspects the file snapshot store and computes idempotency keys, so a
//! stuck or replaying execution can be diagnosed without writing code.

use std::io::{self, IsTerminal, Read};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::core::{key_digest, request_hash, FileSnapshotStore};

/// stepchain - guarded step-chain executor
#[derive(Parser, Debug)]
#[command(name = "stepchain")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Inspect or delete stored snapshots
    Snapshot {
        #[command(subcommand)]
        command: SnapshotCommands,
    },

    /// Print the idempotency key derived from a JSON request
    Hash {
        /// Input file (reads from stdin if not provided)
        #[arg(short, long)]
        input: Option<PathBuf>,
    },

    /// Show resolved configuration (debug)
    Config,
}

#[derive(Subcommand, Debug)]
pub enum SnapshotCommands {
    /// Print the snapshot stored under a key
    Show {
        /// Idempotency key
        key: String,

        /// Snapshot directory (defaults to the configured one)
        #[arg(long, env = "STEPCHAIN_SNAPSHOTS")]
        dir: Option<PathBuf>,
    },

    /// Delete the snapshot stored under a key
    Clear {
        /// Idempotency key
        key: String,

        /// Snapshot directory (defaults to the configured one)
        #[arg(long, env = "STEPCHAIN_SNAPSHOTS")]
        dir: Option<PathBuf>,
    },
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Snapshot { command } => match command {
                SnapshotCommands::Show { key, dir } => show_snapshot(&key, dir).await,
                SnapshotCommands::Clear { key, dir } => clear_snapshot(&key, dir).await,
            },
            Commands::Hash { input } => print_hash(input),
            Commands::Config => show_config(),
        }
    }
}

async fn open_store(dir: Option<PathBuf>) -> Result<FileSnapshotStore> {
    match dir {
        Some(dir) => FileSnapshotStore::open(dir).await,
        None => FileSnapshotStore::from_config().await,
    }
}

/// Print a stored snapshot
async fn show_snapshot(key: &str, dir: Option<PathBuf>) -> Result<()> {
    let store = open_store(dir).await?;

    let Some(snapshot) = store.read_raw(key).await? else {
        anyhow::bail!("No snapshot for key: {}", key);
    };

    println!("Key:       {}", key);
    println!("File:      {}", store.path_for(key).display());
    println!("Success:   {}", snapshot["success"]);
    println!("Last step: {}", snapshot["last_step_id"]);
    println!("Saved at:  {}", snapshot["saved_at"]);
    println!();
    println!(
        "{}",
        serde_json::to_string_pretty(&snapshot["context"]).context("Failed to render context")?
    );

    Ok(())
}

/// Delete a stored snapshot
async fn clear_snapshot(key: &str, dir: Option<PathBuf>) -> Result<()> {
    let store = open_store(dir).await?;

    if store.remove(key).await? {
        println!("Removed snapshot for key: {}", key);
    } else {
        println!("No snapshot for key: {}", key);
    }

    Ok(())
}

/// Hash a JSON request the same way `Pipeline::execute` does
fn print_hash(input_file: Option<PathBuf>) -> Result<()> {
    let input = if let Some(path) = input_file {
        std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read input file: {}", path.display()))?
    } else if !io::stdin().is_terminal() {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .context("Failed to read from stdin")?;
        buffer
    } else {
        anyhow::bail!("No input provided. Use --input <file> or pipe to stdin");
    };

    let request: serde_json::Value =
        serde_json::from_str(&input).context("Input is not valid JSON")?;
    let key = request_hash(&request).context("Failed to hash request")?;

    println!("{}", key);
    eprintln!("[snapshot file: {}.json]", key_digest(&key));

    Ok(())
}

/// Show resolved configuration
fn show_config() -> Result<()> {
    let cfg = crate::config::config()?;

    println!("stepchain configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:      {}", crate::config::stepchain_home()?.display());
    println!("  Snapshots: {}", cfg.snapshots.display());
    println!();
    println!("Default retry policy:");
    println!("  Max attempts:   {}", cfg.retry.max_attempts);
    println!("  Initial delay:  {}ms", cfg.retry.initial_delay_ms);
    println!("  Max delay:      {}ms", cfg.retry.max_delay_ms);
    println!("  Backoff:        x{}", cfg.retry.backoff_multiplier);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_snapshot_show() {
        let cli = Cli::try_parse_from(["stepchain", "snapshot", "show", "order-42"]).unwrap();

        match cli.command {
            Commands::Snapshot {
                command: SnapshotCommands::Show { key, .. },
            } => assert_eq!(key, "order-42"),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_hash_with_input() {
        let cli = Cli::try_parse_from(["stepchain", "hash", "--input", "req.json"]).unwrap();

        match cli.command {
            Commands::Hash { input } => assert_eq!(input, Some(PathBuf::from("req.json"))),
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
