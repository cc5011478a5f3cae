//! Bisync CLI
//!
//! Command-line tools for exercising the bisync engine.
//!
//! # Commands
//!
//! - `replay` - Replay a scripted edit session and print every event
//! - `defaults` - Print the effective engine configuration

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Bisync engine command-line tools.
#[derive(Parser)]
#[command(name = "bisync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a scripted edit session on a manual clock
    Replay {
        /// Path to the JSON script
        script: PathBuf,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,

        /// Override the edit debounce in milliseconds
        #[arg(long)]
        debounce_ms: Option<u64>,

        /// Override the conversion timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Override the version history capacity
        #[arg(long)]
        history: Option<usize>,
    },

    /// Print the effective engine configuration
    Defaults {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Replay {
            script,
            format,
            debounce_ms,
            timeout_ms,
            history,
        } => {
            let overrides = commands::replay::Overrides {
                debounce_ms,
                timeout_ms,
                history,
            };
            commands::replay::run(&script, &overrides, &format)?;
        }
        Commands::Defaults { format } => {
            commands::defaults::run(&format)?;
        }
        Commands::Version => {
            println!("Bisync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
