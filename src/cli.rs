// CLI module - command-line argument parsing
//
// `indexer [-d|--domain DOMAIN] [-l|--listener] [-f|--full]` per spec.md §6.
// Both `-l` and `-f` may be passed together; `-f` runs first (spec.md §4.8).
// A `config --show` subcommand is additive: it prints the resolved,
// secret-redacted configuration for a domain and exits without running a
// mode.

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "indexer")]
#[command(version)]
#[command(about = "Keeps a search index consistent with a relational store", long_about = None)]
pub struct Cli {
    /// Domain name, e.g. ASSET, FACILITY. Falls back to the DOMAIN env var.
    #[arg(short = 'd', long = "domain")]
    pub domain: Option<String>,

    /// Start the change-capture listener (default: true).
    #[arg(short = 'l', long = "listener", default_value_t = true)]
    pub listener: bool,

    /// Run a full (or override-windowed) refresh before anything else.
    #[arg(short = 'f', long = "full", default_value_t = false)]
    pub full: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Inspect configuration without running a mode.
    Config {
        /// Print the resolved, secret-redacted configuration for the domain.
        #[arg(long)]
        show: bool,
    },
}
