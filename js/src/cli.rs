//! CLI argument parsing for journalstore

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "js")]
#[command(author, version, about = "Append-only JSONL journal inspector", long_about = None)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Journal directory (overrides config)
    #[arg(short, long)]
    pub journal: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List streams
    List {
        /// List archived streams instead of live ones
        #[arg(short, long)]
        archived: bool,
    },

    /// Print the entries of a stream
    Cat {
        /// Stream name
        #[arg(required = true)]
        stream: String,

        /// Only print the last N entries
        #[arg(short, long)]
        tail: Option<usize>,
    },

    /// Show statistics for a stream
    Stats {
        /// Stream name
        #[arg(required = true)]
        stream: String,
    },
}
