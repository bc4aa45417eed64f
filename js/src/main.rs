use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use log::info;

use journalstore::Journal;
use journalstore::cli::{Cli, Command};
use journalstore::config::Config;

fn setup_logging() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Warn)
        .init();
    Ok(())
}

fn main() -> Result<()> {
    setup_logging().context("Failed to setup logging")?;

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    let journal_path = cli.journal.clone().unwrap_or_else(|| config.journal_path.clone());

    info!("journalstore opening {}", journal_path.display());
    let journal = Journal::open(&journal_path)?;

    match cli.command {
        Command::List { archived } => {
            let streams: Vec<String> = if archived {
                journal.archived_streams()?
            } else {
                journal.streams()?
            }
            .into_iter()
            .filter(|stream| config.lists(stream))
            .collect();
            if streams.is_empty() {
                println!("No streams found");
            } else {
                for stream in streams {
                    println!("{}", stream);
                }
            }
        }
        Command::Cat { stream, tail } => {
            let entries = journal.read_any::<serde_json::Value>(&stream)?;
            let skip = tail.map(|n| entries.len().saturating_sub(n)).unwrap_or(0);
            for entry in entries.into_iter().skip(skip) {
                println!(
                    "{} {} {}",
                    entry.seq.to_string().yellow(),
                    entry.at_ms.to_string().dimmed(),
                    entry.record
                );
            }
        }
        Command::Stats { stream } => {
            let stats = journal.stats(&stream)?;
            println!("Stream: {}", stats.stream.cyan());
            println!("  Entries: {}", stats.entries);
            println!("  Bytes: {}", stats.bytes);
            println!("  Archived: {}", stats.archived);
        }
    }

    Ok(())
}
