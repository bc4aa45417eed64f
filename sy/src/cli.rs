//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;

/// Switchyard - event bus and workflow orchestrator for agent fleets
#[derive(Parser)]
#[command(
    name = "sy",
    version,
    about = "Event bus and workflow orchestrator with human-in-the-loop gating"
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Journal directory (overrides storage.journal-dir)
    #[arg(short, long, global = true)]
    pub journal: Option<PathBuf>,

    /// Output format
    #[arg(short, long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Publish an event and show the follow-up events it caused
    PublishEvent {
        /// Event type
        #[arg(value_name = "TYPE")]
        event_type: String,

        /// JSON object payload
        #[arg(short, long)]
        data: Option<String>,

        /// Request id used to deduplicate redeliveries
        #[arg(short, long)]
        request_id: Option<String>,

        /// Publishing agent id
        #[arg(short, long, default_value = "cli")]
        source: String,

        /// Route the event to one workflow instance
        #[arg(short, long)]
        instance: Option<String>,
    },

    /// Stream events until interrupted, sweeping deadlines meanwhile
    SubscribeEvent {
        /// Event type (all events when omitted)
        #[arg(value_name = "TYPE", default_value = "*")]
        event_type: String,
    },

    /// List event types known to the bus and the workflows
    ListEvents,

    /// Show recent events
    EventHistory {
        /// Only events of this type
        #[arg(short = 't', long)]
        event_type: Option<String>,

        /// Only events concerning this workflow instance
        #[arg(short, long)]
        instance: Option<String>,

        /// Number of events to show
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },

    /// Show per-agent metric aggregates
    PerformanceMetrics {
        /// Only this agent
        #[arg(short, long)]
        agent: Option<String>,

        /// Only this metric
        #[arg(short, long)]
        metric: Option<String>,
    },

    /// Show bus counters and workflow totals
    MessageBusStatus,

    /// Start a workflow instance
    StartWorkflow {
        /// Workflow name
        #[arg(value_name = "NAME")]
        name: String,

        /// JSON object given to the instance as context
        #[arg(long)]
        context: Option<String>,
    },

    /// Cancel a live workflow instance
    Cancel {
        /// Instance id
        #[arg(value_name = "ID")]
        instance_id: String,

        /// Reason recorded on the instance
        #[arg(short, long)]
        reason: Option<String>,
    },

    /// List workflow instances
    Instances {
        /// Include finished instances
        #[arg(short, long)]
        all: bool,
    },

    /// List decisions waiting for a human
    Decisions,

    /// Run the kernel in the foreground with the escalation sweep
    Run,
}

/// Output format for every command
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        debug!(%s, "OutputFormat::from_str: called");
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown format: {}. Use: text or json", s)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Where `sy` writes its log file
pub fn get_log_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("switchyard")
        .join("logs")
        .join("switchyard.log")
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_publish_event() {
        let cli = Cli::try_parse_from([
            "sy",
            "publish-event",
            "build_completed",
            "--data",
            r#"{"status":"completed"}"#,
            "-f",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.format, OutputFormat::Json);
        match cli.command {
            Command::PublishEvent {
                event_type, source, ..
            } => {
                assert_eq!(event_type, "build_completed");
                assert_eq!(source, "cli");
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_subscribe_defaults_to_wildcard() {
        let cli = Cli::try_parse_from(["sy", "subscribe-event"]).unwrap();
        assert!(matches!(cli.command, Command::SubscribeEvent { event_type } if event_type == "*"));
    }

    #[test]
    fn test_unknown_format_rejected() {
        assert!(Cli::try_parse_from(["sy", "-f", "xml", "list-events"]).is_err());
    }
}
