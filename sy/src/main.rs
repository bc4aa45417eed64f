//! Switchyard - event bus and workflow orchestrator for agent fleets
//!
//! CLI entry point. Every invocation replays the journal, performs one
//! operation, waits for the bus to settle and exits; `run` and
//! `subscribe-event` stay up until interrupted. A journal has a single
//! writer, so other invocations on it fail while one of those is up.

use std::collections::BTreeMap;
use std::fs;
use std::sync::{Arc, Mutex};

use clap::Parser;
use colored::*;
use eyre::{Context, Result, eyre};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use switchyard::cli::{Cli, Command, OutputFormat, get_log_path};
use switchyard::config::Config;
use switchyard::events::{Event, INSTANCE_ID_KEY, Payload, WILDCARD};
use switchyard::monitor::Window;
use switchyard::{Switchyard, WorkflowInstance, WorkflowState};

fn setup_logging(cli_log_level: Option<&str>) -> Result<()> {
    let log_path = get_log_path();
    if let Some(log_dir) = log_path.parent() {
        fs::create_dir_all(log_dir).context("Failed to create log directory")?;
    }

    let level = match cli_log_level.map(str::to_uppercase).as_deref() {
        Some("TRACE") => tracing::Level::TRACE,
        Some("DEBUG") => tracing::Level::DEBUG,
        Some("INFO") | None => tracing::Level::INFO,
        Some("WARN") | Some("WARNING") => tracing::Level::WARN,
        Some("ERROR") => tracing::Level::ERROR,
        Some(other) => {
            eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", other);
            tracing::Level::INFO
        }
    };

    let log_file = fs::File::create(&log_path).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.log_level.as_deref()).context("Failed to setup logging")?;

    let mut config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    if let Some(journal) = &cli.journal {
        config.storage.journal_dir = journal.to_string_lossy().into_owned();
        config.storage.persist = true;
    }

    let kernel = Switchyard::open(&config).context("Failed to start switchyard")?;
    let format = cli.format;

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Command::PublishEvent {
            event_type,
            data,
            request_id,
            source,
            instance,
        } => publish_event(&kernel, format, &event_type, data, request_id, &source, instance).await,
        Command::SubscribeEvent { event_type } => subscribe_event(&kernel, format, &event_type).await,
        Command::ListEvents => list_events(&kernel, format),
        Command::EventHistory {
            event_type,
            instance,
            limit,
        } => event_history(&kernel, format, event_type.as_deref(), instance.as_deref(), limit),
        Command::PerformanceMetrics { agent, metric } => {
            performance_metrics(&kernel, format, agent.as_deref(), metric.as_deref())
        }
        Command::MessageBusStatus => message_bus_status(&kernel, format).await,
        Command::StartWorkflow { name, context } => start_workflow(&kernel, format, &name, context).await,
        Command::Cancel { instance_id, reason } => {
            kernel.orchestrator().cancel(&instance_id, reason.as_deref()).await?;
            kernel.settle().await;
            match format {
                OutputFormat::Json => print_json(&serde_json::json!({ "cancelled": instance_id }))?,
                OutputFormat::Text => println!("{} {}", "Cancelled".yellow().bold(), instance_id),
            }
            Ok(())
        }
        Command::Instances { all } => instances(&kernel, format, all).await,
        Command::Decisions => decisions(&kernel, format).await,
        Command::Run => run(&kernel).await,
    }
}

fn parse_object(raw: Option<String>, flag: &str) -> Result<Value> {
    match raw {
        Some(raw) => serde_json::from_str(&raw).context(format!("{} must be valid JSON", flag)),
        None => Ok(Value::Null),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_event(event: &Event) {
    let status = event.status().unwrap_or("-");
    let status = match status {
        "completed" | "approved" => status.green(),
        "failed" | "rejected" => status.red(),
        "escalated" | "pending" => status.yellow(),
        _ => status.normal(),
    };
    println!(
        "{} {} {} {} {}",
        event.emitted_at.format("%H:%M:%S%.3f").to_string().dimmed(),
        event.event_type.cyan().bold(),
        status,
        format!("from {}", event.source).dimmed(),
        serde_json::to_string(&event.payload).unwrap_or_default()
    );
}

fn print_events(events: &[Event], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => print_json(&events),
        OutputFormat::Text => {
            if events.is_empty() {
                println!("{}", "No events".dimmed());
            }
            for event in events {
                print_event(event);
            }
            Ok(())
        }
    }
}

async fn publish_event(
    kernel: &Switchyard,
    format: OutputFormat,
    event_type: &str,
    data: Option<String>,
    request_id: Option<String>,
    source: &str,
    instance: Option<String>,
) -> Result<()> {
    let mut event = Event::from_value(event_type, source, parse_object(data, "--data")?)?;
    if let Some(request_id) = request_id {
        event = event.with_request_id(request_id);
    }
    if let Some(instance) = instance {
        event = event.with_field(INSTANCE_ID_KEY, instance);
    }

    let captured: Arc<Mutex<Vec<Event>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = captured.clone();
    let handle = kernel.bus().subscribe(WILDCARD, move |event: Arc<Event>| {
        let sink = sink.clone();
        async move {
            if let Ok(mut events) = sink.lock() {
                events.push(event.as_ref().clone());
            }
            Ok::<(), eyre::Report>(())
        }
    });

    let published_id = event.id.clone();
    kernel.bus().publish(event.clone())?;
    kernel.settle().await;
    kernel.bus().unsubscribe(&handle);

    let follow_ups: Vec<Event> = captured
        .lock()
        .map(|events| events.iter().filter(|e| e.id != published_id).cloned().collect())
        .unwrap_or_default();

    match format {
        OutputFormat::Json => print_json(&serde_json::json!({
            "published": event,
            "follow_ups": follow_ups,
        })),
        OutputFormat::Text => {
            println!("{} {}", "Published".green().bold(), event.event_type);
            println!("  {} {}", "id:".dimmed(), event.id);
            if follow_ups.is_empty() {
                println!("  {}", "no follow-up events".dimmed());
            } else {
                println!("  {}", "follow-ups:".dimmed());
                for follow_up in &follow_ups {
                    print!("  ");
                    print_event(follow_up);
                }
            }
            Ok(())
        }
    }
}

async fn subscribe_event(kernel: &Switchyard, format: OutputFormat, event_type: &str) -> Result<()> {
    kernel.bus().subscribe(event_type, move |event: Arc<Event>| async move {
        match format {
            OutputFormat::Json => println!("{}", serde_json::to_string(event.as_ref())?),
            OutputFormat::Text => print_event(&event),
        }
        Ok::<(), eyre::Report>(())
    });
    eprintln!(
        "{} {} (Ctrl+C to stop)",
        "Subscribed to".green().bold(),
        event_type.cyan()
    );
    run(kernel).await
}

/// Sweep deadlines until Ctrl+C
async fn run(kernel: &Switchyard) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);
    let sweeper = kernel.escalation_manager().spawn(shutdown_rx);
    info!(live = kernel.orchestrator().live_count(), "Switchyard running");
    eprintln!("Switchyard running. Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;
    debug!("run: ctrl_c received, initiating shutdown");
    let _ = shutdown_tx.send(()).await;
    let _ = sweeper.await;
    kernel.settle().await;
    info!("Switchyard stopped");
    Ok(())
}

#[derive(Serialize)]
struct EventTypeRow {
    event_type: String,
    published: u64,
    workflows: Vec<String>,
}

fn list_events(kernel: &Switchyard, format: OutputFormat) -> Result<()> {
    let mut rows: BTreeMap<String, EventTypeRow> = BTreeMap::new();
    let row = |event_type: &str| EventTypeRow {
        event_type: event_type.to_string(),
        published: 0,
        workflows: Vec::new(),
    };

    for (event_type, count) in kernel.bus().event_types() {
        rows.entry(event_type.clone()).or_insert_with(|| row(&event_type)).published = count;
    }
    for definition in kernel.orchestrator().definitions() {
        for event_type in definition.event_types() {
            rows.entry(event_type.clone())
                .or_insert_with(|| row(&event_type))
                .workflows
                .push(definition.name.clone());
        }
    }
    let rows: Vec<EventTypeRow> = rows.into_values().collect();

    match format {
        OutputFormat::Json => print_json(&rows),
        OutputFormat::Text => {
            if rows.is_empty() {
                println!("{}", "No event types known".dimmed());
            }
            for row in rows {
                let workflows = if row.workflows.is_empty() {
                    String::new()
                } else {
                    format!("[{}]", row.workflows.join(", "))
                };
                println!("{:<40} {:>8} {}", row.event_type.cyan(), row.published, workflows.dimmed());
            }
            Ok(())
        }
    }
}

fn event_history(
    kernel: &Switchyard,
    format: OutputFormat,
    event_type: Option<&str>,
    instance: Option<&str>,
    limit: usize,
) -> Result<()> {
    let events = match instance {
        Some(instance) => {
            let mut events: Vec<Event> = kernel
                .bus()
                .recent(event_type, usize::MAX)
                .into_iter()
                .filter(|e| e.instance_id() == Some(instance))
                .collect();
            let skip = events.len().saturating_sub(limit);
            events.drain(..skip);
            events
        }
        None => kernel.bus().recent(event_type, limit),
    };
    print_events(&events, format)
}

fn performance_metrics(
    kernel: &Switchyard,
    format: OutputFormat,
    agent: Option<&str>,
    metric: Option<&str>,
) -> Result<()> {
    let rows: Vec<_> = kernel
        .monitor()
        .summary(Window::All)
        .into_iter()
        .filter(|row| agent.is_none_or(|a| row.agent_id == a))
        .filter(|row| metric.is_none_or(|m| row.metric_name == m))
        .collect();

    match format {
        OutputFormat::Json => print_json(&rows),
        OutputFormat::Text => {
            if rows.is_empty() {
                println!("{}", "No metrics recorded".dimmed());
                return Ok(());
            }
            println!(
                "{:<20} {:<18} {:>6} {:>10} {:>10} {:>8}",
                "AGENT".bold(),
                "METRIC".bold(),
                "COUNT".bold(),
                "MEAN".bold(),
                "P95".bold(),
                "ERRORS".bold()
            );
            let fmt = |v: Option<f64>| v.map(|v| format!("{:.2}", v)).unwrap_or_else(|| "-".to_string());
            for row in rows {
                let error_rate = format!("{:.1}%", row.aggregate.error_rate * 100.0);
                let error_rate = if row.aggregate.error_rate > 0.1 {
                    error_rate.red()
                } else {
                    error_rate.green()
                };
                println!(
                    "{:<20} {:<18} {:>6} {:>10} {:>10} {:>8}",
                    row.agent_id,
                    row.metric_name,
                    row.aggregate.count,
                    fmt(row.aggregate.mean),
                    fmt(row.aggregate.p95),
                    error_rate
                );
            }
            Ok(())
        }
    }
}

async fn message_bus_status(kernel: &Switchyard, format: OutputFormat) -> Result<()> {
    let stats = kernel.bus().stats();
    let live = kernel.orchestrator().live_count();
    let pending = kernel.orchestrator().pending_decisions().await.len();
    let agents = kernel.registry().agents().len();

    match format {
        OutputFormat::Json => print_json(&serde_json::json!({
            "bus": stats,
            "live_instances": live,
            "pending_decisions": pending,
            "agents": agents,
            "journal": kernel.journal().map(|j| j.root().display().to_string()),
        })),
        OutputFormat::Text => {
            println!("{}", "Message bus".bold());
            println!("  published:        {}", stats.published);
            println!("  delivered:        {}", stats.delivered);
            println!("  rejected:         {}", stats.rejected);
            println!("  handler failures: {}", stats.handler_failures);
            println!("  redeliveries:     {}", stats.redeliveries);
            println!("  dead letters:     {}", stats.dead_letters);
            println!("  subscriptions:    {}", stats.subscriptions);
            println!("  event types:      {}", stats.event_types.len());
            println!("{}", "Workflows".bold());
            println!("  live instances:   {}", live);
            println!("  pending decisions: {}", pending);
            println!("  agents:           {}", agents);
            if let Some(journal) = kernel.journal() {
                println!("  journal:          {}", journal.root().display());
            }
            Ok(())
        }
    }
}

async fn start_workflow(kernel: &Switchyard, format: OutputFormat, name: &str, context: Option<String>) -> Result<()> {
    let context: Payload = match parse_object(context, "--context")? {
        Value::Object(map) => map,
        Value::Null => Payload::new(),
        _ => return Err(eyre!("--context must be a JSON object")),
    };

    let id = kernel.orchestrator().start_workflow(name, context)?;
    kernel.settle().await;
    let instance = kernel
        .orchestrator()
        .instance(&id)
        .await
        .ok_or_else(|| eyre!("Instance {} vanished", id))?;

    match format {
        OutputFormat::Json => print_json(&instance),
        OutputFormat::Text => {
            println!("{} {} {}", "Started".green().bold(), name, id);
            print_instance(&instance);
            Ok(())
        }
    }
}

fn print_instance(instance: &WorkflowInstance) {
    let state = instance.state.to_string();
    let state = match instance.state {
        WorkflowState::Completed => state.green(),
        WorkflowState::Failed | WorkflowState::Cancelled => state.red(),
        WorkflowState::AwaitingApproval | WorkflowState::Escalated => state.yellow(),
        WorkflowState::Running => state.cyan(),
    };
    let reason = instance
        .history
        .last()
        .and_then(|entry| entry.reason.clone())
        .map(|r| format!("({})", r))
        .unwrap_or_default();
    println!(
        "  {} {:<16} {:<18} step {} {} {}",
        instance.id.dimmed(),
        instance.workflow,
        state,
        instance.current_step_index,
        instance.assigned_agent.as_deref().unwrap_or("-"),
        reason.dimmed()
    );
}

async fn instances(kernel: &Switchyard, format: OutputFormat, all: bool) -> Result<()> {
    let instances = kernel.orchestrator().instances(all).await;
    match format {
        OutputFormat::Json => print_json(&instances),
        OutputFormat::Text => {
            if instances.is_empty() {
                println!("{}", "No instances".dimmed());
            }
            for instance in &instances {
                print_instance(instance);
            }
            Ok(())
        }
    }
}

async fn decisions(kernel: &Switchyard, format: OutputFormat) -> Result<()> {
    let decisions = kernel.orchestrator().pending_decisions().await;
    match format {
        OutputFormat::Json => print_json(&decisions),
        OutputFormat::Text => {
            if decisions.is_empty() {
                println!("{}", "No pending decisions".dimmed());
            }
            for decision in &decisions {
                println!(
                    "  {} {} step {} due {}",
                    decision.id.dimmed(),
                    decision.workflow_instance_id,
                    decision.step_index,
                    decision.deadline.to_rfc3339()
                );
                println!("    {}", decision.prompt);
                println!("    resolve with: {}", decision.resolve_on.join(", ").cyan());
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_object() {
        assert_eq!(parse_object(None, "--data").unwrap(), Value::Null);
        assert!(parse_object(Some("{\"a\":1}".to_string()), "--data").unwrap().is_object());
        assert!(parse_object(Some("{nope".to_string()), "--data").is_err());
    }
}
