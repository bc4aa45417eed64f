//! Integration tests for Switchyard
//!
//! These tests drive the wired kernel through agents and the escalation sweep.

use std::sync::{Arc, Mutex};

use chrono::{Duration, Utc};
use proptest::prelude::*;
use serde_json::{Value, json};
use switchyard::config::{AgentConfig, Config};
use switchyard::events::{Event, Payload};
use switchyard::workflow::{DecisionStatus, StepDefinition, TimeoutPolicy, WorkflowDefinition};
use switchyard::{OrchestratorError, Switchyard, ValidationError, WorkflowInstance, WorkflowState};
use tempfile::TempDir;

fn release_definition(on_timeout: TimeoutPolicy) -> WorkflowDefinition {
    WorkflowDefinition::new(
        "release",
        vec![
            StepDefinition::new("build_requested"),
            StepDefinition::new("tests_passed"),
            StepDefinition::new("release_approved")
                .with_approval()
                .with_timeout_secs(60),
            StepDefinition::new("release_deployed"),
        ],
    )
    .with_timeout_policy(on_timeout)
}

fn base_config() -> Config {
    let mut config = Config::default();
    config.storage.persist = false;
    config.bus.redelivery_backoff_ms = 1;
    config
}

fn release_config(on_timeout: TimeoutPolicy) -> Config {
    let mut config = base_config();
    config.workflows.push(release_definition(on_timeout));
    config
}

async fn instance(kernel: &Switchyard, id: &str) -> WorkflowInstance {
    kernel.orchestrator().instance(id).await.expect("instance exists")
}

fn last_reason(instance: &WorkflowInstance) -> Option<String> {
    instance.history.last().and_then(|entry| entry.reason.clone())
}

// =============================================================================
// Release workflow
// =============================================================================

#[tokio::test]
async fn test_release_fails_when_approval_times_out() {
    let kernel = Switchyard::in_memory(&release_config(TimeoutPolicy::Fail)).unwrap();
    let ci = kernel.agent("ci");
    let id = kernel.orchestrator().start_workflow("release", Payload::new()).unwrap();

    ci.publish_agent_event("build_requested", json!({}), None).unwrap();
    kernel.settle().await;
    let inst = instance(&kernel, &id).await;
    assert_eq!(inst.current_step_index, 1);
    assert_eq!(inst.state, WorkflowState::Running);

    let before = Utc::now();
    ci.publish_agent_event("tests_passed", json!({}), None).unwrap();
    kernel.settle().await;
    let inst = instance(&kernel, &id).await;
    assert_eq!(inst.current_step_index, 2);
    assert_eq!(inst.state, WorkflowState::AwaitingApproval);

    let decision = inst.pending_decision().unwrap().clone();
    assert!(decision.deadline >= before + Duration::seconds(60));
    assert!(decision.deadline <= Utc::now() + Duration::seconds(60));
    assert_eq!(decision.resolve_on, vec!["release_approved".to_string()]);

    let escalation = kernel.escalation_manager();
    let early = escalation.sweep(Utc::now()).await;
    assert_eq!(early.scanned, 0);

    let report = escalation.sweep(decision.deadline + Duration::seconds(1)).await;
    kernel.settle().await;
    assert_eq!(report.escalated, 1);
    assert_eq!(report.failed, 1);

    let inst = instance(&kernel, &id).await;
    assert_eq!(inst.state, WorkflowState::Failed);
    assert_eq!(inst.decisions[0].status, DecisionStatus::TimedOut);
    assert_eq!(last_reason(&inst).as_deref(), Some("escalation_timeout"));

    let escalated = kernel.bus().recent(Some("release_escalated"), 10);
    assert_eq!(escalated.len(), 1);
    let failed = kernel.bus().recent(Some("release_failed"), 10);
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].status(), Some("failed"));
    assert_eq!(failed[0].str_field("reason"), Some("escalation_timeout"));
}

#[tokio::test]
async fn test_release_completes_after_approval() {
    let kernel = Switchyard::in_memory(&release_config(TimeoutPolicy::Fail)).unwrap();
    let ci = kernel.agent("ci");
    let reviewer = kernel.agent("alice");
    let id = kernel.orchestrator().start_workflow("release", Payload::new()).unwrap();

    ci.publish_agent_event("build_requested", json!({}), None).unwrap();
    ci.publish_agent_event("tests_passed", json!({}), None).unwrap();
    kernel.settle().await;
    assert_eq!(instance(&kernel, &id).await.state, WorkflowState::AwaitingApproval);

    reviewer
        .publish_agent_event("release_approved", json!({"status": "approved"}), None)
        .unwrap();
    kernel.settle().await;
    let inst = instance(&kernel, &id).await;
    assert_eq!(inst.current_step_index, 3);
    assert_eq!(inst.state, WorkflowState::Running);
    assert_eq!(inst.decisions[0].status, DecisionStatus::Approved);
    assert_eq!(inst.decisions[0].resolved_by.as_deref(), Some("alice"));

    ci.publish_agent_event("release_deployed", json!({"status": "completed"}), None)
        .unwrap();
    kernel.settle().await;
    let inst = instance(&kernel, &id).await;
    assert_eq!(inst.state, WorkflowState::Completed);
    assert_eq!(inst.current_step_index, 4);

    let completed = kernel.bus().recent(Some("release_completed"), 10);
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].status(), Some("completed"));
    assert_eq!(completed[0].instance_id(), Some(id.as_str()));
    assert_eq!(kernel.orchestrator().live_count(), 0);
}

#[tokio::test]
async fn test_out_of_order_event_is_ignored() {
    let kernel = Switchyard::in_memory(&release_config(TimeoutPolicy::Fail)).unwrap();
    let id = kernel.orchestrator().start_workflow("release", Payload::new()).unwrap();
    let before = instance(&kernel, &id).await;

    kernel
        .agent("ci")
        .publish_agent_event("release_deployed", json!({"status": "completed"}), None)
        .unwrap();
    kernel.settle().await;

    let after = instance(&kernel, &id).await;
    assert_eq!(after.state, WorkflowState::Running);
    assert_eq!(after.current_step_index, 0);
    assert_eq!(after.history.len(), before.history.len());
    assert_eq!(kernel.bus().stats().handler_failures, 0);
}

#[tokio::test]
async fn test_completed_event_with_negative_status_rejects_approval() {
    let mut config = base_config();
    config.workflows.push(WorkflowDefinition::new(
        "review",
        vec![
            StepDefinition::new("review_completed").with_approval(),
            StepDefinition::new("merge_done"),
        ],
    ));
    let kernel = Switchyard::in_memory(&config).unwrap();
    let reviewer = kernel.agent("alice");

    for status in ["rejected", "failed"] {
        let id = kernel.orchestrator().start_workflow("review", Payload::new()).unwrap();
        assert_eq!(instance(&kernel, &id).await.state, WorkflowState::AwaitingApproval);

        reviewer
            .publish_agent_event("review_completed", json!({"status": status, "instance_id": id}), None)
            .unwrap();
        kernel.settle().await;

        let inst = instance(&kernel, &id).await;
        assert_eq!(inst.state, WorkflowState::Failed, "status {}", status);
        assert_eq!(inst.current_step_index, 0);
        assert_eq!(inst.decisions[0].status, DecisionStatus::Rejected);
        assert_eq!(last_reason(&inst).as_deref(), Some("approval_rejected"));
    }

    let id = kernel.orchestrator().start_workflow("review", Payload::new()).unwrap();
    reviewer
        .publish_agent_event("review_completed", json!({"status": "completed", "instance_id": id}), None)
        .unwrap();
    kernel.settle().await;
    let inst = instance(&kernel, &id).await;
    assert_eq!(inst.state, WorkflowState::Running);
    assert_eq!(inst.decisions[0].status, DecisionStatus::Approved);
}

// =============================================================================
// Agents and events
// =============================================================================

#[tokio::test]
async fn test_lowest_error_rate_agent_wins() {
    let mut config = base_config();
    for id in ["A", "B"] {
        config.agents.push(AgentConfig {
            id: id.to_string(),
            capabilities: vec!["deploy".to_string()],
        });
    }
    let kernel = Switchyard::in_memory(&config).unwrap();

    for i in 0..100 {
        kernel.monitor().record_outcome("A", i != 0);
        kernel.monitor().record_outcome("B", i >= 20);
    }
    assert!((kernel.registry().error_rate("A") - 0.01).abs() < 1e-9);
    assert!((kernel.registry().error_rate("B") - 0.2).abs() < 1e-9);
    assert_eq!(kernel.registry().best_match(&["deploy"]).unwrap(), "A");
}

#[tokio::test]
async fn test_completed_event_without_status_is_rejected() {
    let kernel = Switchyard::in_memory(&base_config()).unwrap();
    let seen = Arc::new(Mutex::new(0usize));
    let counter = seen.clone();
    kernel.bus().subscribe("*", move |_event: Arc<Event>| {
        let counter = counter.clone();
        async move {
            *counter.lock().unwrap() += 1;
            Ok(())
        }
    });

    let err = kernel
        .agent("ci")
        .publish_agent_event("build_completed", json!({"artifact": "x.tar"}), None)
        .unwrap_err();
    assert!(matches!(err, ValidationError::MissingStatus { .. }));
    kernel.settle().await;

    assert_eq!(*seen.lock().unwrap(), 0);
    assert_eq!(kernel.bus().stats().rejected, 1);
    assert!(kernel.bus().recent(None, 10).is_empty());
}

#[tokio::test]
async fn test_duplicate_request_is_applied_once() {
    let kernel = Switchyard::in_memory(&release_config(TimeoutPolicy::Fail)).unwrap();
    let ci = kernel.agent("ci");
    let id = kernel.orchestrator().start_workflow("release", Payload::new()).unwrap();
    kernel.settle().await;

    for _ in 0..2 {
        ci.publish_agent_event("build_requested", json!({}), Some("req-1".to_string()))
            .unwrap();
        kernel.settle().await;
    }

    let inst = instance(&kernel, &id).await;
    assert_eq!(inst.current_step_index, 1);
    let applied = inst
        .history
        .iter()
        .filter(|entry| entry.event.event_type == "build_requested")
        .count();
    assert_eq!(applied, 1);

    // One request for step 0 at start, one for step 1 after the build
    assert_eq!(kernel.bus().recent(Some("release_step_requested"), 10).len(), 2);
}

#[tokio::test]
async fn test_cancelling_finished_instance_is_rejected() {
    let mut config = base_config();
    config
        .workflows
        .push(WorkflowDefinition::new("short", vec![StepDefinition::new("done_signal")]));
    let kernel = Switchyard::in_memory(&config).unwrap();
    let id = kernel.orchestrator().start_workflow("short", Payload::new()).unwrap();

    kernel
        .agent("ci")
        .publish_agent_event("done_signal", json!({}), None)
        .unwrap();
    kernel.settle().await;
    assert_eq!(instance(&kernel, &id).await.state, WorkflowState::Completed);

    let err = kernel.orchestrator().cancel(&id, None).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<OrchestratorError>(),
        Some(OrchestratorError::NotCancellable {
            state: WorkflowState::Completed,
            ..
        })
    ));
}

// =============================================================================
// Escalation
// =============================================================================

fn deploy_config() -> Config {
    let mut config = base_config();
    for id in ["d1", "d2"] {
        config.agents.push(AgentConfig {
            id: id.to_string(),
            capabilities: vec!["deploy".to_string()],
        });
    }
    config.workflows.push(
        WorkflowDefinition::new(
            "rollout",
            vec![
                StepDefinition::new("rollout_done")
                    .with_capabilities(&["deploy"])
                    .with_timeout_secs(30),
            ],
        )
        .with_timeout_policy(TimeoutPolicy::Reassign),
    );
    config
}

#[tokio::test]
async fn test_reassigned_once_then_failed() {
    let kernel = Switchyard::in_memory(&deploy_config()).unwrap();
    let escalation = kernel.escalation_manager();
    let id = kernel.orchestrator().start_workflow("rollout", Payload::new()).unwrap();
    kernel.settle().await;

    let inst = instance(&kernel, &id).await;
    assert_eq!(inst.assigned_agent.as_deref(), Some("d1"));
    let first_deadline = inst.deadline.unwrap();

    let report = escalation.sweep(first_deadline + Duration::seconds(1)).await;
    kernel.settle().await;
    assert_eq!(report.reassigned, 1);

    let inst = instance(&kernel, &id).await;
    assert_eq!(inst.state, WorkflowState::Escalated);
    assert_eq!(inst.escalations, 1);
    assert_eq!(inst.assigned_agent.as_deref(), Some("d2"));
    assert!(kernel.registry().error_rate("d1") > 0.0);
    let second_deadline = inst.deadline.unwrap();
    assert!(second_deadline > first_deadline);

    let report = escalation.sweep(second_deadline + Duration::seconds(1)).await;
    kernel.settle().await;
    assert_eq!(report.failed, 1);
    let inst = instance(&kernel, &id).await;
    assert_eq!(inst.state, WorkflowState::Failed);
    assert_eq!(last_reason(&inst).as_deref(), Some("escalation_timeout"));
    assert_eq!(kernel.bus().recent(Some("rollout_escalated"), 10).len(), 2);
}

#[tokio::test]
async fn test_reassigned_step_completes() {
    let kernel = Switchyard::in_memory(&deploy_config()).unwrap();
    let id = kernel.orchestrator().start_workflow("rollout", Payload::new()).unwrap();
    let deadline = instance(&kernel, &id).await.deadline.unwrap();

    kernel
        .escalation_manager()
        .sweep(deadline + Duration::seconds(1))
        .await;
    kernel.settle().await;

    kernel
        .agent("d2")
        .publish_agent_event("rollout_done", json!({"status": "ok"}), None)
        .unwrap();
    kernel.settle().await;

    let inst = instance(&kernel, &id).await;
    assert_eq!(inst.state, WorkflowState::Completed);
    let latency = kernel
        .monitor()
        .aggregate("d2", "step_latency_ms", switchyard::Window::All);
    assert_eq!(latency.count, 1);
}

#[tokio::test]
async fn test_timed_out_approval_is_reopened() {
    let mut config = base_config();
    config.workflows.push(
        WorkflowDefinition::new(
            "gate",
            vec![StepDefinition::new("gate_approved").with_approval().with_timeout_secs(10)],
        )
        .with_timeout_policy(TimeoutPolicy::Reassign),
    );
    let kernel = Switchyard::in_memory(&config).unwrap();
    let id = kernel.orchestrator().start_workflow("gate", Payload::new()).unwrap();
    let deadline = instance(&kernel, &id).await.deadline.unwrap();

    kernel
        .escalation_manager()
        .sweep(deadline + Duration::seconds(1))
        .await;
    kernel.settle().await;

    let inst = instance(&kernel, &id).await;
    assert_eq!(inst.state, WorkflowState::Escalated);
    assert_eq!(inst.decisions.len(), 2);
    assert_eq!(inst.decisions[0].status, DecisionStatus::TimedOut);
    let reopened = inst.pending_decision().unwrap().clone();
    assert_eq!(kernel.orchestrator().pending_decisions().await, vec![reopened.clone()]);

    kernel
        .agent("bob")
        .publish_agent_event(
            "gate_approved",
            json!({"status": "approved", "decision_id": reopened.id}),
            None,
        )
        .unwrap();
    kernel.settle().await;
    let inst = instance(&kernel, &id).await;
    assert_eq!(inst.state, WorkflowState::Completed);
    assert_eq!(inst.decisions[1].status, DecisionStatus::Approved);
}

// =============================================================================
// Persistence
// =============================================================================

#[tokio::test]
async fn test_state_survives_restart() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let mut config = release_config(TimeoutPolicy::Fail);
    config
        .workflows
        .push(WorkflowDefinition::new("short", vec![StepDefinition::new("done_signal")]));

    let (live_id, done_id) = {
        let kernel = Switchyard::with_journal_dir(&config, temp_dir.path()).unwrap();
        let ci = kernel.agent("ci");
        let live_id = kernel.orchestrator().start_workflow("release", Payload::new()).unwrap();
        ci.publish_agent_event("build_requested", json!({"instance_id": live_id}), None)
            .unwrap();
        let done_id = kernel.orchestrator().start_workflow("short", Payload::new()).unwrap();
        ci.publish_agent_event("done_signal", json!({"instance_id": done_id}), None)
            .unwrap();
        kernel.settle().await;
        (live_id, done_id)
    };

    let kernel = Switchyard::with_journal_dir(&config, temp_dir.path()).unwrap();
    let live = instance(&kernel, &live_id).await;
    assert_eq!(live.state, WorkflowState::Running);
    assert_eq!(live.current_step_index, 1);
    let done = instance(&kernel, &done_id).await;
    assert_eq!(done.state, WorkflowState::Completed);
    assert_eq!(kernel.orchestrator().live_count(), 1);
    assert_eq!(kernel.orchestrator().instances(true).await.len(), 2);
    assert_eq!(kernel.bus().recent(Some("build_requested"), 10).len(), 1);

    kernel
        .agent("ci")
        .publish_agent_event("tests_passed", json!({}), None)
        .unwrap();
    kernel.settle().await;
    let live = instance(&kernel, &live_id).await;
    assert_eq!(live.current_step_index, 2);
    assert_eq!(live.state, WorkflowState::AwaitingApproval);
}

#[tokio::test]
async fn test_journal_has_one_kernel_at_a_time() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config = release_config(TimeoutPolicy::Fail);

    let runner = Switchyard::with_journal_dir(&config, temp_dir.path()).unwrap();
    let id = runner.orchestrator().start_workflow("release", Payload::new()).unwrap();
    runner.settle().await;

    let err = Switchyard::with_journal_dir(&config, temp_dir.path())
        .err()
        .expect("second kernel must be refused");
    assert!(format!("{:#}", err).contains("in use"));
    drop(runner);

    let kernel = Switchyard::with_journal_dir(&config, temp_dir.path()).unwrap();
    kernel
        .agent("ci")
        .publish_agent_event("build_requested", json!({"instance_id": id}), None)
        .unwrap();
    kernel.settle().await;
    assert_eq!(instance(&kernel, &id).await.current_step_index, 1);
}

// =============================================================================
// Ordering
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_consecutive_steps_apply_in_publish_order() {
    let mut config = base_config();
    config.workflows.push(WorkflowDefinition::new(
        "pair",
        vec![StepDefinition::new("a_done"), StepDefinition::new("b_done")],
    ));
    let kernel = Switchyard::in_memory(&config).unwrap();
    let agent = kernel.agent("worker");

    let mut ids = Vec::new();
    for _ in 0..200 {
        let id = kernel.orchestrator().start_workflow("pair", Payload::new()).unwrap();
        agent
            .publish_agent_event("a_done", json!({"instance_id": id}), None)
            .unwrap();
        agent
            .publish_agent_event("b_done", json!({"instance_id": id}), None)
            .unwrap();
        ids.push(id);
    }
    kernel.settle().await;

    for id in &ids {
        let inst = instance(&kernel, id).await;
        assert_eq!(inst.state, WorkflowState::Completed, "instance {} stalled", id);
    }
    assert_eq!(kernel.orchestrator().live_count(), 0);
}

// =============================================================================
// Properties
// =============================================================================

fn scripted_event(choice: usize) -> (&'static str, Value) {
    match choice {
        0 => ("build_requested", json!({})),
        1 => ("tests_passed", json!({})),
        2 => ("release_approved", json!({"status": "approved"})),
        3 => ("release_approved", json!({"status": "rejected"})),
        4 => ("release_deployed", json!({"status": "completed"})),
        _ => ("unrelated_notice", json!({})),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn property_step_index_never_rewinds(choices in prop::collection::vec(0usize..6, 1..16)) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let kernel = Switchyard::in_memory(&release_config(TimeoutPolicy::Fail)).unwrap();
            let ci = kernel.agent("ci");
            let id = kernel.orchestrator().start_workflow("release", Payload::new()).unwrap();

            let mut last = 0;
            for choice in choices {
                let (event_type, data) = scripted_event(choice);
                ci.publish_agent_event(event_type, data, None).unwrap();
                kernel.settle().await;

                let inst = instance(&kernel, &id).await;
                assert!(inst.current_step_index >= last);
                assert!(inst.current_step_index <= 4);
                last = inst.current_step_index;
            }
        });
    }
}
