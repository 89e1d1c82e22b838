//! End-to-end flows across orchestrator, channels, graph and state sync.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use conclave_agent::{Agent, AgentRole};
use conclave_channels::{OutgoingMessage, LAST_MESSAGE_KEY, REPLY_TYPE};
use conclave_core::config::ConclaveConfig;
use conclave_core::error::ConclaveError;
use conclave_core::event::EventBus;
use conclave_core::handler::Handler;
use conclave_core::traits::StateProvider;
use conclave_core::types::{DataMap, EventKind, SystemId};
use conclave_core::{MemoryStateStore, StateKey};
use conclave_graph::ExecutionStatus;
use conclave_orchestrator::{Orchestrator, StateSync, SystemStateAdapter, TaskSpec, TaskStatus};
use conclave_test_utils::{data, CallLog, EventCollector, RecordingProcessor, SlowProcessor};
use tokio_util::sync::CancellationToken;

fn recording_agent(name: &str, role: AgentRole, log: &CallLog, bus: &Arc<EventBus>) -> Arc<Agent> {
    Arc::new(
        Agent::new(
            name,
            role,
            Handler::processor(
                RecordingProcessor::new(name, log.clone()).with_delay(Duration::from_millis(20)),
            ),
        )
        .with_event_sink(bus.clone()),
    )
}

#[tokio::test]
async fn test_dependency_chain_completes_in_order() {
    let bus = Arc::new(EventBus::default());
    let collector = EventCollector::attach(
        bus.as_ref(),
        &[EventKind::TaskStarted, EventKind::TaskCompleted],
    );
    let orch = Orchestrator::new(ConclaveConfig::default(), Some(bus.clone()));
    let log = CallLog::new();
    orch.register_agent(recording_agent("planner", AgentRole::Planner, &log, &bus))
        .unwrap();

    let a = orch.create_task(TaskSpec::new("a", AgentRole::Planner)).unwrap();
    let b = orch
        .create_task(TaskSpec::new("b", AgentRole::Planner).depends_on(&a.id))
        .unwrap();
    let c = orch
        .create_task(TaskSpec::new("c", AgentRole::Planner).depends_on(&b.id))
        .unwrap();

    let c = orch.wait_for_task(&c.id, Duration::from_secs(5)).await.unwrap();
    assert_eq!(c.status, TaskStatus::Completed);

    let a = orch.get_task(&a.id).unwrap();
    let b = orch.get_task(&b.id).unwrap();
    assert!(b.started_at.unwrap() >= a.completed_at.unwrap());
    assert!(c.started_at.unwrap() >= b.completed_at.unwrap());

    // Every start of a dependent follows its dependency's completion.
    let order: Vec<String> = collector
        .events()
        .iter()
        .map(|e| format!("{}:{}", e.kind, e.task_id.as_ref().unwrap()))
        .collect();
    let pos = |kind: &str, id: &conclave_core::types::TaskId| {
        order.iter().position(|s| s == &format!("{}:{}", kind, id)).unwrap()
    };
    assert!(pos("task_completed", &a.id) < pos("task_started", &b.id));
    assert!(pos("task_completed", &b.id) < pos("task_started", &c.id));

    orch.shutdown().await;
}

#[tokio::test]
async fn test_orchestrator_and_worker_exchange_reply() {
    let orch = Orchestrator::new(ConclaveConfig::default(), None);
    let log = CallLog::new();
    let bus = Arc::new(EventBus::default());
    let boss = recording_agent("orchestrator", AgentRole::Orchestrator, &log, &bus);
    let worker = recording_agent("worker", AgentRole::CodeGenerator, &log, &bus);
    orch.register_agent(boss.clone()).unwrap();
    orch.register_agent(worker.clone()).unwrap();

    let comm = orch.communication();
    let channel = comm.create_channel(boss.id(), worker.id(), "assign").unwrap();
    let request = OutgoingMessage::new(&channel.id, boss.id(), worker.id(), "assign")
        .with_content(data([("job", json!("build login"))]));

    let reply = comm
        .send_and_wait(request, Some(Duration::from_secs(5)))
        .await
        .unwrap();

    assert_eq!(reply.message_type, REPLY_TYPE);
    assert_eq!(reply.target, *boss.id());
    assert!(!reply.requires_reply);

    let original = comm.get_message(reply.reply_to_id.as_ref().unwrap()).unwrap();
    assert_eq!(original.source, *boss.id());
    let seen = worker.get_state(LAST_MESSAGE_KEY).unwrap();
    assert_eq!(seen["id"], json!(original.id));
    assert_eq!(seen["content"]["job"], json!("build login"));

    // Exactly one reply per request.
    let replies: Vec<_> = comm
        .get_messages_by_channel(&channel.id)
        .into_iter()
        .filter(|m| m.reply_to_id.as_ref() == Some(&original.id))
        .collect();
    assert_eq!(replies.len(), 1);

    orch.shutdown().await;
}

#[tokio::test]
async fn test_slow_worker_surfaces_reply_timeout() {
    let orch = Orchestrator::new(ConclaveConfig::default(), None);
    let boss = Arc::new(Agent::new("orchestrator", AgentRole::Orchestrator, Handler::Passthrough));
    let worker = Arc::new(Agent::new(
        "worker",
        AgentRole::CodeGenerator,
        Handler::processor(SlowProcessor::new(Duration::from_secs(5))),
    ));
    orch.register_agent(boss.clone()).unwrap();
    orch.register_agent(worker.clone()).unwrap();

    let comm = orch.communication();
    let channel = comm.create_channel(boss.id(), worker.id(), "assign").unwrap();
    let request = OutgoingMessage::new(&channel.id, boss.id(), worker.id(), "assign");

    let err = comm
        .send_and_wait(request, Some(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert!(matches!(err, ConclaveError::ReplyTimeout { .. }));

    orch.shutdown().await;
}

#[tokio::test]
async fn test_cancelled_pending_task_is_never_assigned() {
    let bus = Arc::new(EventBus::default());
    let collector = EventCollector::attach(bus.as_ref(), &[EventKind::TaskAssigned]);
    let orch = Orchestrator::new(ConclaveConfig::default(), Some(bus.clone()));

    // No verifier yet, so the task waits in pending.
    let task = orch
        .create_task(TaskSpec::new("verify", AgentRole::Verifier))
        .unwrap();
    let cancelled = orch.cancel_task(&task.id).unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);
    assert!(cancelled.completed_at.is_some());

    let log = CallLog::new();
    orch.register_agent(recording_agent("verifier", AgentRole::Verifier, &log, &bus))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(orch.get_task(&task.id).unwrap().status, TaskStatus::Cancelled);
    assert_eq!(collector.count(EventKind::TaskAssigned), 0);
    assert!(log.entries().is_empty());

    let err = orch.cancel_task(&task.id).unwrap_err();
    assert!(matches!(err, ConclaveError::InvalidTransition { .. }));
}

#[tokio::test]
async fn test_workflow_runs_linked_agents_once_each() {
    let orch = Orchestrator::new(ConclaveConfig::default(), None);
    let log = CallLog::new();
    let bus = Arc::new(EventBus::default());
    let planner = recording_agent("planner", AgentRole::Planner, &log, &bus);
    let ui = recording_agent("ui", AgentRole::UiBuilder, &log, &bus);
    let api = recording_agent("api", AgentRole::ApiBuilder, &log, &bus);
    let verifier = recording_agent("verifier", AgentRole::Verifier, &log, &bus);
    for agent in [&planner, &ui, &api, &verifier] {
        orch.register_agent((*agent).clone()).unwrap();
    }

    // Diamond: the verifier is reachable along two paths.
    orch.link_agents(planner.id(), ui.id(), "ui").unwrap();
    orch.link_agents(planner.id(), api.id(), "api").unwrap();
    orch.link_agents(ui.id(), verifier.id(), "verify").unwrap();
    orch.link_agents(api.id(), verifier.id(), "verify").unwrap();

    let execution = orch
        .execute_workflow(planner.id(), DataMap::new(), DataMap::new())
        .unwrap();
    let done = orch
        .executor()
        .wait_for_execution(&execution.id, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(done.status, ExecutionStatus::Completed);
    assert_eq!(log.count("verifier"), 1);
    assert_eq!(log.entries().len(), 4);

    orch.shutdown().await;
}

#[tokio::test]
async fn test_state_sync_publishes_agents_tasks_and_system() {
    let bus = Arc::new(EventBus::default());
    let store = Arc::new(MemoryStateStore::new());
    let sync = StateSync::start(bus.clone(), store.clone());
    let orch = Orchestrator::new(ConclaveConfig::default(), Some(bus.clone()));

    let log = CallLog::new();
    let planner = recording_agent("planner", AgentRole::Planner, &log, &bus);
    orch.register_agent(planner.clone()).unwrap();

    let mut watch = store.watch_state(&StateKey::agent(planner.id())).await.unwrap();
    let task = orch
        .create_task(TaskSpec::new("plan", AgentRole::Planner))
        .unwrap();
    orch.wait_for_task(&task.id, Duration::from_secs(5)).await.unwrap();
    sync.stop().await;

    assert!(watch.has_changed().unwrap());
    let agent_state = watch.borrow_and_update().clone().unwrap();
    assert_eq!(agent_state["name"], json!("planner"));

    let task_state = store.get_state(&StateKey::task(&task.id)).await.unwrap().unwrap();
    assert_eq!(task_state["status"], json!("completed"));

    let summary = SystemStateAdapter::new(store.clone(), SystemId::from("main"))
        .snapshot(&orch)
        .await
        .unwrap();
    assert_eq!(summary["tasks"]["completed"], json!(1));
    assert_eq!(
        store.get_state("system:main").await.unwrap().unwrap()["agents"][0]["name"],
        json!("planner")
    );

    orch.shutdown().await;
}
