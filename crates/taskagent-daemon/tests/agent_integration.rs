#![allow(clippy::unwrap_used, clippy::panic)] // Integration tests use unwrap for brevity

//! Agents and clients talking over the in-process bus, with real workers.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::{Value, json};

use taskagent_core::config::QueueConfig;
use taskagent_daemon::TaskAgent;
use taskagent_daemon::agent::SHOW_TASKS;
use taskagent_daemon::client::{CallEvent, ClientOptions, CommandClient, TaskHandle};
use taskagent_daemon::runner::ChildStatus;
use taskagent_daemon::transport::MemoryBus;

async fn start_agent(
    bus: &Arc<MemoryBus>,
    dir: &std::path::Path,
    resource: &str,
    queues: &[QueueConfig],
) -> TaskAgent {
    let agent = TaskAgent::new(&common::agent_config(dir, resource), bus.clone()).unwrap();
    agent.setup_queues(queues).await.unwrap();
    agent
}

fn client(bus: &Arc<MemoryBus>) -> CommandClient {
    CommandClient::new(
        bus.clone(),
        ClientOptions {
            timeout: Duration::from_secs(30),
            max_outstanding: None,
        },
    )
}

async fn events(mut call: TaskHandle) -> Vec<(String, Value)> {
    let mut out = Vec::new();
    while let Some(event) = call.next().await {
        match event {
            CallEvent::Event(event) => out.push((event.name, event.payload)),
            CallEvent::TimedOut => panic!("call timed out"),
        }
    }
    out
}

fn names(events: &[(String, Value)]) -> Vec<&str> {
    events.iter().map(|(n, _)| n.as_str()).collect()
}

#[tokio::test]
async fn demo_over_the_bus() {
    let dir = tempfile::tempdir().unwrap();
    let bus = Arc::new(MemoryBus::new());
    let agent = start_agent(&bus, dir.path(), "svc", &[common::queue("demo_tasks", &["demo"], 4)]).await;

    let handle = client(&bus).get_agent_handle("svc", "u1").await.unwrap();
    let call = handle.send_task("demo", json!({})).await.unwrap();
    let events = events(call).await;

    assert_eq!(names(&events), vec!["start", "progress", "finish"]);
    assert_eq!(events[1].1["value"], 50);
    assert_eq!(events[2].1["hello"], "world");
    assert_eq!(handle.outstanding().await, 0);

    let history = agent.runner().history(None).await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, ChildStatus::Finished);
    agent.shutdown().await;
}

#[tokio::test]
async fn concurrent_calls_are_correlated() {
    let dir = tempfile::tempdir().unwrap();
    let bus = Arc::new(MemoryBus::new());
    let _agent = start_agent(
        &bus,
        dir.path(),
        "svc",
        &[common::queue("mixed", &["demo", "error"], 2)],
    )
    .await;

    let handle = client(&bus).get_agent_handle("svc", "u1").await.unwrap();
    let failing = handle.send_task("error", json!({})).await.unwrap();
    let passing = handle.send_task("demo", json!({})).await.unwrap();
    let (failing, passing) = tokio::join!(events(failing), events(passing));

    assert_eq!(names(&passing), vec!["start", "progress", "finish"]);
    assert_eq!(
        names(&failing),
        vec!["start", "start:silly", "end:silly", "error", "error", "finish"]
    );
}

#[tokio::test]
async fn admission_never_exceeds_the_queue_limit() {
    let dir = tempfile::tempdir().unwrap();
    let bus = Arc::new(MemoryBus::new());
    let agent = Arc::new(
        start_agent(&bus, dir.path(), "svc", &[common::queue("serial", &["demo"], 1)]).await,
    );

    let peak = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicBool::new(false));
    let sampler = {
        let agent = Arc::clone(&agent);
        let peak = Arc::clone(&peak);
        let done = Arc::clone(&done);
        tokio::spawn(async move {
            while !done.load(Ordering::SeqCst) {
                peak.fetch_max(agent.runner().active_count().await, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
    };

    let handle = client(&bus).get_agent_handle("svc", "u1").await.unwrap();
    let mut calls = Vec::new();
    for _ in 0..3 {
        calls.push(handle.send_task("demo", json!({})).await.unwrap());
    }
    for call in calls {
        call.finished().await.unwrap();
    }
    done.store(true, Ordering::SeqCst);
    sampler.await.unwrap();

    assert!(peak.load(Ordering::SeqCst) <= 1);
    let history = agent.runner().history(None).await;
    assert_eq!(history.len(), 3);
    for pair in history.windows(2) {
        assert!(pair[1].started_at >= pair[0].finished_at.unwrap());
    }
}

#[tokio::test]
async fn subtasks_are_delegated_to_the_sibling_agent() {
    let dir = tempfile::tempdir().unwrap();
    let bus = Arc::new(MemoryBus::new());
    let front = start_agent(&bus, dir.path(), "front", &[common::queue("front", &["delegate"], 2)]).await;
    let back = start_agent(&bus, dir.path(), "back", &[common::queue("back", &["demo"], 2)]).await;

    let handle = client(&bus).get_agent_handle("front", "u1").await.unwrap();
    let call = handle
        .send_task("delegate", json!({"resource": "back", "task": "demo"}))
        .await
        .unwrap();
    let events = events(call).await;

    assert_eq!(names(&events), vec!["validate", "start", "progress", "finish"]);
    let finish = &events[3].1;
    assert_eq!(finish["resource"], "back");
    assert_eq!(finish["result"]["hello"], "world");

    assert_eq!(front.runner().history(Some(ChildStatus::Finished)).await.len(), 1);
    assert_eq!(back.runner().history(Some(ChildStatus::Finished)).await.len(), 1);
    let delegate = &front.runner().history(None).await[0];
    assert!(delegate.messages.iter().any(|m| m.kind == "subtask"));
}

#[tokio::test]
async fn show_tasks_reports_history() {
    let dir = tempfile::tempdir().unwrap();
    let bus = Arc::new(MemoryBus::new());
    let _agent = start_agent(&bus, dir.path(), "svc", &[common::queue("demo_tasks", &["demo"], 4)]).await;

    let handle = client(&bus).get_agent_handle("svc", "u1").await.unwrap();
    handle
        .send_task("demo", json!({}))
        .await
        .unwrap()
        .finished()
        .await
        .unwrap();

    let report = handle
        .send_task(SHOW_TASKS, json!({"status": "finished"}))
        .await
        .unwrap()
        .finished()
        .await
        .unwrap();
    let history = report.payload["history"].as_array().unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0]["task"], "demo");
    assert_eq!(history[0]["status"], "finished");
    assert!(history[0]["elapsed_seconds"].is_i64());
}
