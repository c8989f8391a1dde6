//! Scenario tests for the event loop, run against the in-memory mock bus.

use std::time::{Duration, Instant};

use interchange_core::bus::mock::SharedMockBus;
use interchange_core::bus::ManagerMessage;
use interchange_core::codec::JsonSerializer;
use interchange_core::eventloop::{EventLoop, EventLoopConfig};
use interchange_core::monitoring::NoopEmitter;
use interchange_core::registry::{ManagerId, RuntimeIdentity};
use interchange_core::selector::RandomManagerSelector;
use interchange_core::task::{FailureResult, Task};

fn identity() -> RuntimeIdentity {
    RuntimeIdentity {
        framework_version: "2024.01.01".into(),
        // Full version, truncated to its minor by `RuntimeIdentity::matches`
        // the same way a real Manager's `python_v` is — see
        // `registration_message`'s `"python_v": "3.11.4"` below.
        python_version: "3.11.4".into(),
    }
}

fn build_loop(bus: SharedMockBus, seed: u64) -> EventLoop {
    EventLoop::new(
        Box::new(bus),
        Box::new(RandomManagerSelector::new(seed)),
        Box::new(NoopEmitter),
        Box::new(JsonSerializer),
        EventLoopConfig {
            identity: identity(),
            heartbeat_threshold: Duration::from_secs(60),
            poll_period: Duration::from_millis(10),
            worker_port: 9000,
            run_id: "run-test".into(),
        },
    )
}

fn task_payload(task_id: i64, priority: f64) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "task_id": task_id,
        "resource_spec": { "priority": priority },
    }))
    .unwrap()
}

fn registration_message(manager_id: &str, max_capacity: u32, parsl_v: &str) -> ManagerMessage {
    let meta = serde_json::to_vec(&serde_json::json!({
        "type": "registration",
        "python_v": "3.11.4",
        "parsl_v": parsl_v,
        "start_time": 0.0,
        "block_id": "block-0",
        "worker_count": max_capacity,
        "max_capacity": max_capacity,
        "hostname": "host-a",
    }))
    .unwrap();
    ManagerMessage {
        manager_id: ManagerId(manager_id.as_bytes().to_vec()),
        meta,
        payloads: Vec::new(),
    }
}

fn heartbeat_message(manager_id: &str) -> ManagerMessage {
    ManagerMessage {
        manager_id: ManagerId(manager_id.as_bytes().to_vec()),
        meta: serde_json::to_vec(&serde_json::json!({"type": "heartbeat"})).unwrap(),
        payloads: Vec::new(),
    }
}

fn drain_message(manager_id: &str) -> ManagerMessage {
    ManagerMessage {
        manager_id: ManagerId(manager_id.as_bytes().to_vec()),
        meta: serde_json::to_vec(&serde_json::json!({"type": "drain"})).unwrap(),
        payloads: Vec::new(),
    }
}

fn result_message(manager_id: &str, task_ids: &[i64]) -> ManagerMessage {
    let payloads = task_ids
        .iter()
        .map(|id| {
            serde_json::to_vec(&serde_json::json!({"type": "result", "task_id": id})).unwrap()
        })
        .collect();
    ManagerMessage {
        manager_id: ManagerId(manager_id.as_bytes().to_vec()),
        meta: serde_json::to_vec(&serde_json::json!({"type": "result"})).unwrap(),
        payloads,
    }
}

fn dispatched_task_ids(frames: &[Vec<u8>]) -> Vec<i64> {
    frames
        .iter()
        .flat_map(|frame| serde_json::from_slice::<Vec<Task>>(frame).unwrap())
        .map(|t| t.task_id)
        .collect()
}

#[tokio::test]
async fn scenario_empty_dispatch_leaves_tasks_queued() {
    let bus = SharedMockBus::new();
    let mut event_loop = build_loop(bus.clone(), 1);

    for (id, prio) in [(1, 1.0), (2, 2.0), (3, 3.0)] {
        bus.push_task(task_payload(id, prio)).await;
        event_loop.run_iteration(Instant::now()).await;
    }

    assert_eq!(event_loop.queue_size(), 3);
    assert!(bus.drain_manager_out().await.is_empty());
}

#[tokio::test]
async fn scenario_single_manager_priority_dispatch_then_remainder() {
    let bus = SharedMockBus::new();
    let mut event_loop = build_loop(bus.clone(), 1);

    bus.push_task(task_payload(1, 1.0)).await;
    event_loop.run_iteration(Instant::now()).await;
    bus.push_task(task_payload(2, 5.0)).await;
    event_loop.run_iteration(Instant::now()).await;
    bus.push_task(task_payload(3, 5.0)).await;
    event_loop.run_iteration(Instant::now()).await;

    bus.push_manager_message(registration_message("m1", 2, "2024.01.01"))
        .await;
    event_loop.run_iteration(Instant::now()).await;

    let sent = bus.drain_manager_out().await;
    assert_eq!(sent.len(), 1);
    let (manager_id, frames) = &sent[0];
    assert_eq!(manager_id.as_text(), "m1");
    assert_eq!(dispatched_task_ids(frames), vec![2, 3]);
    assert_eq!(event_loop.queue_size(), 1);

    bus.push_manager_message(result_message("m1", &[2])).await;
    event_loop.run_iteration(Instant::now()).await;

    let sent = bus.drain_manager_out().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(dispatched_task_ids(&sent[0].1), vec![1]);
}

#[tokio::test]
async fn scenario_heartbeat_expiry_fails_outstanding_task() {
    let bus = SharedMockBus::new();
    let mut event_loop = build_loop(bus.clone(), 2);
    let threshold = Duration::from_secs(60);
    let t0 = Instant::now();

    bus.push_task(task_payload(7, 1.0)).await;
    event_loop.run_iteration(t0).await;
    bus.push_manager_message(registration_message("m1", 1, "2024.01.01"))
        .await;
    event_loop.run_iteration(t0).await;

    assert_eq!(bus.drain_manager_out().await.len(), 1);
    assert!(event_loop.registry().contains(&ManagerId(b"m1".to_vec())));

    let t1 = t0 + threshold + Duration::from_secs(1);
    event_loop.run_iteration(t1).await;

    assert!(!event_loop.registry().contains(&ManagerId(b"m1".to_vec())));
    let results = bus.drain_results_out().await;
    assert_eq!(results.len(), 1);
    let failure: FailureResult = serde_json::from_slice(&results[0][0]).unwrap();
    assert_eq!(failure.task_id, 7);
    assert!(failure.exception.contains("ManagerLost"));
}

#[tokio::test]
async fn scenario_drain_acknowledged_once_idle() {
    let bus = SharedMockBus::new();
    let mut event_loop = build_loop(bus.clone(), 3);
    let now = Instant::now();

    bus.push_task(task_payload(1, 1.0)).await;
    event_loop.run_iteration(now).await;
    bus.push_manager_message(registration_message("m1", 1, "2024.01.01"))
        .await;
    event_loop.run_iteration(now).await;
    assert_eq!(bus.drain_manager_out().await.len(), 1);

    bus.push_manager_message(result_message("m1", &[1])).await;
    event_loop.run_iteration(now).await;

    bus.push_manager_message(drain_message("m1")).await;
    event_loop.run_iteration(now).await;

    assert!(!event_loop.registry().contains(&ManagerId(b"m1".to_vec())));
    let sent = bus.drain_manager_out().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1[0], interchange_core::codec::encode_framing_code(
        interchange_core::codec::DRAINED_CODE
    ));
}

#[tokio::test]
async fn scenario_version_mismatch_kills_loop_and_fails_task() {
    let bus = SharedMockBus::new();
    let mut event_loop = build_loop(bus.clone(), 4);

    bus.push_manager_message(registration_message("m1", 2, "2099.01.01"))
        .await;
    event_loop.run_iteration(Instant::now()).await;

    assert!(event_loop.is_killed());
    assert!(!event_loop.registry().contains(&ManagerId(b"m1".to_vec())));

    let results = bus.drain_results_out().await;
    assert_eq!(results.len(), 1);
    let failure: FailureResult = serde_json::from_slice(&results[0][0]).unwrap();
    assert_eq!(failure.task_id, -1);
}

#[tokio::test]
async fn scenario_priority_tie_break_preserves_insertion_order() {
    let bus = SharedMockBus::new();
    let mut event_loop = build_loop(bus.clone(), 5);

    for id in 0..1000i64 {
        bus.push_task(task_payload(id, 0.0)).await;
        event_loop.run_iteration(Instant::now()).await;
    }
    assert_eq!(event_loop.queue_size(), 1000);

    bus.push_manager_message(registration_message("m1", 1000, "2024.01.01"))
        .await;
    event_loop.run_iteration(Instant::now()).await;

    let sent = bus.drain_manager_out().await;
    assert_eq!(sent.len(), 1);
    let ids = dispatched_task_ids(&sent[0].1);
    let expected: Vec<i64> = (0..1000).collect();
    assert_eq!(ids, expected);
}

#[tokio::test]
async fn result_for_task_manager_never_held_is_not_forwarded() {
    let bus = SharedMockBus::new();
    let mut event_loop = build_loop(bus.clone(), 8);

    bus.push_task(task_payload(1, 1.0)).await;
    event_loop.run_iteration(Instant::now()).await;
    bus.push_manager_message(registration_message("m1", 1, "2024.01.01"))
        .await;
    event_loop.run_iteration(Instant::now()).await;
    assert_eq!(bus.drain_manager_out().await.len(), 1);

    // task_id 99 was never dispatched to m1; only task_id 1 was.
    bus.push_manager_message(result_message("m1", &[99, 1])).await;
    event_loop.run_iteration(Instant::now()).await;

    let results = bus.drain_results_out().await;
    assert_eq!(results.len(), 1, "exactly one multipart send, carrying only the real result");
    assert_eq!(results[0].len(), 1);
    let forwarded: serde_json::Value = serde_json::from_slice(&results[0][0]).unwrap();
    assert_eq!(forwarded["task_id"], serde_json::json!(1));
}

#[tokio::test]
async fn command_workers_reflects_registered_worker_count() {
    let bus = SharedMockBus::new();
    let mut event_loop = build_loop(bus.clone(), 6);

    bus.push_manager_message(registration_message("m1", 4, "2024.01.01"))
        .await;
    event_loop.run_iteration(Instant::now()).await;

    bus.push_command("WORKERS").await;
    event_loop.run_iteration(Instant::now()).await;

    let replies = bus.drain_command_out().await;
    assert_eq!(replies.len(), 1);
    let value: serde_json::Value = serde_json::from_slice(&replies[0]).unwrap();
    assert_eq!(value, serde_json::json!(4));
}

#[tokio::test]
async fn unknown_manager_messages_are_dropped_without_panic() {
    let bus = SharedMockBus::new();
    let mut event_loop = build_loop(bus.clone(), 7);

    bus.push_manager_message(heartbeat_message("ghost")).await;
    event_loop.run_iteration(Instant::now()).await;

    assert!(!event_loop.registry().contains(&ManagerId(b"ghost".to_vec())));
    assert!(bus.drain_manager_out().await.is_empty());
}
