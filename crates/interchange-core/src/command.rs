//! Synchronous request/reply introspection service (`spec.md` §4.5).

use std::time::Instant;

use serde_json::{json, Value};

use crate::registry::{ManagerId, ManagerRegistry};

/// A parsed request from the `command` endpoint. Requests arrive as a
/// single opaque string; the literal wire values are matched verbatim
/// against `spec.md`'s grammar table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandRequest {
    ConnectedBlocks,
    Workers,
    Managers,
    ManagersPackages,
    HoldWorker(String),
    WorkerBinds,
    Unknown(String),
}

impl CommandRequest {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "CONNECTED_BLOCKS" => Self::ConnectedBlocks,
            "WORKERS" => Self::Workers,
            "MANAGERS" => Self::Managers,
            "MANAGERS_PACKAGES" => Self::ManagersPackages,
            "WORKER_BINDS" => Self::WorkerBinds,
            other => match other.split_once(';') {
                Some(("HOLD_WORKER", mgr)) => Self::HoldWorker(mgr.to_string()),
                _ => Self::Unknown(other.to_string()),
            },
        }
    }
}

/// Handle one request. Mutates the registry only for `HOLD_WORKER`
/// (`spec.md` §4.3 `mark_hold`). Returns the reply value to serialize
/// back on the `command` endpoint.
pub fn handle(
    request: &CommandRequest,
    registry: &mut ManagerRegistry,
    worker_port: u16,
    now: Instant,
) -> Value {
    match request {
        CommandRequest::ConnectedBlocks => json!(registry.connected_block_history()),
        CommandRequest::Workers => {
            let total: u64 = registry.iter().map(|(_, rec)| rec.worker_count as u64).sum();
            json!(total)
        }
        CommandRequest::Managers => {
            let managers: Vec<Value> = registry
                .iter()
                .map(|(id, rec)| {
                    let idle_duration = rec
                        .idle_since
                        .map(|since| now.saturating_duration_since(since).as_secs_f64())
                        .unwrap_or(0.0);
                    json!({
                        "manager": id.as_text(),
                        "block_id": rec.block_id,
                        "worker_count": rec.worker_count,
                        "tasks": rec.tasks.len(),
                        "idle_duration": idle_duration,
                        "active": rec.active,
                        "parsl_version": rec.parsl_version,
                        "python_version": rec.python_version,
                        "draining": rec.draining,
                    })
                })
                .collect();
            json!(managers)
        }
        CommandRequest::ManagersPackages => {
            let mut map = serde_json::Map::new();
            for (id, rec) in registry.iter() {
                map.insert(id.as_text(), rec.packages.clone());
            }
            Value::Object(map)
        }
        CommandRequest::HoldWorker(mgr) => {
            let id = ManagerId(mgr.as_bytes().to_vec());
            if !registry.mark_hold(&id) {
                tracing::warn!(manager = %mgr, "worker to hold was not in ready managers list");
            }
            Value::Null
        }
        CommandRequest::WorkerBinds => json!(worker_port),
        CommandRequest::Unknown(raw) => {
            tracing::error!(request = %raw, "received unknown command");
            Value::Null
        }
    }
}
