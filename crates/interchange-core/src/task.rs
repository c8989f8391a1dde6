//! Task payloads and the resource hints they may carry.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An opaque unit of work submitted by the client.
///
/// `task_id` and `resource_spec` are the only fields the core ever reads;
/// everything else travels as an opaque JSON blob so that a Manager (or a
/// future executor) can interpret it without the Interchange needing to
/// understand the payload format (`spec.md` §1 Non-goals).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: i64,
    #[serde(default = "ResourceSpec::default")]
    pub resource_spec: ResourceSpec,
    /// Every other field the client sent, preserved verbatim for forwarding
    /// to a Manager on dispatch.
    #[serde(flatten)]
    pub extra: std::collections::BTreeMap<String, Value>,
}

/// Resource hints attached to a task. Only `priority` affects scheduling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// Higher numeric priority dispatches first. Absent means lowest
    /// priority (`+infinity` in `spec.md` §3).
    #[serde(default = "ResourceSpec::default_priority")]
    pub priority: f64,
    #[serde(flatten)]
    pub extra: std::collections::BTreeMap<String, Value>,
}

impl ResourceSpec {
    fn default_priority() -> f64 {
        f64::INFINITY
    }
}

/// A task with no `resource_spec` at all gets the same `+infinity`
/// priority as one with an empty `resource_spec` (`spec.md` §3;
/// `original_source/.../interchange.py:335-336`:
/// `resource_spec.get('priority', inf)` against a `{}` fallback).
impl Default for ResourceSpec {
    fn default() -> Self {
        Self {
            priority: Self::default_priority(),
            extra: std::collections::BTreeMap::new(),
        }
    }
}

/// A synthesized failure the loop sends back to the client on
/// `results_out` when a task can never be completed (version mismatch at
/// registration, or the Manager that held the task vanished).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureResult {
    #[serde(rename = "type")]
    pub kind: String,
    pub task_id: i64,
    pub exception: String,
}

impl FailureResult {
    pub fn new(task_id: i64, exception: impl Into<String>) -> Self {
        Self {
            kind: "result".to_string(),
            task_id,
            exception: exception.into(),
        }
    }
}
