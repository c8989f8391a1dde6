//! Manager records and the registration handshake.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The registration blob a Manager sends on first contact over
/// `manager_router` (`spec.md` §6 "Registration meta").
#[derive(Debug, Clone, Deserialize)]
pub struct RegistrationMeta {
    pub python_v: String,
    pub parsl_v: String,
    #[serde(default)]
    pub start_time: Value,
    #[serde(default)]
    pub block_id: Option<String>,
    #[serde(default)]
    pub worker_count: u32,
    #[serde(default)]
    pub max_capacity: u32,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub packages: Value,
    /// Every other field the registration blob carries, preserved for
    /// command replies even though the core never interprets it
    /// (`spec.md` §3 ManagerRecord invariant on catch-all fields).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Mutable per-Manager bookkeeping (`spec.md` §3 ManagerRecord).
#[derive(Debug, Clone, Serialize)]
pub struct ManagerRecord {
    pub block_id: Option<String>,
    #[serde(skip)]
    pub start_time: Value,
    pub tasks: Vec<i64>,
    pub worker_count: u32,
    pub max_capacity: u32,
    pub active: bool,
    pub draining: bool,
    #[serde(skip)]
    pub last_heartbeat: Instant,
    #[serde(skip)]
    pub idle_since: Option<Instant>,
    pub parsl_version: String,
    pub python_version: String,
    pub hostname: String,
    pub packages: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ManagerRecord {
    pub fn from_registration(meta: RegistrationMeta, now: Instant) -> Self {
        Self {
            block_id: meta.block_id,
            start_time: meta.start_time,
            tasks: Vec::new(),
            worker_count: meta.worker_count,
            max_capacity: meta.max_capacity,
            active: true,
            draining: false,
            last_heartbeat: now,
            idle_since: Some(now),
            parsl_version: meta.parsl_v,
            python_version: meta.python_v,
            hostname: meta.hostname,
            packages: meta.packages,
            extra: meta.extra,
        }
    }

    /// `real_capacity` per `spec.md` §4.7 step 7: remaining slots this
    /// Manager can accept this iteration.
    pub fn real_capacity(&self) -> usize {
        (self.max_capacity as usize).saturating_sub(self.tasks.len())
    }

    /// Remove one occurrence of `task_id` from `tasks`, if present.
    /// Invariant 1/2 (`spec.md` §3): set `idle_since` when the last task
    /// drains.
    pub fn record_result(&mut self, task_id: i64, now: Instant) -> bool {
        if let Some(pos) = self.tasks.iter().position(|&t| t == task_id) {
            self.tasks.remove(pos);
            if self.tasks.is_empty() {
                self.idle_since = Some(now);
            }
            true
        } else {
            false
        }
    }

    pub fn assign(&mut self, task_ids: impl IntoIterator<Item = i64>) {
        self.tasks.extend(task_ids);
        if !self.tasks.is_empty() {
            self.idle_since = None;
        }
    }
}

/// Minor-version-truncated runtime identity carried in `current_platform`
/// (`spec.md` §4.3: "drop the component after the last dot").
pub fn minor_version(full: &str) -> &str {
    match full.rsplit_once('.') {
        Some((prefix, _)) => prefix,
        None => full,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minor_version_drops_patch_component() {
        assert_eq!(minor_version("3.11.4"), "3.11");
        assert_eq!(minor_version("2.1"), "2");
        assert_eq!(minor_version("nodots"), "nodots");
    }

    #[test]
    fn real_capacity_saturates_at_zero() {
        let now = Instant::now();
        let mut rec = ManagerRecord::from_registration(
            RegistrationMeta {
                python_v: "3.11.4".into(),
                parsl_v: "2024.01.01".into(),
                start_time: Value::Null,
                block_id: Some("b0".into()),
                worker_count: 4,
                max_capacity: 2,
                hostname: "h".into(),
                packages: Value::Null,
                extra: Map::new(),
            },
            now,
        );
        rec.assign([1, 2, 3]);
        assert_eq!(rec.real_capacity(), 0);
    }

    #[test]
    fn record_result_sets_idle_since_when_empty() {
        let t0 = Instant::now();
        let mut rec = ManagerRecord::from_registration(
            RegistrationMeta {
                python_v: "3.11.4".into(),
                parsl_v: "2024.01.01".into(),
                start_time: Value::Null,
                block_id: None,
                worker_count: 1,
                max_capacity: 1,
                hostname: "h".into(),
                packages: Value::Null,
                extra: Map::new(),
            },
            t0,
        );
        rec.assign([7]);
        assert!(rec.idle_since.is_none());
        assert!(rec.record_result(7, t0));
        assert!(rec.idle_since.is_some());
        assert!(!rec.record_result(7, t0));
    }
}
