//! The Manager registry: identity -> [`ManagerRecord`] and lifecycle
//! transitions (`spec.md` §4.3).

use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

use crate::manager::{minor_version, ManagerRecord, RegistrationMeta};

/// The router endpoint's peer identity, treated as opaque bytes
/// (`spec.md` §9 "Opaque Manager identity"). Decoded lossily only when
/// rendered for command replies.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ManagerId(pub Vec<u8>);

impl ManagerId {
    pub fn as_text(&self) -> String {
        String::from_utf8_lossy(&self.0).into_owned()
    }
}

impl fmt::Display for ManagerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_text())
    }
}

/// The runtime identity this Interchange requires registering Managers
/// to match (`spec.md` §4.3). `python_version` must be the *full*
/// dotted version (e.g. `"3.11.4"`), not pre-truncated: `matches`
/// truncates both sides to their minor component before comparing, so a
/// pre-truncated `"3.11"` would itself get truncated one component too
/// far (to `"3"`) and reject every real Manager.
#[derive(Debug, Clone)]
pub struct RuntimeIdentity {
    pub framework_version: String,
    pub python_version: String,
}

impl RuntimeIdentity {
    fn matches(&self, meta: &RegistrationMeta) -> bool {
        minor_version(&self.python_version) == minor_version(&meta.python_v)
            && self.framework_version == meta.parsl_v
    }
}

/// The outcome of attempting to register a Manager.
pub enum Registered<'a> {
    Ok(&'a ManagerRecord),
    VersionMismatch {
        interchange_version: String,
        manager_version: String,
    },
}

/// Mapping from opaque Manager identity to its record, plus the
/// append-only registration history.
#[derive(Default)]
pub struct ManagerRegistry {
    managers: HashMap<ManagerId, ManagerRecord>,
    /// One entry per successful registration, in registration order.
    /// Never shrinks, even as Managers deregister (`spec.md` §4.3).
    connected_block_history: Vec<String>,
}

impl ManagerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempt to register `manager_id`. Rejects (without inserting) a
    /// Manager whose framework or runtime minor version does not match
    /// `identity` (`spec.md` §3 invariant 7).
    pub fn register(
        &mut self,
        manager_id: ManagerId,
        meta: RegistrationMeta,
        identity: &RuntimeIdentity,
        now: Instant,
    ) -> Registered<'_> {
        if !identity.matches(&meta) {
            return Registered::VersionMismatch {
                interchange_version: format!(
                    "py.v={} parsl.v={}",
                    minor_version(&identity.python_version),
                    identity.framework_version
                ),
                manager_version: format!(
                    "py.v={} parsl.v={}",
                    minor_version(&meta.python_v),
                    meta.parsl_v
                ),
            };
        }

        if let Some(block_id) = meta.block_id.clone() {
            self.connected_block_history.push(block_id);
        }
        let record = ManagerRecord::from_registration(meta, now);
        self.managers.insert(manager_id.clone(), record);
        Registered::Ok(self.managers.get(&manager_id).expect("just inserted"))
    }

    pub fn get(&self, manager_id: &ManagerId) -> Option<&ManagerRecord> {
        self.managers.get(manager_id)
    }

    pub fn get_mut(&mut self, manager_id: &ManagerId) -> Option<&mut ManagerRecord> {
        self.managers.get_mut(manager_id)
    }

    pub fn remove(&mut self, manager_id: &ManagerId) -> Option<ManagerRecord> {
        self.managers.remove(manager_id)
    }

    pub fn contains(&self, manager_id: &ManagerId) -> bool {
        self.managers.contains_key(manager_id)
    }

    /// Remove one occurrence of `task_id` from `manager_id`'s tasks. Logs
    /// and returns `false` if the task is not present or the Manager is
    /// unknown, so callers can skip forwarding a result for a task the
    /// Manager never held (`spec.md` §7: "keep forwarding other results").
    pub fn record_result(&mut self, manager_id: &ManagerId, task_id: i64, now: Instant) -> bool {
        match self.managers.get_mut(manager_id) {
            Some(record) => {
                let removed = record.record_result(task_id, now);
                if !removed {
                    tracing::warn!(%manager_id, task_id, "result for task not in manager's outstanding set");
                }
                removed
            }
            None => {
                tracing::warn!(%manager_id, task_id, "result from unregistered manager");
                false
            }
        }
    }

    pub fn mark_heartbeat(&mut self, manager_id: &ManagerId, now: Instant) {
        if let Some(record) = self.managers.get_mut(manager_id) {
            record.last_heartbeat = now;
        }
    }

    pub fn mark_drain(&mut self, manager_id: &ManagerId) {
        if let Some(record) = self.managers.get_mut(manager_id) {
            record.draining = true;
        }
    }

    pub fn mark_hold(&mut self, manager_id: &ManagerId) -> bool {
        match self.managers.get_mut(manager_id) {
            Some(record) => {
                record.active = false;
                true
            }
            None => false,
        }
    }

    pub fn connected_block_history(&self) -> &[String] {
        &self.connected_block_history
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ManagerId, &ManagerRecord)> {
        self.managers.iter()
    }

    pub fn ids(&self) -> impl Iterator<Item = &ManagerId> {
        self.managers.keys()
    }

    pub fn len(&self) -> usize {
        self.managers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.managers.is_empty()
    }
}
