//! Optional outbound monitoring channel (`spec.md` §4.6).
//!
//! The emitter is fire-and-forget: a failure to emit, or the channel
//! being full or closed, must never disturb the event loop. To keep that
//! guarantee even when the underlying transport is slow, the production
//! emitter hands owned snapshots across an unbounded channel to a
//! background task that owns the actual socket (`spec.md` §5).

use std::time::{Instant, SystemTime};

use serde::Serialize;
use tokio::sync::mpsc;

use crate::manager::ManagerRecord;
use crate::registry::ManagerId;

/// A NODE_INFO snapshot, timestamped at emission (`spec.md` §4.6).
#[derive(Debug, Clone, Serialize)]
pub struct NodeInfoEvent {
    pub manager_id: String,
    #[serde(flatten)]
    pub record: SerializableRecord,
    pub run_id: String,
}

/// [`ManagerRecord`] reshaped for wire transmission: `last_heartbeat`
/// becomes an absolute wall-clock timestamp and `timestamp` records when
/// the snapshot was taken, mirroring `_send_monitoring_info` in the
/// original source.
#[derive(Debug, Clone, Serialize)]
pub struct SerializableRecord {
    pub block_id: Option<String>,
    pub tasks: Vec<i64>,
    pub worker_count: u32,
    pub max_capacity: u32,
    pub active: bool,
    pub draining: bool,
    pub last_heartbeat: u64,
    pub timestamp: u64,
    pub parsl_version: String,
    pub python_version: String,
    pub hostname: String,
}

impl SerializableRecord {
    fn from_record(record: &ManagerRecord, now: Instant) -> Self {
        let epoch_now = SystemTime::now();
        let to_epoch_secs = |at: Instant| {
            let delta = now.saturating_duration_since(at);
            epoch_now
                .checked_sub(delta)
                .unwrap_or(epoch_now)
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs()
        };
        Self {
            block_id: record.block_id.clone(),
            tasks: record.tasks.clone(),
            worker_count: record.worker_count,
            max_capacity: record.max_capacity,
            active: record.active,
            draining: record.draining,
            last_heartbeat: to_epoch_secs(record.last_heartbeat),
            timestamp: epoch_now
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            parsl_version: record.parsl_version.clone(),
            python_version: record.python_version.clone(),
            hostname: record.hostname.clone(),
        }
    }
}

/// Emits NODE_INFO snapshots. Never allowed to block or panic the loop.
pub trait MonitoringEmitter: Send + Sync {
    fn emit(&self, manager_id: &ManagerId, record: &ManagerRecord, now: Instant);
}

/// Used when `hub_address`/`hub_zmq_port` are not both set.
pub struct NoopEmitter;

impl MonitoringEmitter for NoopEmitter {
    fn emit(&self, _manager_id: &ManagerId, _record: &ManagerRecord, _now: Instant) {}
}

/// Hands a value copy of the record across an unbounded channel to
/// whatever task owns the real transport. Lossy on shutdown: if the
/// receiver has already been dropped, `emit` silently discards the event.
pub struct ChannelMonitoringEmitter {
    run_id: String,
    sender: mpsc::UnboundedSender<NodeInfoEvent>,
}

impl ChannelMonitoringEmitter {
    pub fn new(run_id: String) -> (Self, mpsc::UnboundedReceiver<NodeInfoEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { run_id, sender }, receiver)
    }
}

impl MonitoringEmitter for ChannelMonitoringEmitter {
    fn emit(&self, manager_id: &ManagerId, record: &ManagerRecord, now: Instant) {
        let event = NodeInfoEvent {
            manager_id: manager_id.as_text(),
            record: SerializableRecord::from_record(record, now),
            run_id: self.run_id.clone(),
        };
        // An unbounded send only fails if the receiver was dropped, which
        // happens if the background sink task has already exited; either
        // way this must not propagate to the event loop.
        let _ = self.sender.send(event);
    }
}
