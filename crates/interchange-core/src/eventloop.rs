//! The single-threaded poll/dispatch driver that composes every other
//! component (`spec.md` §4.7).

use std::collections::HashSet;
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::bus::{ManagerMessage, MessageBus};
use crate::codec::{encode_framing_code, StructSerializer, DRAINED_CODE, HEARTBEAT_CODE};
use crate::command::{self, CommandRequest};
use crate::manager::RegistrationMeta;
use crate::monitoring::MonitoringEmitter;
use crate::queue::TaskQueue;
use crate::registry::{ManagerId, ManagerRegistry, Registered, RuntimeIdentity};
use crate::selector::ManagerSelector;
use crate::task::{FailureResult, Task};

/// The header frame of a `manager_router` message, tagged by `type`
/// (`spec.md` §6 "Message schemas").
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ManagerMeta {
    Registration(RegistrationMeta),
    Heartbeat,
    Drain,
    Result,
}

/// One payload frame following a `result`-tagged header.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ResultSubMessage {
    Result {
        task_id: i64,
        #[serde(flatten)]
        #[allow(dead_code)]
        extra: Map<String, Value>,
    },
    Monitoring {
        #[allow(dead_code)]
        payload: Value,
    },
}

/// Everything the loop needs at construction time besides its
/// collaborators (`spec.md` §6 "Startup").
pub struct EventLoopConfig {
    pub identity: RuntimeIdentity,
    pub heartbeat_threshold: Duration,
    pub poll_period: Duration,
    pub worker_port: u16,
    pub run_id: String,
}

/// Composes the [`MessageBus`], [`TaskQueue`], [`ManagerRegistry`],
/// [`ManagerSelector`], and [`MonitoringEmitter`] into the six-step
/// iteration `spec.md` §4.7 specifies.
pub struct EventLoop {
    bus: Box<dyn MessageBus>,
    selector: Box<dyn ManagerSelector>,
    monitor: Box<dyn MonitoringEmitter>,
    serializer: Box<dyn StructSerializer>,

    registry: ManagerRegistry,
    queue: TaskQueue,
    interesting: HashSet<ManagerId>,

    identity: RuntimeIdentity,
    heartbeat_threshold: Duration,
    poll_period: Duration,
    worker_port: u16,
    run_id: String,

    kill: bool,
    dispatched_count: u64,
}

impl EventLoop {
    pub fn new(
        bus: Box<dyn MessageBus>,
        selector: Box<dyn ManagerSelector>,
        monitor: Box<dyn MonitoringEmitter>,
        serializer: Box<dyn StructSerializer>,
        config: EventLoopConfig,
    ) -> Self {
        Self {
            bus,
            selector,
            monitor,
            serializer,
            registry: ManagerRegistry::new(),
            queue: TaskQueue::new(),
            interesting: HashSet::new(),
            identity: config.identity,
            heartbeat_threshold: config.heartbeat_threshold,
            poll_period: config.poll_period,
            worker_port: config.worker_port,
            run_id: config.run_id,
            kill: false,
            dispatched_count: 0,
        }
    }

    /// Run iterations until the kill-flag is set (`spec.md` §4.7,
    /// "Iteration ends; loop repeats until the kill-flag is set").
    pub async fn run(&mut self) {
        tracing::info!(run_id = %self.run_id, "event loop starting");
        loop {
            self.run_iteration(Instant::now()).await;
            if self.kill {
                tracing::info!(run_id = %self.run_id, "kill-flag set, tearing down");
                break;
            }
        }
    }

    /// Run exactly one iteration. Exposed separately from [`Self::run`]
    /// so tests can step the loop deterministically.
    pub async fn run_iteration(&mut self, now: Instant) {
        let readiness = self.bus.poll(self.poll_period).await;

        if readiness.command {
            self.service_command(now).await;
        }
        if readiness.task_in {
            self.service_task_intake().await;
        }
        if readiness.manager_router {
            self.service_manager_message(now).await;
        }
        self.expire_bad_managers(now).await;
        self.expire_drained_managers(now).await;
        self.dispatch(now).await;
    }

    pub fn dispatched_count(&self) -> u64 {
        self.dispatched_count
    }

    pub fn queue_size(&self) -> usize {
        self.queue.size()
    }

    pub fn registry(&self) -> &ManagerRegistry {
        &self.registry
    }

    pub fn is_killed(&self) -> bool {
        self.kill
    }

    async fn service_command(&mut self, now: Instant) {
        let Some(raw) = self.bus.take_command_request().await else {
            return;
        };
        let text = String::from_utf8_lossy(&raw);
        let request = CommandRequest::parse(&text);
        let was_hold = matches!(request, CommandRequest::HoldWorker(_));
        let reply = command::handle(&request, &mut self.registry, self.worker_port, now);

        if was_hold {
            if let CommandRequest::HoldWorker(mgr) = &request {
                let id = ManagerId(mgr.as_bytes().to_vec());
                if let Some(record) = self.registry.get(&id) {
                    self.monitor.emit(&id, record, now);
                }
            }
        }

        let body = serde_json::to_vec(&reply).unwrap_or_else(|_| b"null".to_vec());
        if let Err(err) = self.bus.send_command_reply(body).await {
            tracing::error!(%err, "failed to send command reply");
        }
    }

    async fn service_task_intake(&mut self) {
        let Some(payload) = self.bus.take_task().await else {
            return;
        };
        match serde_json::from_slice::<Task>(&payload) {
            Ok(task) => self.queue.enqueue(task),
            Err(err) => tracing::warn!(%err, "dropping malformed task payload"),
        }
    }

    async fn service_manager_message(&mut self, now: Instant) {
        let Some(ManagerMessage {
            manager_id,
            meta,
            payloads,
        }) = self.bus.take_manager_message().await
        else {
            return;
        };

        let parsed: ManagerMeta = match serde_json::from_slice(&meta) {
            Ok(m) => m,
            Err(err) => {
                tracing::warn!(%manager_id, %err, "dropping malformed manager message");
                return;
            }
        };

        if !matches!(parsed, ManagerMeta::Registration(_)) && !self.registry.contains(&manager_id) {
            tracing::warn!(%manager_id, "message from unregistered manager");
            return;
        }

        match parsed {
            ManagerMeta::Registration(meta) => self.handle_registration(manager_id, meta, now).await,
            ManagerMeta::Heartbeat => self.handle_heartbeat(manager_id, now).await,
            ManagerMeta::Drain => self.registry.mark_drain(&manager_id),
            ManagerMeta::Result => self.handle_result_batch(manager_id, payloads, now).await,
        }
    }

    async fn handle_registration(&mut self, manager_id: ManagerId, meta: RegistrationMeta, now: Instant) {
        match self.registry.register(manager_id.clone(), meta, &self.identity, now) {
            Registered::Ok(record) => {
                self.interesting.insert(manager_id.clone());
                self.monitor.emit(&manager_id, record, now);
            }
            Registered::VersionMismatch {
                interchange_version,
                manager_version,
            } => {
                let exception = format!(
                    "version mismatch: interchange={interchange_version} manager={manager_version}"
                );
                tracing::error!(%manager_id, %exception, "rejecting manager registration");
                self.send_failure(-1, exception).await;
                self.kill = true;
            }
        }
    }

    async fn handle_heartbeat(&mut self, manager_id: ManagerId, now: Instant) {
        self.registry.mark_heartbeat(&manager_id, now);
        let code = encode_framing_code(HEARTBEAT_CODE).to_vec();
        if let Err(err) = self.bus.send_to_manager(&manager_id, vec![code]).await {
            tracing::error!(%manager_id, %err, "failed to reply to heartbeat");
        }
    }

    async fn handle_result_batch(&mut self, manager_id: ManagerId, payloads: Vec<Vec<u8>>, now: Instant) {
        let mut forward = Vec::new();
        for payload in payloads {
            match serde_json::from_slice::<ResultSubMessage>(&payload) {
                Ok(ResultSubMessage::Result { task_id, .. }) => {
                    if self.registry.record_result(&manager_id, task_id, now) {
                        forward.push(payload);
                    }
                }
                Ok(ResultSubMessage::Monitoring { .. }) => {
                    if let Some(record) = self.registry.get(&manager_id) {
                        self.monitor.emit(&manager_id, record, now);
                    } else {
                        tracing::warn!(%manager_id, "monitoring sub-message from unknown manager");
                    }
                }
                Err(err) => tracing::warn!(%manager_id, %err, "dropping malformed result sub-message"),
            }
        }

        if !forward.is_empty() {
            if let Err(err) = self.bus.send_results_multipart(forward).await {
                tracing::error!(%manager_id, %err, "failed to forward results");
            }
            self.interesting.insert(manager_id.clone());
            if let Some(record) = self.registry.get_mut(&manager_id) {
                if record.tasks.is_empty() {
                    record.idle_since = Some(now);
                }
            }
            if let Some(record) = self.registry.get(&manager_id) {
                self.monitor.emit(&manager_id, record, now);
            }
        }
    }

    async fn send_failure(&mut self, task_id: i64, exception: String) {
        let failure = FailureResult::new(task_id, exception);
        match serde_json::to_vec(&failure) {
            Ok(body) => {
                if let Err(err) = self.bus.send_result(body).await {
                    tracing::error!(%err, "failed to send failure result");
                }
            }
            Err(err) => tracing::error!(%err, "failed to encode failure result"),
        }
    }

    async fn expire_bad_managers(&mut self, now: Instant) {
        let expired: Vec<ManagerId> = self
            .registry
            .iter()
            .filter(|(_, record)| {
                now.saturating_duration_since(record.last_heartbeat) > self.heartbeat_threshold
            })
            .map(|(id, _)| id.clone())
            .collect();

        for manager_id in expired {
            if let Some(record) = self.registry.get_mut(&manager_id) {
                record.active = false;
            }
            if let Some(record) = self.registry.get(&manager_id) {
                self.monitor.emit(&manager_id, record, now);
            }

            let (tasks, hostname) = match self.registry.get(&manager_id) {
                Some(record) => (record.tasks.clone(), record.hostname.clone()),
                None => continue,
            };
            for task_id in tasks {
                let exception = format!("ManagerLost({manager_id}, {hostname})");
                self.send_failure(task_id, exception).await;
            }

            self.registry.remove(&manager_id);
            self.interesting.remove(&manager_id);
            tracing::warn!(%manager_id, "manager expired for missed heartbeats");
        }
    }

    async fn expire_drained_managers(&mut self, now: Instant) {
        let drained: Vec<ManagerId> = self
            .interesting
            .iter()
            .filter(|id| {
                self.registry
                    .get(id)
                    .is_some_and(|record| record.draining && record.tasks.is_empty())
            })
            .cloned()
            .collect();

        for manager_id in drained {
            let code = encode_framing_code(DRAINED_CODE).to_vec();
            if let Err(err) = self.bus.send_to_manager(&manager_id, vec![code]).await {
                tracing::error!(%manager_id, %err, "failed to notify drained manager");
            }
            self.interesting.remove(&manager_id);
            if let Some(mut record) = self.registry.remove(&manager_id) {
                record.active = false;
                self.monitor.emit(&manager_id, &record, now);
            }
        }
    }

    async fn dispatch(&mut self, now: Instant) {
        if self.interesting.is_empty() || !self.queue.nonempty() {
            return;
        }

        let candidates: Vec<ManagerId> = self.interesting.iter().cloned().collect();
        let mut stack = self.selector.select(&self.registry, &candidates);

        while let Some(manager_id) = stack.pop() {
            if !self.queue.nonempty() {
                break;
            }
            let Some(record) = self.registry.get(&manager_id) else {
                self.interesting.remove(&manager_id);
                continue;
            };
            let real_capacity = record.real_capacity();
            let eligible = real_capacity > 0 && record.active && !record.draining;

            if !eligible {
                self.interesting.remove(&manager_id);
                continue;
            }

            let batch = self.queue.pop_batch(real_capacity);
            if batch.is_empty() {
                continue;
            }
            let task_ids: Vec<i64> = batch.iter().map(|t| t.task_id).collect();
            let payload = self.serializer.encode_task_batch(&batch);

            if let Err(err) = self.bus.send_to_manager(&manager_id, vec![payload]).await {
                tracing::error!(%manager_id, %err, "failed to dispatch task batch");
                continue;
            }

            let dispatched = task_ids.len() as u64;
            if let Some(record) = self.registry.get_mut(&manager_id) {
                record.assign(task_ids);
            }
            self.dispatched_count += dispatched;

            let remaining = self
                .registry
                .get(&manager_id)
                .map(|r| r.real_capacity())
                .unwrap_or(0);
            if remaining == 0 {
                self.interesting.remove(&manager_id);
            }
            if let Some(record) = self.registry.get(&manager_id) {
                self.monitor.emit(&manager_id, record, now);
            }
        }
    }
}
