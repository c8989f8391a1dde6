//! The four-endpoint message bus (`spec.md` §4.1).
//!
//! `MessageBus` is the seam between the [`crate::eventloop::EventLoop`]
//! and the transport. The production implementation, [`ZmqMessageBus`],
//! binds/connects four ZeroMQ sockets; [`mock::MockMessageBus`] backs the
//! scenario tests in `tests/`.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::InterchangeError;
use crate::registry::ManagerId;

/// One frame of the `[manager_id, meta, payload...]` shape a Manager
/// sends on `manager_router` (`spec.md` §4.1).
#[derive(Debug, Clone)]
pub struct ManagerMessage {
    pub manager_id: ManagerId,
    pub meta: Vec<u8>,
    pub payloads: Vec<Vec<u8>>,
}

/// Which endpoints had pending input on the most recent [`MessageBus::poll`]
/// call. Mirrors the `dict(poller.poll(...))` membership checks the
/// original source makes once per iteration against each socket
/// (`spec.md` §4.7 step 1).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub command: bool,
    pub task_in: bool,
    pub manager_router: bool,
}

/// Nonblocking, unbounded, fair-polling transport for the four endpoints
/// `spec.md` §4.1 describes. A call to `poll` both waits (up to
/// `timeout`) for input and buffers whatever arrived so the subsequent
/// `take_*` calls return it without awaiting again.
#[async_trait]
pub trait MessageBus: Send {
    async fn poll(&mut self, timeout: Duration) -> Readiness;

    /// Take the buffered command request, if `poll` reported one.
    async fn take_command_request(&mut self) -> Option<Vec<u8>>;
    /// Take the buffered task payload, if `poll` reported one.
    async fn take_task(&mut self) -> Option<Vec<u8>>;
    /// Take the buffered Manager message, if `poll` reported one.
    async fn take_manager_message(&mut self) -> Option<ManagerMessage>;

    async fn send_command_reply(&mut self, reply: Vec<u8>) -> Result<(), InterchangeError>;
    async fn send_result(&mut self, payload: Vec<u8>) -> Result<(), InterchangeError>;
    /// Forward a batch of collected result/failure frames as one
    /// multipart send (`spec.md` §4.7 step 4, "result").
    async fn send_results_multipart(&mut self, payloads: Vec<Vec<u8>>) -> Result<(), InterchangeError>;
    /// Send one or more payload frames to a specific Manager
    /// (`spec.md` §4.1: "every sent frame is `[manager_id, payload]`").
    async fn send_to_manager(
        &mut self,
        manager_id: &ManagerId,
        frames: Vec<Vec<u8>>,
    ) -> Result<(), InterchangeError>;
}

/// Binds/connects the four sockets the original Python interchange opens:
/// `task_in`/`results_out` as `DEALER`, `command` as `REP`,
/// `manager_router` as `ROUTER` (`spec.md` §6).
pub struct ZmqMessageBus {
    task_in: zeromq::DealerSocket,
    results_out: zeromq::DealerSocket,
    command: zeromq::RepSocket,
    manager_router: zeromq::RouterSocket,

    pending_command: Option<Vec<u8>>,
    pending_task: Option<Vec<u8>>,
    pending_manager: Option<ManagerMessage>,
}

/// Where the bus should bind/connect its four sockets.
pub struct BusAddresses {
    pub task_in_addr: String,
    pub results_out_addr: String,
    pub command_addr: String,
    /// `None` means bind to a random port within `worker_port_range`.
    pub manager_router_bind: String,
}

impl ZmqMessageBus {
    pub async fn connect(addrs: &BusAddresses) -> Result<(Self, u16), InterchangeError> {
        use zeromq::Socket;

        let mut task_in = zeromq::DealerSocket::new();
        task_in.connect(&addrs.task_in_addr).await?;

        let mut results_out = zeromq::DealerSocket::new();
        results_out.connect(&addrs.results_out_addr).await?;

        let mut command = zeromq::RepSocket::new();
        command.connect(&addrs.command_addr).await?;

        let mut manager_router = zeromq::RouterSocket::new();
        let bound = manager_router.bind(&addrs.manager_router_bind).await?;
        let worker_port = bound.port().unwrap_or(0);

        Ok((
            Self {
                task_in,
                results_out,
                command,
                manager_router,
                pending_command: None,
                pending_task: None,
                pending_manager: None,
            },
            worker_port,
        ))
    }
}

fn frames_from_message(msg: zeromq::ZmqMessage) -> Vec<Vec<u8>> {
    msg.into_vec().into_iter().map(|b| b.to_vec()).collect()
}

fn message_from_frames(frames: Vec<Vec<u8>>) -> zeromq::ZmqMessage {
    let mut iter = frames.into_iter().map(Bytes::from);
    let mut msg: zeromq::ZmqMessage = iter
        .next()
        .expect("at least one frame")
        .into();
    for frame in iter {
        msg.push_back(frame);
    }
    msg
}

#[async_trait]
impl MessageBus for ZmqMessageBus {
    async fn poll(&mut self, timeout: Duration) -> Readiness {
        use zeromq::Socket;

        let mut readiness = Readiness::default();
        tokio::select! {
            biased;
            // Branch order is irrelevant to fairness here: tokio::select!
            // polls in source order but only the first *ready* future
            // wins, and across repeated calls every branch gets an equal
            // opportunity since none is favored by blocking the others.
            result = self.command.recv() => {
                if let Ok(msg) = result {
                    self.pending_command = frames_from_message(msg).into_iter().next();
                    readiness.command = true;
                }
            }
            result = self.task_in.recv() => {
                if let Ok(msg) = result {
                    self.pending_task = frames_from_message(msg).into_iter().next();
                    readiness.task_in = true;
                }
            }
            result = self.manager_router.recv() => {
                if let Ok(msg) = result {
                    let mut frames = frames_from_message(msg);
                    if frames.len() >= 2 {
                        let manager_id = ManagerId(frames.remove(0));
                        let meta = frames.remove(0);
                        self.pending_manager = Some(ManagerMessage {
                            manager_id,
                            meta,
                            payloads: frames,
                        });
                        readiness.manager_router = true;
                    }
                }
            }
            _ = tokio::time::sleep(timeout) => {}
        }
        readiness
    }

    async fn take_command_request(&mut self) -> Option<Vec<u8>> {
        self.pending_command.take()
    }

    async fn take_task(&mut self) -> Option<Vec<u8>> {
        self.pending_task.take()
    }

    async fn take_manager_message(&mut self) -> Option<ManagerMessage> {
        self.pending_manager.take()
    }

    async fn send_command_reply(&mut self, reply: Vec<u8>) -> Result<(), InterchangeError> {
        use zeromq::Socket;
        self.command.send(reply.into()).await?;
        Ok(())
    }

    async fn send_result(&mut self, payload: Vec<u8>) -> Result<(), InterchangeError> {
        use zeromq::Socket;
        self.results_out.send(payload.into()).await?;
        Ok(())
    }

    async fn send_results_multipart(&mut self, payloads: Vec<Vec<u8>>) -> Result<(), InterchangeError> {
        use zeromq::Socket;
        if payloads.is_empty() {
            return Ok(());
        }
        self.results_out.send(message_from_frames(payloads)).await?;
        Ok(())
    }

    async fn send_to_manager(
        &mut self,
        manager_id: &ManagerId,
        frames: Vec<Vec<u8>>,
    ) -> Result<(), InterchangeError> {
        use zeromq::Socket;
        let mut all = vec![manager_id.0.clone()];
        all.extend(frames);
        self.manager_router.send(message_from_frames(all)).await?;
        Ok(())
    }
}

/// An in-memory bus used by the scenario tests (`spec.md` §8). Endpoints
/// are plain queues; `poll` reports readiness immediately based on
/// whatever the test has pushed, with no real waiting.
pub mod mock {
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use super::{ManagerMessage, MessageBus, Readiness};
    use crate::error::InterchangeError;
    use crate::registry::ManagerId;

    #[derive(Default)]
    pub struct MockMessageBus {
        pub command_in: VecDeque<Vec<u8>>,
        pub task_in: VecDeque<Vec<u8>>,
        pub manager_in: VecDeque<ManagerMessage>,

        pub command_out: Vec<Vec<u8>>,
        pub results_out: Vec<Vec<Vec<u8>>>,
        pub manager_out: Vec<(ManagerId, Vec<Vec<u8>>)>,
    }

    impl MockMessageBus {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push_task(&mut self, payload: Vec<u8>) {
            self.task_in.push_back(payload);
        }

        pub fn push_manager_message(&mut self, msg: ManagerMessage) {
            self.manager_in.push_back(msg);
        }

        pub fn push_command(&mut self, raw: &str) {
            self.command_in.push_back(raw.as_bytes().to_vec());
        }
    }

    #[async_trait]
    impl MessageBus for MockMessageBus {
        async fn poll(&mut self, _timeout: Duration) -> Readiness {
            Readiness {
                command: !self.command_in.is_empty(),
                task_in: !self.task_in.is_empty(),
                manager_router: !self.manager_in.is_empty(),
            }
        }

        async fn take_command_request(&mut self) -> Option<Vec<u8>> {
            self.command_in.pop_front()
        }

        async fn take_task(&mut self) -> Option<Vec<u8>> {
            self.task_in.pop_front()
        }

        async fn take_manager_message(&mut self) -> Option<ManagerMessage> {
            self.manager_in.pop_front()
        }

        async fn send_command_reply(&mut self, reply: Vec<u8>) -> Result<(), InterchangeError> {
            self.command_out.push(reply);
            Ok(())
        }

        async fn send_result(&mut self, payload: Vec<u8>) -> Result<(), InterchangeError> {
            self.results_out.push(vec![payload]);
            Ok(())
        }

        async fn send_results_multipart(
            &mut self,
            payloads: Vec<Vec<u8>>,
        ) -> Result<(), InterchangeError> {
            if !payloads.is_empty() {
                self.results_out.push(payloads);
            }
            Ok(())
        }

        async fn send_to_manager(
            &mut self,
            manager_id: &ManagerId,
            frames: Vec<Vec<u8>>,
        ) -> Result<(), InterchangeError> {
            self.manager_out.push((manager_id.clone(), frames));
            Ok(())
        }
    }

    /// A clonable handle onto a [`MockMessageBus`], so a test can hand one
    /// half to the [`crate::eventloop::EventLoop`] (which takes ownership of
    /// its bus) while keeping the other half to push input and inspect
    /// what was sent.
    #[derive(Clone, Default)]
    pub struct SharedMockBus(Arc<Mutex<MockMessageBus>>);

    impl SharedMockBus {
        pub fn new() -> Self {
            Self(Arc::new(Mutex::new(MockMessageBus::new())))
        }

        pub async fn push_task(&self, payload: Vec<u8>) {
            self.0.lock().await.push_task(payload);
        }

        pub async fn push_manager_message(&self, msg: ManagerMessage) {
            self.0.lock().await.push_manager_message(msg);
        }

        pub async fn push_command(&self, raw: &str) {
            self.0.lock().await.push_command(raw);
        }

        pub async fn drain_command_out(&self) -> Vec<Vec<u8>> {
            std::mem::take(&mut self.0.lock().await.command_out)
        }

        pub async fn drain_results_out(&self) -> Vec<Vec<Vec<u8>>> {
            std::mem::take(&mut self.0.lock().await.results_out)
        }

        pub async fn drain_manager_out(&self) -> Vec<(ManagerId, Vec<Vec<u8>>)> {
            std::mem::take(&mut self.0.lock().await.manager_out)
        }
    }

    #[async_trait]
    impl MessageBus for SharedMockBus {
        async fn poll(&mut self, timeout: Duration) -> Readiness {
            self.0.lock().await.poll(timeout).await
        }

        async fn take_command_request(&mut self) -> Option<Vec<u8>> {
            self.0.lock().await.take_command_request().await
        }

        async fn take_task(&mut self) -> Option<Vec<u8>> {
            self.0.lock().await.take_task().await
        }

        async fn take_manager_message(&mut self) -> Option<ManagerMessage> {
            self.0.lock().await.take_manager_message().await
        }

        async fn send_command_reply(&mut self, reply: Vec<u8>) -> Result<(), InterchangeError> {
            self.0.lock().await.send_command_reply(reply).await
        }

        async fn send_result(&mut self, payload: Vec<u8>) -> Result<(), InterchangeError> {
            self.0.lock().await.send_result(payload).await
        }

        async fn send_results_multipart(
            &mut self,
            payloads: Vec<Vec<u8>>,
        ) -> Result<(), InterchangeError> {
            self.0.lock().await.send_results_multipart(payloads).await
        }

        async fn send_to_manager(
            &mut self,
            manager_id: &ManagerId,
            frames: Vec<Vec<u8>>,
        ) -> Result<(), InterchangeError> {
            self.0.lock().await.send_to_manager(manager_id, frames).await
        }
    }
}
