//! Core task-routing logic for the Interchange: the priority queue,
//! Manager registry, dispatch selector, command service, monitoring
//! emission, and the event loop that composes them.
//!
//! The `interchange` binary crate owns process bootstrap (stdin
//! configuration, logging, and wiring the ZeroMQ transport); everything
//! here is transport-agnostic and exercised directly in tests via the
//! in-memory [`bus::mock::MockMessageBus`].

pub mod bus;
pub mod codec;
pub mod command;
pub mod config;
pub mod error;
pub mod eventloop;
pub mod manager;
pub mod monitoring;
pub mod queue;
pub mod registry;
pub mod selector;
pub mod task;

pub use bus::{BusAddresses, MessageBus, ZmqMessageBus};
pub use config::Settings;
pub use error::InterchangeError;
pub use eventloop::{EventLoop, EventLoopConfig};
pub use registry::{ManagerId, ManagerRegistry, RuntimeIdentity};
