//! Bootstrap for the Interchange process: read the startup configuration
//! blob from standard input, initialize logging, bind the transport, and
//! run the event loop to completion (`spec.md` §2 "Bootstrap").

use std::io::Read;
use std::time::Duration;

use anyhow::Context;
use rand::Rng;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use interchange_core::bus::BusAddresses;
use interchange_core::config::Settings;
use interchange_core::eventloop::{EventLoop, EventLoopConfig};
use interchange_core::monitoring::{ChannelMonitoringEmitter, MonitoringEmitter, NoopEmitter};
use interchange_core::registry::RuntimeIdentity;
use interchange_core::selector::RandomManagerSelector;
use interchange_core::{InterchangeError, ZmqMessageBus};

/// This binary's own identity, matched against an incoming Manager's
/// registration (`spec.md` §4.3). Kept separate from `logging_level`
/// defaults since it describes the protocol, not the process.
const FRAMEWORK_VERSION: &str = env!("CARGO_PKG_VERSION");
/// Full version, *not* pre-truncated: `RuntimeIdentity::matches` truncates
/// both sides to their minor version before comparing
/// (`registry.rs::minor_version`), so this must carry a patch component
/// or it would itself get truncated one component too far (`"3.11"` →
/// `"3"`), rejecting every real Manager's `"3.11.x"`.
const PYTHON_COMPAT_VERSION: &str = "3.11.4";

fn read_settings_from_stdin() -> anyhow::Result<Settings> {
    let mut raw = String::new();
    std::io::stdin()
        .read_to_string(&mut raw)
        .context("reading configuration blob from stdin")?;
    serde_json::from_str(&raw).context("decoding configuration blob")
}

fn init_logging(settings: &Settings) -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    std::fs::create_dir_all(&settings.logdir)
        .with_context(|| format!("creating log directory {}", settings.logdir))?;
    let file_appender = tracing_appender::rolling::never(&settings.logdir, "interchange.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(settings.tracing_filter_directive()));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();

    Ok(guard)
}

/// Resolve the worker-facing bind port: the fixed `worker_port` if set,
/// otherwise a single random pick within `worker_port_range`
/// (`spec.md` §6). Unlike the original source, this does not retry on
/// a bind collision — left as a follow-up, noted in `DESIGN.md`.
fn worker_bind_port(settings: &Settings) -> u16 {
    match settings.worker_port {
        Some(p) => p,
        None => {
            let (lo, hi) = settings.worker_port_range;
            rand::rng().random_range(lo..=hi)
        }
    }
}

fn client_bind_host(settings: &Settings) -> &str {
    settings.interchange_address.as_deref().unwrap_or("*")
}

/// `spec.md` §6 names `manager_selector` as a startup field but only
/// defines one policy (§4.4's unbiased random permutation). Any other
/// value falls back to it with a warning rather than failing startup.
fn build_selector(name: &str) -> Box<dyn interchange_core::selector::ManagerSelector> {
    match name {
        "random" => Box::new(RandomManagerSelector::from_entropy()),
        other => {
            tracing::warn!(selector = %other, "unknown manager_selector, falling back to random");
            Box::new(RandomManagerSelector::from_entropy())
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = read_settings_from_stdin()?;
    let _log_guard = init_logging(&settings)?;

    tracing::info!(run_id = %settings.run_id, "starting interchange");

    let (task_in_port, results_out_port, command_port) = settings.client_ports;
    let addrs = BusAddresses {
        task_in_addr: format!("tcp://{}:{task_in_port}", settings.client_address),
        results_out_addr: format!("tcp://{}:{results_out_port}", settings.client_address),
        command_addr: format!("tcp://{}:{command_port}", settings.client_address),
        manager_router_bind: format!(
            "tcp://{}:{}",
            client_bind_host(&settings),
            worker_bind_port(&settings)
        ),
    };

    let (bus, worker_port) = ZmqMessageBus::connect(&addrs)
        .await
        .context("binding interchange transport")?;

    let (monitor, _monitor_task): (Box<dyn MonitoringEmitter>, _) = if settings.monitoring_enabled() {
        let (emitter, receiver) = ChannelMonitoringEmitter::new(settings.run_id.clone());
        let task = tokio::spawn(run_monitoring_sink(receiver));
        (Box::new(emitter), Some(task))
    } else {
        (Box::new(NoopEmitter), None)
    };

    let config = EventLoopConfig {
        identity: RuntimeIdentity {
            framework_version: FRAMEWORK_VERSION.to_string(),
            python_version: PYTHON_COMPAT_VERSION.to_string(),
        },
        heartbeat_threshold: Duration::from_secs(settings.heartbeat_threshold),
        poll_period: Duration::from_millis(settings.poll_period),
        worker_port,
        run_id: settings.run_id.clone(),
    };

    let mut event_loop = EventLoop::new(
        Box::new(bus),
        build_selector(&settings.manager_selector),
        monitor,
        Box::new(interchange_core::codec::JsonSerializer),
        config,
    );

    event_loop.run().await;
    tracing::info!(
        dispatched = event_loop.dispatched_count(),
        "interchange exiting"
    );
    Ok(())
}

/// Owns the actual monitoring transport; receives owned snapshots over
/// the channel so the event loop never shares a `ManagerRecord`
/// reference across the task boundary (`spec.md` §5).
async fn run_monitoring_sink(
    mut receiver: tokio::sync::mpsc::UnboundedReceiver<interchange_core::monitoring::NodeInfoEvent>,
) -> Result<(), InterchangeError> {
    while let Some(event) = receiver.recv().await {
        tracing::debug!(manager_id = %event.manager_id, run_id = %event.run_id, "node_info event");
    }
    Ok(())
}
