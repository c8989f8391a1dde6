//! Startup configuration, read as a single JSON blob from stdin
//! (`spec.md` §5).

use serde::Deserialize;

fn default_poll_period() -> u64 {
    10
}

fn default_heartbeat_threshold() -> u64 {
    120
}

/// The configuration blob the bootstrap process reads from stdin before
/// constructing the bus and event loop. Field names match the keys the
/// client driver already sends.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub client_address: String,
    #[serde(default)]
    pub interchange_address: Option<String>,
    /// `(task_in, results_out, command)`, in that order.
    pub client_ports: (u16, u16, u16),
    #[serde(default)]
    pub worker_port: Option<u16>,
    #[serde(default = "Settings::default_worker_port_range")]
    pub worker_port_range: (u16, u16),
    #[serde(default)]
    pub hub_address: Option<String>,
    #[serde(default)]
    pub hub_zmq_port: Option<u16>,
    #[serde(default = "default_heartbeat_threshold")]
    pub heartbeat_threshold: u64,
    pub logdir: String,
    #[serde(default = "Settings::default_logging_level")]
    pub logging_level: u32,
    #[serde(default = "default_poll_period")]
    pub poll_period: u64,
    #[serde(default)]
    pub cert_dir: Option<String>,
    #[serde(default = "Settings::default_manager_selector")]
    pub manager_selector: String,
    pub run_id: String,
}

impl Settings {
    fn default_worker_port_range() -> (u16, u16) {
        (54000, 55000)
    }

    /// Python's `logging.INFO`; `spec.md` §5 maps this onto `tracing`
    /// levels at startup.
    fn default_logging_level() -> u32 {
        20
    }

    fn default_manager_selector() -> String {
        "random".to_string()
    }

    /// Whether a monitoring emitter should be wired up at all
    /// (`spec.md` §4.6: both fields must be set).
    pub fn monitoring_enabled(&self) -> bool {
        self.hub_address.is_some() && self.hub_zmq_port.is_some()
    }

    /// `tracing`'s `EnvFilter` directive for Python's numeric logging
    /// levels (`10`=DEBUG, `20`=INFO, `30`=WARNING, `40`=ERROR).
    pub fn tracing_filter_directive(&self) -> &'static str {
        match self.logging_level {
            0..=10 => "debug",
            11..=20 => "info",
            21..=30 => "warn",
            _ => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_blob_with_defaults() {
        let raw = r#"{
            "client_address": "127.0.0.1",
            "client_ports": [55001, 55002, 55003],
            "logdir": "/tmp/interchange-logs",
            "run_id": "run-1"
        }"#;
        let settings: Settings = serde_json::from_str(raw).expect("parses");
        assert_eq!(settings.client_ports, (55001, 55002, 55003));
        assert_eq!(settings.heartbeat_threshold, 120);
        assert_eq!(settings.poll_period, 10);
        assert_eq!(settings.manager_selector, "random");
        assert!(!settings.monitoring_enabled());
    }

    #[test]
    fn monitoring_enabled_requires_both_hub_fields() {
        let raw = r#"{
            "client_address": "127.0.0.1",
            "client_ports": [1, 2, 3],
            "logdir": "/tmp/x",
            "run_id": "run-1",
            "hub_address": "10.0.0.1"
        }"#;
        let settings: Settings = serde_json::from_str(raw).expect("parses");
        assert!(!settings.monitoring_enabled());
    }

    #[test]
    fn logging_level_maps_to_tracing_directive() {
        let mut settings: Settings = serde_json::from_str(
            r#"{"client_address":"a","client_ports":[1,2,3],"logdir":"/tmp","run_id":"r"}"#,
        )
        .unwrap();
        settings.logging_level = 10;
        assert_eq!(settings.tracing_filter_directive(), "debug");
        settings.logging_level = 40;
        assert_eq!(settings.tracing_filter_directive(), "error");
    }
}
