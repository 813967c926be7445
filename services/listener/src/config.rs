//! Listener options and their environment-variable front end.
//!
//! Options cover the node identity, the HTTP bind, loop frequencies, pool
//! caps and the persistence locations.  The persisted *user* configuration
//! (`<name>_config.json`) is separate: an opaque JSON object owned by the
//! behavior, loaded at construction and written back at shutdown.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Construction-time knobs for an [`EventListener`](crate::EventListener).
///
/// `ListenerOptions::new("io")` gives the defaults every node ships with;
/// override fields directly before handing the options to the listener.
#[derive(Debug, Clone)]
pub struct ListenerOptions {
    /// Node identity; also the base name of the state and config files.
    /// Stored lowercase.
    pub name: String,
    /// HTTP bind address.
    pub address: String,
    /// HTTP bind port.
    pub port: u16,
    /// Skip snapshot rehydration at construction.
    pub do_not_load_state: bool,
    /// Run the neighbour-discovery loop.
    pub discovery_neighbours: bool,
    /// Emit control-loop overtime warnings.
    pub report_overtime: bool,
    /// Analyzer loop frequency (Hz).
    pub analyze_queue_frequency: f64,
    /// Local-data loop frequency (Hz).
    pub check_local_data_frequency: f64,
    /// Dispatcher loop frequency (Hz).
    pub send_queue_frequency: f64,
    /// Discovery loop frequency (Hz).
    pub discovery_frequency: f64,
    pub incoming_max_size: usize,
    pub incoming_max_age_seconds: f64,
    pub outgoing_max_size: usize,
    pub outgoing_max_age_seconds: f64,
    /// Delivery attempts before an outgoing event is dropped.
    pub max_retries: u32,
    /// Oldest entries the dispatcher takes per tick.
    pub send_batch_size: usize,
    /// Deadline substituted for events that carry none (seconds).
    pub default_max_processing_time: f64,
    /// Wait between binding the server and releasing the loops.
    pub stabilization: Duration,
    /// Directory for `<name>_state.json`.
    pub state_dir: PathBuf,
    /// Directory for `<name>_config.json`.
    pub config_dir: PathBuf,
}

impl ListenerOptions {
    pub fn new(name: impl Into<String>) -> Self {
        ListenerOptions {
            name: name.into().to_lowercase(),
            address: "127.0.0.1".to_owned(),
            port: 8000,
            do_not_load_state: false,
            discovery_neighbours: false,
            report_overtime: true,
            analyze_queue_frequency: 100.0,
            check_local_data_frequency: 100.0,
            send_queue_frequency: 50.0,
            discovery_frequency: 1.0,
            incoming_max_size: 10_000,
            incoming_max_age_seconds: 300.0,
            outgoing_max_size: 50_000,
            outgoing_max_age_seconds: 600.0,
            max_retries: 10,
            send_batch_size: 100,
            default_max_processing_time: 20.0,
            stabilization: Duration::from_secs(2),
            state_dir: env::temp_dir(),
            config_dir: PathBuf::from("."),
        }
    }

    /// Options for the standalone binary, read from the environment:
    /// `NODE_NAME`, `NODE_ADDRESS`, `NODE_PORT`, `DO_NOT_LOAD_STATE`,
    /// `DISCOVERY_NEIGHBOURS`, `REPORT_OVERTIME`.
    pub fn from_env() -> Self {
        let mut options = ListenerOptions::new(
            env::var("NODE_NAME").unwrap_or_else(|_| "node".to_owned()),
        );
        if let Ok(address) = env::var("NODE_ADDRESS") {
            options.address = address;
        }
        if let Ok(port) = env::var("NODE_PORT") {
            if let Ok(port) = port.parse() {
                options.port = port;
            }
        }
        options.do_not_load_state = env_flag("DO_NOT_LOAD_STATE", options.do_not_load_state);
        options.discovery_neighbours =
            env_flag("DISCOVERY_NEIGHBOURS", options.discovery_neighbours);
        options.report_overtime = env_flag("REPORT_OVERTIME", options.report_overtime);
        options
    }

    pub fn state_file_path(&self) -> PathBuf {
        self.state_dir.join(format!("{}_state.json", self.name))
    }

    pub fn config_file_path(&self) -> PathBuf {
        self.config_dir.join(format!("{}_config.json", self.name))
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(value) => matches!(value.as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}
