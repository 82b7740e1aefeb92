//! Configuration: the CLI surface (clap-derive) and the tuning parameter
//! bags handed to [`crate::swarm::Swarm`] and [`crate::circuit::Circuit`].
//!
//! The flag table is grounded on `proctor/scripts.py`'s `get_args_parser`/
//! `parse_args`; the builder-setter shape on `shutdown.rs`'s
//! `ShutdownConfig::with_drain_timeout`/`without_signal_handlers`.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Proxy log verbosity, mirroring the five choices of the original CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    Critical,
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    /// `CRITICAL` has no tracing equivalent; it's mapped onto `ERROR` and
    /// swarm-exhaustion logs carry a `fatal = true` field to distinguish it.
    pub fn as_tracing_level(self) -> tracing::Level {
        match self {
            LogLevel::Critical | LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
        }
    }
}

/// Command-line surface for the circuit-swarm proxy binary.
#[derive(Debug, Parser)]
#[command(name = "circuit-swarm", about = "HTTP(S) forward proxy over a swarm of anonymizing circuits")]
pub struct Cli {
    /// Proxy listen port.
    #[arg(short = 'p', long, default_value_t = 8080)]
    pub port: u16,

    /// Base SOCKS port for the circuit processes.
    #[arg(short = 's', long = "base-socks-port", default_value_t = 19050)]
    pub base_socks_port: u16,

    /// Base control port for the circuit processes.
    #[arg(short = 'c', long = "base-control-port", default_value_t = 18118)]
    pub base_control_port: u16,

    /// Swarm size.
    #[arg(short = 'n', long, default_value_t = 2)]
    pub instances: usize,

    /// Root directory for child data directories. A temp dir is created
    /// and removed on exit if this is not set.
    #[arg(short = 'd', long = "work-dir")]
    pub work_dir: Option<PathBuf>,

    /// Maps to `sockets_max`: max dialers served before a circuit restarts.
    #[arg(short = 'm', long = "max-use")]
    pub max_use: Option<u64>,

    /// Maps to `conn_time_avg_max`, in seconds.
    #[arg(short = 't', long = "max-conn-time", default_value_t = 2.0)]
    pub max_conn_time: f64,

    /// Minimum log level to display.
    #[arg(short = 'l', long = "loglevel", value_enum, default_value_t = LogLevel::Info)]
    pub loglevel: LogLevel,
}

/// Tuning parameters for one [`crate::circuit::Circuit`].
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    pub boot_time_max: Duration,
    pub errors_max: u64,
    pub conn_time_avg_max: f64,
    pub grace_time: Duration,
    pub sockets_max: Option<u64>,
    pub resurrections_max: u32,
    pub drain_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            boot_time_max: Duration::from_secs(60),
            errors_max: 3,
            conn_time_avg_max: 2.0,
            grace_time: Duration::from_secs(10),
            sockets_max: None,
            resurrections_max: 3,
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitConfig {
    pub fn with_boot_time_max(mut self, value: Duration) -> Self {
        self.boot_time_max = value;
        self
    }

    pub fn with_errors_max(mut self, value: u64) -> Self {
        self.errors_max = value;
        self
    }

    pub fn with_conn_time_avg_max(mut self, value: f64) -> Self {
        self.conn_time_avg_max = value;
        self
    }

    pub fn with_grace_time(mut self, value: Duration) -> Self {
        self.grace_time = value;
        self
    }

    pub fn with_sockets_max(mut self, value: Option<u64>) -> Self {
        self.sockets_max = value;
        self
    }

    pub fn with_resurrections_max(mut self, value: u32) -> Self {
        self.resurrections_max = value;
        self
    }

    pub fn with_drain_timeout(mut self, value: Duration) -> Self {
        self.drain_timeout = value;
        self
    }
}

/// Construction parameters for a [`crate::swarm::Swarm`].
#[derive(Debug, Clone)]
pub struct SwarmConfig {
    pub base_socks_port: u16,
    pub base_control_port: u16,
    pub work_dir: PathBuf,
    pub circuit: CircuitConfig,
}

impl SwarmConfig {
    pub fn new(base_socks_port: u16, base_control_port: u16, work_dir: PathBuf) -> Self {
        Self {
            base_socks_port,
            base_control_port,
            work_dir,
            circuit: CircuitConfig::default(),
        }
    }

    pub fn with_circuit_config(mut self, circuit: CircuitConfig) -> Self {
        self.circuit = circuit;
        self
    }
}

impl From<&Cli> for CircuitConfig {
    fn from(cli: &Cli) -> Self {
        CircuitConfig::default()
            .with_conn_time_avg_max(cli.max_conn_time)
            .with_sockets_max(cli.max_use)
    }
}
