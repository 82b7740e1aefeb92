//! `Circuit` — owns one child circuit process, supervises its lifecycle,
//! accumulates health statistics, and lends out [`InstrumentedDialer`]s.
//!
//! Grounded on `splice/src/supervisor.rs` (`Supervisor`, `WorkerState`,
//! restart/backoff shape) for the process-supervision loop, and
//! `src/shutdown.rs` (`GracefulShutdown::drain_connections`,
//! `ConnectionGuard`) for the drain-with-timeout loop and RAII counting.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tracing::{info, warn};

use crate::config::CircuitConfig;
use crate::dialer::{InstrumentedDialer, StatsSink};
use crate::error::{SwarmError, SwarmResult};
use crate::metrics;
use crate::stats::{RollingStats, StatsSummary};

const SUPERVISOR_TICK: Duration = Duration::from_secs(1);
const SUSPEND_RETRY: Duration = Duration::from_millis(100);

const READY_SUBSTRING: &str = "Bootstrapped 100%: Done.";
const BIND_FAILURE_PREFIX: &str = "Could not bind to 127.0.0.1:";

/// The five mutually exclusive lifecycle states a circuit can occupy.
///
/// The distilled model describes a `readiness` flag and a `terminated` flag
/// independently, but the lifecycle section already enumerates five
/// mutually exclusive states; collapsing them here means "usable iff
/// readiness ∧ ¬terminated" is just `state == Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CircuitState {
    Booting = 0,
    Ready = 1,
    Draining = 2,
    Stopped = 3,
    Terminated = 4,
}

impl CircuitState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => CircuitState::Booting,
            1 => CircuitState::Ready,
            2 => CircuitState::Draining,
            3 => CircuitState::Stopped,
            _ => CircuitState::Terminated,
        }
    }
}

/// Accounting shared between a `Circuit` and the dialers it hands out.
///
/// Kept separate from `Circuit` itself so a dialer's stats callback closes
/// over this handle rather than the circuit — a one-way message, no
/// back-reference, per the cyclic-ownership design note.
struct Accounting {
    ref_count: AtomicI64,
    socket_count: AtomicU64,
    stats: Mutex<RollingStats>,
}

impl Accounting {
    fn new() -> Self {
        Self {
            ref_count: AtomicI64::new(0),
            socket_count: AtomicU64::new(0),
            stats: Mutex::new(RollingStats::new()),
        }
    }

    fn reset(&self) {
        self.socket_count.store(0, Ordering::SeqCst);
        self.stats.lock().unwrap().reset();
        // ref_count is intentionally left alone here: a restart only
        // reaches this point after the drain has already forced it to 0.
    }
}

pub struct Circuit {
    name: String,
    socks_port: u16,
    control_port: u16,
    work_dir: PathBuf,
    binary: PathBuf,
    config: CircuitConfig,

    state: AtomicU8,
    accounting: Arc<Accounting>,
    resurrections: AtomicU64,
    boot_time: Mutex<Instant>,
    connected_time: Mutex<Option<Instant>>,
    stop_requested: AtomicBool,

    /// Held exclusively for the entire drain; acquired non-blocking during
    /// dialer issuance so dispatch never stalls on a mid-restart circuit.
    exclusive_access: AsyncMutex<()>,
}

impl Circuit {
    pub fn new(
        name: impl Into<String>,
        socks_port: u16,
        control_port: u16,
        work_dir: PathBuf,
        config: CircuitConfig,
    ) -> Self {
        Self {
            name: name.into(),
            socks_port,
            control_port,
            work_dir,
            binary: PathBuf::from("tor"),
            config,
            state: AtomicU8::new(CircuitState::Booting as u8),
            accounting: Arc::new(Accounting::new()),
            resurrections: AtomicU64::new(0),
            boot_time: Mutex::new(Instant::now()),
            connected_time: Mutex::new(None),
            stop_requested: AtomicBool::new(false),
            exclusive_access: AsyncMutex::new(()),
        }
    }

    /// Override the circuit-process executable. Used by tests to point at
    /// a fake stand-in script instead of a real `tor` binary.
    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: CircuitState) {
        self.state.store(state as u8, Ordering::SeqCst);
        metrics::set_circuit_state(&self.name, state);
    }

    /// Test-only hook so tests in this module and `swarm` can drive a
    /// circuit into a given state without running the supervisor loop.
    #[cfg(test)]
    pub fn set_state_for_test(&self, state: CircuitState) {
        self.set_state(state);
    }

    pub fn is_usable(&self) -> bool {
        self.state() == CircuitState::Ready
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == CircuitState::Terminated
    }

    pub fn ref_count(&self) -> i64 {
        self.accounting.ref_count.load(Ordering::SeqCst)
    }

    pub fn socket_count(&self) -> u64 {
        self.accounting.socket_count.load(Ordering::SeqCst)
    }

    pub fn stats_summary(&self) -> StatsSummary {
        self.accounting.stats.lock().unwrap().summary()
    }

    /// Request the supervisor loop to stop at its next ~1 s check.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    fn data_dir(&self) -> PathBuf {
        self.work_dir.join(&self.name)
    }

    fn pid_file(&self) -> PathBuf {
        self.data_dir().join("pid")
    }

    fn spawn_args(&self) -> Vec<String> {
        let pairs: [(&str, String); 6] = [
            ("CookieAuthentication", "0".to_string()),
            ("HashedControlPassword", String::new()),
            ("ControlPort", self.control_port.to_string()),
            ("SocksPort", self.socks_port.to_string()),
            ("PidFile", self.pid_file().display().to_string()),
            ("DataDirectory", self.data_dir().display().to_string()),
        ];
        pairs
            .into_iter()
            .flat_map(|(k, v)| [format!("--{k}"), v])
            .collect()
    }

    /// Request a dialer bound to this circuit's SOCKS endpoint.
    ///
    /// Returns `Ok(None)` when `suppress_errors` is set and the circuit is
    /// not ready, or when a restart is in progress — callers must retry
    /// against another circuit in both cases. Returns `Err(NotConnected)`
    /// when not ready and `suppress_errors` is false.
    pub async fn create_socket(&self, suppress_errors: bool) -> SwarmResult<Option<InstrumentedDialer>> {
        if !self.is_usable() {
            if suppress_errors {
                sleep(SUSPEND_RETRY).await;
                return Ok(None);
            }
            return Err(SwarmError::NotConnected {
                name: self.name.clone(),
            });
        }

        let Ok(_guard) = self.exclusive_access.try_lock() else {
            return Ok(None);
        };

        // Re-check under the lock: a restart may have started between the
        // usability check above and acquiring the lock.
        if !self.is_usable() {
            return Ok(None);
        }

        let socks_addr = format!("127.0.0.1:{}", self.socks_port)
            .parse()
            .expect("loopback address always parses");

        let accounting = self.accounting.clone();
        let name = self.name.clone();
        let sink: StatsSink = Arc::new(move |elapsed, errors| {
            record_dialer_result(&name, &accounting, elapsed, errors);
        });

        self.accounting.ref_count.fetch_add(1, Ordering::SeqCst);
        self.accounting.socket_count.fetch_add(1, Ordering::SeqCst);
        metrics::set_ref_count(&self.name, self.ref_count());
        metrics::set_socket_count(&self.name, self.socket_count());

        Ok(Some(InstrumentedDialer::new(socks_addr, sink)))
    }

    /// Run the supervisor state machine to completion (until stopped or
    /// terminated). Intended to be spawned as its own task, one per
    /// circuit, mirroring "one supervisor thread per Circuit".
    pub async fn run(self: Arc<Self>) {
        loop {
            match self.state() {
                CircuitState::Booting => {
                    if !self.run_booting().await {
                        break;
                    }
                }
                CircuitState::Ready => {
                    if !self.run_ready().await {
                        break;
                    }
                }
                CircuitState::Draining => {
                    self.run_draining().await;
                }
                CircuitState::Stopped | CircuitState::Terminated => break,
            }
        }
    }

    /// Spawn the child, reset accounting, and wait for either a readiness
    /// signal, a bind failure, a boot timeout, an unexpected exit, or a
    /// stop request. Returns `false` when the supervisor loop should exit.
    async fn run_booting(&self) -> bool {
        self.accounting.reset();
        *self.boot_time.lock().unwrap() = Instant::now();

        if let Err(e) = tokio::fs::create_dir_all(self.data_dir()).await {
            warn!(circuit = %self.name, error = %e, "failed to create circuit data directory");
        }

        let mut child = match Command::new(&self.binary)
            .args(self.spawn_args())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                warn!(circuit = %self.name, error = %e, "failed to spawn circuit process, will retry");
                sleep(SUPERVISOR_TICK).await;
                return true;
            }
        };

        let stdout = child.stdout.take().expect("stdout was piped");
        let mut lines = BufReader::new(stdout).lines();

        let deadline = Instant::now() + self.config.boot_time_max;
        info!(circuit = %self.name, "booting circuit process");

        loop {
            if self.stop_requested.load(Ordering::SeqCst) {
                stop_child(&mut child).await;
                self.set_state(CircuitState::Stopped);
                return false;
            }

            if Instant::now() >= deadline {
                warn!(circuit = %self.name, "boot timed out, restarting");
                stop_child(&mut child).await;
                metrics::inc_restarts(&self.name);
                return true;
            }

            let line = timeout(SUPERVISOR_TICK, lines.next_line()).await;
            let line = match line {
                Ok(Ok(Some(line))) => line,
                Ok(Ok(None)) => {
                    // child exited while booting
                    let status = child.wait().await;
                    info!(circuit = %self.name, ?status, "circuit process exited during boot");
                    return self.handle_unexpected_exit();
                }
                Ok(Err(e)) => {
                    warn!(circuit = %self.name, error = %e, "error reading circuit stdout");
                    continue;
                }
                Err(_) => continue, // tick elapsed, loop back to re-check stop/deadline
            };

            if line.contains(READY_SUBSTRING) {
                *self.connected_time.lock().unwrap() = Some(Instant::now());
                self.set_state(CircuitState::Ready);
                info!(circuit = %self.name, "circuit ready");
                return true;
            }

            if let Some(port) = bind_failure_port(&line) {
                if port == self.socks_port || port == self.control_port {
                    warn!(circuit = %self.name, port, "bind failure, terminating circuit");
                    stop_child(&mut child).await;
                    self.set_state(CircuitState::Terminated);
                    metrics::inc_terminations(&self.name, "bind_failure");
                    return false;
                }
            }
        }
    }

    /// While `Ready`: watch health thresholds and the stop signal at 1 s
    /// granularity. Returns `false` when the loop should exit.
    async fn run_ready(&self) -> bool {
        let mut tick = interval(SUPERVISOR_TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tick.tick().await;

            if self.stop_requested.load(Ordering::SeqCst) {
                self.set_state(CircuitState::Stopped);
                return false;
            }

            let age = self
                .connected_time
                .lock()
                .unwrap()
                .map(|t| t.elapsed())
                .unwrap_or_default();

            if age < self.config.grace_time {
                continue;
            }

            let summary = self.stats_summary();
            let sockets_max_hit = self
                .config
                .sockets_max
                .map(|max| self.socket_count() >= max)
                .unwrap_or(false);

            if summary.errors_total > self.config.errors_max
                || summary.timing_avg > self.config.conn_time_avg_max
                || sockets_max_hit
            {
                info!(circuit = %self.name, "health thresholds exceeded, draining for restart");
                self.set_state(CircuitState::Draining);
                return true;
            }
        }
    }

    /// Drain outstanding dialers (hard 30 s timeout), then restart.
    async fn run_draining(&self) {
        let _guard = self.exclusive_access.lock().await;

        let start = Instant::now();
        loop {
            if self.ref_count() <= 0 {
                break;
            }
            if start.elapsed() >= self.config.drain_timeout {
                let stuck = self.ref_count();
                warn!(circuit = %self.name, stuck, "drain timed out, forcing ref_count to 0");
                self.accounting.ref_count.store(0, Ordering::SeqCst);
                metrics::inc_drain_timeouts(&self.name);
                let _ = SwarmError::RefCountStuck {
                    name: self.name.clone(),
                    stuck,
                };
                break;
            }
            sleep(SUSPEND_RETRY).await;
        }

        // child is re-spawned by run_booting(); here we just need to make
        // sure whatever child handle the boot loop held has been told to
        // go away, which run_booting's own spawn + kill_on_drop covers on
        // the next iteration since we never held the Child here directly.
        metrics::inc_restarts(&self.name);
        self.set_state(CircuitState::Booting);
    }

    /// Unexpected child exit: resurrect unless the budget is exhausted.
    fn handle_unexpected_exit(&self) -> bool {
        let resurrections = self.resurrections.fetch_add(1, Ordering::SeqCst) + 1;
        if resurrections > self.config.resurrections_max as u64 {
            warn!(circuit = %self.name, resurrections, "resurrection budget exhausted, terminating");
            self.set_state(CircuitState::Terminated);
            metrics::inc_terminations(&self.name, "resurrection_exhausted");
            false
        } else {
            info!(circuit = %self.name, resurrections, "circuit exited unexpectedly, resurrecting");
            metrics::inc_resurrections(&self.name);
            true
        }
    }
}

fn record_dialer_result(name: &str, accounting: &Accounting, elapsed: f64, errors: u32) {
    {
        let mut stats = accounting.stats.lock().unwrap();
        stats.record(elapsed, errors);
    }

    let prev = accounting.ref_count.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
        if v > 0 {
            Some(v - 1)
        } else {
            None
        }
    });
    if prev.is_err() {
        warn!(circuit = %name, "dialer reported stats but ref_count was already at 0");
    }
    metrics::set_ref_count(name, accounting.ref_count.load(Ordering::SeqCst));
}

fn bind_failure_port(line: &str) -> Option<u16> {
    let idx = line.find(BIND_FAILURE_PREFIX)?;
    let rest = &line[idx + BIND_FAILURE_PREFIX.len()..];
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

async fn stop_child(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        if let Some(pid) = child.id() {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
    }

    match timeout(Duration::from_secs(5), child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            let _ = child.kill().await;
        }
    }
}

/// Type alias kept for call sites that want to name the future explicitly
/// (e.g. when composing `run()` with other supervisor tasks in the swarm).
pub type CircuitRunFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CircuitConfig {
        CircuitConfig::default()
    }

    #[test]
    fn bind_failure_port_parses_trailing_digits() {
        let line = "[warn] Could not bind to 127.0.0.1:19050: Address already in use";
        assert_eq!(bind_failure_port(line), Some(19050));
    }

    #[test]
    fn bind_failure_port_none_when_absent() {
        assert_eq!(bind_failure_port("Bootstrapped 100%: Done."), None);
    }

    #[tokio::test]
    async fn new_circuit_starts_booting_and_unusable() {
        let circuit = Circuit::new("tor-0", 19050, 18118, PathBuf::from("/tmp/circuit-test"), config());
        assert_eq!(circuit.state(), CircuitState::Booting);
        assert!(!circuit.is_usable());
        assert_eq!(circuit.ref_count(), 0);
        assert_eq!(circuit.socket_count(), 0);
    }

    #[tokio::test]
    async fn create_socket_not_ready_suppressed_returns_none() {
        let circuit = Circuit::new("tor-0", 19050, 18118, PathBuf::from("/tmp/circuit-test"), config());
        let result = circuit.create_socket(true).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn create_socket_not_ready_unsuppressed_errors() {
        let circuit = Circuit::new("tor-0", 19050, 18118, PathBuf::from("/tmp/circuit-test"), config());
        let result = circuit.create_socket(false).await;
        assert!(matches!(result, Err(SwarmError::NotConnected { .. })));
    }

    #[tokio::test]
    async fn create_socket_when_ready_increments_counters() {
        let circuit = Circuit::new("tor-0", 19050, 18118, PathBuf::from("/tmp/circuit-test"), config());
        circuit.set_state(CircuitState::Ready);

        let dialer = circuit.create_socket(true).await.unwrap();
        assert!(dialer.is_some());
        assert_eq!(circuit.ref_count(), 1);
        assert_eq!(circuit.socket_count(), 1);

        dialer.unwrap().close().await;
        assert_eq!(circuit.ref_count(), 0);
        // socket_count is only reset on restart, not on dialer completion.
        assert_eq!(circuit.socket_count(), 1);
    }

    #[tokio::test]
    async fn create_socket_while_draining_returns_none() {
        let circuit = Circuit::new("tor-0", 19050, 18118, PathBuf::from("/tmp/circuit-test"), config());
        circuit.set_state(CircuitState::Draining);
        let result = circuit.create_socket(true).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn ref_count_decrement_never_goes_negative() {
        let circuit = Circuit::new("tor-0", 19050, 18118, PathBuf::from("/tmp/circuit-test"), config());
        record_dialer_result("tor-0", &circuit.accounting, 0.1, 0);
        assert_eq!(circuit.ref_count(), 0);
    }
}


