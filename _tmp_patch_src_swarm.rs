//! `Swarm` — owns a fixed-size set of circuits and a round-robin cursor
//! over the currently connected ones.
//!
//! Grounded on `src/connection_pool.rs`'s `ConnectionPool` (the
//! `AtomicUsize`-based round-robin index) for the cursor, and
//! `proctor/tor.py`'s `TorSwarm` for `start`/`instances`/`stop` semantics.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{error, info};

use crate::circuit::Circuit;
use crate::config::SwarmConfig;
use crate::error::{SwarmError, SwarmResult};

const START_STAGGER: Duration = Duration::from_millis(100);

/// A fixed-size set of circuits plus a serialized round-robin cursor.
pub struct Swarm {
    circuits: Vec<Arc<Circuit>>,
    cursor: AtomicUsize,
    /// Serializes cursor advance + terminated-skip + exhaustion-check as
    /// one step, per the "one mutex around the cursor" dispatch contract.
    dispatch_lock: Mutex<()>,
    supervisors: Mutex<Vec<JoinHandle<()>>>,
}

impl Swarm {
    /// Create and start `n` circuits named `tor-0..tor-(n-1)`, assigning
    /// ports `base+i` for each, staggering starts by 100 ms to avoid a
    /// startup-time thundering herd on the host.
    pub async fn start(config: SwarmConfig, n: usize) -> Self {
        let mut circuits = Vec::with_capacity(n);
        let mut supervisors = Vec::with_capacity(n);

        for i in 0..n {
            let name = format!("tor-{i}");
            let socks_port = config.base_socks_port + i as u16;
            let control_port = config.base_control_port + i as u16;

            let circuit = Arc::new(Circuit::new(
                name.clone(),
                socks_port,
                control_port,
                config.work_dir.clone(),
                config.circuit.clone(),
            ));

            let handle = tokio::spawn(circuit.clone().run());
            supervisors.push(handle);
            circuits.push(circuit);

            info!(circuit = %name, socks_port, control_port, "circuit starting");

            if i + 1 < n {
                sleep(START_STAGGER).await;
            }
        }

        Self {
            circuits,
            cursor: AtomicUsize::new(0),
            dispatch_lock: Mutex::new(()),
            supervisors: Mutex::new(supervisors),
        }
    }

    /// Test-only constructor: wires up `PathBuf`-configurable circuits
    /// without spawning a supervisor task, so tests can drive each
    /// circuit's state machine explicitly.
    #[cfg(test)]
    pub fn from_circuits(circuits: Vec<Arc<Circuit>>) -> Self {
        Self {
            circuits,
            cursor: AtomicUsize::new(0),
            dispatch_lock: Mutex::new(()),
            supervisors: Mutex::new(Vec::new()),
        }
    }

    pub fn circuits(&self) -> &[Arc<Circuit>] {
        &self.circuits
    }

    /// Advance the cursor and return the next non-terminated circuit,
    /// skipping terminated ones without eagerly removing them. Ends
    /// (returns `Err(SwarmExhausted)`) once no non-terminated circuit
    /// remains — consumers must treat that as fatal.
    pub async fn next_instance(&self) -> SwarmResult<Arc<Circuit>> {
        let _guard = self.dispatch_lock.lock().await;

        let total = self.circuits.len();
        for _ in 0..total {
            let idx = self.cursor.fetch_add(1, Ordering::SeqCst) % total;
            let circuit = &self.circuits[idx];
            if !circuit.is_terminated() {
                return Ok(circuit.clone());
            }
        }

        if self.circuits.iter().all(|c| c.is_terminated()) {
            Err(SwarmError::SwarmExhausted)
        } else {
            // All circuits mid-restart but none terminated: give the caller
            // the one the cursor currently points at so it can retry.
            let idx = self.cursor.load(Ordering::SeqCst) % total;
            Ok(self.circuits[idx].clone())
        }
    }

    /// Dispatch contract: obtain the next circuit, request a dialer with
    /// `suppress_errors = true`, retrying against the next circuit on
    /// `None`. Returns `SwarmExhausted` if the whole swarm is unusable.
    pub async fn dispatch(&self) -> SwarmResult<crate::dialer::InstrumentedDialer> {
        for _ in 0..self.circuits.len() {
            let circuit = self.next_instance().await?;
            if let Some(dialer) = circuit.create_socket(true).await? {
                return Ok(dialer);
            }
        }
        Err(SwarmError::SwarmExhausted)
    }

    /// True once at least one circuit has reached `Ready`.
    pub fn has_ready_circuit(&self) -> bool {
        self.circuits.iter().any(|c| c.is_usable())
    }

    /// True once every circuit has permanently failed.
    pub fn is_exhausted(&self) -> bool {
        self.circuits.iter().all(|c| c.is_terminated())
    }

    /// Signal stop to every circuit and wait for each supervisor task to
    /// exit. Idempotent: calling this twice is harmless.
    pub async fn stop(&self) {
        for circuit in &self.circuits {
            circuit.request_stop();
        }

        let mut supervisors = self.supervisors.lock().await;
        for handle in supervisors.drain(..) {
            if let Err(e) = handle.await {
                error!("supervisor task panicked during shutdown: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::CircuitState;
    use crate::config::CircuitConfig;

    fn ready_circuit(name: &str) -> Arc<Circuit> {
        let circuit = Circuit::new(name, 19050, 18118, PathBuf::from("/tmp/swarm-test"), CircuitConfig::default());
        circuit.set_state_for_test(CircuitState::Ready);
        Arc::new(circuit)
    }

    fn terminated_circuit(name: &str) -> Arc<Circuit> {
        let circuit = Circuit::new(name, 19050, 18118, PathBuf::from("/tmp/swarm-test"), CircuitConfig::default());
        circuit.set_state_for_test(CircuitState::Terminated);
        Arc::new(circuit)
    }

    #[tokio::test]
    async fn round_robin_distributes_evenly() {
        let swarm = Swarm::from_circuits(vec![ready_circuit("tor-0"), ready_circuit("tor-1")]);

        let mut counts = [0usize; 2];
        for _ in 0..10 {
            let circuit = swarm.next_instance().await.unwrap();
            let idx = circuit.name().strip_prefix("tor-").unwrap().parse::<usize>().unwrap();
            counts[idx] += 1;
        }

        assert_eq!(counts, [5, 5]);
    }

    #[tokio::test]
    async fn skips_terminated_circuits() {
        let swarm = Swarm::from_circuits(vec![
            terminated_circuit("tor-0"),
            ready_circuit("tor-1"),
        ]);

        for _ in 0..5 {
            let circuit = swarm.next_instance().await.unwrap();
            assert_eq!(circuit.name(), "tor-1");
        }
    }

    #[tokio::test]
    async fn fully_terminated_swarm_is_exhausted() {
        let swarm = Swarm::from_circuits(vec![terminated_circuit("tor-0"), terminated_circuit("tor-1")]);
        let result = swarm.next_instance().await;
        assert!(matches!(result, Err(SwarmError::SwarmExhausted)));
        assert!(swarm.is_exhausted());
    }

    #[tokio::test]
    async fn dispatch_retries_past_a_none_result() {
        let swarm = Swarm::from_circuits(vec![ready_circuit("tor-0")]);
        let dialer = swarm.dispatch().await.unwrap();
        dialer.close().await;
    }
}


===== tests/seed_scenarios.rs =====
//! Integration tests for the seed scenarios, run against a fake stand-in
//! for the `tor` binary: a small shell script that echoes configurable
//! stdout lines instead of actually bootstrapping a circuit, so the full
//! supervisor state machine runs without a real Tor install.

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use circuit_swarm::circuit::{Circuit, CircuitState};
use circuit_swarm::config::CircuitConfig;
use circuit_swarm::error::SwarmError;
use circuit_swarm::swarm::Swarm;

/// Writes an executable shell script standing in for `tor`. The script
/// echoes `line` to stdout after `delay_ms`, then sleeps indefinitely so
/// the supervisor has a live child to manage and kill on restart/stop.
fn fake_circuit_binary(dir: &tempfile::TempDir, name: &str, line: &str, delay_ms: u64) -> PathBuf {
    let path = dir.path().join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(
        file,
        "#!/bin/sh\nsleep {}\necho '{}'\nwhile true; do sleep 3600; done\n",
        delay_ms as f64 / 1000.0,
        line
    )
    .unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

fn immediate_ready_binary(dir: &tempfile::TempDir) -> PathBuf {
    fake_circuit_binary(dir, "fake-tor-ready", "Bootstrapped 100%: Done.", 0)
}

fn bind_failure_binary(dir: &tempfile::TempDir, port: u16) -> PathBuf {
    fake_circuit_binary(
        dir,
        "fake-tor-bind-failure",
        &format!("Could not bind to 127.0.0.1:{port}"),
        0,
    )
}

/// S1 — happy path: a circuit configured with an immediately-ready fake
/// binary reaches `Ready` and can hand out dialers.
#[tokio::test]
async fn s1_happy_path_reaches_ready() {
    let scratch = tempfile::tempdir().unwrap();
    let binary = immediate_ready_binary(&scratch);

    let circuit = Arc::new(
        Circuit::new("tor-0", 19050, 18118, scratch.path().to_path_buf(), CircuitConfig::default())
            .with_binary(binary),
    );

    let supervisor = tokio::spawn(circuit.clone().run());

    let reached_ready = wait_for_state(&circuit, CircuitState::Ready, Duration::from_secs(5)).await;
    assert!(reached_ready, "circuit should reach Ready via the stdout substring trigger");

    circuit.request_stop();
    let _ = tokio::time::timeout(Duration::from_secs(5), supervisor).await;
}

/// S4 — bind failure: a circuit whose fake child reports a bind failure
/// transitions to `Terminated` and the swarm's round robin skips it.
#[tokio::test]
async fn s4_bind_failure_terminates_and_is_skipped() {
    let scratch = tempfile::tempdir().unwrap();
    let failing_binary = bind_failure_binary(&scratch, 19050);
    let healthy_binary = immediate_ready_binary(&scratch);

    let failing = Arc::new(
        Circuit::new("tor-0", 19050, 18118, scratch.path().to_path_buf(), CircuitConfig::default())
            .with_binary(failing_binary),
    );
    let healthy = Arc::new(
        Circuit::new("tor-1", 19051, 18119, scratch.path().to_path_buf(), CircuitConfig::default())
            .with_binary(healthy_binary),
    );

    let failing_supervisor = tokio::spawn(failing.clone().run());
    let healthy_supervisor = tokio::spawn(healthy.clone().run());

    assert!(wait_for_state(&failing, CircuitState::Terminated, Duration::from_secs(5)).await);
    assert!(wait_for_state(&healthy, CircuitState::Ready, Duration::from_secs(5)).await);

    let swarm = Swarm::from_circuits(vec![failing.clone(), healthy.clone()]);
    for _ in 0..5 {
        let circuit = swarm.next_instance().await.unwrap();
        assert_eq!(circuit.name(), "tor-1");
    }

    healthy.request_stop();
    let _ = tokio::time::timeout(Duration::from_secs(5), failing_supervisor).await;
    let _ = tokio::time::timeout(Duration::from_secs(5), healthy_supervisor).await;
}

/// S5 — swarm exhaustion: once every circuit has terminated,
/// `next_instance` surfaces `SwarmExhausted` rather than looping forever.
#[tokio::test]
async fn s5_swarm_exhaustion_is_fatal() {
    let scratch = tempfile::tempdir().unwrap();
    let failing_binary_a = bind_failure_binary(&scratch, 19050);
    let failing_binary_b = bind_failure_binary(&scratch, 19051);

    let a = Arc::new(
        Circuit::new("tor-0", 19050, 18118, scratch.path().to_path_buf(), CircuitConfig::default())
            .with_binary(failing_binary_a),
    );
    let b = Arc::new(
        Circuit::new("tor-1", 19051, 18119, scratch.path().to_path_buf(), CircuitConfig::default())
            .with_binary(failing_binary_b),
    );

    let sup_a = tokio::spawn(a.clone().run());
    let sup_b = tokio::spawn(b.clone().run());

    assert!(wait_for_state(&a, CircuitState::Terminated, Duration::from_secs(5)).await);
    assert!(wait_for_state(&b, CircuitState::Terminated, Duration::from_secs(5)).await);

    let swarm = Swarm::from_circuits(vec![a, b]);
    let result = swarm.next_instance().await;
    assert!(matches!(result, Err(SwarmError::SwarmExhausted)));
    assert!(swarm.is_exhausted());

    let _ = tokio::time::timeout(Duration::from_secs(5), sup_a).await;
    let _ = tokio::time::timeout(Duration::from_secs(5), sup_b).await;
}

/// S2 — restart on error threshold: forcing more than `errors_max` dialer
/// errors on a ready circuit should drain it back through `Booting` to
/// `Ready` again, clearing its stats window on the way.
#[tokio::test]
async fn s2_restart_on_error_threshold() {
    let scratch = tempfile::tempdir().unwrap();
    let binary = immediate_ready_binary(&scratch);

    let config = CircuitConfig::default()
        .with_errors_max(3)
        .with_grace_time(Duration::from_secs(0))
        .with_conn_time_avg_max(f64::MAX);

    let circuit = Arc::new(
        Circuit::new("tor-0", 19060, 18128, scratch.path().to_path_buf(), config).with_binary(binary),
    );

    let supervisor = tokio::spawn(circuit.clone().run());
    assert!(wait_for_state(&circuit, CircuitState::Ready, Duration::from_secs(5)).await);

    // Nothing is listening on the circuit's SOCKS port (the fake binary
    // never binds it), so every connect attempt fails with a real
    // connection-refused error, driving errors_total past errors_max.
    let target: std::net::SocketAddr = "127.0.0.1:1".parse().unwrap();
    for _ in 0..4 {
        let mut dialer = circuit.create_socket(true).await.unwrap().unwrap();
        let _ = dialer.connect(target).await;
    }

    assert!(
        wait_for_state(&circuit, CircuitState::Draining, Duration::from_secs(5)).await,
        "error threshold should push the circuit into Draining"
    );
    assert!(
        wait_for_state(&circuit, CircuitState::Ready, Duration::from_secs(5)).await,
        "circuit should come back up through Booting and reach Ready again"
    );
    assert_eq!(circuit.stats_summary().errors_total, 0, "restart should clear the stats window");

    circuit.request_stop();
    let _ = tokio::time::timeout(Duration::from_secs(5), supervisor).await;
}

/// S3 — drain timeout: a dialer that never reports back (ref_count stuck
/// above 0) should not block a restart forever; past `drain_timeout` the
/// circuit force-resets `ref_count` and completes the restart anyway.
#[tokio::test]
async fn s3_drain_timeout_forces_restart() {
    let scratch = tempfile::tempdir().unwrap();
    let binary = immediate_ready_binary(&scratch);

    let config = CircuitConfig::default()
        .with_sockets_max(Some(1))
        .with_grace_time(Duration::from_secs(0))
        .with_errors_max(u64::MAX)
        .with_conn_time_avg_max(f64::MAX)
        .with_drain_timeout(Duration::from_millis(200));

    let circuit = Arc::new(
        Circuit::new("tor-0", 19061, 18129, scratch.path().to_path_buf(), config).with_binary(binary),
    );

    let supervisor = tokio::spawn(circuit.clone().run());
    assert!(wait_for_state(&circuit, CircuitState::Ready, Duration::from_secs(5)).await);

    // Hold one dialer open without ever closing it, so ref_count never
    // drops back to 0 on its own — the drain has to time out and force it.
    // sockets_max=1 is what pushes the circuit into Draining in the first
    // place; the point under test is what happens to the stuck ref_count
    // once it gets there.
    let stuck_dialer = circuit.create_socket(true).await.unwrap().unwrap();
    assert_eq!(circuit.ref_count(), 1);

    assert!(
        wait_for_state(&circuit, CircuitState::Draining, Duration::from_secs(5)).await,
        "hitting sockets_max with an outstanding socket should trigger a restart"
    );
    assert!(
        wait_for_state(&circuit, CircuitState::Ready, Duration::from_secs(5)).await,
        "the drain should force ref_count to 0 after drain_timeout and complete the restart"
    );
    assert_eq!(circuit.ref_count(), 0);

    drop(stuck_dialer);
    circuit.request_stop();
    let _ = tokio::time::timeout(Duration::from_secs(5), supervisor).await;
}

/// S6 — max-use cap: once `sockets_max` dialers have been handed out, the
/// circuit drains and restarts, resetting `socket_count` to 0.
#[tokio::test]
async fn s6_max_use_cap_triggers_restart() {
    let scratch = tempfile::tempdir().unwrap();
    let binary = immediate_ready_binary(&scratch);

    let config = CircuitConfig::default()
        .with_sockets_max(Some(3))
        .with_grace_time(Duration::from_secs(0))
        .with_errors_max(u64::MAX)
        .with_conn_time_avg_max(f64::MAX);

    let circuit = Arc::new(
        Circuit::new("tor-0", 19062, 18130, scratch.path().to_path_buf(), config).with_binary(binary),
    );

    let supervisor = tokio::spawn(circuit.clone().run());
    assert!(wait_for_state(&circuit, CircuitState::Ready, Duration::from_secs(5)).await);

    for _ in 0..3 {
        let dialer = circuit.create_socket(true).await.unwrap().unwrap();
        dialer.close().await;
    }
    assert_eq!(circuit.socket_count(), 3);

    assert!(
        wait_for_state(&circuit, CircuitState::Draining, Duration::from_secs(5)).await,
        "hitting sockets_max should trigger a restart"
    );
    assert!(wait_for_state(&circuit, CircuitState::Ready, Duration::from_secs(5)).await);
    assert_eq!(circuit.socket_count(), 0, "restart should reset socket_count");

    circuit.request_stop();
    let _ = tokio::time::timeout(Duration::from_secs(5), supervisor).await;
}

async fn wait_for_state(circuit: &Arc<Circuit>, target: CircuitState, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if circuit.state() == target {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

