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
