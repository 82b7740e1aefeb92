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
