//! `InstrumentedDialer` — a SOCKS4 TCP client that times its own lifecycle
//! and reports exactly one stats sample back to its owning circuit.
//!
//! Grounded on `proctor/socket.py`'s `InstrumentedSocket`, generalized to
//! the exactly-once contract this system's spec spells out explicitly (the
//! retrieved `socket.py` snapshot calls back on every timed operation; the
//! written contract is newer and is what's implemented here).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks4Stream;
use tokio_socks::IntoTargetAddr;

use crate::error::SwarmError;

/// One-shot stats delivery: `(total_elapsed_seconds, error_count)`.
///
/// Cloned cheaply (an `Arc`) so a fresh dialer can be handed a sink closing
/// over the owning circuit's accounting state without the dialer holding a
/// reference back to the circuit itself (see the cyclic-ownership note).
pub type StatsSink = Arc<dyn Fn(f64, u32) + Send + Sync>;

/// A SOCKS4-over-TCP client bound to one circuit's local endpoint.
pub struct InstrumentedDialer {
    socks_addr: SocketAddr,
    stream: Option<Socks4Stream<TcpStream>>,
    callback: StatsSink,
    fired: AtomicBool,
    error_count: u32,
    total_elapsed: f64,
}

impl InstrumentedDialer {
    pub fn new(socks_addr: SocketAddr, callback: StatsSink) -> Self {
        Self {
            socks_addr,
            stream: None,
            callback,
            fired: AtomicBool::new(false),
            error_count: 0,
            total_elapsed: 0.0,
        }
    }

    fn fire(&self) {
        if !self.fired.swap(true, Ordering::SeqCst) {
            (self.callback)(self.total_elapsed, self.error_count);
        }
    }

    fn connected_stream(&mut self) -> Result<&mut Socks4Stream<TcpStream>, SwarmError> {
        self.stream.as_mut().ok_or_else(|| {
            SwarmError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "dialer has no connected stream",
            ))
        })
    }

    /// Perform the SOCKS4 connect handshake to `target`, with remote DNS
    /// resolution (the target is sent to the proxy as a hostname, not a
    /// pre-resolved address). Times the full call; on failure, increments
    /// the error count and fires the stats callback before re-raising.
    pub async fn connect<'a>(&mut self, target: impl IntoTargetAddr<'a>) -> Result<(), SwarmError> {
        let start = Instant::now();
        let result = Socks4Stream::connect(self.socks_addr, target).await;
        self.total_elapsed += start.elapsed().as_secs_f64();

        match result {
            Ok(stream) => {
                self.stream = Some(stream);
                Ok(())
            }
            Err(e) => {
                self.error_count += 1;
                self.fire();
                Err(SwarmError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    e,
                )))
            }
        }
    }

    /// Read from the connected stream. On error only: increment the error
    /// count and fire the callback before re-raising; a normal read does
    /// not deliver stats.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, SwarmError> {
        let stream = self.connected_stream()?;
        match stream.read(buf).await {
            Ok(n) => Ok(n),
            Err(e) => {
                self.error_count += 1;
                self.fire();
                Err(e.into())
            }
        }
    }

    /// Write to the connected stream, with the same error-only callback
    /// semantics as [`Self::read`].
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize, SwarmError> {
        let stream = self.connected_stream()?;
        match stream.write(buf).await {
            Ok(n) => Ok(n),
            Err(e) => {
                self.error_count += 1;
                self.fire();
                Err(e.into())
            }
        }
    }

    /// Shut down the write half. Times the call and fires the stats
    /// callback on return (success or failure — whichever happens first
    /// wins, since delivery is idempotent).
    pub async fn shutdown(&mut self) -> Result<(), SwarmError> {
        let start = Instant::now();
        let result = match self.stream.as_mut() {
            Some(stream) => stream.shutdown().await,
            None => Ok(()),
        };
        self.total_elapsed += start.elapsed().as_secs_f64();
        if result.is_err() {
            self.error_count += 1;
        }
        self.fire();
        result.map_err(SwarmError::from)
    }

    /// Consume the dialer, reporting final stats if they haven't fired yet.
    /// Mirrors the source's `close()`, which delivers the callback even if
    /// an earlier operation already raised.
    pub async fn close(mut self) {
        let start = Instant::now();
        self.stream = None;
        self.total_elapsed += start.elapsed().as_secs_f64();
        self.fire();
    }
}

impl Drop for InstrumentedDialer {
    fn drop(&mut self) {
        // Guards ref_count correctness if a caller drops the dialer without
        // calling close()/shutdown() explicitly (panics, early returns).
        self.fire();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recording_sink() -> (StatsSink, Arc<Mutex<Vec<(f64, u32)>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let calls_clone = calls.clone();
        let sink: StatsSink = Arc::new(move |elapsed, errors| {
            calls_clone.lock().unwrap().push((elapsed, errors));
        });
        (sink, calls)
    }

    #[tokio::test]
    async fn close_fires_callback_exactly_once() {
        let (sink, calls) = recording_sink();
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let dialer = InstrumentedDialer::new(addr, sink);
        dialer.close().await;
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn drop_without_close_still_fires_once() {
        let (sink, calls) = recording_sink();
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        {
            let _dialer = InstrumentedDialer::new(addr, sink);
        }
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn shutdown_then_close_only_fires_once() {
        let (sink, calls) = recording_sink();
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let mut dialer = InstrumentedDialer::new(addr, sink);
        let _ = dialer.shutdown().await;
        dialer.close().await;
        assert_eq!(calls.lock().unwrap().len(), 1);
    }
}
