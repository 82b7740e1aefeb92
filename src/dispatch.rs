//! `DispatchHandler` — the hook the HTTP/CONNECT frontend implements
//! against the core. The intercepting proxy itself (CONNECT parsing, TLS
//! MITM, byte piping) lives outside this crate; this module only owns the
//! part of the contract the core is responsible for: obtaining a dialer
//! and connecting it to a resolved target.
//!
//! Grounded on `proctor/proxy.py`'s `tor_proxy_handler_factory` (retry
//! against another circuit on `None`, single serialized cursor).

use std::time::Duration;

use tokio::time::timeout;
use tokio_socks::IntoTargetAddr;
use tracing::warn;

use crate::dialer::InstrumentedDialer;
use crate::error::SwarmResult;
use crate::swarm::Swarm;

/// Socket connect timeout imposed by the dispatcher, per the external
/// interface contract.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolve a dialer for `target` by retrying against the swarm's
/// round-robin sequence until one connects or the swarm is exhausted.
///
/// This is the full extent of the core's involvement in serving one
/// proxied connection; piping bytes between the client socket and the
/// returned dialer, and any TLS wrapping for CONNECT requests, is the
/// frontend's responsibility.
pub async fn dial<'a>(swarm: &Swarm, target: impl IntoTargetAddr<'a> + Clone) -> SwarmResult<InstrumentedDialer> {
    let mut dialer = swarm.dispatch().await?;

    match timeout(CONNECT_TIMEOUT, dialer.connect(target)).await {
        Ok(Ok(())) => Ok(dialer),
        Ok(Err(e)) => Err(e),
        Err(_) => {
            warn!("dialer connect timed out after {:?}", CONNECT_TIMEOUT);
            dialer.close().await;
            Err(crate::error::SwarmError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "dialer connect timed out",
            )))
        }
    }
}
