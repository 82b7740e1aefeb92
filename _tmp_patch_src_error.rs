//! Error types for the circuit-swarm core.
//!
//! Each variant maps to one of the error kinds a caller needs to branch on:
//! permanent per-circuit failures, transient "try another circuit" signals,
//! and the fatal swarm-exhausted condition.

use std::io;
use thiserror::Error;

/// Errors surfaced by a [`crate::circuit::Circuit`] or [`crate::swarm::Swarm`].
#[derive(Debug, Error)]
pub enum SwarmError {
    /// A dialer was requested from a circuit that is not `Ready` and the
    /// caller did not opt into suppressing the error.
    #[error("circuit {name} is not connected")]
    NotConnected { name: String },

    /// The circuit is mid-restart; transient, callers should retry against
    /// another circuit.
    #[error("circuit {name} has no dialer available right now")]
    DialerUnavailable { name: String },

    /// The circuit's child process could not bind one of its ports; the
    /// circuit is permanently terminated.
    #[error("circuit {name} failed to bind port {port}")]
    BindFailure { name: String, port: u16 },

    /// More than `resurrections_max` unexpected child exits; the circuit is
    /// permanently terminated.
    #[error("circuit {name} exhausted its resurrection budget ({resurrections} restarts)")]
    ResurrectionExhausted { name: String, resurrections: u32 },

    /// No non-terminated circuits remain in the swarm.
    #[error("swarm exhausted: no non-terminated circuits remain")]
    SwarmExhausted,

    /// Soft failure: a restart drain timed out and `ref_count` was
    /// force-reset. Not fatal, logged and recorded as a metric.
    #[error("circuit {name} drain timed out with {stuck} dialer(s) outstanding")]
    RefCountStuck { name: String, stuck: i64 },

    /// Process spawn or I/O failure underneath a circuit's child.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl SwarmError {
    /// Machine-readable error code, used as a metrics label and in logs.
    pub fn code(&self) -> &'static str {
        match self {
            SwarmError::NotConnected { .. } => "NOT_CONNECTED",
            SwarmError::DialerUnavailable { .. } => "DIALER_UNAVAILABLE",
            SwarmError::BindFailure { .. } => "BIND_FAILURE",
            SwarmError::ResurrectionExhausted { .. } => "RESURRECTION_EXHAUSTED",
            SwarmError::SwarmExhausted => "SWARM_EXHAUSTED",
            SwarmError::RefCountStuck { .. } => "REF_COUNT_STUCK",
            SwarmError::Io(_) => "IO_ERROR",
        }
    }

    /// Whether a dispatcher should retry against a different circuit.
    pub fn is_transient(&self) -> bool {
        matches!(self, SwarmError::DialerUnavailable { .. })
    }
}

pub type SwarmResult<T> = Result<T, SwarmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(SwarmError::SwarmExhausted.code(), "SWARM_EXHAUSTED");
        assert_eq!(
            SwarmError::BindFailure { name: "tor-0".into(), port: 19050 }.code(),
            "BIND_FAILURE"
        );
    }

    #[test]
    fn only_dialer_unavailable_is_transient() {
        assert!(SwarmError::DialerUnavailable { name: "tor-0".into() }.is_transient());
        assert!(!SwarmError::SwarmExhausted.is_transient());
        assert!(!SwarmError::NotConnected { name: "tor-0".into() }.is_transient());
    }
}


