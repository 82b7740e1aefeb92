//! Circuit-swarm core: supervises a fixed set of anonymizing circuit
//! processes and dispatches proxied connections across them round-robin.
//!
//! The HTTP/CONNECT frontend, TLS MITM, and CLI entry point are thin
//! collaborators built on top of the modules here; see `dispatch` for the
//! boundary between this crate and that frontend.

pub mod circuit;
pub mod config;
pub mod dialer;
pub mod dispatch;
pub mod error;
pub mod metrics;
pub mod stats;
pub mod swarm;
