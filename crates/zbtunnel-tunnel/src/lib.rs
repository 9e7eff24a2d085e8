//! Tunnels: one local endpoint, one hop chain, one reactor thread
//!
//! A socket tunnel binds a local acceptor and feeds accepted connections to
//! its pool; an io tunnel bridges the process stdio pair through a single
//! pooled connection. Either way the tunnel owns a dedicated thread running
//! a current-thread tokio runtime, so all of its pool and connection state
//! is only ever touched from that one reactor.

mod tunnel;

pub use tunnel::Tunnel;

use std::io;
use std::net::SocketAddr;
use thiserror::Error;
use zbtunnel_codec::CoderError;
use zbtunnel_config::ConfigError;

/// Tunnel startup errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Coder(#[from] CoderError),

    #[error("invalid local address: {0}")]
    BadLocalAddress(String),

    #[error("failed to bind {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}
