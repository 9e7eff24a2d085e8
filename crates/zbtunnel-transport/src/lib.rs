//! Layered transport abstraction
//!
//! A transport is a uniform async byte stream. The bottom of a stack is a
//! real socket (or the process stdio pair). Protocol layers (shadow, HTTP
//! CONNECT, HTTPS CONNECT, SOCKS5) own their parent transport and delegate
//! I/O downward after any local transformation, so hops compose in any
//! order. Building a chain means connecting the bottom socket and then
//! stacking one layer per hop, running each layer's handshake in sequence.

pub mod http;
pub mod https;
pub mod shadow;
pub mod socket;
pub mod socks5;
pub mod stdio;

pub use http::HttpConnectTransport;
pub use https::HttpsConnectTransport;
pub use shadow::ShadowTransport;
pub use socket::SocketTransport;
pub use socks5::Socks5Transport;
pub use stdio::StdioTransport;

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use zbtunnel_codec::CoderPool;
use zbtunnel_config::{ConfigError, HopConfig, TransportKind};

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed")]
    Closed,

    #[error("bad host:port")]
    BadAddress,

    #[error("no usable endpoint for {0}")]
    ResolverFailed(String),

    #[error("operation not supported by this transport")]
    UnsupportedOperation,

    #[error("proxy refused: {0}")]
    PermissionDenied(String),

    #[error("protocol not supported: {0}")]
    ProtocolNotSupported(String),

    #[error("receive buffer exhausted before the proxy reply completed")]
    NoBufferSpace,

    #[error("connect attempted before the handshake finished")]
    OperationInProgress,

    #[error("TLS error: {0}")]
    Tls(String),

    #[error(transparent)]
    Coder(#[from] zbtunnel_codec::CoderError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// A uniform async byte stream, stackable as layers.
///
/// `send` may transform bytes in place before forwarding to the parent;
/// `recv` delegates to the parent and then transforms what arrived. `close`
/// cascades down the stack and is idempotent.
#[async_trait]
pub trait Transport: Send {
    /// Establish this layer on top of its parent (or dial the socket, for a
    /// bottom transport), targeting `host:port`.
    async fn connect(&mut self, host: &str, port: u16) -> Result<(), TransportError>;

    /// Like `connect`, but with an already-resolved endpoint so no name
    /// resolution happens.
    async fn connect_addr(&mut self, addr: SocketAddr) -> Result<(), TransportError> {
        self.connect(&addr.ip().to_string(), addr.port()).await
    }

    /// Post-connect handshake for layers that need one (TLS, SOCKS5
    /// greeting). A no-op by default.
    async fn init(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn send(&mut self, data: &mut [u8]) -> Result<(), TransportError>;

    /// Read some bytes; `Ok(0)` means the peer closed cleanly.
    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    async fn close(&mut self);

    fn is_open(&self) -> bool;

    /// The resolved remote endpoint, for bottom transports that know one.
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Stack the layer for `kind` on top of `parent`.
///
/// Raw hops stack nothing: the bytes of the next hop ride the existing top
/// of the stack untouched.
pub fn stack_layer(
    kind: TransportKind,
    parent: Box<dyn Transport>,
    hop: &HopConfig,
    coders: &Arc<CoderPool>,
) -> Result<Box<dyn Transport>, TransportError> {
    Ok(match kind {
        TransportKind::Raw => parent,
        TransportKind::Shadow => Box::new(ShadowTransport::new(parent, hop, coders)?),
        TransportKind::Http => Box::new(HttpConnectTransport::new(parent, hop)),
        TransportKind::Https => Box::new(HttpsConnectTransport::new(parent, hop)?),
        TransportKind::Socks5 => Box::new(Socks5Transport::new(parent, hop)),
    })
}

/// Read exactly `buf.len()` bytes from `transport`.
pub(crate) async fn recv_exact<T: Transport + ?Sized>(
    transport: &mut T,
    buf: &mut [u8],
) -> Result<(), TransportError> {
    let mut pos = 0;
    while pos < buf.len() {
        let n = transport.recv(&mut buf[pos..]).await?;
        if n == 0 {
            return Err(TransportError::Closed);
        }
        pos += n;
    }
    Ok(())
}
