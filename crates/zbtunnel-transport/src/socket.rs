//! TCP socket transport, the bottom of most stacks

use crate::{Transport, TransportError};
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tracing::debug;

/// A transport backed by a TCP socket.
///
/// Created empty for the outbound side of a connection (dialed later via
/// `connect`), or wrapped around an accepted stream for the inbound side.
pub struct SocketTransport {
    stream: Option<TcpStream>,
}

impl SocketTransport {
    pub fn new() -> Self {
        Self { stream: None }
    }

    pub fn from_stream(stream: TcpStream) -> Self {
        Self {
            stream: Some(stream),
        }
    }

    fn stream_mut(&mut self) -> Result<&mut TcpStream, TransportError> {
        self.stream.as_mut().ok_or(TransportError::Closed)
    }
}

impl Default for SocketTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for SocketTransport {
    async fn connect(&mut self, host: &str, port: u16) -> Result<(), TransportError> {
        if host.is_empty() {
            return Err(TransportError::BadAddress);
        }

        debug!("resolving {}:{}", host, port);
        let mut last_error = None;
        for addr in lookup_host((host, port)).await? {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    debug!("connected to {}", addr);
                    self.stream = Some(stream);
                    return Ok(());
                }
                Err(e) => last_error = Some(e),
            }
        }

        Err(match last_error {
            Some(e) => e.into(),
            None => TransportError::ResolverFailed(format!("{host}:{port}")),
        })
    }

    async fn connect_addr(&mut self, addr: SocketAddr) -> Result<(), TransportError> {
        self.stream = Some(TcpStream::connect(addr).await?);
        Ok(())
    }

    async fn send(&mut self, data: &mut [u8]) -> Result<(), TransportError> {
        self.stream_mut()?.write_all(data).await?;
        Ok(())
    }

    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        Ok(self.stream_mut()?.read(buf).await?)
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.as_ref().and_then(|s| s.peer_addr().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn empty_host_is_a_bad_address() {
        let mut transport = SocketTransport::new();
        assert!(matches!(
            transport.connect("", 80).await,
            Err(TransportError::BadAddress)
        ));
    }

    #[tokio::test]
    async fn connects_and_round_trips() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut peer, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            peer.read_exact(&mut buf).await.unwrap();
            peer.write_all(&buf).await.unwrap();
        });

        let mut transport = SocketTransport::new();
        transport
            .connect("127.0.0.1", addr.port())
            .await
            .unwrap();
        assert!(transport.is_open());
        assert_eq!(transport.peer_addr(), Some(addr));

        transport.send(&mut *b"ping".to_vec()).await.unwrap();
        let mut buf = [0u8; 4];
        crate::recv_exact(&mut transport, &mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        transport.close().await;
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn send_on_unconnected_socket_fails_closed() {
        let mut transport = SocketTransport::new();
        assert!(matches!(
            transport.send(&mut [1, 2, 3]).await,
            Err(TransportError::Closed)
        ));
    }
}
