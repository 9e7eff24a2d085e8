//! Shadow transport: byte-wise substitution cipher over the parent

use crate::{Transport, TransportError};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;
use zbtunnel_codec::{CoderPool, TableCoder};
use zbtunnel_config::HopConfig;

/// Address-type marker for a domain-name request frame.
const ATYP_DOMAIN: u8 = 0x03;

/// A layer that substitutes every outbound byte through the codec's
/// encryption table and every inbound byte through its decryption table.
///
/// `connect` emits a single request frame naming the ultimate target and
/// reports success as soon as the frame is written; end-to-end reachability
/// surfaces as an error on the next read or write.
pub struct ShadowTransport {
    parent: Box<dyn Transport>,
    coder: Arc<TableCoder>,
}

impl ShadowTransport {
    pub fn new(
        parent: Box<dyn Transport>,
        hop: &HopConfig,
        coders: &Arc<CoderPool>,
    ) -> Result<Self, TransportError> {
        let method = hop.get_or("method", "");
        let key = hop.require("key")?;
        let coder = coders.get(method, key)?;
        Ok(Self { parent, coder })
    }
}

#[async_trait]
impl Transport for ShadowTransport {
    async fn connect(&mut self, host: &str, port: u16) -> Result<(), TransportError> {
        if host.is_empty() || host.len() > u8::MAX as usize {
            return Err(TransportError::BadAddress);
        }

        let mut frame = Vec::with_capacity(host.len() + 4);
        frame.push(ATYP_DOMAIN);
        frame.push(host.len() as u8);
        frame.extend_from_slice(host.as_bytes());
        frame.extend_from_slice(&port.to_be_bytes());

        debug!("sending request frame for {}:{}", host, port);
        self.send(&mut frame).await
    }

    async fn send(&mut self, data: &mut [u8]) -> Result<(), TransportError> {
        self.coder.encrypt(data);
        self.parent.send(data).await
    }

    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let n = self.parent.recv(buf).await?;
        self.coder.decrypt(&mut buf[..n]);
        Ok(n)
    }

    async fn close(&mut self) {
        self.parent.close().await;
    }

    fn is_open(&self) -> bool {
        self.parent.is_open()
    }
}
