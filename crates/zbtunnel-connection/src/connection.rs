//! One relayed connection and its outbound chain

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zbtunnel_codec::CoderPool;
use zbtunnel_config::{ChainConfig, ConfigError, TransportKind};
use zbtunnel_transport::{stack_layer, SocketTransport, Transport, TransportError};

/// Relay staging buffer size, one buffer per direction.
pub const BUFFER_SIZE: usize = 8192;

/// Connection errors
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Init,
    Connecting,
    Connected,
    Bad,
}

/// Immutable tunnel-side context captured at connection creation: the chain
/// snapshot, the shared codec pool, and the once-resolved first-hop
/// endpoint.
pub struct ChainContext {
    pub owner: Arc<str>,
    pub chain: ChainConfig,
    pub coders: Arc<CoderPool>,
    pub endpoint_cache: OnceLock<SocketAddr>,
}

impl ChainContext {
    pub fn new(owner: &str, chain: ChainConfig, coders: Arc<CoderPool>) -> Arc<Self> {
        Arc::new(Self {
            owner: Arc::from(owner),
            chain,
            coders,
            endpoint_cache: OnceLock::new(),
        })
    }
}

pub struct Connection {
    id: u64,
    context: Arc<ChainContext>,
    state: ConnectionState,
    current: usize,
    out: Box<dyn Transport>,
}

impl Connection {
    pub(crate) fn new(id: u64, context: Arc<ChainContext>) -> Self {
        Self {
            id,
            context,
            state: ConnectionState::Init,
            current: 0,
            out: Box::new(SocketTransport::new()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.out.is_open()
    }

    /// `owner#id.cursor`, the form every log line uses.
    pub fn label(&self) -> String {
        format!("{}#{}.{}", self.context.owner, self.id, self.current)
    }

    /// Build the outbound chain to its last hop.
    ///
    /// Connects the bottom socket (to the cached endpoint when one exists),
    /// then walks the chain: stack the hop's layer, run its handshake, and
    /// dial the next hop through the stack so far.
    pub async fn establish(&mut self) -> Result<(), ConnectionError> {
        if self.state == ConnectionState::Connected {
            return Ok(());
        }

        self.state = ConnectionState::Connecting;
        match self.build_chain().await {
            Ok(()) => {
                self.state = ConnectionState::Connected;
                info!("{} connected", self.label());
                Ok(())
            }
            Err(e) => {
                warn!("{} connect failed: {}", self.label(), e);
                self.state = ConnectionState::Bad;
                self.out.close().await;
                Err(e)
            }
        }
    }

    async fn build_chain(&mut self) -> Result<(), ConnectionError> {
        let context = Arc::clone(&self.context);
        let chain = &context.chain;

        if let Some(addr) = context.endpoint_cache.get() {
            debug!("{} connecting to cached endpoint {}", self.label(), addr);
            self.out.connect_addr(*addr).await?;
        } else {
            let first = chain.hop(0).ok_or(ConfigError::MissingField {
                hop: 0,
                key: "host",
            })?;
            let (host, port) = first.host_port()?;
            debug!("{} connecting to {}:{}", self.label(), host, port);
            self.out.connect(&host, port).await?;
            if let Some(addr) = self.out.peer_addr() {
                let _ = context.endpoint_cache.set(addr);
            }
        }

        for index in 0..chain.len() {
            self.current = index;
            let hop = chain.hop(index).ok_or(ConfigError::MissingField {
                hop: index,
                key: "transport",
            })?;

            let kind = hop.transport()?;
            if kind != TransportKind::Raw {
                let parent =
                    std::mem::replace(&mut self.out, Box::new(SocketTransport::new()));
                self.out = stack_layer(kind, parent, hop, &context.coders)?;
                self.out.init().await?;
            }

            if let Some(next) = chain.hop(index + 1) {
                let (host, port) = next.host_port()?;
                debug!("{} connecting to {}:{}", self.label(), host, port);
                self.out.connect(&host, port).await?;
            }
        }
        self.current = chain.len();
        Ok(())
    }

    /// Shuttle bytes between `inbound` and the outbound chain until one
    /// side finishes or the token fires.
    ///
    /// Returns whether the outbound chain is a recycling candidate: true
    /// only when the inbound side ended (EOF or read error) while the chain
    /// stayed healthy.
    pub async fn relay(
        &mut self,
        mut inbound: Box<dyn Transport>,
        cancel: &CancellationToken,
    ) -> bool {
        debug!("{} starting to transfer", self.label());
        let mut in_buf = vec![0u8; BUFFER_SIZE];
        let mut out_buf = vec![0u8; BUFFER_SIZE];

        let recycle_hint = loop {
            tokio::select! {
                _ = cancel.cancelled() => break false,

                read = inbound.recv(&mut in_buf) => match read {
                    Ok(0) => {
                        debug!("{} inbound closed", self.label());
                        break true;
                    }
                    Ok(n) => {
                        if let Err(e) = self.out.send(&mut in_buf[..n]).await {
                            debug!("{} outbound write interrupted: {}", self.label(), e);
                            break false;
                        }
                    }
                    Err(e) => {
                        debug!("{} inbound read interrupted: {}", self.label(), e);
                        break true;
                    }
                },

                read = self.out.recv(&mut out_buf) => match read {
                    Ok(0) => {
                        debug!("{} outbound closed", self.label());
                        break false;
                    }
                    Ok(n) => {
                        if let Err(e) = inbound.send(&mut out_buf[..n]).await {
                            debug!("{} inbound write interrupted: {}", self.label(), e);
                            break false;
                        }
                    }
                    Err(e) => {
                        debug!("{} outbound read interrupted: {}", self.label(), e);
                        break false;
                    }
                },
            }
        };

        inbound.close().await;
        if !recycle_hint {
            self.state = ConnectionState::Bad;
        }
        recycle_hint
    }

    /// Tear down the outbound chain. Idempotent.
    pub async fn close(&mut self) {
        self.out.close().await;
    }

    #[cfg(test)]
    pub(crate) fn force_state(&mut self, state: ConnectionState) {
        self.state = state;
    }
}
