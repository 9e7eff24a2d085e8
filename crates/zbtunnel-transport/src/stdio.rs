//! Stdio bridge, the inbound side of an io tunnel
//!
//! Bridges process stdin/stdout into the transport contract so a single
//! connection can relay the terminal (or a pipe) through an ordinary
//! outbound chain. Tokio drives stdin from a helper thread, so a quiet
//! stdin never blocks the reactor.

use crate::{Transport, TransportError};
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, Stdin, Stdout};
use tracing::debug;

pub struct StdioTransport {
    stdin: Stdin,
    stdout: Stdout,
    open: bool,
}

impl StdioTransport {
    pub fn new() -> Self {
        Self {
            stdin: tokio::io::stdin(),
            stdout: tokio::io::stdout(),
            open: true,
        }
    }
}

impl Default for StdioTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn connect(&mut self, _host: &str, _port: u16) -> Result<(), TransportError> {
        Err(TransportError::UnsupportedOperation)
    }

    async fn send(&mut self, data: &mut [u8]) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::Closed);
        }
        self.stdout.write_all(data).await?;
        self.stdout.flush().await?;
        Ok(())
    }

    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if !self.open {
            return Err(TransportError::Closed);
        }
        Ok(self.stdin.read(buf).await?)
    }

    async fn close(&mut self) {
        if self.open {
            debug!("closing stdio bridge");
            self.open = false;
            let _ = self.stdout.flush().await;
        }
    }

    fn is_open(&self) -> bool {
        self.open
    }
}
