//! SOCKS5 proxy layer

use crate::{recv_exact, Transport, TransportError};
use async_trait::async_trait;
use tracing::debug;
use zbtunnel_config::HopConfig;

const VERSION: u8 = 0x05;
const METHOD_NONE: u8 = 0x00;
const METHOD_USERPASS: u8 = 0x02;
const METHOD_UNACCEPTABLE: u8 = 0xff;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Largest possible CONNECT reply: header plus a 255-byte domain bound
/// address plus the port.
const REPLY_MAX: usize = 4 + 1 + 255 + 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    Standby,
    Connected,
}

/// A layer speaking the client side of SOCKS5 (RFC 1928), with optional
/// username/password authentication (RFC 1929). After the CONNECT reply the
/// layer is a transparent pass-through.
pub struct Socks5Transport {
    parent: Box<dyn Transport>,
    username: String,
    password: String,
    state: State,
}

impl Socks5Transport {
    pub fn new(parent: Box<dyn Transport>, hop: &HopConfig) -> Self {
        Self {
            parent,
            username: hop.get_or("username", "").to_owned(),
            password: hop.get_or("password", "").to_owned(),
            state: State::Init,
        }
    }

    async fn authenticate(&mut self) -> Result<(), TransportError> {
        let mut request = Vec::with_capacity(3 + self.username.len() + self.password.len());
        request.push(0x01);
        request.push(self.username.len() as u8);
        request.extend_from_slice(self.username.as_bytes());
        request.push(self.password.len() as u8);
        request.extend_from_slice(self.password.as_bytes());
        self.parent.send(&mut request).await?;

        let mut reply = [0u8; 2];
        recv_exact(self.parent.as_mut(), &mut reply).await?;
        if reply[1] != 0x00 {
            return Err(TransportError::PermissionDenied(
                "authentication failed".to_owned(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for Socks5Transport {
    async fn init(&mut self) -> Result<(), TransportError> {
        let mut greeting = if self.username.is_empty() {
            vec![VERSION, 1, METHOD_NONE]
        } else {
            vec![VERSION, 2, METHOD_NONE, METHOD_USERPASS]
        };
        self.parent.send(&mut greeting).await?;

        let mut reply = [0u8; 2];
        recv_exact(self.parent.as_mut(), &mut reply).await?;

        if reply[0] != VERSION {
            return Err(TransportError::ProtocolNotSupported(format!(
                "server requires version {}",
                reply[0]
            )));
        }
        match reply[1] {
            METHOD_UNACCEPTABLE => Err(TransportError::ProtocolNotSupported(
                "no acceptable authentication method".to_owned(),
            )),
            METHOD_USERPASS => {
                debug!("server asked for username/password auth");
                self.authenticate().await?;
                self.state = State::Standby;
                Ok(())
            }
            _ => {
                self.state = State::Standby;
                Ok(())
            }
        }
    }

    async fn connect(&mut self, host: &str, port: u16) -> Result<(), TransportError> {
        if host.is_empty() || host.len() > u8::MAX as usize {
            return Err(TransportError::BadAddress);
        }
        if self.state != State::Standby {
            return Err(TransportError::OperationInProgress);
        }

        let mut request = Vec::with_capacity(host.len() + 7);
        request.extend_from_slice(&[VERSION, CMD_CONNECT, 0x00, ATYP_DOMAIN]);
        request.push(host.len() as u8);
        request.extend_from_slice(host.as_bytes());
        request.extend_from_slice(&port.to_be_bytes());

        debug!("requesting connect to {}:{}", host, port);
        self.parent.send(&mut request).await?;

        // Minimum reply prefix: VER REP RSV ATYP plus two bytes of the
        // bound address. The rest is sized by the address type so no bytes
        // beyond the reply are ever consumed.
        let mut reply = [0u8; REPLY_MAX];
        recv_exact(self.parent.as_mut(), &mut reply[..6]).await?;

        if reply[0] != VERSION {
            return Err(TransportError::ProtocolNotSupported(format!(
                "server requires version {}",
                reply[0]
            )));
        }
        if reply[1] != 0x00 || reply[2] != 0x00 {
            return Err(TransportError::PermissionDenied(format!(
                "connect request rejected (code {})",
                reply[1]
            )));
        }

        let total = match reply[3] {
            ATYP_IPV4 => 4 + 4 + 2,
            ATYP_IPV6 => 4 + 16 + 2,
            ATYP_DOMAIN => 4 + 1 + reply[4] as usize + 2,
            other => {
                return Err(TransportError::ProtocolNotSupported(format!(
                    "unknown address type {other} in reply"
                )))
            }
        };
        if total > 6 {
            recv_exact(self.parent.as_mut(), &mut reply[6..total]).await?;
        }

        self.state = State::Connected;
        debug!("connected through socks5 proxy");
        Ok(())
    }

    async fn send(&mut self, data: &mut [u8]) -> Result<(), TransportError> {
        self.parent.send(data).await
    }

    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        self.parent.recv(buf).await
    }

    async fn close(&mut self) {
        self.parent.close().await;
    }

    fn is_open(&self) -> bool {
        self.parent.is_open()
    }
}
