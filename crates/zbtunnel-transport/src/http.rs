//! HTTP CONNECT proxy layer

use crate::{Transport, TransportError};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tracing::debug;
use zbtunnel_config::HopConfig;

const USER_AGENT: &str = concat!("zbtunnel/", env!("CARGO_PKG_VERSION"));

/// The proxy reply must terminate within this many bytes.
const REPLY_LIMIT: usize = 256;

/// Offset of the three-digit status code in `HTTP/1.1 NNN ...`.
const STATUS_OFFSET: usize = 9;

/// Offset of the reason phrase on the status line.
const REASON_OFFSET: usize = 13;

/// A layer speaking the `CONNECT` side of an HTTP proxy. Once the proxy
/// answers 2xx the layer is a transparent pass-through.
pub struct HttpConnectTransport {
    parent: Box<dyn Transport>,
    username: String,
    password: String,
}

impl HttpConnectTransport {
    pub fn new(parent: Box<dyn Transport>, hop: &HopConfig) -> Self {
        Self {
            parent,
            username: hop.get_or("username", "").to_owned(),
            password: hop.get_or("password", "").to_owned(),
        }
    }
}

#[async_trait]
impl Transport for HttpConnectTransport {
    async fn connect(&mut self, host: &str, port: u16) -> Result<(), TransportError> {
        if host.is_empty() {
            return Err(TransportError::BadAddress);
        }

        let mut request = connect_request(host, port, &self.username, &self.password);
        debug!("sending CONNECT {}:{}", host, port);
        self.parent.send(&mut request).await?;
        read_connect_reply(self.parent.as_mut()).await
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

/// Build the CONNECT request, with basic proxy auth when a username is
/// configured.
pub(crate) fn connect_request(host: &str, port: u16, username: &str, password: &str) -> Vec<u8> {
    let mut request = format!(
        "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\nUser-Agent: {USER_AGENT}\r\n"
    );
    if !username.is_empty() {
        let credentials = BASE64.encode(format!("{username}:{password}"));
        request.push_str(&format!("Proxy-Authorization: basic {credentials}\r\n"));
    }
    request.push_str("\r\n");
    request.into_bytes()
}

/// Read the proxy's reply until the header terminator and judge the status.
///
/// The reply must fit `REPLY_LIMIT` bytes; a non-2xx status surfaces the
/// reason phrase from the status line.
pub(crate) async fn read_connect_reply<T: Transport + ?Sized>(
    transport: &mut T,
) -> Result<(), TransportError> {
    let mut buf = [0u8; REPLY_LIMIT];
    let mut pos = 0;

    loop {
        if pos >= buf.len() {
            return Err(TransportError::NoBufferSpace);
        }
        let n = transport.recv(&mut buf[pos..]).await?;
        if n == 0 {
            return Err(TransportError::Closed);
        }
        pos += n;

        if pos > 4 && &buf[pos - 4..pos] == b"\r\n\r\n" {
            break;
        }
    }

    let status = buf.get(STATUS_OFFSET).copied().unwrap_or(0);
    debug!("proxy replied with status {}", status as char);
    if status == b'2' {
        return Ok(());
    }

    let line_end = buf[..pos]
        .windows(2)
        .position(|w| w == b"\r\n")
        .unwrap_or(pos);
    let reason = if line_end > REASON_OFFSET {
        String::from_utf8_lossy(&buf[REASON_OFFSET..line_end]).into_owned()
    } else {
        String::new()
    };
    Err(TransportError::PermissionDenied(reason))
}
