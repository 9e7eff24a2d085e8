//! Tunnel chain configuration
//!
//! The config file is a JSON object mapping tunnel names to hop chains. Each
//! hop is a flat string-to-string map (numeric and boolean JSON scalars are
//! coerced), and hop 0 additionally carries the tunnel's local endpoint and
//! pool policy. The special key `global` holds process-wide options and the
//! special name `-` designates the stdio tunnel.

pub mod chain;
pub mod global;

pub use chain::{ChainConfig, HopConfig, TransportKind, TunnelOptions};
pub use global::{GlobalConfig, LogLevel};

use serde_json::Value;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("hop {hop}: missing required key \"{key}\"")]
    MissingField { hop: usize, key: &'static str },

    #[error("hop {hop}: invalid value for \"{key}\": {value}")]
    InvalidValue {
        hop: usize,
        key: String,
        value: String,
    },

    #[error("hop {hop}: unsupported transport type: {kind}")]
    UnsupportedTransport { hop: usize, kind: String },

    #[error("tunnel \"{0}\" has an empty hop chain")]
    EmptyChain(String),

    #[error("the io tunnel must be the only tunnel in the config")]
    IoTunnelNotAlone,

    #[error("no tunnel definition found")]
    NoTunnels,

    #[error("config root must be a JSON object")]
    NotAnObject,

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Whether a tunnel serves a local TCP acceptor or the process stdio pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelKind {
    Socket,
    Io,
}

/// One tunnel definition: a name and its ordered hop chain.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub name: String,
    pub kind: TunnelKind,
    pub chain: ChainConfig,
}

/// The whole config file: global options plus the tunnel definitions.
#[derive(Debug, Clone)]
pub struct Config {
    pub global: GlobalConfig,
    pub tunnels: Vec<TunnelConfig>,
}

impl Config {
    pub fn from_str(text: &str) -> Result<Self, ConfigError> {
        Self::from_value(serde_json::from_str(text)?)
    }

    pub fn from_value(root: Value) -> Result<Self, ConfigError> {
        let Value::Object(entries) = root else {
            return Err(ConfigError::NotAnObject);
        };

        let mut global = GlobalConfig::default();
        let mut tunnels = Vec::new();

        for (name, value) in entries {
            if name == "global" {
                global = GlobalConfig::from_value(&value)?;
                continue;
            }

            let kind = if name == "-" {
                TunnelKind::Io
            } else {
                TunnelKind::Socket
            };
            let chain = ChainConfig::from_value(&name, &value)?;
            tunnels.push(TunnelConfig { name, kind, chain });
        }

        if tunnels.is_empty() {
            return Err(ConfigError::NoTunnels);
        }
        if tunnels.len() > 1 && tunnels.iter().any(|t| t.kind == TunnelKind::Io) {
            return Err(ConfigError::IoTunnelNotAlone);
        }

        Ok(Self { global, tunnels })
    }
}

/// Coerce a JSON scalar to its string form, the way the original
/// property-tree loader did.
pub(crate) fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
