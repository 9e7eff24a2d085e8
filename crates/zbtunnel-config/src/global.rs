//! Process-wide options from the `global` config block

use crate::{scalar_to_string, ConfigError};
use serde_json::Value;

/// Subsystem bits accepted in `log_filter`.
pub mod filter {
    pub const TUNNEL: u32 = 1;
    pub const CONNECTION: u32 = 2;
    pub const SOCKET: u32 = 4;
    pub const SHADOW: u32 = 8;
    pub const HTTP: u32 = 16;
    pub const SOCKS: u32 = 32;
    pub const CODER: u32 = 64;
    pub const STDIO: u32 = 128;
    pub const MANAGER: u32 = 256;
    pub const ALL: u32 = 0xffff;
}

/// Verbosity threshold for diagnostic output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    None,
}

impl LogLevel {
    fn parse(text: &str) -> Option<Self> {
        match text {
            "0" | "DEBUG" | "debug" => Some(Self::Debug),
            "1" | "INFO" | "info" => Some(Self::Info),
            "2" | "WARN" | "warn" => Some(Self::Warn),
            "3" | "NONE" | "none" => Some(Self::None),
            _ => None,
        }
    }
}

/// Defaults for every tunnel, overridable per tunnel on hop 0.
#[derive(Debug, Clone)]
pub struct GlobalConfig {
    pub log_filter: u32,
    pub log_level: LogLevel,
    pub recycle: bool,
    pub preconnect: usize,
    pub max_reuse: usize,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_filter: filter::TUNNEL | filter::CONNECTION | filter::MANAGER,
            log_level: LogLevel::Info,
            recycle: false,
            preconnect: 0,
            max_reuse: 10,
        }
    }
}

impl GlobalConfig {
    pub(crate) fn from_value(value: &Value) -> Result<Self, ConfigError> {
        let mut global = Self::default();
        let Value::Object(entries) = value else {
            return Ok(global);
        };

        let text_of = |key: &str| -> Option<String> {
            entries.get(key).and_then(scalar_to_string)
        };

        if let Some(text) = text_of("log_filter") {
            global.log_filter = text.parse().map_err(|_| ConfigError::InvalidValue {
                hop: 0,
                key: "log_filter".to_owned(),
                value: text.clone(),
            })?;
        }
        if let Some(text) = text_of("log_level") {
            global.log_level = LogLevel::parse(&text).ok_or(ConfigError::InvalidValue {
                hop: 0,
                key: "log_level".to_owned(),
                value: text.clone(),
            })?;
        }
        if let Some(text) = text_of("recycle") {
            global.recycle = matches!(text.as_str(), "1" | "true");
        }
        if let Some(text) = text_of("preconnect") {
            global.preconnect = text.parse().unwrap_or(global.preconnect);
        }
        if let Some(text) = text_of("max_reuse") {
            global.max_reuse = text.parse().unwrap_or(global.max_reuse);
        }
        Ok(global)
    }

    /// Translate `log_level` + `log_filter` into tracing filter directives.
    ///
    /// Warnings and errors always pass for every subsystem; messages below
    /// warn level pass only for subsystems whose filter bit is set.
    pub fn env_filter_directives(&self) -> String {
        let verbose = match self.log_level {
            LogLevel::None => return "off".to_owned(),
            LogLevel::Warn => return "warn".to_owned(),
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        };

        let targets = [
            (filter::TUNNEL, "zbtunnel_tunnel"),
            (filter::CONNECTION, "zbtunnel_connection::connection"),
            (filter::MANAGER, "zbtunnel_connection::manager"),
            (filter::SOCKET, "zbtunnel_transport::socket"),
            (filter::SHADOW, "zbtunnel_transport::shadow"),
            // One HTTP bit governs both proxy flavors, as in the original
            // where the https transport inherited the http one's logging.
            (filter::HTTP, "zbtunnel_transport::http"),
            (filter::HTTP, "zbtunnel_transport::https"),
            (filter::SOCKS, "zbtunnel_transport::socks5"),
            (filter::STDIO, "zbtunnel_transport::stdio"),
            (filter::CODER, "zbtunnel_codec"),
        ];

        let mut directives = vec!["warn".to_owned()];
        for (bit, target) in targets {
            if self.log_filter & bit != 0 {
                directives.push(format!("{target}={verbose}"));
            }
        }
        directives.join(",")
    }
}
