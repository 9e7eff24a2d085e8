//! Hop chains and per-hop key access

use crate::{scalar_to_string, ConfigError, GlobalConfig};
use serde_json::Value;
use std::collections::BTreeMap;

/// The proxy protocol spoken at one hop of the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Plain TCP to the next hop; no layer is stacked.
    Raw,
    Shadow,
    Http,
    Https,
    Socks5,
}

/// One hop: a flat string map plus its position in the chain.
#[derive(Debug, Clone)]
pub struct HopConfig {
    index: usize,
    values: BTreeMap<String, String>,
}

impl HopConfig {
    fn from_value(index: usize, value: &Value) -> Result<Self, ConfigError> {
        let Value::Object(entries) = value else {
            return Err(ConfigError::InvalidValue {
                hop: index,
                key: "<hop>".to_owned(),
                value: value.to_string(),
            });
        };

        let mut values = BTreeMap::new();
        for (key, item) in entries {
            let text = scalar_to_string(item).ok_or_else(|| ConfigError::InvalidValue {
                hop: index,
                key: key.clone(),
                value: item.to_string(),
            })?;
            values.insert(key.clone(), text);
        }
        Ok(Self { index, values })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    pub fn require(&self, key: &'static str) -> Result<&str, ConfigError> {
        self.get(key).ok_or(ConfigError::MissingField {
            hop: self.index,
            key,
        })
    }

    pub fn get_int(&self, key: &str, default: i64) -> Result<i64, ConfigError> {
        match self.get(key) {
            None => Ok(default),
            Some(text) => text.parse().map_err(|_| ConfigError::InvalidValue {
                hop: self.index,
                key: key.to_owned(),
                value: text.to_owned(),
            }),
        }
    }

    pub fn get_bool(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.get(key) {
            None => Ok(default),
            Some("1") | Some("true") => Ok(true),
            Some("0") | Some("false") => Ok(false),
            Some(text) => Err(ConfigError::InvalidValue {
                hop: self.index,
                key: key.to_owned(),
                value: text.to_owned(),
            }),
        }
    }

    /// The hop's `host`/`port` pair, both required.
    pub fn host_port(&self) -> Result<(String, u16), ConfigError> {
        let host = self.require("host")?;
        if host.is_empty() {
            return Err(ConfigError::MissingField {
                hop: self.index,
                key: "host",
            });
        }
        let port = self.require("port")?;
        let port = port.parse().map_err(|_| ConfigError::InvalidValue {
            hop: self.index,
            key: "port".to_owned(),
            value: port.to_owned(),
        })?;
        Ok((host.to_owned(), port))
    }

    /// Resolve the hop's transport kind; an omitted key means raw TCP.
    pub fn transport(&self) -> Result<TransportKind, ConfigError> {
        match self.get("transport") {
            None | Some("") | Some("raw") => Ok(TransportKind::Raw),
            Some("shadow") => Ok(TransportKind::Shadow),
            Some("http") => Ok(TransportKind::Http),
            Some("https") => Ok(TransportKind::Https),
            Some("socks5") => Ok(TransportKind::Socks5),
            Some(other) => Err(ConfigError::UnsupportedTransport {
                hop: self.index,
                kind: other.to_owned(),
            }),
        }
    }
}

/// The ordered hop chain of one tunnel.
#[derive(Debug, Clone)]
pub struct ChainConfig {
    hops: Vec<HopConfig>,
}

impl ChainConfig {
    pub(crate) fn from_value(name: &str, value: &Value) -> Result<Self, ConfigError> {
        let Value::Array(entries) = value else {
            return Err(ConfigError::EmptyChain(name.to_owned()));
        };
        if entries.is_empty() {
            return Err(ConfigError::EmptyChain(name.to_owned()));
        }

        let hops = entries
            .iter()
            .enumerate()
            .map(|(index, hop)| HopConfig::from_value(index, hop))
            .collect::<Result<_, _>>()?;
        Ok(Self { hops })
    }

    /// Build a chain directly from key/value hop maps (used by tests and
    /// embedding code).
    pub fn from_hops<I, K, V>(hops: Vec<I>) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let hops = hops
            .into_iter()
            .enumerate()
            .map(|(index, entries)| HopConfig {
                index,
                values: entries
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            })
            .collect();
        Self { hops }
    }

    pub fn len(&self) -> usize {
        self.hops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    pub fn hop(&self, index: usize) -> Option<&HopConfig> {
        self.hops.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &HopConfig> {
        self.hops.iter()
    }

    /// Local endpoint and pool policy, read from hop 0 with global defaults.
    pub fn tunnel_options(&self, global: &GlobalConfig) -> Result<TunnelOptions, ConfigError> {
        let first = &self.hops[0];
        Ok(TunnelOptions {
            local_address: first.get_or("local_address", "0.0.0.0").to_owned(),
            local_port: first.get_int("local_port", 8080)? as u16,
            preconnect: first.get_int("preconnect", global.preconnect as i64)? as usize,
            max_reuse: first.get_int("max_reuse", global.max_reuse as i64)? as usize,
            recycle: first.get_bool("recycle", global.recycle)?,
        })
    }
}

/// Per-tunnel acceptor endpoint and pool policy.
#[derive(Debug, Clone)]
pub struct TunnelOptions {
    pub local_address: String,
    pub local_port: u16,
    pub preconnect: usize,
    pub max_reuse: usize,
    pub recycle: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(json: &str) -> ChainConfig {
        ChainConfig::from_value("t", &serde_json::from_str(json).unwrap()).unwrap()
    }

    #[test]
    fn transport_defaults_to_raw() {
        let c = chain(r#"[{"host":"h","port":"1"}]"#);
        assert_eq!(c.hop(0).unwrap().transport().unwrap(), TransportKind::Raw);

        let c = chain(r#"[{"transport":"raw","host":"h","port":"1"}]"#);
        assert_eq!(c.hop(0).unwrap().transport().unwrap(), TransportKind::Raw);
    }

    #[test]
    fn unknown_transport_is_rejected() {
        let c = chain(r#"[{"transport":"carrier-pigeon","host":"h","port":"1"}]"#);
        assert!(matches!(
            c.hop(0).unwrap().transport(),
            Err(ConfigError::UnsupportedTransport { hop: 0, .. })
        ));
    }

    #[test]
    fn missing_host_names_the_hop_and_key() {
        let c = chain(r#"[{"host":"h","port":"1"},{"transport":"socks5","port":"2"}]"#);
        let err = c.hop(1).unwrap().host_port().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingField { hop: 1, key: "host" }
        ));
    }

    #[test]
    fn tunnel_options_fall_back_to_globals() {
        let mut global = GlobalConfig::default();
        global.preconnect = 3;
        global.max_reuse = 7;
        global.recycle = false;

        let c = chain(r#"[{"host":"h","port":"1"}]"#);
        let options = c.tunnel_options(&global).unwrap();
        assert_eq!(options.local_address, "0.0.0.0");
        assert_eq!(options.local_port, 8080);
        assert_eq!(options.preconnect, 3);
        assert_eq!(options.max_reuse, 7);
        assert!(!options.recycle);

        let c = chain(
            r#"[{"host":"h","port":"1","local_port":"19000","preconnect":"1","max_reuse":"2","recycle":"true"}]"#,
        );
        let options = c.tunnel_options(&global).unwrap();
        assert_eq!(options.local_port, 19000);
        assert_eq!(options.preconnect, 1);
        assert_eq!(options.max_reuse, 2);
        assert!(options.recycle);
    }

    #[test]
    fn bad_port_is_an_invalid_value() {
        let c = chain(r#"[{"host":"h","port":"http"}]"#);
        assert!(matches!(
            c.hop(0).unwrap().host_port(),
            Err(ConfigError::InvalidValue { hop: 0, .. })
        ));
    }
}
