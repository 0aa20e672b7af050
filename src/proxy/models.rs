//! Proxy data models

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Proxy protocol, declared in fallback order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Socks4,
    Socks5,
}

impl Protocol {
    /// Order the classifier walks when a proxy carries no protocol hint.
    pub const FALLBACK_ORDER: [Protocol; 3] = [Protocol::Http, Protocol::Socks4, Protocol::Socks5];

    pub fn scheme(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Socks4 => "socks4",
            Protocol::Socks5 => "socks5",
        }
    }

    /// Next protocol in the fallback chain, `None` after socks5.
    pub fn next(&self) -> Option<Protocol> {
        match self {
            Protocol::Http => Some(Protocol::Socks4),
            Protocol::Socks4 => Some(Protocol::Socks5),
            Protocol::Socks5 => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "http" => Ok(Protocol::Http),
            "socks4" => Ok(Protocol::Socks4),
            "socks5" => Ok(Protocol::Socks5),
            other => Err(format!(
                "Invalid protocol: {}. Use: http, socks4, socks5",
                other
            )),
        }
    }
}

/// Proxy endpoint discovered by a source, not yet validated
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Candidate {
    pub ip: String,
    pub port: u16,
}

impl Candidate {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }

    /// Forward-proxy URL used for both http and https traffic
    pub fn proxy_url(&self) -> String {
        format!("http://{}:{}", self.ip, self.port)
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Protocol hint attached to a list entry with `|protocol`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolHint {
    /// No hint, walk the whole fallback chain
    None,
    Known(Protocol),
    /// Hint present but not a supported protocol
    Unknown(String),
}

/// String-form proxy entry consumed by the classifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEntry {
    /// Normalized line, the de-duplication key
    pub line: String,
    /// Address part: `ip:port`, `user:pass@ip:port` or an opaque string
    pub address: String,
    pub hint: ProtocolHint,
}

impl ProxyEntry {
    /// Split a normalized line into address and protocol hint
    pub fn from_line(line: impl Into<String>) -> Self {
        let line = line.into();
        let (address, hint) = match line.rsplit_once('|') {
            Some((address, hint)) => {
                let hint = match hint.parse::<Protocol>() {
                    Ok(protocol) => ProtocolHint::Known(protocol),
                    Err(_) => ProtocolHint::Unknown(hint.to_string()),
                };
                (address.to_string(), hint)
            }
            None => (line.clone(), ProtocolHint::None),
        };

        Self {
            line,
            address,
            hint,
        }
    }

    /// Proxy URL for one protocol attempt
    pub fn url(&self, protocol: Protocol) -> String {
        format!("{}://{}", protocol, self.address)
    }
}

impl fmt::Display for ProxyEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.line)
    }
}

/// Result of a reachability probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeOutcome {
    pub candidate: Candidate,
    pub reachable: bool,
}

/// Result of protocol classification against the target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationOutcome {
    pub proxy: String,
    /// Protocol that succeeded; `None` when every attempt failed
    pub protocol: Option<Protocol>,
    pub functional: bool,
}

impl ClassificationOutcome {
    pub fn functional(proxy: String, protocol: Protocol) -> Self {
        Self {
            proxy,
            protocol: Some(protocol),
            functional: true,
        }
    }

    pub fn failed(proxy: String) -> Self {
        Self {
            proxy,
            protocol: None,
            functional: false,
        }
    }

    /// Line appended to the good-proxy output
    pub fn good_line(&self) -> Option<String> {
        self.protocol
            .filter(|_| self.functional)
            .map(|protocol| format!("{}|{}", self.proxy, protocol))
    }
}

/// Usable proxy joined with its geolocation lookup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoRecord {
    pub ip: String,
    pub port: u16,
    pub geolocation: serde_json::Value,
}
