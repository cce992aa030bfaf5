//! Shared value objects used across multiple bounded contexts

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Call leg identifier
///
/// Opaque and supplied by the signaling backend; the engine never invents one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LegId(String);

impl LegId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LegId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LegId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Transfer attempt identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransferId(Uuid);

impl TransferId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TransferId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Conference identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConferenceId(Uuid);

impl ConferenceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConferenceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConferenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// SIP URI value object
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SipUri {
    user: String,
    host: String,
    port: Option<u16>,
}

impl SipUri {
    pub fn parse(uri: &str) -> Result<Self, String> {
        let uri = uri
            .trim()
            .strip_prefix("sip:")
            .ok_or_else(|| "URI must start with 'sip:'".to_string())?;

        let (user, host_port) = uri
            .split_once('@')
            .ok_or_else(|| "Invalid SIP URI format".to_string())?;

        if user.is_empty() || host_port.is_empty() || host_port.contains('@') {
            return Err("Invalid SIP URI format".to_string());
        }

        let (host, port) = match host_port.split_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse()
                    .map_err(|_| format!("Invalid SIP URI port: {}", port))?;
                (host, Some(port))
            }
            None => (host_port, None),
        };

        Ok(Self {
            user: user.to_string(),
            host: host.to_string(),
            port,
        })
    }

    /// Normalize a dial string into a URI
    ///
    /// Bare numbers get `domain` appended; anything containing `@` is taken
    /// as-is, with the `sip:` scheme added when missing.
    pub fn from_dial_string(target: &str, domain: &str) -> Result<Self, String> {
        let target = target.trim();
        if target.is_empty() {
            return Err("Dial string is empty".to_string());
        }

        if target.contains('@') {
            if target.starts_with("sip:") {
                Self::parse(target)
            } else {
                Self::parse(&format!("sip:{}", target))
            }
        } else {
            let user: String = target.chars().filter(|c| !c.is_whitespace()).collect();
            Self::parse(&format!("sip:{}@{}", user, domain))
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(port) = self.port {
            write!(f, "sip:{}@{}:{}", self.user, self.host, port)
        } else {
            write!(f, "sip:{}@{}", self.user, self.host)
        }
    }
}
