//! Account and chat identifiers.
//!
//! A JID has the shape `user[:device]@server`. A bare `server` (no `@`) is
//! also valid and is used for server-level addresses.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Server used by status updates and broadcast lists.
pub const BROADCAST_SERVER: &str = "broadcast";

/// Errors produced while parsing a JID.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JidError {
    #[error("empty jid")]
    Empty,

    #[error("unexpected number of @ in jid: {0}")]
    TooManyAt(String),

    #[error("invalid device in jid {jid}: {device}")]
    InvalidDevice { jid: String, device: String },
}

/// A parsed account or chat identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Jid {
    pub user: String,
    pub device: u16,
    pub server: String,
}

impl Jid {
    pub fn new(user: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            device: 0,
            server: server.into(),
        }
    }

    /// Same identity with the device part stripped.
    pub fn to_non_ad(&self) -> Self {
        Self {
            user: self.user.clone(),
            device: 0,
            server: self.server.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.server.is_empty()
    }

    /// Status/broadcast-channel chats.
    pub fn is_broadcast(&self) -> bool {
        self.server == BROADCAST_SERVER
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.user.is_empty() {
            return write!(f, "{}", self.server);
        }
        if self.device > 0 {
            write!(f, "{}:{}@{}", self.user, self.device, self.server)
        } else {
            write!(f, "{}@{}", self.user, self.server)
        }
    }
}

impl FromStr for Jid {
    type Err = JidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(JidError::Empty);
        }

        let parts: Vec<&str> = s.split('@').collect();
        match parts.as_slice() {
            [server] => Ok(Jid::new("", *server)),
            [user_part, server] => {
                if server.is_empty() {
                    return Err(JidError::Empty);
                }
                let (user, device) = match user_part.split_once(':') {
                    Some((user, device)) => {
                        let device = device.parse::<u16>().map_err(|_| JidError::InvalidDevice {
                            jid: s.to_string(),
                            device: device.to_string(),
                        })?;
                        (user, device)
                    }
                    None => (*user_part, 0),
                };
                Ok(Jid {
                    user: user.to_string(),
                    device,
                    server: server.to_string(),
                })
            }
            _ => Err(JidError::TooManyAt(s.to_string())),
        }
    }
}

impl Serialize for Jid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Jid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
