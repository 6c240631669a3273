//! Wire messages exchanged over a relay connection.
//!
//! Every frame is a JSON object tagged by `"type"`:
//! `{ "type", "session_id"?, "qr_content"?, "device_type"?, "status"?, "timestamp" }`.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{Role, SessionCode};

/// ISO-8601 timestamp for outbound frames.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Frames sent by the relay to a device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        session_id: String,
        device_type: Role,
        timestamp: String,
    },
    Status {
        status: String,
        timestamp: String,
    },
    Scan {
        qr_content: String,
        device_type: Role,
        timestamp: String,
    },
    Pong {
        timestamp: String,
    },
    Ping {
        timestamp: String,
    },
}

impl ServerMessage {
    pub fn connected(code: &SessionCode, role: Role) -> Self {
        Self::Connected {
            session_id: code.to_string(),
            device_type: role,
            timestamp: now_timestamp(),
        }
    }

    pub fn status(status: impl Into<String>) -> Self {
        Self::Status {
            status: status.into(),
            timestamp: now_timestamp(),
        }
    }

    /// `"{role}_connected"`, sent to the peer when `role` joins.
    pub fn peer_connected(role: Role) -> Self {
        Self::status(format!("{role}_connected"))
    }

    /// `"{role}_already_connected"`, sent to a newcomer whose peer is present.
    pub fn already_connected(role: Role) -> Self {
        Self::status(format!("{role}_already_connected"))
    }

    /// `"{role}_disconnected"`, sent to the peer when `role` leaves.
    pub fn peer_disconnected(role: Role) -> Self {
        Self::status(format!("{role}_disconnected"))
    }

    /// A forwarded scan. `content` is carried verbatim.
    pub fn scan(content: &str, from: Role) -> Self {
        Self::Scan {
            qr_content: content.to_owned(),
            device_type: from,
            timestamp: now_timestamp(),
        }
    }

    pub fn pong() -> Self {
        Self::Pong {
            timestamp: now_timestamp(),
        }
    }

    pub fn ping() -> Self {
        Self::Ping {
            timestamp: now_timestamp(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Status { .. } => "status",
            Self::Scan { .. } => "scan",
            Self::Pong { .. } => "pong",
            Self::Ping { .. } => "ping",
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Frames sent by a device to the relay.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Scan {
        #[serde(default)]
        qr_content: Option<String>,
    },
    Ping,
    Disconnect,
    #[serde(other)]
    Unknown,
}

impl ClientMessage {
    /// Parse a text frame. Malformed input yields `None`.
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }

    /// Scan content when this is a scan with a non-empty payload.
    pub fn scan_content(&self) -> Option<&str> {
        match self {
            Self::Scan {
                qr_content: Some(content),
            } if !content.is_empty() => Some(content),
            _ => None,
        }
    }
}
