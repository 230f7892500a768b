//! JSON envelope protocol spoken over each user's WebSocket.
//!
//! Every frame is a text frame carrying one [`Envelope`]. Clients may send
//! shares, typing hints and pings; everything else is server-originated.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::UserId;

/// Maximum accepted frame size (16MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    // Client-originated
    FileShare,
    CodeShare,
    BulkFileShare,
    Typing,
    Ping,

    // Server-originated
    Pong,
    ConnectionSuccess,
    FileUpdated,
    FileConflict,
    ConflictResolved,
    CollaborationUpdated,
    Notification,

    #[serde(other)]
    Unknown,
}

impl EventType {
    /// Kinds a client may address to another user
    pub fn is_client_relayable(self) -> bool {
        matches!(
            self,
            EventType::FileShare | EventType::CodeShare | EventType::BulkFileShare | EventType::Typing
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::FileShare => "file_share",
            EventType::CodeShare => "code_share",
            EventType::BulkFileShare => "bulk_file_share",
            EventType::Typing => "typing",
            EventType::Ping => "ping",
            EventType::Pong => "pong",
            EventType::ConnectionSuccess => "connection_success",
            EventType::FileUpdated => "file_updated",
            EventType::FileConflict => "file_conflict",
            EventType::ConflictResolved => "conflict_resolved",
            EventType::CollaborationUpdated => "collaboration_updated",
            EventType::Notification => "notification",
            EventType::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("Message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),

    #[error("Invalid message format: {0}")]
    InvalidFormat(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

/// One event on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "sender_id")]
    pub sender: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "recipient_id")]
    pub recipient: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    pub fn new(kind: EventType) -> Self {
        Self {
            kind,
            sender: None,
            recipient: None,
            payload: None,
            timestamp: Utc::now(),
        }
    }

    pub fn connection_success(user_id: UserId) -> Self {
        Self::new(EventType::ConnectionSuccess)
            .to(user_id)
            .with_payload(serde_json::json!({
                "message": "Connected successfully",
                "user_id": user_id,
            }))
    }

    pub fn pong(user_id: UserId) -> Self {
        Self::new(EventType::Pong).to(user_id)
    }

    pub fn with_sender(mut self, sender: UserId) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn to(mut self, recipient: UserId) -> Self {
        self.recipient = Some(recipient);
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Parse a text frame received from a client
    pub fn from_client_text(text: &str) -> Result<Self, ProtocolError> {
        if text.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge(text.len(), MAX_MESSAGE_SIZE));
        }
        serde_json::from_str(text).map_err(|e| ProtocolError::InvalidFormat(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Stamp server-side fields on an event a client asked us to relay
    pub fn relayed_by(mut self, sender: UserId) -> Self {
        self.sender = Some(sender);
        self.timestamp = Utc::now();
        self
    }
}
