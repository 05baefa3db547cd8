//! Local socket protocol between the daemon and display clients.
//!
//! Newline-delimited JSON in both directions:
//!   Server -> client: `{"type":"message"|"call","data":{...}}`
//!   Client -> server: `{"action":"send"|"reply","chat_jid":"...","message_id":"...","sender_jid":"...","text":"..."}`

use serde::{Deserialize, Serialize};

/// A surfaced chat message.
///
/// `id` is assigned by the store and stays `None` until the row is persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub message_id: String,
    pub timestamp: i64,
    pub chat_jid: String,
    pub chat_name: String,
    pub sender_jid: String,
    pub sender_name: String,
    pub is_group: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_jid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
    pub is_muted: bool,
    pub is_reply_to_me: bool,
    pub text: String,
}

/// An incoming call signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Call {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub timestamp: i64,
    pub call_id: String,
    pub caller_jid: String,
    pub caller_name: String,
    pub is_group: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_jid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
}

/// Frame published to every connected display client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum SocketEvent {
    Message(Message),
    Call(Call),
}

impl SocketEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            SocketEvent::Message(_) => "message",
            SocketEvent::Call(_) => "call",
        }
    }

    /// Encode as a single newline-terminated JSON line.
    pub fn to_line(&self) -> serde_json::Result<Vec<u8>> {
        let mut buf = serde_json::to_vec(self)?;
        buf.push(b'\n');
        Ok(buf)
    }
}

/// Action names accepted on the command channel.
pub const ACTION_SEND: &str = "send";
pub const ACTION_REPLY: &str = "reply";

/// Raw command record as sent by a display client.
///
/// Kept loosely typed so unknown actions can be reported by name instead of
/// failing as malformed JSON.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub action: String,
    #[serde(default)]
    pub chat_jid: String,
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub sender_jid: String,
    #[serde(default)]
    pub text: String,
}
