//! Protocol between the daemon and the messaging bridge subprocess.
//!
//! The bridge owns the messaging session (login, transport, encryption) and
//! talks newline-delimited JSON over stdio:
//!
//! - **Events** (bridge -> daemon): [`BridgeEvent`], tagged by `type`.
//! - **Requests** (daemon -> bridge): [`BridgeRequest`], answered by a
//!   `response` event carrying the same `id`.
//!
//! ```text
//! -> {"id":3,"method":"send_text","params":{"chat_jid":"1@s.whatsapp.net","text":"hi"}}
//! <- {"type":"response","id":3,"result":null}
//! <- {"type":"message","id":"3EB0..","timestamp":1700000000,"chat":"..","sender":"..",..}
//! ```

use serde::{Deserialize, Serialize};

use crate::jid::Jid;

// ============================================================================
// Events (bridge -> daemon)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeEvent {
    /// Pairing code to present to the user (QR payload).
    QrCode { code: String },
    /// Pairing finished; the bridge now holds a device session.
    PairSuccess {
        #[serde(default)]
        jid: Option<Jid>,
    },
    Connected,
    Disconnected,
    LoggedOut {
        #[serde(default)]
        reason: Option<String>,
    },
    Message(RawMessage),
    CallOffer(RawCall),
    CallOfferNotice(RawCall),
    Response(BridgeResponse),
}

/// Inbound chat message as reported by the bridge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawMessage {
    pub id: String,
    pub timestamp: i64,
    pub chat: Jid,
    pub sender: Jid,
    #[serde(default)]
    pub push_name: String,
    #[serde(default)]
    pub is_from_me: bool,
    #[serde(default)]
    pub is_group: bool,
    #[serde(default)]
    pub content: MessageContent,
}

/// Message payload. At most one body field is normally set; when several
/// are, display resolution follows field order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extended_text: Option<ExtendedText>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<CaptionedMedia>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video: Option<CaptionedMedia>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<DocumentMedia>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<AudioMedia>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sticker: Option<StickerMedia>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<ContactCard>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<LocationPin>,
}

/// Mentions and quoted-message reference attached to a message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextInfo {
    #[serde(default)]
    pub mentioned_jid: Vec<String>,
    /// Sender of the quoted message, when this message is a reply.
    #[serde(default)]
    pub participant: Option<String>,
    /// Id of the quoted message.
    #[serde(default)]
    pub stanza_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendedText {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub context_info: Option<ContextInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptionedMedia {
    #[serde(default)]
    pub caption: String,
    #[serde(default)]
    pub context_info: Option<ContextInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMedia {
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub context_info: Option<ContextInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioMedia {
    /// Push-to-talk voice note.
    #[serde(default)]
    pub ptt: bool,
    #[serde(default)]
    pub context_info: Option<ContextInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StickerMedia {
    #[serde(default)]
    pub context_info: Option<ContextInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactCard {
    #[serde(default)]
    pub display_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocationPin {
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
}

impl MessageContent {
    /// Context info of the first media/text body that carries one.
    pub fn context_info(&self) -> Option<&ContextInfo> {
        if let Some(ext) = &self.extended_text {
            return ext.context_info.as_ref();
        }
        if let Some(img) = &self.image {
            return img.context_info.as_ref();
        }
        if let Some(vid) = &self.video {
            return vid.context_info.as_ref();
        }
        if let Some(doc) = &self.document {
            return doc.context_info.as_ref();
        }
        if let Some(audio) = &self.audio {
            return audio.context_info.as_ref();
        }
        if let Some(sticker) = &self.sticker {
            return sticker.context_info.as_ref();
        }
        None
    }
}

/// Incoming call offer (regular or notice form).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawCall {
    pub call_id: String,
    pub from: Jid,
    pub timestamp: i64,
    #[serde(default)]
    pub group_jid: Option<Jid>,
}

// ============================================================================
// Requests (daemon -> bridge)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeRequest {
    pub id: u64,
    #[serde(flatten)]
    pub call: BridgeCall,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum BridgeCall {
    /// Returns [`StatusResult`].
    Status,
    Connect,
    Disconnect,
    SendText {
        chat_jid: Jid,
        text: String,
    },
    SendReply {
        chat_jid: Jid,
        quoted_id: String,
        quoted_participant: Jid,
        text: String,
    },
    /// Returns [`GroupInfoResult`].
    GroupInfo { jid: Jid },
    /// Returns [`ContactResult`].
    Contact { jid: Jid },
    /// Returns [`MuteState`].
    ChatSettings { jid: Jid },
    /// Returns [`OwnIdentitiesResult`].
    OwnIdentities,
}

impl BridgeCall {
    pub fn method(&self) -> &'static str {
        match self {
            BridgeCall::Status => "status",
            BridgeCall::Connect => "connect",
            BridgeCall::Disconnect => "disconnect",
            BridgeCall::SendText { .. } => "send_text",
            BridgeCall::SendReply { .. } => "send_reply",
            BridgeCall::GroupInfo { .. } => "group_info",
            BridgeCall::Contact { .. } => "contact",
            BridgeCall::ChatSettings { .. } => "chat_settings",
            BridgeCall::OwnIdentities => "own_identities",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeResponse {
    pub id: u64,
    #[serde(default)]
    pub result: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResult {
    /// Whether a device session already exists (no pairing needed).
    pub paired: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInfoResult {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactResult {
    #[serde(default)]
    pub found: bool,
    #[serde(default)]
    pub push_name: String,
    #[serde(default)]
    pub full_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnIdentitiesResult {
    #[serde(default)]
    pub primary: Option<Jid>,
    #[serde(default)]
    pub alternate: Option<Jid>,
}

/// Chat mute setting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MuteState {
    #[default]
    None,
    Forever,
    /// Muted until the given epoch second.
    Until { timestamp: i64 },
}

impl MuteState {
    pub fn is_active(&self, now: i64) -> bool {
        match self {
            MuteState::None => false,
            MuteState::Forever => true,
            MuteState::Until { timestamp } => *timestamp > now,
        }
    }
}
