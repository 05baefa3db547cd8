//! Messaging client abstraction.
//!
//! The daemon never speaks the messaging protocol itself. It consumes a stream
//! of [`ClientEvent`]s and calls back into a [`MessagingClient`] for outbound
//! sends and metadata lookups. [`BridgeClient`] is the production
//! implementation, driving an external bridge process over stdio.

mod bridge;
mod error;

pub use bridge::{BridgeClient, BridgeConfig};
pub use error::{ClientError, ClientResult};

use async_trait::async_trait;
use chatwatch_protocol::Jid;
use chatwatch_protocol::bridge::{BridgeEvent, MuteState, RawCall, RawMessage};

/// Inbound events from the messaging client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Message(RawMessage),
    CallOffer(RawCall),
    CallOfferNotice(RawCall),
    Connected,
    Disconnected,
    LoggedOut { reason: Option<String> },
    /// Pairing payload to show while authenticating.
    QrCode(String),
    PairSuccess,
}

impl ClientEvent {
    /// Convert a bridge line into a client event. Responses are not events.
    pub fn from_bridge(event: BridgeEvent) -> Option<Self> {
        Some(match event {
            BridgeEvent::Message(msg) => ClientEvent::Message(msg),
            BridgeEvent::CallOffer(call) => ClientEvent::CallOffer(call),
            BridgeEvent::CallOfferNotice(call) => ClientEvent::CallOfferNotice(call),
            BridgeEvent::Connected => ClientEvent::Connected,
            BridgeEvent::Disconnected => ClientEvent::Disconnected,
            BridgeEvent::LoggedOut { reason } => ClientEvent::LoggedOut { reason },
            BridgeEvent::QrCode { code } => ClientEvent::QrCode(code),
            BridgeEvent::PairSuccess { .. } => ClientEvent::PairSuccess,
            BridgeEvent::Response(_) => return None,
        })
    }
}

/// Contact book entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContactInfo {
    pub push_name: String,
    pub full_name: String,
}

impl ContactInfo {
    /// Push name, then full name; `None` if both are blank.
    pub fn best_name(&self) -> Option<&str> {
        if !self.push_name.is_empty() {
            Some(&self.push_name)
        } else if !self.full_name.is_empty() {
            Some(&self.full_name)
        } else {
            None
        }
    }
}

/// The account's own identities: the canonical JID and, when linked, the
/// alternate device-linked identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnIdentities {
    pub primary: Jid,
    pub alternate: Option<Jid>,
}

impl OwnIdentities {
    /// Whether `candidate` (as it appears in a mention list or quote) names
    /// this account in any of its forms.
    pub fn matches(&self, candidate: &str) -> bool {
        if candidate.is_empty() {
            return false;
        }
        if candidate == self.primary.to_string() || candidate == self.primary.to_non_ad().to_string()
        {
            return true;
        }
        match &self.alternate {
            Some(alt) if !alt.is_empty() => {
                candidate == alt.to_non_ad().to_string() || candidate == alt.to_string()
            }
            _ => false,
        }
    }

    /// Whether a parsed JID is this account (device part ignored).
    pub fn is_self(&self, jid: &Jid) -> bool {
        let jid = jid.to_non_ad();
        jid == self.primary.to_non_ad()
            || self
                .alternate
                .as_ref()
                .is_some_and(|alt| jid == alt.to_non_ad())
    }
}

/// Outbound and lookup operations offered by the messaging client.
#[async_trait]
pub trait MessagingClient: Send + Sync {
    /// Whether a device session exists already.
    async fn is_paired(&self) -> ClientResult<bool>;

    /// Start (or resume) the session. Pairing events follow on the event
    /// stream when no session exists.
    async fn connect(&self) -> ClientResult<()>;

    /// Best-effort disconnect.
    async fn disconnect(&self);

    async fn send_text(&self, chat: &Jid, text: &str) -> ClientResult<()>;

    async fn send_reply(
        &self,
        chat: &Jid,
        quoted_id: &str,
        quoted_participant: &Jid,
        text: &str,
    ) -> ClientResult<()>;

    /// Group subject.
    async fn group_name(&self, group: &Jid) -> ClientResult<String>;

    /// Contact book entry, `None` if unknown.
    async fn contact(&self, jid: &Jid) -> ClientResult<Option<ContactInfo>>;

    async fn mute_state(&self, chat: &Jid) -> ClientResult<MuteState>;

    /// `None` until a session exists.
    async fn own_identities(&self) -> ClientResult<Option<OwnIdentities>>;
}
