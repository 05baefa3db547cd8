//! Event classification.
//!
//! Decides whether an inbound message or call is surfaced and builds the
//! display model for kept events. Rules are evaluated in order and the first
//! match wins:
//!
//! 1. self-originated events are dropped
//! 2. status/broadcast chats are dropped unless enabled
//! 3. muted chats are dropped unless the message mentions or replies to the
//!    account, or muted filtering is disabled
//!
//! The only side effects are metadata lookups against the messaging client.

mod text;

pub use text::{PLACEHOLDER_OTHER, display_text};

use log::debug;
use serde::{Deserialize, Serialize};

use chatwatch_protocol::bridge::{MessageContent, RawCall, RawMessage};
use chatwatch_protocol::{Call, Jid, Message};

use crate::client::{MessagingClient, OwnIdentities};

/// Filter switches (`[filters]` config section).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Surface status/broadcast-channel events.
    pub include_status_messages: bool,
    /// Surface every message from muted chats, not only mentions and replies.
    pub include_muted_messages: bool,
}

/// Why an event was not surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    FromMe,
    StatusBroadcast,
    Muted,
}

/// Classification outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision<T> {
    Keep(T),
    Drop(DropReason),
}

impl<T> Decision<T> {
    pub fn is_keep(&self) -> bool {
        matches!(self, Decision::Keep(_))
    }

    pub fn kept(self) -> Option<T> {
        match self {
            Decision::Keep(value) => Some(value),
            Decision::Drop(_) => None,
        }
    }
}

/// Whether a muted-chat message is filtered out.
pub fn muted_drop(
    is_muted: bool,
    is_mentioned: bool,
    is_reply_to_me: bool,
    include_muted: bool,
) -> bool {
    is_muted && !is_mentioned && !is_reply_to_me && !include_muted
}

/// Own identity appears in the message's mention list.
pub fn is_mentioned(content: &MessageContent, own: Option<&OwnIdentities>) -> bool {
    let (Some(own), Some(ctx)) = (own, content.context_info()) else {
        return false;
    };
    ctx.mentioned_jid.iter().any(|jid| own.matches(jid))
}

/// The message quotes a message sent by this account.
pub fn is_reply_to_me(content: &MessageContent, own: Option<&OwnIdentities>) -> bool {
    let (Some(own), Some(ctx)) = (own, content.context_info()) else {
        return false;
    };
    ctx.participant
        .as_deref()
        .is_some_and(|participant| own.matches(participant))
}

/// Applies the filter rules to inbound events.
#[derive(Debug, Clone, Copy, Default)]
pub struct Classifier {
    filters: FilterConfig,
}

impl Classifier {
    pub fn new(filters: FilterConfig) -> Self {
        Self { filters }
    }

    pub async fn classify_message(
        &self,
        raw: &RawMessage,
        client: &dyn MessagingClient,
    ) -> Decision<Message> {
        self.classify_message_at(raw, client, chrono::Utc::now().timestamp())
            .await
    }

    /// [`classify_message`](Self::classify_message) with an explicit clock.
    pub async fn classify_message_at(
        &self,
        raw: &RawMessage,
        client: &dyn MessagingClient,
        now: i64,
    ) -> Decision<Message> {
        if raw.is_from_me {
            return Decision::Drop(DropReason::FromMe);
        }
        if raw.chat.is_broadcast() && !self.filters.include_status_messages {
            return Decision::Drop(DropReason::StatusBroadcast);
        }

        let is_muted = match client.mute_state(&raw.chat).await {
            Ok(state) => state.is_active(now),
            Err(e) => {
                debug!("Mute lookup for {} failed: {}", raw.chat, e);
                false
            }
        };
        let own = own_identities(client).await;
        let mentioned = is_mentioned(&raw.content, own.as_ref());
        let reply_to_me = is_reply_to_me(&raw.content, own.as_ref());

        if muted_drop(
            is_muted,
            mentioned,
            reply_to_me,
            self.filters.include_muted_messages,
        ) {
            return Decision::Drop(DropReason::Muted);
        }

        let sender_name = sender_name(raw, client).await;
        let chat_name = chat_name(raw, client).await;
        let chat_jid = raw.chat.to_string();

        Decision::Keep(Message {
            id: None,
            message_id: raw.id.clone(),
            timestamp: raw.timestamp,
            group_jid: raw.is_group.then(|| chat_jid.clone()),
            group_name: raw.is_group.then(|| chat_name.clone()),
            chat_jid,
            chat_name,
            sender_jid: raw.sender.to_string(),
            sender_name,
            is_group: raw.is_group,
            is_muted,
            is_reply_to_me: reply_to_me,
            text: display_text(&raw.content),
        })
    }

    pub async fn classify_call(&self, raw: &RawCall, client: &dyn MessagingClient) -> Decision<Call> {
        let own = own_identities(client).await;
        if own.as_ref().is_some_and(|own| own.is_self(&raw.from)) {
            return Decision::Drop(DropReason::FromMe);
        }
        if raw.from.is_broadcast() && !self.filters.include_status_messages {
            return Decision::Drop(DropReason::StatusBroadcast);
        }

        let group = raw.group_jid.as_ref().filter(|jid| !jid.is_empty());
        let group_name = match group {
            Some(jid) => Some(client.group_name(jid).await.unwrap_or_else(|e| {
                debug!("Group lookup for {} failed: {}", jid, e);
                String::new()
            })),
            None => None,
        };

        Decision::Keep(Call {
            id: None,
            timestamp: raw.timestamp,
            call_id: raw.call_id.clone(),
            caller_jid: raw.from.to_string(),
            caller_name: contact_name(&raw.from, client).await,
            is_group: group.is_some(),
            group_jid: group.map(|jid| jid.to_string()),
            group_name,
        })
    }
}

async fn own_identities(client: &dyn MessagingClient) -> Option<OwnIdentities> {
    match client.own_identities().await {
        Ok(own) => own,
        Err(e) => {
            debug!("Own identity lookup failed: {}", e);
            None
        }
    }
}

/// Contact book name for `jid`, falling back to the bare user part.
async fn contact_name(jid: &Jid, client: &dyn MessagingClient) -> String {
    if let Ok(Some(contact)) = client.contact(jid).await
        && let Some(name) = contact.best_name()
    {
        return name.to_string();
    }
    bare_user(jid)
}

async fn sender_name(raw: &RawMessage, client: &dyn MessagingClient) -> String {
    if raw.is_group
        && let Ok(Some(contact)) = client.contact(&raw.sender).await
        && let Some(name) = contact.best_name()
    {
        return name.to_string();
    }
    if !raw.push_name.is_empty() {
        return raw.push_name.clone();
    }
    bare_user(&raw.sender)
}

async fn chat_name(raw: &RawMessage, client: &dyn MessagingClient) -> String {
    if raw.is_group {
        match client.group_name(&raw.chat).await {
            Ok(name) if !name.is_empty() => return name,
            Ok(_) => {}
            Err(e) => debug!("Group lookup for {} failed: {}", raw.chat, e),
        }
    }
    contact_name(&raw.chat, client).await
}

fn bare_user(jid: &Jid) -> String {
    if jid.user.is_empty() {
        jid.to_string()
    } else {
        jid.user.clone()
    }
}
