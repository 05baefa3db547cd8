//! Shared fixtures for integration tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use chatwatch::broadcast::PeerRegistry;
use chatwatch::client::{ClientError, ClientResult, ContactInfo, MessagingClient, OwnIdentities};
use chatwatch_protocol::Jid;
use chatwatch_protocol::bridge::{ContextInfo, ExtendedText, MessageContent, MuteState, RawCall, RawMessage};

pub const OWN_PRIMARY: &str = "15550001:4@s.whatsapp.net";
pub const OWN_ALTERNATE: &str = "777:4@lid";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Text {
        chat: String,
        text: String,
    },
    Reply {
        chat: String,
        quoted_id: String,
        quoted_sender: String,
        text: String,
    },
}

/// In-memory messaging client recording outbound sends.
pub struct FakeClient {
    paired: bool,
    fail_sends: bool,
    muted: HashSet<String>,
    groups: HashMap<String, String>,
    contacts: HashMap<String, ContactInfo>,
    own: Option<OwnIdentities>,
    sent: Mutex<Vec<Sent>>,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
}

impl Default for FakeClient {
    fn default() -> Self {
        Self {
            paired: true,
            fail_sends: false,
            muted: HashSet::new(),
            groups: HashMap::new(),
            contacts: HashMap::new(),
            own: Some(own_identities()),
            sent: Mutex::new(Vec::new()),
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
        }
    }
}

impl FakeClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unpaired(mut self) -> Self {
        self.paired = false;
        self
    }

    pub fn failing_sends(mut self) -> Self {
        self.fail_sends = true;
        self
    }

    pub fn muted(mut self, chat: &str) -> Self {
        self.muted.insert(chat.to_string());
        self
    }

    pub fn group(mut self, jid: &str, name: &str) -> Self {
        self.groups.insert(jid.to_string(), name.to_string());
        self
    }

    pub fn contact(mut self, jid: &str, push_name: &str) -> Self {
        self.contacts.insert(
            jid.to_string(),
            ContactInfo {
                push_name: push_name.to_string(),
                full_name: String::new(),
            },
        );
        self
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    fn record(&self, sent: Sent) -> ClientResult<()> {
        if self.fail_sends {
            return Err(ClientError::Rejected {
                method: "send_text",
                message: "not connected".to_string(),
            });
        }
        self.sent.lock().unwrap().push(sent);
        Ok(())
    }
}

#[async_trait]
impl MessagingClient for FakeClient {
    async fn is_paired(&self) -> ClientResult<bool> {
        Ok(self.paired)
    }

    async fn connect(&self) -> ClientResult<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    async fn send_text(&self, chat: &Jid, text: &str) -> ClientResult<()> {
        self.record(Sent::Text {
            chat: chat.to_string(),
            text: text.to_string(),
        })
    }

    async fn send_reply(
        &self,
        chat: &Jid,
        quoted_id: &str,
        quoted_participant: &Jid,
        text: &str,
    ) -> ClientResult<()> {
        self.record(Sent::Reply {
            chat: chat.to_string(),
            quoted_id: quoted_id.to_string(),
            quoted_sender: quoted_participant.to_string(),
            text: text.to_string(),
        })
    }

    async fn group_name(&self, group: &Jid) -> ClientResult<String> {
        Ok(self.groups.get(&group.to_string()).cloned().unwrap_or_default())
    }

    async fn contact(&self, jid: &Jid) -> ClientResult<Option<ContactInfo>> {
        Ok(self.contacts.get(&jid.to_string()).cloned())
    }

    async fn mute_state(&self, chat: &Jid) -> ClientResult<MuteState> {
        if self.muted.contains(&chat.to_string()) {
            Ok(MuteState::Forever)
        } else {
            Ok(MuteState::None)
        }
    }

    async fn own_identities(&self) -> ClientResult<Option<OwnIdentities>> {
        Ok(self.own.clone())
    }
}

pub fn own_identities() -> OwnIdentities {
    OwnIdentities {
        primary: OWN_PRIMARY.parse().unwrap(),
        alternate: Some(OWN_ALTERNATE.parse().unwrap()),
    }
}

pub fn text_message(id: &str, chat: &str, timestamp: i64, text: &str) -> RawMessage {
    RawMessage {
        id: id.to_string(),
        timestamp,
        chat: chat.parse().unwrap(),
        sender: chat.parse().unwrap(),
        push_name: "Kim".to_string(),
        content: MessageContent {
            conversation: Some(text.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn mention_message(id: &str, chat: &str, timestamp: i64, mentioned: &str) -> RawMessage {
    RawMessage {
        content: MessageContent {
            extended_text: Some(ExtendedText {
                text: format!("@{mentioned} look"),
                context_info: Some(ContextInfo {
                    mentioned_jid: vec![mentioned.to_string()],
                    ..Default::default()
                }),
            }),
            ..Default::default()
        },
        ..text_message(id, chat, timestamp, "")
    }
}

pub fn call_offer(call_id: &str, from: &str, timestamp: i64) -> RawCall {
    RawCall {
        call_id: call_id.to_string(),
        from: from.parse().unwrap(),
        timestamp,
        group_jid: None,
    }
}

/// Poll until the registry holds `expected` peers.
pub async fn wait_for_peers(registry: &PeerRegistry, expected: usize) {
    for _ in 0..400 {
        if registry.len().await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("registry never reached {expected} peers");
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..400 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}
