use std::sync::Arc;

use log::{debug, error, warn};

use chatwatch_protocol::SocketEvent;
use chatwatch_protocol::bridge::{RawCall, RawMessage};

use crate::attention::AttentionNotifier;
use crate::broadcast::PeerRegistry;
use crate::classifier::{Classifier, Decision, DropReason};
use crate::client::MessagingClient;
use crate::store::Store;

/// What happened to one inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Broadcast to `peers`; `id` is `None` when persisting failed.
    Published { id: Option<i64>, peers: usize },
    Dropped(DropReason),
}

/// Classify, persist, then publish. Events are handled one at a time, so
/// every event is stored before the next is classified.
pub struct Pipeline {
    classifier: Classifier,
    store: Store,
    registry: PeerRegistry,
    client: Arc<dyn MessagingClient>,
    attention: Option<AttentionNotifier>,
}

impl Pipeline {
    pub fn new(
        classifier: Classifier,
        store: Store,
        registry: PeerRegistry,
        client: Arc<dyn MessagingClient>,
    ) -> Self {
        Self {
            classifier,
            store,
            registry,
            client,
            attention: None,
        }
    }

    pub fn with_attention(mut self, attention: Option<AttentionNotifier>) -> Self {
        self.attention = attention;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub async fn handle_message(&self, raw: &RawMessage) -> Outcome {
        let mut message = match self
            .classifier
            .classify_message(raw, self.client.as_ref())
            .await
        {
            Decision::Keep(message) => message,
            Decision::Drop(reason) => {
                debug!("Dropped message {} from {}: {:?}", raw.id, raw.chat, reason);
                return Outcome::Dropped(reason);
            }
        };

        match self.store.messages().append(&message).await {
            Ok(id) => message.id = Some(id),
            Err(e) => error!("Failed to save message {}: {}", message.message_id, e),
        }
        let id = message.id;
        let peers = self.registry.publish(&SocketEvent::Message(message)).await;

        if let Some(attention) = &self.attention
            && let Err(e) = attention.notify().await
        {
            warn!("Failed to send attention request: {}", e);
        }

        Outcome::Published { id, peers }
    }

    pub async fn handle_call(&self, raw: &RawCall) -> Outcome {
        let mut call = match self.classifier.classify_call(raw, self.client.as_ref()).await {
            Decision::Keep(call) => call,
            Decision::Drop(reason) => {
                debug!("Dropped call {} from {}: {:?}", raw.call_id, raw.from, reason);
                return Outcome::Dropped(reason);
            }
        };

        match self.store.calls().append(&call).await {
            Ok(id) => call.id = Some(id),
            Err(e) => error!("Failed to save call {}: {}", call.call_id, e),
        }
        let id = call.id;
        let peers = self.registry.publish(&SocketEvent::Call(call)).await;
        Outcome::Published { id, peers }
    }
}
