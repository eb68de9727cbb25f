use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::ledger::models::{IntentStatus, PaymentIntent};

/// Broadcast channel capacity
const BROADCAST_CAPACITY: usize = 1000;

/// Topic every committed transition is published on
pub const TASK_POOL_TOPIC: &str = "task-pool";

pub fn intent_topic(intent_id: Uuid) -> String {
    format!("intent:{}", intent_id)
}

pub fn wallet_topic(wallet_address: &str) -> String {
    format!("wallet:{}", wallet_address)
}

/// A committed intent transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentEvent {
    pub intent_id: Uuid,
    pub previous_status: Option<IntentStatus>,
    pub status: IntentStatus,
    pub user_wallet_address: String,
    pub lp_wallet_address: Option<String>,
    pub note: String,
    pub timestamp: DateTime<Utc>,
}

impl IntentEvent {
    pub fn from_intent(intent: &PaymentIntent, previous_status: Option<IntentStatus>) -> Self {
        let note = intent
            .last_entry()
            .map(|entry| entry.note.clone())
            .unwrap_or_default();
        Self {
            intent_id: intent.id,
            previous_status,
            status: intent.status,
            user_wallet_address: intent.user_wallet_address.clone(),
            lp_wallet_address: intent.lp_wallet_address.clone(),
            note,
            timestamp: intent.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub topic: String,
    pub event: IntentEvent,
}

/// Fan-out of intent transitions to websocket subscribers.
///
/// Delivery is best effort: a send with no receivers, or to a lagging
/// receiver, is dropped and never reported back to the caller.
pub struct NotificationHub {
    tx: broadcast::Sender<Notification>,
}

impl NotificationHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { tx }
    }

    pub fn notify(&self, topic: impl Into<String>, event: IntentEvent) {
        let topic = topic.into();
        debug!("📡 Notify {}: {} -> {}", topic, event.intent_id, event.status);
        let _ = self.tx.send(Notification { topic, event });
    }

    /// Publish one transition on the intent, user, LP and task pool topics
    pub fn publish_transition(&self, intent: &PaymentIntent, previous_status: Option<IntentStatus>) {
        let event = IntentEvent::from_intent(intent, previous_status);

        self.notify(intent_topic(intent.id), event.clone());
        self.notify(wallet_topic(&intent.user_wallet_address), event.clone());
        if let Some(lp) = &intent.lp_wallet_address {
            self.notify(wallet_topic(lp), event.clone());
        }
        self.notify(TASK_POOL_TOPIC, event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new()
    }
}
