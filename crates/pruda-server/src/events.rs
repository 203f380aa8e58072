//! In-process fan-out of lifecycle events.
//!
//! The authority publishes into a bounded queue; a dispatcher task drains it
//! and hands each event to the sinks (audit log, Discord webhook). Delivery
//! is best-effort: a full queue drops the event with a warning and never
//! blocks a state transition.

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::store::Store;
use crate::webhooks;

/// Queue capacity; overflow drops events rather than growing memory.
pub const EVENT_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    Issued,
    Activated,
    Renewed,
    Revoked,
    Expired,
    ExpiringSoon,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Issued => "issued",
            EventKind::Activated => "activated",
            EventKind::Renewed => "renewed",
            EventKind::Revoked => "revoked",
            EventKind::Expired => "expired",
            EventKind::ExpiringSoon => "expiringSoon",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleEvent {
    pub kind: EventKind,
    pub license_id: u64,
    pub key: String,
    pub at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discord_username: Option<String>,
}

/// Publishing handle held by the authority.
#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::Sender<LifecycleEvent>,
}

impl EventBus {
    /// Creates the bus plus the receiving end the dispatcher drains. Tests
    /// keep the receiver to observe published events directly.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<LifecycleEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Non-blocking hand-off. Overflow is logged and the event is dropped.
    pub fn publish(&self, event: LifecycleEvent) {
        if let Err(e) = self.tx.try_send(event) {
            warn!(error = %e, "event queue full, dropping lifecycle event");
        }
    }
}

/// Spawns the dispatcher: audit line per event, then Discord delivery. The
/// task ends when every publishing handle is gone.
pub fn spawn_dispatcher(
    mut rx: mpsc::Receiver<LifecycleEvent>,
    store: Store,
    client: reqwest::Client,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            audit(&event);
            webhooks::notify_discord(&store, &client, &event).await;
        }
    })
}

fn audit(event: &LifecycleEvent) {
    info!(
        kind = event.kind.as_str(),
        license_id = event.license_id,
        key = %event.key,
        "audit: license lifecycle event"
    );
}
