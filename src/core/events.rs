// src/core/events.rs

//! The notification bus towards mounted clients.
//!
//! Metadata transactions publish refresh events after their locks are
//! released; gateway tasks subscribe and fan the invalidations out to the
//! mounted clients they serve. Publishing is send-and-forget.

use tokio::sync::broadcast;
use tracing::debug;

/// Capacity of the refresh broadcast channel.
const REFRESH_BUS_CAPACITY: usize = 16384;

/// A cache invalidation for one entity and its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshEvent {
    /// The mutated entity.
    pub id: u64,
    /// Its parent container.
    pub parent_id: u64,
}

/// The refresh distribution hub.
#[derive(Debug)]
pub struct ClientNotifier {
    tx: broadcast::Sender<RefreshEvent>,
}

impl Default for ClientNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientNotifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(REFRESH_BUS_CAPACITY);
        Self { tx }
    }

    /// Publishes a refresh. It is fine for nobody to be listening.
    pub fn publish(&self, id: u64, parent_id: u64) {
        if self.tx.send(RefreshEvent { id, parent_id }).is_err() {
            debug!("msg=\"published a refresh with no active subscribers\" id={id}");
        }
    }

    /// Opens a new subscription for a gateway task.
    pub fn subscribe(&self) -> broadcast::Receiver<RefreshEvent> {
        self.tx.subscribe()
    }
}
