// src/core/bus/broker.rs

//! The message-broker seam of the shared-object bus.
//!
//! The bus treats the broker as an abstract "message with headers and body"
//! transport. Emissions are best-effort monitor traffic: a send that cannot
//! be delivered is dropped silently.

use crate::core::CoreError;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// Capacity of the in-process broker channel.
const BROKER_CHANNEL_CAPACITY: usize = 16384;

/// A broker message: an optional destination, a flat ASCII body and the
/// monitor-class marker.
#[derive(Debug, Clone)]
pub struct BrokerMessage {
    /// Destination queue or client id. `None` broadcasts to everyone.
    pub target: Option<String>,
    /// The flat `key=value&...` body.
    pub body: String,
    /// Monitor-class messages are best-effort and never retransmitted.
    pub monitor: bool,
    /// The client id of the emitter.
    pub sender: String,
}

/// The transport the bus publishes through and subscribes to.
pub trait MessageBroker: Send + Sync {
    /// Sends a message. Implementations drop undeliverable monitor traffic
    /// and only report hard transport misconfiguration.
    fn send(&self, msg: BrokerMessage) -> Result<(), CoreError>;

    /// The client id this node advertises as a reply address.
    fn client_id(&self) -> &str;

    /// Opens a new subscription to the broker's delivery stream.
    fn subscribe(&self) -> broadcast::Receiver<BrokerMessage>;
}

/// Checks whether a message destination addresses the given client.
///
/// A `None` target broadcasts; a target ending in `/*` matches every client
/// under its prefix; anything else must equal the client id exactly.
pub fn matches_target(client_id: &str, target: Option<&str>) -> bool {
    match target {
        None => true,
        Some(t) => {
            if let Some(prefix) = t.strip_suffix("/*") {
                client_id.starts_with(prefix)
            } else {
                t == client_id
            }
        }
    }
}

/// An in-process broker connecting the nodes of one process over a tokio
/// broadcast channel. Used by single-process clusters and by the tests.
#[derive(Debug)]
pub struct ChannelBroker {
    tx: broadcast::Sender<BrokerMessage>,
    client_id: String,
}

impl ChannelBroker {
    pub fn new(client_id: impl Into<String>) -> Self {
        let (tx, _) = broadcast::channel(BROKER_CHANNEL_CAPACITY);
        Self {
            tx,
            client_id: client_id.into(),
        }
    }

    /// Builds a second endpoint on the same channel with its own client id.
    pub fn endpoint(&self, client_id: impl Into<String>) -> Self {
        Self {
            tx: self.tx.clone(),
            client_id: client_id.into(),
        }
    }
}

impl MessageBroker for ChannelBroker {
    fn send(&self, msg: BrokerMessage) -> Result<(), CoreError> {
        if self.tx.send(msg).is_err() {
            debug!("msg=\"dropping bus message, no connected receivers\"");
        }
        Ok(())
    }

    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn subscribe(&self) -> broadcast::Receiver<BrokerMessage> {
        self.tx.subscribe()
    }
}

/// Convenience alias for the shared broker handle.
pub type SharedBroker = Arc<dyn MessageBroker>;
