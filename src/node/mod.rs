// src/node/mod.rs

//! Node bootstrap: explicit construction and teardown of the process-wide
//! components.
//!
//! Nothing here is built in a static initializer; the broker handle, the
//! buffer pool, the QoS class table and the namespace engine are created in
//! [`NodeState::initialize`] and torn down by cancelling the cooperative
//! tasks before the pools drop.

pub mod spawner;

use crate::config::Config;
use crate::core::CoreError;
use crate::core::audit::AuditSink;
use crate::core::buffer::BufferManager;
use crate::core::bus::broker::SharedBroker;
use crate::core::bus::{ChannelBroker, SharedObjectManager};
use crate::core::cipher::UriCapCipher;
use crate::core::events::ClientNotifier;
use crate::core::namespace::qos::QosRegistry;
use crate::core::namespace::registry::{FsView, NamespaceRegistry};
use crate::core::namespace::stripes::TransferJob;
use crate::core::namespace::{NamespaceEngine, NullStorageQuery, StorageQuery};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::info;

/// Capacity of the shutdown broadcast channel.
const SHUTDOWN_CHANNEL_CAPACITY: usize = 4;

/// Everything initialized and ready for the task spawner.
pub struct NodeInit {
    pub state: Arc<NodeState>,
    /// Receives scheduled stripe transfers for the transfer worker.
    pub transfer_rx: mpsc::UnboundedReceiver<TransferJob>,
}

/// The central struct holding all shared, node-wide state.
pub struct NodeState {
    pub config: Config,
    pub broker: SharedBroker,
    pub shared_objects: Arc<SharedObjectManager>,
    pub namespace: Arc<NamespaceEngine>,
    pub notifier: Arc<ClientNotifier>,
    pub buffers: Arc<BufferManager>,
    pub cipher: Option<Arc<UriCapCipher>>,
    pub audit: Option<Arc<AuditSink>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl NodeState {
    /// Initializes the node with the in-process broker and no storage
    /// transport.
    pub fn initialize(config: Config) -> Result<NodeInit, CoreError> {
        let broker: SharedBroker = Arc::new(ChannelBroker::new(config.bus.client_id.clone()));
        Self::initialize_with(config, broker, Arc::new(NullStorageQuery))
    }

    /// Initializes the node against explicit broker and storage seams.
    /// This is the single factory for the node's shared context.
    pub fn initialize_with(
        config: Config,
        broker: SharedBroker,
        storage_query: Arc<dyn StorageQuery>,
    ) -> Result<NodeInit, CoreError> {
        config
            .validate()
            .map_err(|e| CoreError::Invalid(e.to_string()))?;

        // Startup failures below are fatal: a cipher without a derivable key
        // or an unusable audit directory must stop the node.
        let cipher = match &config.cipher {
            Some(cfg) => Some(Arc::new(UriCapCipher::from_config(cfg)?)),
            None => None,
        };

        let audit = if config.audit.enabled {
            Some(Arc::new(AuditSink::new(&config.audit)?))
        } else {
            None
        };

        let buffers = Arc::new(BufferManager::new(
            config.buffers.max_size,
            config.buffers.slots,
            config.buffers.base_size,
        ));

        let shared_objects = Arc::new(SharedObjectManager::new(Arc::clone(&broker)));
        let registry = Arc::new(NamespaceRegistry::new());
        let fsview = Arc::new(FsView::new());
        let notifier = Arc::new(ClientNotifier::new());
        let qos = Arc::new(QosRegistry::new());

        let (engine, transfer_rx) = NamespaceEngine::new(
            registry,
            fsview,
            Arc::clone(&notifier),
            qos,
            storage_query,
            audit.clone(),
            config.instance.clone(),
            config.space.clone(),
        );

        let (shutdown_tx, _) = broadcast::channel(SHUTDOWN_CHANNEL_CAPACITY);

        let state = Arc::new(Self {
            config,
            broker,
            shared_objects,
            namespace: Arc::new(engine),
            notifier,
            buffers,
            cipher,
            audit,
            shutdown_tx,
        });

        info!(
            "msg=\"node state initialized\" instance={}",
            state.config.instance
        );

        Ok(NodeInit { state, transfer_rx })
    }

    /// A receiver for the cooperative shutdown signal.
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Signals every background task to stop.
    pub fn shutdown(&self) {
        info!("msg=\"broadcasting shutdown\"");
        let _ = self.shutdown_tx.send(());
    }
}

impl std::fmt::Debug for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeState")
            .field("instance", &self.config.instance)
            .finish()
    }
}
