// src/core/namespace/mod.rs

//! The namespace locking and attribute engine.
//!
//! Provides atomic, re-entrant read/write access to file and container
//! metadata and implements the metadata transactions of the manager request
//! surface: extended attributes, ACL evaluation, QoS classification and the
//! stripe lifecycle (verify, drop, replicate, commit).

pub mod acl;
pub mod attr;
pub mod commit;
pub mod entity;
pub mod locking;
pub mod qos;
pub mod registry;
pub mod stripes;

use crate::core::CoreError;
use crate::core::audit::AuditSink;
use crate::core::events::ClientNotifier;
use async_trait::async_trait;
use dashmap::DashMap;
use entity::FileId;
use qos::QosRegistry;
use registry::{FsView, NamespaceRegistry, QuotaTracker};
use std::sync::Arc;
use stripes::TransferJob;
use tokio::sync::mpsc;

pub use entity::{AccessMode, FileOrContainer, Identity, TAPE_FS_ID};
pub use locking::Lockable;

/// Why a file id is being tracked by the transfer machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerType {
    Drain,
    Balance,
    Convert,
}

/// Deduplicating tracker for scheduled per-file transfers.
#[derive(Debug, Default)]
pub struct FidTracker {
    tracked: DashMap<FileId, TrackerType>,
}

impl FidTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a file id. Returns false when it is already tracked.
    pub fn add_entry(&self, fid: FileId, tracker: TrackerType) -> bool {
        match self.tracked.entry(fid) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(e) => {
                e.insert(tracker);
                true
            }
        }
    }

    pub fn remove_entry(&self, fid: FileId) {
        self.tracked.remove(&fid);
    }

    pub fn is_tracked(&self, fid: FileId) -> bool {
        self.tracked.contains_key(&fid)
    }
}

/// The out-of-band query channel towards a storage node.
#[async_trait]
pub trait StorageQuery: Send + Sync {
    /// Sends an opaque query string and returns the node's response body.
    async fn send_query(&self, host: &str, port: u16, request: &str) -> Result<String, CoreError>;
}

/// A storage query sink that accepts everything. Stands in when no storage
/// transport is wired up.
#[derive(Debug, Default)]
pub struct NullStorageQuery;

#[async_trait]
impl StorageQuery for NullStorageQuery {
    async fn send_query(
        &self,
        _host: &str,
        _port: u16,
        _request: &str,
    ) -> Result<String, CoreError> {
        Ok(String::new())
    }
}

/// The namespace engine and its collaborators.
///
/// Operations are synchronous; no namespace lock is ever held across an await
/// point. Long-running transfers are handed to the job channel and executed
/// by a background worker.
pub struct NamespaceEngine {
    pub registry: Arc<NamespaceRegistry>,
    pub fsview: Arc<FsView>,
    pub quota: Arc<QuotaTracker>,
    pub notifier: Arc<ClientNotifier>,
    pub qos: Arc<QosRegistry>,
    pub fid_tracker: Arc<FidTracker>,
    pub storage_query: Arc<dyn StorageQuery>,
    pub audit: Option<Arc<AuditSink>>,
    transfer_tx: mpsc::UnboundedSender<TransferJob>,
    /// Advertised in verification requests so the storage node can call back.
    pub manager_id: String,
    /// Space name used in conversion identifiers.
    pub space: String,
}

impl NamespaceEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<NamespaceRegistry>,
        fsview: Arc<FsView>,
        notifier: Arc<ClientNotifier>,
        qos: Arc<QosRegistry>,
        storage_query: Arc<dyn StorageQuery>,
        audit: Option<Arc<AuditSink>>,
        manager_id: String,
        space: String,
    ) -> (Self, mpsc::UnboundedReceiver<TransferJob>) {
        let (transfer_tx, transfer_rx) = mpsc::unbounded_channel();

        let engine = Self {
            registry,
            fsview,
            quota: Arc::new(QuotaTracker::new()),
            notifier,
            qos,
            fid_tracker: Arc::new(FidTracker::new()),
            storage_query,
            audit,
            transfer_tx,
            manager_id,
            space,
        };

        (engine, transfer_rx)
    }

    pub(crate) fn schedule_transfer(&self, job: TransferJob) {
        // The receiver draining this channel is the transfer worker; losing
        // it only parks the jobs.
        let _ = self.transfer_tx.send(job);
    }
}

impl std::fmt::Debug for NamespaceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamespaceEngine")
            .field("containers", &self.registry.container_count())
            .field("files", &self.registry.file_count())
            .finish()
    }
}
