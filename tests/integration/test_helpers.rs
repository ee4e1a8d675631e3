// tests/integration/test_helpers.rs

//! Test helpers and utilities for integration tests.

use garnetfs::config::Config;
use garnetfs::core::CoreError;
use garnetfs::core::bus::broker::SharedBroker;
use garnetfs::core::bus::{BusListener, ChannelBroker, SharedObjectManager};
use garnetfs::core::namespace::entity::{FsId, Identity};
use garnetfs::core::namespace::registry::{ConfigStatus, FilesystemInfo};
use garnetfs::core::namespace::{NamespaceEngine, StorageQuery};
use garnetfs::node::{NodeInit, NodeState};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

/// A storage query mock recording every request it receives.
#[derive(Debug, Default)]
pub struct RecordingStorageQuery {
    pub requests: Mutex<Vec<(String, u16, String)>>,
    pub fail: Mutex<bool>,
}

impl RecordingStorageQuery {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_fail(&self, fail: bool) {
        *self.fail.lock() = fail;
    }

    pub fn recorded(&self) -> Vec<(String, u16, String)> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl StorageQuery for RecordingStorageQuery {
    async fn send_query(&self, host: &str, port: u16, request: &str) -> Result<String, CoreError> {
        if *self.fail.lock() {
            return Err(CoreError::Transport("mock transport down".to_string()));
        }

        self.requests
            .lock()
            .push((host.to_string(), port, request.to_string()));
        Ok(String::new())
    }
}

/// TestContext provides a complete test environment with an initialized node.
pub struct TestContext {
    pub state: Arc<NodeState>,
    pub storage: Arc<RecordingStorageQuery>,
    pub vid_root: Identity,
}

impl TestContext {
    /// Creates a new test context with the default configuration.
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Creates a new test context with a custom configuration.
    pub fn with_config(config: Config) -> Self {
        let broker: SharedBroker = Arc::new(ChannelBroker::new(config.bus.client_id.clone()));
        let storage = RecordingStorageQuery::new();
        let storage_dyn: Arc<dyn StorageQuery> = storage.clone();

        let NodeInit { state, .. } = NodeState::initialize_with(config, broker, storage_dyn)
            .expect("node initialization succeeds");

        Self {
            state,
            storage,
            vid_root: Identity::root(),
        }
    }

    pub fn engine(&self) -> &NamespaceEngine {
        &self.state.namespace
    }

    /// Registers a writable filesystem in the view.
    pub fn register_fs(&self, fsid: FsId) {
        self.state.namespace.fsview.register(FilesystemInfo {
            id: fsid,
            host: format!("fst{fsid:02}.example"),
            port: 1095,
            local_prefix: format!("/data{fsid:02}"),
            queue: format!("/garnet/fst{fsid:02}"),
            config_status: ConfigStatus::ReadWrite,
        });
    }

    /// Creates a file with the given locations and size under `/data`.
    pub fn make_file(&self, name: &str, size: u64, locations: &[FsId]) -> u64 {
        let registry = &self.state.namespace.registry;
        registry.make_dir_p("/data", 0, 0).expect("mkdir");
        let file = registry
            .create_file(&format!("/data/{name}"), 0, 0, 0)
            .expect("create file");

        file.md().run_write_op(|f| {
            f.size = size;
            for &fsid in locations {
                f.add_location(fsid);
            }
        });

        for &fsid in locations {
            self.state.namespace.fsview.add_entry(fsid, file.id());
        }

        file.id()
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// An in-process bus "cluster": N nodes sharing one broker channel, each with
/// its own manager and running listener pipeline.
pub struct BusCluster {
    pub managers: Vec<Arc<SharedObjectManager>>,
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

impl BusCluster {
    /// Spawns `n` nodes named `/garnet/test/node<i>` on one shared channel.
    pub fn start(n: usize) -> Self {
        let seed = ChannelBroker::new("/garnet/test/node0");
        let (shutdown_tx, _) = tokio::sync::broadcast::channel(4);
        let mut managers = Vec::with_capacity(n);

        for i in 0..n {
            let broker: SharedBroker = if i == 0 {
                Arc::new(seed.endpoint("/garnet/test/node0"))
            } else {
                Arc::new(seed.endpoint(format!("/garnet/test/node{i}")))
            };

            let manager = Arc::new(SharedObjectManager::new(broker));
            let listener = BusListener::new(Arc::clone(&manager), 256);
            tokio::spawn(listener.run(shutdown_tx.subscribe()));
            managers.push(manager);
        }

        Self {
            managers,
            shutdown_tx,
        }
    }

    pub fn node(&self, i: usize) -> &Arc<SharedObjectManager> {
        &self.managers[i]
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Polls until the condition holds or the timeout expires.
pub async fn wait_for(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    panic!("condition not reached within the timeout");
}
