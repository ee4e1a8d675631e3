// src/node/spawner.rs

//! Spawns the node's long-running background tasks.

use super::NodeInit;
use crate::core::bus::BusListener;
use crate::core::namespace::stripes::transfer_worker;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Launches the bus listener pipeline and the stripe transfer worker.
/// The returned handles finish once shutdown has been broadcast.
pub fn spawn_background_tasks(init: NodeInit) -> (Arc<super::NodeState>, Vec<JoinHandle<()>>) {
    let NodeInit { state, transfer_rx } = init;
    let mut handles = Vec::new();

    let listener = BusListener::new(
        Arc::clone(&state.shared_objects),
        state.config.bus.inflight_capacity,
    );
    let listener_shutdown = state.subscribe_shutdown();
    handles.push(tokio::spawn(async move {
        listener.run(listener_shutdown).await;
    }));

    let engine = Arc::clone(&state.namespace);
    let worker_shutdown = state.subscribe_shutdown();
    handles.push(tokio::spawn(async move {
        transfer_worker(engine, transfer_rx, worker_shutdown).await;
    }));

    debug!("msg=\"background tasks spawned\" count={}", handles.len());
    (state, handles)
}
