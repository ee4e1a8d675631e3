// src/core/bus/listener.rs

//! The broker drain pipeline of the shared-object bus.
//!
//! One reader task pulls messages off the broker subscription and feeds a
//! bounded in-memory queue; an apply task consumes that queue and folds the
//! envelopes into the local replica set. The bounded queue makes
//! back-pressure explicit instead of running replica updates on the broker's
//! delivery thread.

use super::SharedObjectManager;
use super::broker::{BrokerMessage, matches_target};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// The reader/apply pipeline for one node.
pub struct BusListener {
    manager: Arc<SharedObjectManager>,
    inflight_capacity: usize,
}

impl BusListener {
    pub fn new(manager: Arc<SharedObjectManager>, inflight_capacity: usize) -> Self {
        Self {
            manager,
            inflight_capacity,
        }
    }

    /// Runs the pipeline until shutdown is signalled.
    pub async fn run(self, shutdown_rx: broadcast::Receiver<()>) {
        let (queue_tx, queue_rx) = mpsc::channel::<BrokerMessage>(self.inflight_capacity);

        let apply_manager = Arc::clone(&self.manager);
        let apply_shutdown = shutdown_rx.resubscribe();
        let apply_task =
            tokio::spawn(async move { apply_loop(apply_manager, queue_rx, apply_shutdown).await });

        read_loop(self.manager, queue_tx, shutdown_rx).await;

        // Dropping the queue sender lets the apply loop drain and finish.
        if let Err(e) = apply_task.await {
            warn!("msg=\"bus apply task ended abnormally\" err={e}");
        }
    }
}

/// Drains the broker subscription into the bounded queue.
async fn read_loop(
    manager: Arc<SharedObjectManager>,
    queue_tx: mpsc::Sender<BrokerMessage>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let client_id = manager.broker().client_id().to_string();
    let mut rx = manager.broker().subscribe();
    debug!("msg=\"bus reader started\" client_id={client_id}");

    loop {
        tokio::select! {
            msg = rx.recv() => {
                match msg {
                    Ok(msg) => {
                        // Our own emissions come back on the shared channel.
                        if msg.sender == client_id {
                            continue;
                        }

                        if !matches_target(&client_id, msg.target.as_deref()) {
                            continue;
                        }

                        // Waiting here is the back-pressure point.
                        if queue_tx.send(msg).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        // Monitor traffic, lost messages are not recovered.
                        warn!("msg=\"bus reader lagged, dropped messages\" count={n}");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("msg=\"broker channel closed, bus reader stopping\"");
                        return;
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("msg=\"bus reader shutting down\"");
                return;
            }
        }
    }
}

/// Applies queued envelopes to the local replica set.
async fn apply_loop(
    manager: Arc<SharedObjectManager>,
    mut queue_rx: mpsc::Receiver<BrokerMessage>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            msg = queue_rx.recv() => {
                let Some(msg) = msg else {
                    return;
                };

                // A malformed envelope is logged and dropped.
                if let Err(e) = manager.parse_envelope(&msg) {
                    debug!("msg=\"dropping bus message\" err={e} body={}", msg.body);
                }
            }
            _ = shutdown_rx.recv() => {
                info!("msg=\"bus apply loop shutting down, draining queue\"");
                queue_rx.close();

                while let Some(msg) = queue_rx.recv().await {
                    if let Err(e) = manager.parse_envelope(&msg) {
                        debug!("msg=\"dropping bus message\" err={e}");
                    }
                }

                return;
            }
        }
    }
}
