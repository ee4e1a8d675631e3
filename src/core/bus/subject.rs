// src/core/bus/subject.rs

//! A named replicated object and its transaction guard.

use super::broker::{BrokerMessage, SharedBroker};
use super::entry::SubjectEntry;
use super::envelope::{self, Envelope, EnvelopeCmd, SubjectKind};
use indexmap::IndexMap;
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// The ordered store behind a subject. For queues the append order of keys is
/// maintained alongside the entry map.
#[derive(Debug, Default)]
struct SubjectStore {
    entries: IndexMap<String, SubjectEntry>,
    order: VecDeque<String>,
}

/// The pending update and deletion sets of an open transaction.
#[derive(Debug, Default)]
struct TxSets {
    updates: BTreeSet<String>,
    deletions: BTreeSet<String>,
}

/// A named replicated object whose authoritative copy may live on a peer.
///
/// Local mutations are applied to the store immediately; dissemination is
/// batched through [`SharedSubject::transaction`] which emits at most one
/// update and one deletion message on close.
pub struct SharedSubject {
    subject: String,
    kind: SubjectKind,
    broadcast_queue: RwLock<String>,
    change_id: AtomicU64,
    last_object_id: AtomicU64,
    store: RwLock<SubjectStore>,
    tx_sets: Mutex<TxSets>,
    broker: SharedBroker,
}

impl SharedSubject {
    pub fn new(
        subject: impl Into<String>,
        kind: SubjectKind,
        broadcast_queue: impl Into<String>,
        broker: SharedBroker,
    ) -> Self {
        Self {
            subject: subject.into(),
            kind,
            broadcast_queue: RwLock::new(broadcast_queue.into()),
            change_id: AtomicU64::new(0),
            last_object_id: AtomicU64::new(0),
            store: RwLock::new(SubjectStore::default()),
            tx_sets: Mutex::new(TxSets::default()),
            broker,
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn kind(&self) -> SubjectKind {
        self.kind
    }

    pub fn broadcast_queue(&self) -> String {
        self.broadcast_queue.read().clone()
    }

    pub fn set_broadcast_queue(&self, queue: impl Into<String>) {
        *self.broadcast_queue.write() = queue.into();
    }

    /// The subject-level change counter, bumped on every local mutation.
    pub fn change_id(&self) -> u64 {
        self.change_id.load(Ordering::Relaxed)
    }

    /// Stores a value without any dissemination.
    pub fn set(&self, key: &str, value: &str) {
        let mut store = self.store.write();
        self.apply_set(&mut store, key, value);
    }

    pub fn set_u64(&self, key: &str, value: u64) {
        self.set(key, &value.to_string());
    }

    pub fn set_f64(&self, key: &str, value: f64) {
        self.set(key, &format!("{value:.6}"));
    }

    /// Removes a key. Returns whether it was present.
    pub fn delete(&self, key: &str) -> bool {
        let mut store = self.store.write();
        self.apply_delete(&mut store, key)
    }

    /// Removes every key.
    pub fn clear(&self) {
        let mut store = self.store.write();
        store.entries.clear();
        store.order.clear();
        self.change_id.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.store
            .read()
            .entries
            .get(key)
            .map(|e| e.value().to_string())
    }

    pub fn get_u64(&self, key: &str) -> u64 {
        self.get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or_default()
    }

    pub fn get_f64(&self, key: &str) -> f64 {
        self.get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or_default()
    }

    /// Age of an entry in milliseconds, 0 for missing keys.
    pub fn age_ms(&self, key: &str) -> u64 {
        self.store
            .read()
            .entries
            .get(key)
            .map(|e| e.age_ms())
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.store.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.read().entries.is_empty()
    }

    /// Snapshot of all keys and values.
    pub fn contents(&self) -> Vec<(String, String)> {
        self.store
            .read()
            .entries
            .iter()
            .map(|(k, e)| (k.clone(), e.value().to_string()))
            .collect()
    }

    /// Queue keys in append order.
    pub fn queue_keys(&self) -> Vec<String> {
        self.store.read().order.iter().cloned().collect()
    }

    /// Appends an entry to a queue subject. When no key is given one is
    /// generated from the object counter. Refuses an existing key.
    pub fn push_back(&self, key: Option<&str>, value: &str) -> bool {
        let generated;
        let key = match key {
            Some(k) => k,
            None => {
                generated = (self.last_object_id.load(Ordering::Relaxed) + 1).to_string();
                &generated
            }
        };

        let mut store = self.store.write();

        if store.entries.contains_key(key) {
            return false;
        }

        self.apply_set(&mut store, key, value);
        true
    }

    /// One-line-per-entry rendering of the store.
    pub fn dump(&self) -> String {
        let store = self.store.read();
        let mut out = String::new();

        for (key, entry) in &store.entries {
            out.push_str(&format!("key={} {}\n", key, entry.dump()));
        }

        out
    }

    /// Opens a transaction, serializing against other transactions on this
    /// subject. The guard batches mutations and emits on close or drop.
    pub fn transaction(&self) -> SharedTransaction<'_> {
        let mut guard = self.tx_sets.lock();
        guard.updates.clear();
        guard.deletions.clear();

        SharedTransaction {
            subject: self,
            sets: Some(guard),
        }
    }

    /// Emits a broadcast request carrying this node's reply address.
    pub fn broadcast_request(&self, request_target: &str) {
        let env = Envelope {
            cmd: EnvelopeCmd::BcRequest,
            subject: self.subject.clone(),
            kind: self.kind,
            reply: Some(self.broker.client_id().to_string()),
            pairs: None,
            keys: None,
        };

        self.send_monitor(Some(request_target), env.to_body());
    }

    /// Replies to a broadcast request: snapshots the full store under the
    /// read lock into one reply message and sends it to the receiver.
    pub fn broadcast_env_snapshot(&self, receiver: &str) {
        let pairs = {
            let store = self.store.read();
            envelope::encode_pairs(
                store
                    .entries
                    .iter()
                    .map(|(k, e)| (k.as_str(), e.value(), e.change_id())),
            )
        };

        let pairs = match pairs {
            Ok(p) => p,
            Err(e) => {
                debug!("msg=\"skipping broadcast reply\" subject={} err={e}", self.subject);
                return;
            }
        };

        let env = Envelope {
            cmd: EnvelopeCmd::BcReply,
            subject: self.subject.clone(),
            kind: self.kind,
            reply: None,
            pairs: Some(pairs),
            keys: None,
        };

        self.send_monitor(Some(receiver), env.to_body());
    }

    fn apply_set(&self, store: &mut SubjectStore, key: &str, value: &str) {
        self.change_id.fetch_add(1, Ordering::Relaxed);

        if let Some(entry) = store.entries.get_mut(key) {
            entry.set(value);
            return;
        }

        store.entries.insert(key.to_string(), SubjectEntry::new(value));

        // Insert callback of the queue flavor: remember the append order.
        if self.kind == SubjectKind::Queue {
            store.order.push_back(key.to_string());
            self.last_object_id.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn apply_delete(&self, store: &mut SubjectStore, key: &str) -> bool {
        if store.entries.shift_remove(key).is_none() {
            return false;
        }

        self.change_id.fetch_add(1, Ordering::Relaxed);

        if self.kind == SubjectKind::Queue {
            store.order.retain(|k| k != key);
        }

        true
    }

    fn send_monitor(&self, target: Option<&str>, body: String) {
        let msg = BrokerMessage {
            target: target.map(|t| t.to_string()),
            body,
            monitor: true,
            sender: self.broker.client_id().to_string(),
        };

        // Best-effort monitor traffic, failures stay local.
        let _ = self.broker.send(msg);
    }
}

impl std::fmt::Debug for SharedSubject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSubject")
            .field("subject", &self.subject)
            .field("kind", &self.kind)
            .field("size", &self.len())
            .field("change_id", &self.change_id())
            .finish()
    }
}

/// An open transaction on one subject.
///
/// Holds the per-subject transaction mutex for its whole lifetime, so
/// concurrent transactions serialize. Mutations apply to the store right
/// away; the keys marked for broadcast are batched and emitted as at most
/// one update plus one deletion message when [`SharedTransaction::close`]
/// runs. A guard dropped without closing aborts: the local mutations stand
/// but nothing goes on the wire.
pub struct SharedTransaction<'a> {
    subject: &'a SharedSubject,
    sets: Option<MutexGuard<'a, TxSets>>,
}

impl SharedTransaction<'_> {
    /// Stores a value; with `broadcast` the key joins the batched update.
    pub fn set(&mut self, key: &str, value: &str, broadcast: bool) {
        {
            let mut store = self.subject.store.write();
            self.subject.apply_set(&mut store, key, value);
        }

        if broadcast {
            let sets = self.sets.as_mut().expect("transaction is open");
            sets.updates.insert(key.to_string());
        }
    }

    /// Removes a key; with `broadcast` the key moves from the batched update
    /// into the batched deletion.
    pub fn delete(&mut self, key: &str, broadcast: bool) -> bool {
        let deleted = {
            let mut store = self.subject.store.write();
            self.subject.apply_delete(&mut store, key)
        };

        if deleted && broadcast {
            let sets = self.sets.as_mut().expect("transaction is open");
            sets.updates.remove(key);
            sets.deletions.insert(key.to_string());
        }

        deleted
    }

    /// Emits the batched messages and releases the transaction mutex.
    pub fn close(mut self) {
        self.flush();
    }

    fn flush(&mut self) {
        let Some(mut sets) = self.sets.take() else {
            return;
        };

        if !sets.updates.is_empty() {
            let pairs = {
                let store = self.subject.store.read();
                envelope::encode_pairs(sets.updates.iter().filter_map(|key| {
                    store
                        .entries
                        .get(key)
                        .map(|e| (key.as_str(), e.value(), e.change_id()))
                }))
            };

            match pairs {
                Ok(pairs) if !pairs.is_empty() => {
                    let env = Envelope {
                        cmd: EnvelopeCmd::Update,
                        subject: self.subject.subject.clone(),
                        kind: self.subject.kind,
                        reply: None,
                        pairs: Some(pairs),
                        keys: None,
                    };
                    self.subject
                        .send_monitor(Some(&self.subject.broadcast_queue()), env.to_body());
                }
                Ok(_) => {}
                Err(e) => debug!(
                    "msg=\"skipping update broadcast\" subject={} err={e}",
                    self.subject.subject
                ),
            }
        }

        if !sets.deletions.is_empty() {
            match envelope::encode_keys(sets.deletions.iter().map(|k| k.as_str())) {
                Ok(keys) => {
                    let env = Envelope {
                        cmd: EnvelopeCmd::Delete,
                        subject: self.subject.subject.clone(),
                        kind: self.subject.kind,
                        reply: None,
                        pairs: None,
                        keys: Some(keys),
                    };
                    self.subject
                        .send_monitor(Some(&self.subject.broadcast_queue()), env.to_body());
                }
                Err(e) => debug!(
                    "msg=\"skipping deletion broadcast\" subject={} err={e}",
                    self.subject.subject
                ),
            }
        }

        sets.updates.clear();
        sets.deletions.clear();
    }
}

impl Drop for SharedTransaction<'_> {
    fn drop(&mut self) {
        // An unclosed transaction is an abort, no message leaves the node.
        if let Some(mut sets) = self.sets.take() {
            sets.updates.clear();
            sets.deletions.clear();
        }
    }
}
