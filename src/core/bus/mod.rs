// src/core/bus/mod.rs

//! The shared-object bus.
//!
//! Maintains a local, eventually-consistent replica of named subjects whose
//! authoritative copy is held by some peer, disseminates local mutations as
//! monitor-class broker messages and reconciles full snapshots on demand.

pub mod broker;
pub mod entry;
pub mod envelope;
pub mod listener;
pub mod subject;

use crate::core::CoreError;
use broker::{BrokerMessage, SharedBroker};
use dashmap::DashMap;
use envelope::{Envelope, EnvelopeCmd, SubjectKind};
use std::sync::Arc;
use subject::SharedSubject;
use tracing::debug;

pub use broker::{ChannelBroker, MessageBroker};
pub use listener::BusListener;
pub use subject::SharedTransaction;

/// The registry of replicated subjects on this node.
///
/// Subject ids are globally unique across kinds. Incoming update and
/// broadcast-reply messages create unknown subjects on the fly; broadcast
/// requests and deletions never do.
pub struct SharedObjectManager {
    subjects: DashMap<String, Arc<SharedSubject>>,
    broker: SharedBroker,
}

impl SharedObjectManager {
    pub fn new(broker: SharedBroker) -> Self {
        Self {
            subjects: DashMap::new(),
            broker,
        }
    }

    pub fn broker(&self) -> &SharedBroker {
        &self.broker
    }

    /// Creates a subject. An existing subject only gets its broadcast queue
    /// refreshed; the call then reports `false`.
    pub fn create_subject(&self, id: &str, kind: SubjectKind, broadcast_queue: &str) -> bool {
        if let Some(existing) = self.subjects.get(id) {
            existing.set_broadcast_queue(broadcast_queue);
            return false;
        }

        let subject = Arc::new(SharedSubject::new(
            id,
            kind,
            broadcast_queue,
            Arc::clone(&self.broker),
        ));
        self.subjects.insert(id.to_string(), subject);
        true
    }

    /// Removes a subject. Idempotent.
    pub fn delete_subject(&self, id: &str) {
        self.subjects.remove(id);
    }

    pub fn get_subject(&self, id: &str) -> Option<Arc<SharedSubject>> {
        self.subjects.get(id).map(|s| Arc::clone(s.value()))
    }

    /// Stores a value into a subject.
    pub fn set(&self, id: &str, key: &str, value: &str) -> Result<(), CoreError> {
        let subject = self
            .get_subject(id)
            .ok_or_else(|| CoreError::NotFound(format!("unknown subject '{id}'")))?;
        subject.set(key, value);
        Ok(())
    }

    /// Removes a key from a subject.
    pub fn delete(&self, id: &str, key: &str) -> Result<bool, CoreError> {
        let subject = self
            .get_subject(id)
            .ok_or_else(|| CoreError::NotFound(format!("unknown subject '{id}'")))?;
        Ok(subject.delete(key))
    }

    pub fn get(&self, id: &str, key: &str) -> Option<String> {
        self.get_subject(id).and_then(|s| s.get(key))
    }

    /// Emits a broadcast request for a subject towards `request_target`.
    pub fn broadcast_request(&self, id: &str, request_target: &str) -> Result<(), CoreError> {
        let subject = self
            .get_subject(id)
            .ok_or_else(|| CoreError::NotFound(format!("unknown subject '{id}'")))?;
        subject.broadcast_request(request_target);
        Ok(())
    }

    /// One-line-per-subject summary of the local replica set.
    pub fn dump(&self) -> String {
        let mut out = String::new();

        for entry in self.subjects.iter() {
            let s = entry.value();
            out.push_str(&format!(
                "subject={} type={} broadcastqueue={} size={} changeid={}\n",
                s.subject(),
                s.kind(),
                s.broadcast_queue(),
                s.len(),
                s.change_id()
            ));
        }

        out
    }

    /// Applies one broker message to the local replica set.
    ///
    /// Update and broadcast-reply envelopes auto-create their subject; a
    /// broadcast reply resets the store before applying its pairs. Broadcast
    /// requests are answered with a full snapshot towards the reply address.
    pub fn parse_envelope(&self, msg: &BrokerMessage) -> Result<(), CoreError> {
        let env = Envelope::parse_body(&msg.body)?;

        match env.cmd {
            EnvelopeCmd::Update | EnvelopeCmd::BcReply => self.apply_update(&env),
            EnvelopeCmd::BcRequest => self.answer_broadcast_request(&env),
            EnvelopeCmd::Delete => self.apply_deletion(&env),
        }
    }

    fn lookup_checked(&self, env: &Envelope) -> Result<Arc<SharedSubject>, CoreError> {
        let subject = self.get_subject(&env.subject).ok_or_else(|| {
            CoreError::NotFound(format!(
                "{}: don't know this subject '{}'",
                env.cmd.as_str(),
                env.subject
            ))
        })?;

        if subject.kind() != env.kind {
            return Err(CoreError::Invalid(format!(
                "subject '{}' is a {}, message says {}",
                env.subject,
                subject.kind(),
                env.kind
            )));
        }

        Ok(subject)
    }

    fn apply_update(&self, env: &Envelope) -> Result<(), CoreError> {
        let pairs = env
            .pairs
            .as_deref()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| CoreError::Invalid("no pairs in message body".to_string()))?;
        let triples = envelope::parse_pairs(pairs)?;

        // Automatically create the subject if it does not exist. A late
        // joiner catches up through whatever update reaches it first.
        let subject = match self.get_subject(&env.subject) {
            Some(s) if s.kind() == env.kind => s,
            Some(_) => return self.lookup_checked(env).map(|_| ()),
            None => {
                self.create_subject(&env.subject, env.kind, "");
                self.get_subject(&env.subject)
                    .ok_or_else(|| CoreError::Internal("subject vanished on create".to_string()))?
            }
        };

        if env.cmd == EnvelopeCmd::BcReply {
            subject.clear();
        }

        for (key, value, _change_id) in &triples {
            debug!(
                "msg=\"applying update\" subject={} key={key}",
                env.subject
            );
            subject.set(key, value);
        }

        Ok(())
    }

    fn answer_broadcast_request(&self, env: &Envelope) -> Result<(), CoreError> {
        let reply = env
            .reply
            .as_deref()
            .filter(|r| !r.is_empty())
            .ok_or_else(|| CoreError::Invalid("bcrequest: no reply address present".to_string()))?;

        let subject = self.lookup_checked(env)?;
        subject.broadcast_env_snapshot(reply);
        Ok(())
    }

    fn apply_deletion(&self, env: &Envelope) -> Result<(), CoreError> {
        let keys = env
            .keys
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| CoreError::Invalid("no keys in message body".to_string()))?;

        let subject = self.lookup_checked(env)?;

        for key in envelope::parse_keys(keys) {
            debug!(
                "msg=\"applying deletion\" subject={} key={key}",
                env.subject
            );
            subject.delete(&key);
        }

        Ok(())
    }
}

impl std::fmt::Debug for SharedObjectManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedObjectManager")
            .field("subjects", &self.subjects.len())
            .finish()
    }
}
