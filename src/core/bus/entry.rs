// src/core/bus/entry.rs

//! A single value stored inside a shared subject.

use std::time::{SystemTime, UNIX_EPOCH};

/// One key's value together with its modification time and change counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectEntry {
    value: String,
    mtime_ns: u64,
    change_id: u64,
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

impl SubjectEntry {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            mtime_ns: now_ns(),
            change_id: 1,
        }
    }

    /// Assigns a new value, refreshing the timestamp and bumping the counter.
    pub fn set(&mut self, value: impl Into<String>) {
        self.value = value.into();
        self.mtime_ns = now_ns();
        self.change_id += 1;
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn change_id(&self) -> u64 {
        self.change_id
    }

    pub fn mtime_ns(&self) -> u64 {
        self.mtime_ns
    }

    /// Age of the entry since its last assignment.
    pub fn age_ms(&self) -> u64 {
        now_ns().saturating_sub(self.mtime_ns) / 1_000_000
    }

    /// One-line rendering used by the subject dump.
    pub fn dump(&self) -> String {
        format!(
            "age:{:.2} value:{} changeid:{}",
            self.age_ms() as f64 / 1000.0,
            self.value,
            self.change_id
        )
    }
}
