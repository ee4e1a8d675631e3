// src/core/audit/mod.rs

//! The audit sink: append-only, line-oriented JSON records, compressed with
//! a streaming codec into time-bucketed segments.
//!
//! Writers are serialized by a mutex. Segment rotation happens on the write
//! path; after opening a segment an empty compression frame is flushed so a
//! tail reader can open the current file without error, and the stable
//! `audit.zstd` symlink is repointed. Failures are dropped at the record
//! level, auditing never fails an operation.

use crate::config::AuditConfig;
use crate::core::CoreError;
use crate::core::namespace::entity::Identity;
use chrono::{Local, TimeZone};
use parking_lot::Mutex;
use serde::Serialize;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, error, warn};

/// Name of the symlink pointing at the current segment.
const CURRENT_LINK: &str = "audit.zstd";

/// The audited operation classes.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditOperation {
    AttrSet,
    AttrRm,
    Commit,
    DropStripe,
    ReplicateStripe,
    QosSet,
}

/// A before/after metadata summary.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatSummary {
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
    pub mtime_ns: u64,
}

/// One attribute change triple.
#[derive(Debug, Clone, Serialize)]
pub struct AttrChange {
    pub name: String,
    pub before: String,
    pub after: String,
}

/// One structured audit record, serialized as a single JSON line.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub timestamp: u64,
    pub operation: AuditOperation,
    pub path: String,
    pub account: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub client_host: String,
    pub auth_mechanism: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub uuid: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub tid: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub app: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub svc: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<StatSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<StatSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attr: Option<AttrChange>,
    pub version: String,
}

impl AuditRecord {
    pub fn new(operation: AuditOperation, path: &str, vid: &Identity) -> Self {
        let account = if !vid.name.is_empty() {
            vid.name.clone()
        } else {
            vid.uid.to_string()
        };

        Self {
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            operation,
            path: path.to_string(),
            account,
            client_host: vid.host.clone(),
            auth_mechanism: if vid.prot.is_empty() {
                "local".to_string()
            } else {
                vid.prot.clone()
            },
            uuid: String::new(),
            tid: String::new(),
            app: vid.app.clone(),
            svc: String::new(),
            target: String::new(),
            before: None,
            after: None,
            attr: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

struct SegmentWriter {
    encoder: zstd::stream::write::Encoder<'static, File>,
    segment_start: u64,
}

/// The audit sink.
pub struct AuditSink {
    base_dir: PathBuf,
    rotation_seconds: u64,
    compression_level: i32,
    writer: Mutex<Option<SegmentWriter>>,
}

impl AuditSink {
    /// Opens the sink. An uncreatable base directory is fatal.
    pub fn new(cfg: &AuditConfig) -> Result<Self, CoreError> {
        let base_dir = PathBuf::from(&cfg.base_dir);

        std::fs::create_dir_all(&base_dir).map_err(|e| {
            CoreError::Invalid(format!(
                "cannot create audit directory '{}': {e}",
                base_dir.display()
            ))
        })?;

        Ok(Self {
            base_dir,
            rotation_seconds: cfg.rotation_seconds.max(1),
            compression_level: cfg.compression_level,
            writer: Mutex::new(None),
        })
    }

    /// Appends one record. Failures are logged and the record is dropped.
    pub fn record(&self, record: &AuditRecord) {
        let mut line = match serde_json::to_string(record) {
            Ok(json) => json,
            Err(e) => {
                error!("msg=\"failed to serialize audit record\" err={e}");
                return;
            }
        };
        line.push('\n');

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let mut writer = self.writer.lock();
        self.rotate_if_needed(&mut writer, now);

        let Some(segment) = writer.as_mut() else {
            // Failed to open a segment, drop the record.
            return;
        };

        if let Err(e) = segment.encoder.write_all(line.as_bytes()) {
            error!("msg=\"audit write error\" err={e}");
            return;
        }

        // Flush so small records are visible immediately.
        if let Err(e) = segment.encoder.flush() {
            warn!("msg=\"audit flush error\" err={e}");
        }
    }

    fn rotate_if_needed(&self, writer: &mut Option<SegmentWriter>, now: u64) {
        let segment_start = now - (now % self.rotation_seconds);

        if let Some(current) = writer.as_ref()
            && current.segment_start == segment_start
        {
            return;
        }

        // Close the current segment, finishing the compression frame.
        if let Some(old) = writer.take()
            && let Err(e) = old.encoder.finish()
        {
            warn!("msg=\"error finishing audit segment\" err={e}");
        }

        *writer = self.open_segment(segment_start);
    }

    fn open_segment(&self, segment_start: u64) -> Option<SegmentWriter> {
        let path = self.segment_path(segment_start);

        let file = match File::create(&path) {
            Ok(f) => f,
            Err(e) => {
                error!(
                    "msg=\"cannot open audit file\" path=\"{}\" err={e}",
                    path.display()
                );
                return None;
            }
        };

        let mut encoder = match zstd::stream::write::Encoder::new(file, self.compression_level) {
            Ok(enc) => enc,
            Err(e) => {
                error!("msg=\"cannot create zstd encoder\" err={e}");
                return None;
            }
        };

        // Make a valid frame header visible right away so tail readers do not
        // fail on an empty, freshly rotated file.
        if let Err(e) = encoder.flush() {
            warn!("msg=\"zstd header flush error\" err={e}");
        }

        self.repoint_symlink(&path);
        debug!("msg=\"opened audit segment\" path=\"{}\"", path.display());

        Some(SegmentWriter {
            encoder,
            segment_start,
        })
    }

    fn segment_path(&self, segment_start: u64) -> PathBuf {
        let name = Local
            .timestamp_opt(segment_start as i64, 0)
            .single()
            .map(|t| t.format("audit-%Y%m%d-%H%M%S.zst").to_string())
            .unwrap_or_else(|| "audit-unknown.zst".to_string());

        self.base_dir.join(name)
    }

    /// Repoints `audit.zstd` to the current segment, best-effort.
    fn repoint_symlink(&self, target: &Path) {
        let link = self.base_dir.join(CURRENT_LINK);
        let _ = std::fs::remove_file(&link);

        if let Err(e) = std::os::unix::fs::symlink(target, &link) {
            debug!("msg=\"cannot update audit symlink\" err={e}");
        }
    }
}

impl Drop for AuditSink {
    fn drop(&mut self) {
        if let Some(old) = self.writer.lock().take()
            && let Err(e) = old.encoder.finish()
        {
            warn!("msg=\"error finishing audit segment on close\" err={e}");
        }
    }
}

impl std::fmt::Debug for AuditSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditSink")
            .field("base_dir", &self.base_dir)
            .field("rotation_seconds", &self.rotation_seconds)
            .finish()
    }
}
