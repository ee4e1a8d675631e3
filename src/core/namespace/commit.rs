// src/core/namespace/commit.rs

//! The storage-node commit protocol.
//!
//! When a storage node reports a completed write, the engine validates the
//! filesystem state and the advertised metadata, rebalances quota, registers
//! the new location and finalizes atomic or chunked uploads by renaming the
//! temporary name under the container write lock.

use super::NamespaceEngine;
use super::entity::{FileId, FsId, Identity, now_ns};
use super::registry::ConfigStatus;
use crate::core::CoreError;
use crate::core::audit::{AuditOperation, AuditRecord};
use tracing::{debug, info};

/// Suffix given to a displaced previous version of an atomic target; a
/// background pass removes such entries later.
const DELETE_SUFFIX: &str = ".delete";

/// Everything a storage node advertises when committing a write.
#[derive(Debug, Clone)]
pub struct CommitArgs {
    pub fsid: FsId,
    pub fid: FileId,
    /// Logical (final) path of the upload.
    pub path: String,
    pub size: u64,
    pub checksum: Vec<u8>,
    pub mtime_ns: u64,
    /// Whether size and checksum must agree with the stored metadata.
    pub is_replica: bool,
    pub commit_size: bool,
    pub commit_checksum: bool,
    /// Sibling location to drop after a successful commit.
    pub drop_fsid: Option<FsId>,
    /// The upload used a sentinel-suffixed temporary name.
    pub atomic: bool,
    /// The upload is one chunk of a chunked upload.
    pub oc_chunk: bool,
    /// Chunk counter carried in the flags field.
    pub oc_chunk_n: u32,
    /// Whether this chunk closes the chunked upload.
    pub oc_done: bool,
}

impl CommitArgs {
    pub fn replica(fsid: FsId, fid: FileId, path: impl Into<String>, size: u64) -> Self {
        Self {
            fsid,
            fid,
            path: path.into(),
            size,
            checksum: Vec::new(),
            mtime_ns: now_ns(),
            is_replica: true,
            commit_size: true,
            commit_checksum: false,
            drop_fsid: None,
            atomic: false,
            oc_chunk: false,
            oc_chunk_n: 0,
            oc_done: false,
        }
    }
}

impl NamespaceEngine {
    /// Applies one commit report.
    pub fn commit(&self, args: &CommitArgs, vid: &Identity) -> Result<(), CoreError> {
        debug!(
            "msg=\"commit\" fxid={:08x} fsid={} size={} checksum={} occhunk={} ocdone={}",
            args.fid,
            args.fsid,
            args.size,
            hex::encode(&args.checksum),
            args.oc_chunk,
            args.oc_done
        );

        // The target filesystem must still accept completing writes.
        let fs = self.fsview.lookup(args.fsid);
        match fs {
            Some(fs) if fs.config_status >= ConfigStatus::Drain => {}
            _ => {
                return Err(CoreError::NonOperational(format!(
                    "commit file metadata - filesystem {} is in a non-operational state",
                    args.fsid
                )));
            }
        }

        let file = self
            .registry
            .get_file(args.fid)
            .map_err(|_| CoreError::Gone("commit - file is already removed".to_string()))?;

        // The advertised path must still name the same file. During an atomic
        // upload the file carries its temporary name, so the check is skipped.
        if !args.atomic
            && let Ok(by_path) = self.registry.resolve_file(&args.path)
            && by_path.id() != args.fid
        {
            return Err(CoreError::Invalid(format!(
                "commit - file id is wrong {}",
                args.path
            )));
        }

        let cid = file.cont_id();

        {
            let _lock = file.write_lock();

            file.md().run_write_op(|f| {
                // For a replica layout the storage node must agree with the
                // stored metadata; a disagreeing location is discarded.
                if f.id != args.fid {
                    return Err(CoreError::Invalid("commit - file id is wrong".to_string()));
                }

                if args.is_replica {
                    if args.commit_size && args.size != f.size {
                        f.unlink_location(args.fsid);
                        f.remove_location(args.fsid);
                        return Err(CoreError::SizeMismatch(
                            "commit replica - file size is wrong".to_string(),
                        ));
                    }

                    if args.commit_checksum && !f.checksum.is_empty() && args.checksum != f.checksum
                    {
                        f.unlink_location(args.fsid);
                        f.remove_location(args.fsid);
                        return Err(CoreError::ChecksumMismatch(
                            "commit replica - file checksum is wrong".to_string(),
                        ));
                    }
                }

                // Quota is rebalanced by removing the old accounting and
                // adding the new one.
                self.quota.remove_file(f.cont_id, f.size);

                if args.commit_size && !args.is_replica {
                    f.size = args.size;
                }
                if args.commit_checksum && !args.is_replica {
                    f.checksum = args.checksum.clone();
                }
                f.mtime_ns = args.mtime_ns;

                self.quota.add_file(f.cont_id, f.size);

                f.add_location(args.fsid);

                if let Some(drop_fsid) = args.drop_fsid {
                    f.unlink_location(drop_fsid);
                }

                Ok(())
            })?;
        }

        self.fsview.add_entry(args.fsid, args.fid);

        // An atomic upload materializes its final name on commit; a chunked
        // upload only on its final chunk.
        if args.atomic && (!args.oc_chunk || args.oc_done) {
            self.finalize_atomic(&file, &args.path)?;
        }

        self.notifier.publish(args.fid, cid);

        if let Some(audit) = &self.audit {
            let mut rec = AuditRecord::new(AuditOperation::Commit, &args.path, vid);
            rec.target = format!("fsid:{}", args.fsid);
            audit.record(&rec);
        }

        Ok(())
    }

    /// Renames the temporary upload name onto the final one under the
    /// container write lock, moving a pre-existing final entry aside for
    /// asynchronous removal.
    fn finalize_atomic(
        &self,
        file: &super::entity::FileNode,
        final_path: &str,
    ) -> Result<(), CoreError> {
        let (_, final_name) = super::registry::split_path(final_path);

        if final_name.is_empty() {
            return Err(CoreError::Invalid(format!(
                "commit - invalid final path '{final_path}'"
            )));
        }

        if file.name() == final_name {
            return Ok(());
        }

        let parent = self.registry.get_container(file.cont_id())?;

        // Container before file, the process-wide lock order.
        let _parent_lock = parent.write_lock();
        let _file_lock = file.write_lock();

        let existing_id = parent
            .md()
            .run_read_op(|c| c.files.get(final_name).copied());

        if let Some(existing_id) = existing_id
            && existing_id != file.id()
        {
            // Swap the previous version aside; a background pass deletes it.
            let existing = self.registry.get_file(existing_id)?;
            let delete_name = format!("{final_name}{DELETE_SUFFIX}");
            self.registry.rename_file(&existing, &delete_name)?;
            info!(
                "msg=\"moved previous version aside\" path={final_path} aside={delete_name}"
            );
        }

        self.registry.rename_file(file, final_name)?;
        info!(
            "msg=\"de-atomize file\" fxid={:08x} final_name={final_name}",
            file.id()
        );

        Ok(())
    }
}
