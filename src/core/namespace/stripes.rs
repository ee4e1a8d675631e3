// src/core/namespace/stripes.rs

//! The stripe lifecycle: verify, drop, drop-all and replicate/move.

use super::attr::ATTR_FS_TRACKING;
use super::entity::{AccessMode, FileId, FsId, Identity, TAPE_FS_ID, now_ns};
use super::{NamespaceEngine, TrackerType};
use crate::core::CoreError;
use crate::core::audit::{AuditOperation, AuditRecord};
use std::sync::Arc;
use tracing::{debug, error, info};

/// A scheduled stripe transfer, executed by the transfer worker.
#[derive(Debug, Clone)]
pub struct TransferJob {
    pub id: uuid::Uuid,
    pub fid: FileId,
    pub source_fsid: FsId,
    pub target_fsid: FsId,
    pub drop_source: bool,
    pub app_tag: &'static str,
    pub vid: Identity,
}

impl TransferJob {
    /// Pulls the stripe onto the target filesystem and updates the metadata.
    /// Always clears the tracker entry, also on failure.
    pub async fn run(self, engine: &NamespaceEngine) {
        let outcome = self.transfer(engine).await;
        engine.fid_tracker.remove_entry(self.fid);

        match outcome {
            Ok(()) => info!(
                "msg=\"stripe transfer done\" app={} fxid={:08x} src_fsid={} dst_fsid={}",
                self.app_tag, self.fid, self.source_fsid, self.target_fsid
            ),
            Err(e) => error!(
                "msg=\"stripe transfer failed\" app={} fxid={:08x} err={e}",
                self.app_tag, self.fid
            ),
        }
    }

    async fn transfer(&self, engine: &NamespaceEngine) -> Result<(), CoreError> {
        let target = engine.fsview.lookup(self.target_fsid).ok_or_else(|| {
            CoreError::NotFound(format!("no filesystem with id {}", self.target_fsid))
        })?;

        let request = format!(
            "/?fst.pcmd=pull&mgm.fid={:08x}&mgm.sourcefsid={}&mgm.targetfsid={}&mgm.manager={}",
            self.fid, self.source_fsid, self.target_fsid, engine.manager_id
        );

        engine
            .storage_query
            .send_query(&target.host, target.port, &request)
            .await
            .map_err(|e| CoreError::Transport(format!("pull request failed: {e}")))?;

        // The stripe landed; register the new location before dropping the old.
        let file = engine.registry.get_file(self.fid)?;
        {
            let _lock = file.write_lock();
            file.md().run_write_op(|f| {
                f.add_location(self.target_fsid);
                if self.drop_source {
                    f.unlink_location(self.source_fsid);
                    append_fs_tracking(f, &format!("-{}", self.source_fsid));
                }
            });
        }

        engine.fsview.add_entry(self.target_fsid, self.fid);
        Ok(())
    }
}

/// Appends a membership token to the tracking attribute, in reduced form.
pub(crate) fn append_fs_tracking(f: &mut super::entity::FileMd, token: &str) {
    let current = f.xattrs.get(ATTR_FS_TRACKING).cloned().unwrap_or_default();
    f.xattrs
        .insert(ATTR_FS_TRACKING.to_string(), reduce_tracking(&current, token));
}

/// The tracking normal form: comma-separated tokens with consecutive
/// duplicates collapsed.
pub(crate) fn reduce_tracking(current: &str, token: &str) -> String {
    let mut tokens: Vec<&str> = current.split(',').filter(|t| !t.is_empty()).collect();

    if tokens.last() != Some(&token) {
        tokens.push(token);
    }

    tokens.join(",")
}

impl NamespaceEngine {
    /// Sends a verification request for one stripe of a file to the storage
    /// node owning the filesystem. Idempotent; never mutates metadata.
    pub async fn verify_stripe(
        &self,
        path: &str,
        vid: &Identity,
        fsid: FsId,
        options: &str,
    ) -> Result<(), CoreError> {
        let file = self.registry.resolve_file(path)?;
        self.verify_stripe_fid(file.id(), vid, fsid, options, path)
            .await
    }

    /// Same as [`NamespaceEngine::verify_stripe`], addressed by file id.
    pub async fn verify_stripe_fid(
        &self,
        fid: FileId,
        vid: &Identity,
        fsid: FsId,
        options: &str,
        ns_path: &str,
    ) -> Result<(), CoreError> {
        let file = self.registry.get_file(fid)?;

        let (cid, lid) = {
            let _lock = file.read_lock();
            (file.cont_id(), file.layout_id())
        };

        // Parent permission and attribute collection.
        let attrmap = {
            match self.registry.get_container(cid) {
                Ok(parent) => {
                    let _lock = parent.read_lock();

                    // A token scope does not authorize verification, and the
                    // parent must grant write and traversal.
                    if vid.has_token
                        || (!parent.access(vid.uid, vid.gid, AccessMode::WRITE | AccessMode::EXEC)
                            && !vid.is_privileged())
                    {
                        return Err(CoreError::NotPermitted(format!(
                            "verify stripe fid={fid}"
                        )));
                    }

                    parent.xattrs()
                }
                Err(_) => {
                    // Only root verifies a detached stripe.
                    if vid.uid != 0 {
                        return Err(CoreError::NotPermitted(format!(
                            "verify detached stripe fid={fid}"
                        )));
                    }
                    Default::default()
                }
            }
        };

        let fs = self.fsview.lookup(fsid).ok_or_else(|| {
            CoreError::NotFound(format!("filesystem {fsid} does not exist, fid={fid}"))
        })?;

        // Build the opaque verification request.
        let mut opaque = format!(
            "&mgm.localprefix={}&mgm.fid={:08x}&mgm.manager={}&mgm.access=verify&mgm.fsid={}",
            fs.local_prefix, fid, self.manager_id, fsid
        );

        if let Some(tag) = attrmap.get("user.tag") {
            opaque.push_str(&format!("&mgm.container={tag}"));
        }

        opaque.push_str(&format!("&mgm.cid={cid}&mgm.path={ns_path}&mgm.lid={lid}"));

        if !options.is_empty() {
            opaque.push_str(options);
        }

        let request = format!("/?fst.pcmd=verify{opaque}");

        self.storage_query
            .send_query(&fs.host, fs.port, &request)
            .await
            .map_err(|e| {
                error!(
                    "msg=\"unable to send verification message\" target={} err={e}",
                    fs.queue
                );
                CoreError::Transport(format!("verify stripe fid={fid}"))
            })?;

        Ok(())
    }

    /// Drops one stripe of a file.
    ///
    /// The soft variant unlinks the location and leaves it in the unlinked
    /// set; `force` removes it outright and erases the reverse filesystem
    /// index entry after the namespace lock is gone. Both append the
    /// membership change to the tracking attribute.
    pub fn drop_stripe(
        &self,
        path: &str,
        vid: &Identity,
        fsid: FsId,
        force: bool,
    ) -> Result<(), CoreError> {
        let file = self.registry.resolve_file(path)?;
        self.drop_stripe_fid(file.id(), vid, fsid, force, path)
    }

    /// Same as [`NamespaceEngine::drop_stripe`], addressed by file id.
    pub fn drop_stripe_fid(
        &self,
        fid: FileId,
        vid: &Identity,
        fsid: FsId,
        force: bool,
        path: &str,
    ) -> Result<(), CoreError> {
        debug!("msg=\"drop stripe\" path=\"{path}\" fxid={fid:08x} fsid={fsid}");
        let file = self.registry.get_file(fid)?;
        let cid = file.cont_id();

        self.check_stripe_perms(cid, vid, "drop stripe", path)?;

        {
            let _lock = file.write_lock();

            file.md().run_write_op(|f| {
                // A file whose only copy sits on tape is left alone.
                if f.locations == [TAPE_FS_ID] {
                    return Ok(());
                }

                if !force {
                    // We only unlink the location.
                    if !f.has_location(fsid) {
                        return Err(CoreError::NotFound(format!("drop stripe {path}")));
                    }

                    f.unlink_location(fsid);
                    append_fs_tracking(f, &format!("-{fsid}"));
                    debug!("msg=\"unlinking location\" fxid={fid:08x} fsid={fsid}");
                } else {
                    if f.has_location(fsid) {
                        f.unlink_location(fsid);
                        append_fs_tracking(f, &format!("-{fsid}"));
                    }

                    f.remove_location(fsid);
                    debug!("msg=\"unlinking and removing location\" fxid={fid:08x} fsid={fsid}");
                }

                f.ctime_ns = now_ns();
                Ok(())
            })?;
        }

        if force {
            // The reverse index may have to materialize a lazily loaded view,
            // so this must run outside the namespace lock.
            self.fsview.erase_entry(fsid, fid);
        }

        if let Some(audit) = &self.audit {
            let mut rec = AuditRecord::new(AuditOperation::DropStripe, path, vid);
            rec.target = format!("fsid:{fsid}");
            audit.record(&rec);
        }

        Ok(())
    }

    /// Drops all stripes of a file, skipping the tape sentinel. A file whose
    /// only location is tape is left alone.
    pub fn drop_all_stripes(
        &self,
        path: &str,
        vid: &Identity,
        force: bool,
    ) -> Result<(), CoreError> {
        debug!("msg=\"drop all stripes\" path=\"{path}\" force={force}");
        let file = self.registry.resolve_file(path)?;

        self.check_stripe_perms(file.cont_id(), vid, "drop all stripes", path)?;

        let _lock = file.write_lock();

        file.md().run_write_op(|f| {
            // If the file lives only on tape then don't touch it.
            if f.locations == [TAPE_FS_ID] {
                return;
            }

            for fsid in f.locations.clone() {
                if fsid == TAPE_FS_ID {
                    continue;
                }

                f.unlink_location(fsid);
                if force {
                    f.remove_location(fsid);
                }
                debug!("msg=\"unlinking location\" fxid={:08x} fsid={fsid}", f.id);
            }
        });

        Ok(())
    }

    /// Moves a stripe: replicate with source drop.
    pub fn move_stripe(
        &self,
        path: &str,
        vid: &Identity,
        source_fsid: FsId,
        target_fsid: FsId,
    ) -> Result<(), CoreError> {
        self.replicate_stripe(path, vid, source_fsid, target_fsid, true)
    }

    /// Copies a stripe to another filesystem.
    pub fn copy_stripe(
        &self,
        path: &str,
        vid: &Identity,
        source_fsid: FsId,
        target_fsid: FsId,
    ) -> Result<(), CoreError> {
        self.replicate_stripe(path, vid, source_fsid, target_fsid, false)
    }

    /// Schedules a stripe replication from source to target.
    ///
    /// The source location must exist and the target must not. The file id
    /// enters the deduplicating transfer tracker; a file already tracked is
    /// refused busy.
    pub fn replicate_stripe(
        &self,
        path: &str,
        vid: &Identity,
        source_fsid: FsId,
        target_fsid: FsId,
        drop_source: bool,
    ) -> Result<(), CoreError> {
        debug!(
            "msg=\"replicate stripe\" path=\"{path}\" src_fsid={source_fsid} dst_fsid={target_fsid} drop={drop_source}"
        );

        let file = self.registry.resolve_file(path)?;
        self.check_stripe_perms(file.cont_id(), vid, "replicate stripe", path)?;

        {
            let _lock = file.read_lock();

            if !file.has_location(source_fsid) {
                return Err(CoreError::NoSuchLocation(format!(
                    "no replica of '{path}' on filesystem {source_fsid}"
                )));
            }

            if file.has_location(target_fsid) {
                return Err(CoreError::AlreadyExists(format!(
                    "replica of '{path}' already on filesystem {target_fsid}"
                )));
            }
        }

        let fid = file.id();

        if !self.fid_tracker.add_entry(fid, TrackerType::Drain) {
            error!("msg=\"file already tracked\" fxid={fid:08x}");
            return Err(CoreError::Busy(format!(
                "replicate stripe - file already tracked {fid}"
            )));
        }

        self.schedule_transfer(TransferJob {
            id: uuid::Uuid::new_v4(),
            fid,
            source_fsid,
            target_fsid,
            drop_source,
            app_tag: if drop_source { "MoveStripe" } else { "CopyStripe" },
            vid: vid.clone(),
        });

        Ok(())
    }

    /// Parent W+X gate of the stripe mutations: a token scope does not
    /// qualify, a missing parent restricts the operation to root.
    fn check_stripe_perms(
        &self,
        cid: super::entity::ContainerId,
        vid: &Identity,
        op: &str,
        path: &str,
    ) -> Result<(), CoreError> {
        match self.registry.get_container(cid) {
            Ok(parent) => {
                let _lock = parent.read_lock();

                if vid.has_token
                    || (!parent.access(vid.uid, vid.gid, AccessMode::WRITE | AccessMode::EXEC)
                        && !vid.is_privileged())
                {
                    return Err(CoreError::NotPermitted(format!("{op} {path}")));
                }

                Ok(())
            }
            Err(_) => {
                // Missing parent container, only root touches detached files.
                if vid.uid != 0 {
                    return Err(CoreError::NotPermitted(format!("{op} detached {path}")));
                }
                Ok(())
            }
        }
    }
}

/// Spawn helper for [`TransferJob`] consumers: drains the job channel until
/// shutdown and runs each transfer to completion.
pub async fn transfer_worker(
    engine: Arc<NamespaceEngine>,
    mut jobs: tokio::sync::mpsc::UnboundedReceiver<TransferJob>,
    mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
) {
    debug!("msg=\"transfer worker started\"");

    loop {
        tokio::select! {
            job = jobs.recv() => {
                let Some(job) = job else {
                    return;
                };
                job.run(&engine).await;
            }
            _ = shutdown_rx.recv() => {
                info!("msg=\"transfer worker shutting down\"");
                return;
            }
        }
    }
}
