// src/core/namespace/entity.rs

//! File and container metadata entities.
//!
//! Containers hold child maps of identifiers, files hold a parent identifier;
//! all cross-references go through the registry, never through owning
//! pointers.

use super::locking::{Lockable, ReadLockScope, WriteLockScope};
use bitflags::bitflags;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

pub type ContainerId = u64;
pub type FileId = u64;
pub type FsId = u32;

/// Reserved sentinel for tape-like archival media, excluded from drop-all
/// semantics.
pub const TAPE_FS_ID: FsId = u16::MAX as FsId;

bitflags! {
    /// POSIX-style access request bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessMode: u32 {
        const READ  = 0o4;
        const WRITE = 0o2;
        const EXEC  = 0o1;
    }
}

/// The identity a request acts under.
#[derive(Debug, Clone, Default)]
pub struct Identity {
    pub uid: u32,
    pub gid: u32,
    pub name: String,
    pub host: String,
    pub app: String,
    pub prot: String,
    pub sudoer: bool,
    /// Whether the request carries a token whose scope already authorized it.
    pub has_token: bool,
}

impl Identity {
    pub fn root() -> Self {
        Self {
            uid: 0,
            gid: 0,
            name: "root".to_string(),
            prot: "local".to_string(),
            sudoer: true,
            ..Default::default()
        }
    }

    pub fn user(uid: u32, gid: u32) -> Self {
        Self {
            uid,
            gid,
            name: uid.to_string(),
            prot: "local".to_string(),
            ..Default::default()
        }
    }

    pub fn is_privileged(&self) -> bool {
        self.sudoer || self.uid == 0
    }
}

pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

fn posix_access(uid: u32, gid: u32, o_uid: u32, o_gid: u32, mode: u32, req: AccessMode) -> bool {
    if uid == 0 {
        return true;
    }

    let shift = if uid == o_uid {
        6
    } else if gid == o_gid {
        3
    } else {
        0
    };

    (mode >> shift) & req.bits() == req.bits()
}

/// Container metadata payload.
#[derive(Debug, Clone)]
pub struct ContainerMd {
    pub id: ContainerId,
    pub parent_id: ContainerId,
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub ctime_ns: u64,
    pub mtime_ns: u64,
    pub xattrs: BTreeMap<String, String>,
    /// Child containers by name.
    pub containers: BTreeMap<String, ContainerId>,
    /// Child files by name.
    pub files: BTreeMap<String, FileId>,
}

impl ContainerMd {
    pub fn new(id: ContainerId, parent_id: ContainerId, name: impl Into<String>) -> Self {
        let now = now_ns();
        Self {
            id,
            parent_id,
            name: name.into(),
            uid: 0,
            gid: 0,
            mode: 0o755,
            ctime_ns: now,
            mtime_ns: now,
            xattrs: BTreeMap::new(),
            containers: BTreeMap::new(),
            files: BTreeMap::new(),
        }
    }

    /// POSIX permission check against the container mode bits.
    pub fn access(&self, uid: u32, gid: u32, req: AccessMode) -> bool {
        posix_access(uid, gid, self.uid, self.gid, self.mode, req)
    }
}

/// File metadata payload.
#[derive(Debug, Clone)]
pub struct FileMd {
    pub id: FileId,
    pub cont_id: ContainerId,
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub layout_id: u32,
    pub checksum: Vec<u8>,
    /// Live stripe locations.
    pub locations: Vec<FsId>,
    /// Unlinked locations pending physical deletion.
    pub unlinked_locations: Vec<FsId>,
    pub ctime_ns: u64,
    pub mtime_ns: u64,
    pub xattrs: BTreeMap<String, String>,
}

impl FileMd {
    pub fn new(id: FileId, cont_id: ContainerId, name: impl Into<String>) -> Self {
        let now = now_ns();
        Self {
            id,
            cont_id,
            name: name.into(),
            uid: 0,
            gid: 0,
            size: 0,
            layout_id: 0,
            checksum: Vec::new(),
            locations: Vec::new(),
            unlinked_locations: Vec::new(),
            ctime_ns: now,
            mtime_ns: now,
            xattrs: BTreeMap::new(),
        }
    }

    pub fn has_location(&self, fsid: FsId) -> bool {
        self.locations.contains(&fsid)
    }

    pub fn add_location(&mut self, fsid: FsId) {
        if !self.locations.contains(&fsid) {
            self.locations.push(fsid);
        }
    }

    /// Moves a location into the unlinked set.
    pub fn unlink_location(&mut self, fsid: FsId) {
        self.locations.retain(|&l| l != fsid);
        if !self.unlinked_locations.contains(&fsid) {
            self.unlinked_locations.push(fsid);
        }
    }

    /// Erases a location from both the live and the unlinked sets.
    pub fn remove_location(&mut self, fsid: FsId) {
        self.locations.retain(|&l| l != fsid);
        self.unlinked_locations.retain(|&l| l != fsid);
    }
}

/// A container entity: identifier plus its lock-guarded payload.
///
/// The identifier is replicated outside the lock so deterministic bulk
/// ordering never needs to peek into the payload.
#[derive(Debug)]
pub struct ContainerNode {
    id: ContainerId,
    md: Lockable<ContainerMd>,
}

impl ContainerNode {
    pub fn new(md: ContainerMd) -> Arc<Self> {
        Arc::new(Self {
            id: md.id,
            md: Lockable::new(md),
        })
    }

    pub fn id(&self) -> ContainerId {
        self.id
    }

    pub fn md(&self) -> &Lockable<ContainerMd> {
        &self.md
    }

    pub fn read_lock(&self) -> ReadLockScope<'_, ContainerMd> {
        self.md.read_lock()
    }

    pub fn write_lock(&self) -> WriteLockScope<'_, ContainerMd> {
        self.md.write_lock()
    }

    pub fn parent_id(&self) -> ContainerId {
        self.md.run_read_op(|c| c.parent_id)
    }

    pub fn name(&self) -> String {
        self.md.run_read_op(|c| c.name.clone())
    }

    pub fn owner(&self) -> (u32, u32) {
        self.md.run_read_op(|c| (c.uid, c.gid))
    }

    pub fn access(&self, uid: u32, gid: u32, req: AccessMode) -> bool {
        self.md.run_read_op(|c| c.access(uid, gid, req))
    }

    pub fn xattr(&self, key: &str) -> Option<String> {
        self.md.run_read_op(|c| c.xattrs.get(key).cloned())
    }

    pub fn has_xattr(&self, key: &str) -> bool {
        self.md.run_read_op(|c| c.xattrs.contains_key(key))
    }

    pub fn xattrs(&self) -> BTreeMap<String, String> {
        self.md.run_read_op(|c| c.xattrs.clone())
    }
}

/// A file entity: identifier plus its lock-guarded payload.
#[derive(Debug)]
pub struct FileNode {
    id: FileId,
    md: Lockable<FileMd>,
}

impl FileNode {
    pub fn new(md: FileMd) -> Arc<Self> {
        Arc::new(Self {
            id: md.id,
            md: Lockable::new(md),
        })
    }

    pub fn id(&self) -> FileId {
        self.id
    }

    pub fn md(&self) -> &Lockable<FileMd> {
        &self.md
    }

    pub fn read_lock(&self) -> ReadLockScope<'_, FileMd> {
        self.md.read_lock()
    }

    pub fn write_lock(&self) -> WriteLockScope<'_, FileMd> {
        self.md.write_lock()
    }

    pub fn cont_id(&self) -> ContainerId {
        self.md.run_read_op(|f| f.cont_id)
    }

    pub fn name(&self) -> String {
        self.md.run_read_op(|f| f.name.clone())
    }

    pub fn owner(&self) -> (u32, u32) {
        self.md.run_read_op(|f| (f.uid, f.gid))
    }

    pub fn size(&self) -> u64 {
        self.md.run_read_op(|f| f.size)
    }

    pub fn layout_id(&self) -> u32 {
        self.md.run_read_op(|f| f.layout_id)
    }

    pub fn locations(&self) -> Vec<FsId> {
        self.md.run_read_op(|f| f.locations.clone())
    }

    pub fn has_location(&self, fsid: FsId) -> bool {
        self.md.run_read_op(|f| f.has_location(fsid))
    }

    pub fn xattr(&self, key: &str) -> Option<String> {
        self.md.run_read_op(|f| f.xattrs.get(key).cloned())
    }

    pub fn has_xattr(&self, key: &str) -> bool {
        self.md.run_read_op(|f| f.xattrs.contains_key(key))
    }

    pub fn xattrs(&self) -> BTreeMap<String, String> {
        self.md.run_read_op(|f| f.xattrs.clone())
    }
}

/// A path resolution result: either a file or a container.
#[derive(Debug, Clone)]
pub enum FileOrContainer {
    File(Arc<FileNode>),
    Container(Arc<ContainerNode>),
}

impl FileOrContainer {
    /// The sort key of the deterministic bulk locking order: ascending
    /// identifier, containers before files on an identifier tie.
    fn order_key(&self) -> (u64, u8) {
        match self {
            FileOrContainer::Container(c) => (c.id(), 0),
            FileOrContainer::File(f) => (f.id(), 1),
        }
    }

    pub fn xattr(&self, key: &str) -> Option<String> {
        match self {
            FileOrContainer::File(f) => f.xattr(key),
            FileOrContainer::Container(c) => c.xattr(key),
        }
    }

    pub fn xattrs(&self) -> BTreeMap<String, String> {
        match self {
            FileOrContainer::File(f) => f.xattrs(),
            FileOrContainer::Container(c) => c.xattrs(),
        }
    }
}

/// One write guard of a bulk acquisition.
pub enum BulkWriteGuard<'a> {
    Container(WriteLockScope<'a, ContainerMd>),
    File(WriteLockScope<'a, FileMd>),
}

/// Write-locks a set of entities in the deterministic global order, using
/// try-lock on each and releasing everything on any failure before retrying.
pub fn write_lock_in_order(items: &[FileOrContainer]) -> Vec<BulkWriteGuard<'_>> {
    let mut sorted: Vec<&FileOrContainer> = items.iter().collect();
    sorted.sort_by_key(|i| i.order_key());
    sorted.dedup_by_key(|i| i.order_key());

    loop {
        let mut guards = Vec::with_capacity(sorted.len());
        let mut acquired_all = true;

        for item in &sorted {
            let guard = match item {
                FileOrContainer::Container(c) => {
                    c.md().try_write_lock().map(BulkWriteGuard::Container)
                }
                FileOrContainer::File(f) => f.md().try_write_lock().map(BulkWriteGuard::File),
            };

            match guard {
                Some(g) => guards.push(g),
                None => {
                    acquired_all = false;
                    break;
                }
            }
        }

        if acquired_all {
            return guards;
        }

        drop(guards);
        std::thread::yield_now();
    }
}
