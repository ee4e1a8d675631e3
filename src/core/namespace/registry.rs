// src/core/namespace/registry.rs

//! The entity registry: typed arenas for containers and files, path
//! resolution, the filesystem view and quota accounting.
//!
//! Containers reference children by identifier and files reference their
//! parent by identifier; every lookup goes through the registry, which keeps
//! the container/file graph free of ownership cycles.

use super::entity::{
    ContainerId, ContainerMd, ContainerNode, FileId, FileMd, FileNode, FileOrContainer,
};
use crate::core::CoreError;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

pub const ROOT_CONTAINER_ID: ContainerId = 1;

/// The opaque metadata store of the namespace.
#[derive(Debug)]
pub struct NamespaceRegistry {
    containers: DashMap<ContainerId, Arc<ContainerNode>>,
    files: DashMap<FileId, Arc<FileNode>>,
    next_container_id: AtomicU64,
    next_file_id: AtomicU64,
}

impl Default for NamespaceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NamespaceRegistry {
    pub fn new() -> Self {
        let registry = Self {
            containers: DashMap::new(),
            files: DashMap::new(),
            next_container_id: AtomicU64::new(ROOT_CONTAINER_ID + 1),
            next_file_id: AtomicU64::new(1),
        };

        let root = ContainerNode::new(ContainerMd::new(ROOT_CONTAINER_ID, ROOT_CONTAINER_ID, ""));
        registry.containers.insert(ROOT_CONTAINER_ID, root);
        registry
    }

    pub fn root(&self) -> Arc<ContainerNode> {
        self.containers
            .get(&ROOT_CONTAINER_ID)
            .map(|c| Arc::clone(c.value()))
            .expect("root container exists")
    }

    pub fn get_container(&self, id: ContainerId) -> Result<Arc<ContainerNode>, CoreError> {
        self.containers
            .get(&id)
            .map(|c| Arc::clone(c.value()))
            .ok_or_else(|| CoreError::NotFound(format!("no container with id {id}")))
    }

    pub fn get_file(&self, id: FileId) -> Result<Arc<FileNode>, CoreError> {
        self.files
            .get(&id)
            .map(|f| Arc::clone(f.value()))
            .ok_or_else(|| CoreError::NotFound(format!("no file with id {id}")))
    }

    /// Resolves a path to a container.
    pub fn resolve_container(&self, path: &str) -> Result<Arc<ContainerNode>, CoreError> {
        let mut current = self.root();

        for part in path.split('/').filter(|p| !p.is_empty()) {
            let child_id = current
                .md()
                .run_read_op(|c| c.containers.get(part).copied())
                .ok_or_else(|| CoreError::NotFound(format!("no such container '{path}'")))?;
            current = self.get_container(child_id)?;
        }

        Ok(current)
    }

    /// Resolves a path to a file.
    pub fn resolve_file(&self, path: &str) -> Result<Arc<FileNode>, CoreError> {
        let (parent_path, name) = split_path(path);
        let parent = self
            .resolve_container(parent_path)
            .map_err(|_| CoreError::NotFound(format!("no such file '{path}'")))?;

        let file_id = parent
            .md()
            .run_read_op(|c| c.files.get(name).copied())
            .ok_or_else(|| CoreError::NotFound(format!("no such file '{path}'")))?;
        self.get_file(file_id)
    }

    /// Resolves a path to an item, files taking precedence over containers of
    /// the same name.
    pub fn resolve(&self, path: &str) -> Result<FileOrContainer, CoreError> {
        if let Ok(file) = self.resolve_file(path) {
            return Ok(FileOrContainer::File(file));
        }

        self.resolve_container(path)
            .map(FileOrContainer::Container)
            .map_err(|_| CoreError::NotFound(format!("no such file or directory '{path}'")))
    }

    /// Reconstructs the absolute path of a container.
    pub fn container_uri(&self, container: &ContainerNode) -> Result<String, CoreError> {
        let mut parts = Vec::new();
        let mut current = self.get_container(container.id())?;

        while current.id() != ROOT_CONTAINER_ID {
            parts.push(current.name());
            current = self.get_container(current.parent_id())?;
        }

        parts.reverse();
        Ok(format!("/{}", parts.join("/")))
    }

    /// Reconstructs the absolute path of a file.
    pub fn file_uri(&self, file: &FileNode) -> Result<String, CoreError> {
        let parent = self.get_container(file.cont_id())?;
        let dir = self.container_uri(&parent)?;

        if dir == "/" {
            Ok(format!("/{}", file.name()))
        } else {
            Ok(format!("{dir}/{}", file.name()))
        }
    }

    /// Creates all missing containers along the path and returns the last one.
    pub fn make_dir_p(&self, path: &str, uid: u32, gid: u32) -> Result<Arc<ContainerNode>, CoreError> {
        let mut current = self.root();

        for part in path.split('/').filter(|p| !p.is_empty()) {
            let existing = current.md().run_read_op(|c| c.containers.get(part).copied());

            current = match existing {
                Some(id) => self.get_container(id)?,
                None => {
                    let id = self.next_container_id.fetch_add(1, Ordering::Relaxed);
                    let mut md = ContainerMd::new(id, current.id(), part);
                    md.uid = uid;
                    md.gid = gid;
                    let node = ContainerNode::new(md);
                    self.containers.insert(id, Arc::clone(&node));

                    current
                        .md()
                        .run_write_op(|c| c.containers.insert(part.to_string(), id));
                    node
                }
            };
        }

        Ok(current)
    }

    /// Creates a file under an existing parent container.
    pub fn create_file(
        &self,
        path: &str,
        uid: u32,
        gid: u32,
        layout_id: u32,
    ) -> Result<Arc<FileNode>, CoreError> {
        let (parent_path, name) = split_path(path);

        if name.is_empty() {
            return Err(CoreError::Invalid(format!("invalid file path '{path}'")));
        }

        let parent = self.resolve_container(parent_path)?;

        if parent.md().run_read_op(|c| c.files.contains_key(name)) {
            return Err(CoreError::AlreadyExists(format!("file exists: '{path}'")));
        }

        let id = self.next_file_id.fetch_add(1, Ordering::Relaxed);
        let mut md = FileMd::new(id, parent.id(), name);
        md.uid = uid;
        md.gid = gid;
        md.layout_id = layout_id;

        let node = FileNode::new(md);
        self.files.insert(id, Arc::clone(&node));
        parent
            .md()
            .run_write_op(|c| c.files.insert(name.to_string(), id));

        Ok(node)
    }

    /// Detaches a file from its parent and drops it from the arena.
    pub fn remove_file(&self, file: &FileNode) -> Result<(), CoreError> {
        let parent = self.get_container(file.cont_id())?;
        let name = file.name();
        parent.md().run_write_op(|c| c.files.remove(&name));
        self.files.remove(&file.id());
        Ok(())
    }

    /// Renames a file within its parent container. The caller is expected to
    /// hold the container write lock.
    pub fn rename_file(&self, file: &FileNode, new_name: &str) -> Result<(), CoreError> {
        let parent = self.get_container(file.cont_id())?;
        let old_name = file.name();

        parent.md().run_write_op(|c| {
            if let Some(id) = c.files.remove(&old_name) {
                c.files.insert(new_name.to_string(), id);
            }
        });

        file.md().run_write_op(|f| f.name = new_name.to_string());
        Ok(())
    }

    pub fn container_count(&self) -> usize {
        self.containers.len()
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }
}

/// Splits an absolute path into parent path and final component.
pub fn split_path(path: &str) -> (&str, &str) {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(pos) => (&trimmed[..pos.max(1)], &trimmed[pos + 1..]),
        None => ("/", trimmed),
    }
}

/// Configuration state of a filesystem, ordered by operational capability.
/// Commits are accepted from `Drain` upwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConfigStatus {
    Off,
    Empty,
    Drain,
    ReadOnly,
    ReadWrite,
}

/// One registered filesystem.
#[derive(Debug, Clone)]
pub struct FilesystemInfo {
    pub id: super::entity::FsId,
    pub host: String,
    pub port: u16,
    pub local_prefix: String,
    pub queue: String,
    pub config_status: ConfigStatus,
}

/// The filesystem view: registered filesystems plus the reverse index from
/// filesystem to resident files.
#[derive(Debug, Default)]
pub struct FsView {
    filesystems: DashMap<super::entity::FsId, FilesystemInfo>,
    file_index: DashMap<super::entity::FsId, HashSet<FileId>>,
}

impl FsView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, info: FilesystemInfo) {
        self.filesystems.insert(info.id, info);
    }

    pub fn lookup(&self, fsid: super::entity::FsId) -> Option<FilesystemInfo> {
        self.filesystems.get(&fsid).map(|f| f.value().clone())
    }

    pub fn set_config_status(&self, fsid: super::entity::FsId, status: ConfigStatus) {
        if let Some(mut fs) = self.filesystems.get_mut(&fsid) {
            fs.config_status = status;
        }
    }

    /// Records a file as resident on a filesystem.
    pub fn add_entry(&self, fsid: super::entity::FsId, fid: FileId) {
        self.file_index.entry(fsid).or_default().insert(fid);
    }

    /// Erases a residency entry. May need to materialize a lazily loaded
    /// view, so callers must not hold any namespace lock here.
    pub fn erase_entry(&self, fsid: super::entity::FsId, fid: FileId) {
        if let Some(mut files) = self.file_index.get_mut(&fsid) {
            files.remove(&fid);
        }
    }

    pub fn files_on(&self, fsid: super::entity::FsId) -> Vec<FileId> {
        self.file_index
            .get(&fsid)
            .map(|f| f.iter().copied().collect())
            .unwrap_or_default()
    }
}

/// Per-container quota accounting with remove-then-re-add rebalancing.
#[derive(Debug, Default)]
pub struct QuotaTracker {
    nodes: DashMap<ContainerId, (AtomicU64, AtomicU64)>,
}

impl QuotaTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&self, cont_id: ContainerId, size: u64) {
        let node = self.nodes.entry(cont_id).or_default();
        node.0.fetch_add(size, Ordering::Relaxed);
        node.1.fetch_add(1, Ordering::Relaxed);
    }

    pub fn remove_file(&self, cont_id: ContainerId, size: u64) {
        if let Some(node) = self.nodes.get(&cont_id) {
            node.0.fetch_sub(size.min(node.0.load(Ordering::Relaxed)), Ordering::Relaxed);
            let inodes = node.1.load(Ordering::Relaxed);
            node.1.fetch_sub(1.min(inodes), Ordering::Relaxed);
        }
    }

    /// Bytes and inodes accounted to a container.
    pub fn usage(&self, cont_id: ContainerId) -> (u64, u64) {
        self.nodes
            .get(&cont_id)
            .map(|n| (n.0.load(Ordering::Relaxed), n.1.load(Ordering::Relaxed)))
            .unwrap_or((0, 0))
    }
}
