// src/core/namespace/qos.rs

//! The QoS engine: class registry, classification and assignment.
//!
//! A QoS class is a named tuple of canonical layout properties. Retrieval
//! derives the equivalent class of an entity by matching its property tuple
//! against the registered classes; assignment schedules a layout conversion
//! for files and records a pending target for containers.

use super::NamespaceEngine;
use super::entity::{AccessMode, FileOrContainer, Identity};
use crate::core::CoreError;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Current QoS class name of an entity.
pub const ATTR_QOS_CLASS: &str = "user.eos.qos.class";
/// Pending target QoS class name.
pub const ATTR_QOS_TARGET: &str = "user.eos.qos.target";

/// The proc container receiving conversion marker entries.
pub const PROC_CONVERSION_PATH: &str = "/proc/conversion";

/// Compact layout identifier scheme.
///
/// bits 0..4   checksum id
/// bits 4..8   layout type
/// bits 8..16  number of stripes minus one
pub mod layout_id {
    pub const TYPE_PLAIN: u32 = 0;
    pub const TYPE_REPLICA: u32 = 1;
    pub const TYPE_RAID_DP: u32 = 2;
    pub const TYPE_RAID6: u32 = 3;
    pub const TYPE_QRAIN: u32 = 4;

    pub const CKS_NONE: u32 = 0;
    pub const CKS_ADLER: u32 = 1;
    pub const CKS_CRC32: u32 = 2;
    pub const CKS_CRC32C: u32 = 3;

    pub fn build(layout_type: u32, checksum: u32, nstripes: u32) -> u32 {
        (checksum & 0xf) | ((layout_type & 0xf) << 4) | ((nstripes.saturating_sub(1) & 0xff) << 8)
    }

    pub fn layout_type(lid: u32) -> u32 {
        (lid >> 4) & 0xf
    }

    pub fn checksum(lid: u32) -> u32 {
        lid & 0xf
    }

    pub fn nstripes(lid: u32) -> u32 {
        ((lid >> 8) & 0xff) + 1
    }

    pub fn layout_name(lid: u32) -> &'static str {
        match layout_type(lid) {
            TYPE_PLAIN => "plain",
            TYPE_REPLICA => "replica",
            TYPE_RAID_DP => "raiddp",
            TYPE_RAID6 => "raid6",
            TYPE_QRAIN => "qrain",
            _ => "unknown",
        }
    }

    pub fn checksum_name(lid: u32) -> &'static str {
        match checksum(lid) {
            CKS_NONE => "none",
            CKS_ADLER => "adler",
            CKS_CRC32 => "crc32",
            CKS_CRC32C => "crc32c",
            _ => "unknown",
        }
    }

    pub fn layout_type_by_name(name: &str) -> Option<u32> {
        match name {
            "plain" => Some(TYPE_PLAIN),
            "replica" => Some(TYPE_REPLICA),
            "raiddp" => Some(TYPE_RAID_DP),
            "raid6" => Some(TYPE_RAID6),
            "qrain" => Some(TYPE_QRAIN),
            _ => None,
        }
    }

    pub fn checksum_by_name(name: &str) -> Option<u32> {
        match name {
            "none" => Some(CKS_NONE),
            "adler" => Some(CKS_ADLER),
            "crc32" => Some(CKS_CRC32),
            "crc32c" => Some(CKS_CRC32C),
            _ => None,
        }
    }
}

/// A named set of canonical layout properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QosClass {
    pub name: String,
    pub layout: String,
    pub replica: u32,
    pub checksum: String,
    pub placement: String,
}

impl QosClass {
    /// The property tuple used for equivalence matching.
    fn tuple(&self) -> (String, u32, String, String) {
        (
            self.layout.clone(),
            self.replica,
            self.checksum.clone(),
            self.placement.clone(),
        )
    }
}

/// The registered QoS classes of the process, populated at bootstrap.
#[derive(Debug, Default)]
pub struct QosRegistry {
    classes: RwLock<BTreeMap<String, QosClass>>,
}

impl QosRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a class. Replica counts outside 1..=16 are rejected.
    pub fn register(&self, class: QosClass) -> Result<(), CoreError> {
        if class.replica == 0 || class.replica > 16 {
            return Err(CoreError::Invalid(format!(
                "QoS class '{}' has an illegal replica count {}",
                class.name, class.replica
            )));
        }

        if layout_id::layout_type_by_name(&class.layout).is_none() {
            return Err(CoreError::Invalid(format!(
                "QoS class '{}' names an unknown layout '{}'",
                class.name, class.layout
            )));
        }

        if layout_id::checksum_by_name(&class.checksum).is_none() {
            return Err(CoreError::Invalid(format!(
                "QoS class '{}' names an unknown checksum '{}'",
                class.name, class.checksum
            )));
        }

        self.classes.write().insert(class.name.clone(), class);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<QosClass> {
        self.classes.read().get(name).cloned()
    }

    pub fn list(&self) -> Vec<String> {
        self.classes.read().keys().cloned().collect()
    }

    /// Finds the class whose property tuple matches exactly.
    pub fn match_tuple(
        &self,
        layout: &str,
        replica: u32,
        checksum: &str,
        placement: &str,
    ) -> Option<String> {
        let wanted = (
            layout.to_string(),
            replica,
            checksum.to_string(),
            placement.to_string(),
        );

        self.classes
            .read()
            .values()
            .find(|c| c.tuple() == wanted)
            .map(|c| c.name.clone())
    }
}

impl NamespaceEngine {
    /// Returns the current QoS class of a path.
    ///
    /// A container without a stored class gets one derived from its enforced
    /// layout attributes; a successful derivation is persisted so the next
    /// call reads the attribute instead of re-deriving.
    pub fn qos_ls(&self, path: &str, _vid: &Identity) -> Result<String, CoreError> {
        let item = self.registry.resolve(path)?;

        match &item {
            FileOrContainer::File(file) => {
                if let Some(stored) = file.xattr(ATTR_QOS_CLASS) {
                    return Ok(stored);
                }

                let lid = file.layout_id();
                let placement = self.entity_placement(&item);
                Ok(self
                    .qos
                    .match_tuple(
                        layout_id::layout_name(lid),
                        layout_id::nstripes(lid),
                        layout_id::checksum_name(lid),
                        &placement,
                    )
                    .unwrap_or_else(|| "null".to_string()))
            }
            FileOrContainer::Container(cont) => {
                if let Some(stored) = cont.xattr(ATTR_QOS_CLASS) {
                    return Ok(stored);
                }

                let (layout, replica, checksum, placement) = self.container_tuple(&item);
                let matched = self.qos.match_tuple(&layout, replica, &checksum, &placement);

                if let Some(class) = matched {
                    // Persist the derived class so later calls short-circuit.
                    self.attr_set(path, ATTR_QOS_CLASS, &class, &Identity::root(), false)?;
                    return Ok(class);
                }

                Ok("null".to_string())
            }
        }
    }

    /// Returns the full QoS property map of a path.
    pub fn qos_get(
        &self,
        path: &str,
        vid: &Identity,
    ) -> Result<BTreeMap<String, String>, CoreError> {
        let item = self.registry.resolve(path)?;
        let mut out = BTreeMap::new();

        let (layout, replica, checksum, placement) = match &item {
            FileOrContainer::File(file) => {
                let lid = file.layout_id();
                (
                    layout_id::layout_name(lid).to_string(),
                    layout_id::nstripes(lid),
                    layout_id::checksum_name(lid).to_string(),
                    self.entity_placement(&item),
                )
            }
            FileOrContainer::Container(_) => self.container_tuple(&item),
        };

        out.insert("current_qos".to_string(), self.qos_ls(path, vid)?);
        out.insert(
            "target_qos".to_string(),
            item.xattr(ATTR_QOS_TARGET).unwrap_or_else(|| "null".to_string()),
        );
        out.insert("layout".to_string(), layout);
        out.insert("replica".to_string(), replica.to_string());
        out.insert("checksum".to_string(), checksum);
        out.insert("placement".to_string(), placement);
        Ok(out)
    }

    /// Assigns a QoS class.
    ///
    /// For a file a conversion job identifier is synthesized, a marker entry
    /// created in the proc conversion container and the pending target
    /// recorded; for a container only the target attribute is stored.
    /// Assigning the current class is refused.
    pub fn qos_set(
        &self,
        path: &str,
        vid: &Identity,
        class_name: &str,
    ) -> Result<String, CoreError> {
        let class = self
            .qos
            .get(class_name)
            .ok_or_else(|| CoreError::NotFound(format!("no such QoS class '{class_name}'")))?;

        let current = self.qos_ls(path, vid)?;
        if current == class.name {
            return Err(CoreError::Invalid(format!(
                "file already has QoS class '{class_name}'"
            )));
        }

        let item = self.registry.resolve(path)?;
        self.check_parent_wx(&item, vid)?;

        match &item {
            FileOrContainer::File(file) => {
                let layout_type = layout_id::layout_type_by_name(&class.layout)
                    .ok_or_else(|| CoreError::Invalid(format!("bad layout '{}'", class.layout)))?;
                let checksum = layout_id::checksum_by_name(&class.checksum)
                    .ok_or_else(|| CoreError::Invalid(format!("bad checksum '{}'", class.checksum)))?;
                let new_lid = layout_id::build(layout_type, checksum, class.replica);

                let policy = if class.placement.is_empty() {
                    String::new()
                } else {
                    format!("~{}", class.placement)
                };
                let conversion_id =
                    format!("{:016x}:{}#{:08x}{}", file.id(), self.space, new_lid, policy);

                // The marker entry in the proc filesystem drives the converter.
                self.registry.make_dir_p(PROC_CONVERSION_PATH, 0, 0)?;
                let marker = format!("{PROC_CONVERSION_PATH}/{conversion_id}");
                match self.registry.create_file(&marker, 0, 0, 0) {
                    Ok(_) | Err(CoreError::AlreadyExists(_)) => {}
                    Err(e) => return Err(e),
                }

                self.attr_set(path, ATTR_QOS_TARGET, &class.name, &Identity::root(), false)?;
                Ok(conversion_id)
            }
            FileOrContainer::Container(_) => {
                self.attr_set(path, ATTR_QOS_TARGET, &class.name, &Identity::root(), false)?;
                Ok(format!("{path}|{}", class.name))
            }
        }
    }

    /// The property tuple of a container, read from its enforced attributes.
    fn container_tuple(&self, item: &FileOrContainer) -> (String, u32, String, String) {
        let attrs = item.xattrs();
        let layout = attrs
            .get("sys.forced.layout")
            .cloned()
            .unwrap_or_else(|| "plain".to_string());
        let replica = attrs
            .get("sys.forced.nstripes")
            .and_then(|v| v.parse().ok())
            .unwrap_or(1);
        let checksum = attrs
            .get("sys.forced.checksum")
            .cloned()
            .unwrap_or_else(|| "none".to_string());
        let placement = attrs
            .get("sys.forced.placement")
            .cloned()
            .unwrap_or_else(|| "scattered".to_string());
        (layout, replica, checksum, placement)
    }

    /// Placement policy of an entity: its parent's enforced placement, or the
    /// scattered default.
    fn entity_placement(&self, item: &FileOrContainer) -> String {
        let parent = match item {
            FileOrContainer::File(f) => self.registry.get_container(f.cont_id()).ok(),
            FileOrContainer::Container(c) => self.registry.get_container(c.parent_id()).ok(),
        };

        parent
            .and_then(|p| p.xattr("sys.forced.placement"))
            .unwrap_or_else(|| "scattered".to_string())
    }

    /// W+X on the parent container, with token scope and privilege bypass.
    pub(crate) fn check_parent_wx(
        &self,
        item: &FileOrContainer,
        vid: &Identity,
    ) -> Result<(), CoreError> {
        if vid.has_token || vid.is_privileged() {
            return Ok(());
        }

        let parent_id = match item {
            FileOrContainer::File(f) => f.cont_id(),
            FileOrContainer::Container(c) => c.parent_id(),
        };

        let parent = self.registry.get_container(parent_id)?;
        let _lock = parent.read_lock();

        if parent.access(vid.uid, vid.gid, AccessMode::WRITE | AccessMode::EXEC) {
            return Ok(());
        }

        // An ACL write grant on the parent also opens the path.
        let effective = super::acl::container_acl(&parent.xattrs())?.evaluate(vid);
        if effective.write && effective.exec {
            return Ok(());
        }

        Err(CoreError::NotPermitted(format!(
            "no write permission on parent container {parent_id}"
        )))
    }
}
