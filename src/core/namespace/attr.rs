// src/core/namespace/attr.rs

//! Extended-attribute transactions.

use super::NamespaceEngine;
use super::acl::{self, Acl};
use super::entity::{FileOrContainer, Identity, now_ns};
use crate::core::CoreError;
use crate::core::audit::{AttrChange, AuditOperation, AuditRecord};
use std::collections::BTreeMap;

/// Never listed and never returned.
pub const ATTR_OBFUSCATE_KEY: &str = "user.obfuscate.key";
/// Writes to the ETag attribute do not touch ctime.
pub const ATTR_ETAG_KEY: &str = "sys.tmp.etag";
/// Holds the identity owning the attribute lock of an entity.
pub const ATTR_LOCK_KEY: &str = "sys.attr.lock";
/// Append-only history of filesystem membership changes.
pub const ATTR_FS_TRACKING: &str = "sys.fs.tracking";

/// Prefix of attributes a parent container enforces on its children.
const FORCED_PREFIX: &str = "sys.forced.";

impl NamespaceEngine {
    /// Lists the attributes of a path. For files the parent's enforced
    /// `sys.forced.*` values are folded in unless overridden.
    pub fn attr_ls(
        &self,
        path: &str,
        _vid: &Identity,
    ) -> Result<BTreeMap<String, String>, CoreError> {
        let item = self.registry.resolve(path)?;
        let mut attrs = item.xattrs();

        if let FileOrContainer::File(file) = &item {
            let parent = self.registry.get_container(file.cont_id())?;
            for (key, value) in parent.xattrs() {
                if key.starts_with(FORCED_PREFIX) && !attrs.contains_key(&key) {
                    attrs.insert(key, value);
                }
            }
        }

        // The obfuscation key never leaves the namespace.
        attrs.remove(ATTR_OBFUSCATE_KEY);
        Ok(attrs)
    }

    /// Returns one attribute value.
    pub fn attr_get(&self, path: &str, key: &str, _vid: &Identity) -> Result<String, CoreError> {
        if key == ATTR_OBFUSCATE_KEY {
            return Err(CoreError::NoSuchAttribute(format!("{path}#{key}")));
        }

        let item = self.registry.resolve(path)?;
        item.xattr(key)
            .ok_or_else(|| CoreError::NoSuchAttribute(format!("{path}#{key}")))
    }

    /// Sets one attribute value.
    ///
    /// `sys.*` keys need a privileged identity, `user.*` keys the entity
    /// owner. An exclusive set fails on an existing attribute, ACL values are
    /// canonicalized before storage and the refresh notification goes out
    /// after every lock is released.
    pub fn attr_set(
        &self,
        path: &str,
        key: &str,
        value: &str,
        vid: &Identity,
        exclusive: bool,
    ) -> Result<(), CoreError> {
        if !(key.starts_with("sys.") || key.starts_with("user.")) || key.len() <= 5 {
            return Err(CoreError::Invalid(format!("illegal attribute name '{key}'")));
        }

        self.check_parent_mutable(&item_parent_id(&self.registry, path)?, vid)?;

        // ACL strings are stored in canonical numeric form.
        let value = if key == "sys.acl" || key == "user.acl" {
            Acl::parse(value)?.canonical()
        } else {
            value.to_string()
        };

        let item = self.registry.resolve(path)?;
        let (id, parent_id, before) = match &item {
            FileOrContainer::Container(cont) => {
                let _lock = cont.write_lock();
                let before = cont.md().run_write_op(|c| {
                    Self::check_attr_mutation(&c.xattrs, c.uid, key, vid, exclusive)?;
                    let before = c.xattrs.insert(key.to_string(), value.clone());
                    if key != ATTR_ETAG_KEY {
                        c.ctime_ns = now_ns();
                    }
                    Ok::<_, CoreError>(before)
                })?;
                (cont.id(), cont.parent_id(), before)
            }
            FileOrContainer::File(file) => {
                let _lock = file.write_lock();
                let before = file.md().run_write_op(|f| {
                    Self::check_attr_mutation(&f.xattrs, f.uid, key, vid, exclusive)?;
                    let before = f.xattrs.insert(key.to_string(), value.clone());
                    if key != ATTR_ETAG_KEY {
                        f.ctime_ns = now_ns();
                    }
                    Ok::<_, CoreError>(before)
                })?;
                (file.id(), file.cont_id(), before)
            }
        };

        // The refresh goes out after the object lock is gone.
        self.notifier.publish(id, parent_id);

        if let Some(audit) = &self.audit {
            let mut rec = AuditRecord::new(AuditOperation::AttrSet, path, vid);
            rec.attr = Some(AttrChange {
                name: key.to_string(),
                before: before.unwrap_or_default(),
                after: if key == ATTR_OBFUSCATE_KEY {
                    String::new()
                } else {
                    value
                },
            });
            audit.record(&rec);
        }

        Ok(())
    }

    /// Removes one attribute.
    pub fn attr_rm(&self, path: &str, key: &str, vid: &Identity) -> Result<(), CoreError> {
        self.check_parent_mutable(&item_parent_id(&self.registry, path)?, vid)?;

        let item = self.registry.resolve(path)?;
        let (id, parent_id, before) = match &item {
            FileOrContainer::Container(cont) => {
                let _lock = cont.write_lock();
                let before = cont.md().run_write_op(|c| {
                    Self::check_attr_mutation(&c.xattrs, c.uid, key, vid, false)?;
                    let before = c
                        .xattrs
                        .remove(key)
                        .ok_or_else(|| CoreError::NoSuchAttribute(format!("{path}#{key}")))?;
                    c.ctime_ns = now_ns();
                    Ok::<_, CoreError>(before)
                })?;
                (cont.id(), cont.parent_id(), before)
            }
            FileOrContainer::File(file) => {
                let _lock = file.write_lock();
                let before = file.md().run_write_op(|f| {
                    Self::check_attr_mutation(&f.xattrs, f.uid, key, vid, false)?;
                    let before = f
                        .xattrs
                        .remove(key)
                        .ok_or_else(|| CoreError::NoSuchAttribute(format!("{path}#{key}")))?;
                    f.ctime_ns = now_ns();
                    Ok::<_, CoreError>(before)
                })?;
                (file.id(), file.cont_id(), before)
            }
        };

        self.notifier.publish(id, parent_id);

        if let Some(audit) = &self.audit {
            let mut rec = AuditRecord::new(AuditOperation::AttrRm, path, vid);
            rec.attr = Some(AttrChange {
                name: key.to_string(),
                before: if key == ATTR_OBFUSCATE_KEY {
                    String::new()
                } else {
                    before
                },
                after: String::new(),
            });
            audit.record(&rec);
        }

        Ok(())
    }

    /// The shared gate in front of every attribute mutation.
    fn check_attr_mutation(
        xattrs: &BTreeMap<String, String>,
        owner_uid: u32,
        key: &str,
        vid: &Identity,
        exclusive: bool,
    ) -> Result<(), CoreError> {
        // The reserved prefix is writable only with privilege.
        if key.starts_with("sys.") && !vid.is_privileged() {
            return Err(CoreError::NotPermitted(format!(
                "attribute '{key}' requires a privileged identity"
            )));
        }

        if !key.starts_with("sys.") && vid.uid != owner_uid && !vid.is_privileged() {
            return Err(CoreError::NotPermitted(format!(
                "attribute '{key}' is writable only by the owner"
            )));
        }

        // A foreign attribute lock freezes the entity.
        if let Some(lock_owner) = xattrs.get(ATTR_LOCK_KEY)
            && key != ATTR_LOCK_KEY
            && !vid.is_privileged()
            && lock_owner != &vid.uid.to_string()
        {
            return Err(CoreError::AttributeLocked(format!(
                "attribute lock held by uid {lock_owner}"
            )));
        }

        if exclusive && xattrs.contains_key(key) {
            return Err(CoreError::AlreadyExists(format!(
                "exclusive set for existing attribute '{key}'"
            )));
        }

        Ok(())
    }

    /// Refuses mutation under a parent marked immutable by ACL.
    fn check_parent_mutable(
        &self,
        parent_id: &super::entity::ContainerId,
        vid: &Identity,
    ) -> Result<(), CoreError> {
        let parent = self.registry.get_container(*parent_id)?;
        let effective = acl::container_acl(&parent.xattrs())?.evaluate(vid);

        if effective.immutable && !vid.is_privileged() {
            return Err(CoreError::Immutable(format!(
                "container {} is immutable",
                parent_id
            )));
        }

        Ok(())
    }
}

/// Parent container id of whatever the path resolves to.
fn item_parent_id(
    registry: &super::registry::NamespaceRegistry,
    path: &str,
) -> Result<super::entity::ContainerId, CoreError> {
    match registry.resolve(path)? {
        FileOrContainer::File(f) => Ok(f.cont_id()),
        FileOrContainer::Container(c) => Ok(c.parent_id()),
    }
}
