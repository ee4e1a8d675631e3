// src/core/namespace/acl.rs

//! Access-control-list parsing, validation and evaluation.
//!
//! An ACL string is a comma-separated list of `<target>:<who>:<perms>`
//! entries. Targets are `u:` (user id), `g:` (group id), `egroup:` (named
//! group) and `z:` (everyone). Permissions come from `rwxmduqci` with `!`
//! negating the modification-class flags, e.g. `u:1001:rwx!d`.
//!
//! Storage is canonical: identities are numeric, `+d`/`+u` input forms are
//! folded into their plain flags. Evaluation folds matching entries in order,
//! later matches overriding earlier ones.

use super::entity::Identity;
use crate::core::CoreError;

/// One parsed permission set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AclPerms {
    pub read: bool,
    pub write: bool,
    pub exec: bool,
    pub chmod: bool,
    pub chown: bool,
    pub quota: bool,
    pub immutable: bool,
    /// Explicit `!d`: forbids deletion even when a write grant exists.
    pub deny_delete: bool,
    /// Explicit `d` grant.
    pub allow_delete: bool,
    /// Explicit `!u`: forbids updates to existing files.
    pub deny_update: bool,
    pub allow_update: bool,
    pub deny_chmod: bool,
}

/// Who an entry applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AclTarget {
    User(u32),
    Group(u32),
    EGroup(String),
    All,
}

/// One ACL entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclEntry {
    pub target: AclTarget,
    pub perms: AclPerms,
}

/// A parsed, canonical ACL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Acl {
    entries: Vec<AclEntry>,
}

impl Acl {
    /// Parses and validates an ACL string. User and group identities must be
    /// numeric in canonical form; symbolic names are rejected here and must
    /// be translated before they reach the attribute store.
    pub fn parse(input: &str) -> Result<Self, CoreError> {
        let mut entries = Vec::new();

        for rule in input.split(',').filter(|r| !r.is_empty()) {
            entries.push(Self::parse_entry(rule)?);
        }

        Ok(Self { entries })
    }

    fn parse_entry(rule: &str) -> Result<AclEntry, CoreError> {
        let bad = || CoreError::Invalid(format!("illegal ACL entry '{rule}'"));
        let mut fields = rule.split(':');
        let tag = fields.next().ok_or_else(bad)?;

        let (target, perms_str) = match tag {
            "z" => (AclTarget::All, fields.next().ok_or_else(bad)?),
            "u" | "g" | "egroup" => {
                let who = fields.next().ok_or_else(bad)?;
                let perms = fields.next().ok_or_else(bad)?;

                let target = match tag {
                    "u" => AclTarget::User(who.parse().map_err(|_| bad())?),
                    "g" => AclTarget::Group(who.parse().map_err(|_| bad())?),
                    _ => {
                        if who.is_empty() {
                            return Err(bad());
                        }
                        AclTarget::EGroup(who.to_string())
                    }
                };
                (target, perms)
            }
            _ => return Err(bad()),
        };

        if fields.next().is_some() {
            return Err(bad());
        }

        Ok(AclEntry {
            target,
            perms: Self::parse_perms(perms_str).ok_or_else(bad)?,
        })
    }

    fn parse_perms(s: &str) -> Option<AclPerms> {
        let mut perms = AclPerms::default();
        let mut negate = false;
        let mut grant = false;

        for c in s.chars() {
            match c {
                '!' => {
                    negate = true;
                    continue;
                }
                // Legacy grant prefix, `+d` == `d`.
                '+' => {
                    grant = true;
                    continue;
                }
                'r' if !negate => perms.read = true,
                'w' if !negate => perms.write = true,
                'x' if !negate => perms.exec = true,
                'm' => {
                    if negate {
                        perms.deny_chmod = true;
                    } else {
                        perms.chmod = true;
                    }
                }
                'd' => {
                    if negate {
                        perms.deny_delete = true;
                    } else {
                        perms.allow_delete = true;
                    }
                }
                'u' => {
                    if negate {
                        perms.deny_update = true;
                    } else {
                        perms.allow_update = true;
                    }
                }
                'q' if !negate => perms.quota = true,
                'c' if !negate => perms.chown = true,
                'i' if !negate => perms.immutable = true,
                _ => return None,
            }

            negate = false;
            grant = false;
        }

        // A trailing modifier with nothing to modify is illegal.
        if negate || grant {
            return None;
        }

        Some(perms)
    }

    /// Renders the canonical numeric-id representation.
    pub fn canonical(&self) -> String {
        let mut parts = Vec::with_capacity(self.entries.len());

        for entry in &self.entries {
            let who = match &entry.target {
                AclTarget::User(uid) => format!("u:{uid}"),
                AclTarget::Group(gid) => format!("g:{gid}"),
                AclTarget::EGroup(name) => format!("egroup:{name}"),
                AclTarget::All => "z".to_string(),
            };

            let p = &entry.perms;
            let mut flags = String::new();
            if p.read {
                flags.push('r');
            }
            if p.write {
                flags.push('w');
            }
            if p.exec {
                flags.push('x');
            }
            if p.chmod {
                flags.push('m');
            }
            if p.deny_chmod {
                flags.push_str("!m");
            }
            if p.allow_delete {
                flags.push('d');
            }
            if p.deny_delete {
                flags.push_str("!d");
            }
            if p.allow_update {
                flags.push('u');
            }
            if p.deny_update {
                flags.push_str("!u");
            }
            if p.quota {
                flags.push('q');
            }
            if p.chown {
                flags.push('c');
            }
            if p.immutable {
                flags.push('i');
            }

            parts.push(format!("{who}:{flags}"));
        }

        parts.join(",")
    }

    /// Folds the entries matching the identity into one effective permission
    /// set. Later matching entries override earlier ones field by field.
    pub fn evaluate(&self, id: &Identity) -> AclPerms {
        let mut effective = AclPerms::default();

        for entry in &self.entries {
            let matches = match &entry.target {
                AclTarget::User(uid) => *uid == id.uid,
                AclTarget::Group(gid) => *gid == id.gid,
                AclTarget::EGroup(name) => *name == id.name,
                AclTarget::All => true,
            };

            if !matches {
                continue;
            }

            let p = &entry.perms;
            effective.read |= p.read;
            effective.write |= p.write;
            effective.exec |= p.exec;
            effective.chmod |= p.chmod;
            effective.chown |= p.chown;
            effective.quota |= p.quota;
            effective.immutable |= p.immutable;
            effective.allow_delete |= p.allow_delete;
            effective.allow_update |= p.allow_update;

            if p.deny_delete {
                effective.deny_delete = true;
                effective.allow_delete = false;
            }
            if p.deny_update {
                effective.deny_update = true;
                effective.allow_update = false;
            }
            if p.deny_chmod {
                effective.deny_chmod = true;
                effective.chmod = false;
            }
        }

        effective
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The single deletion rule unifying the historical evaluation paths:
/// deletion needs an effective write grant (ACL write or explicit `d`) and
/// no explicit `!d` for the evaluating identity; the entity owner keeps
/// deletion rights regardless of `!d`.
pub fn may_delete(effective: &AclPerms, identity: &Identity, owner_uid: u32) -> bool {
    if identity.uid == owner_uid || identity.is_privileged() {
        return true;
    }

    (effective.write || effective.allow_delete) && !effective.deny_delete
}

/// Builds the effective ACL of a container from its attributes: the system
/// ACL rules first, the user ACL appended when `sys.eval.useracl` enables it.
pub fn container_acl(
    xattrs: &std::collections::BTreeMap<String, String>,
) -> Result<Acl, CoreError> {
    let mut entries = Vec::new();

    if let Some(sys_acl) = xattrs.get("sys.acl") {
        entries.extend(Acl::parse(sys_acl)?.entries);
    }

    if xattrs.contains_key("sys.eval.useracl")
        && let Some(user_acl) = xattrs.get("user.acl")
    {
        entries.extend(Acl::parse(user_acl)?.entries);
    }

    Ok(Acl { entries })
}
