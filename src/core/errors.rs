// src/core/errors.rs

//! Defines the primary error type for the entire node.

use std::num::{ParseFloatError, ParseIntError};
use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the core.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
///
/// Every public boundary of the namespace engine and the shared-object bus
/// returns this type; the capability cipher is the one exception and collapses
/// its failures into an empty-string return instead.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("No such entry: {0}")]
    NotFound(String),

    #[error("No such attribute: {0}")]
    NoSuchAttribute(String),

    #[error("No such stripe location: {0}")]
    NoSuchLocation(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Operation not permitted: {0}")]
    NotPermitted(String),

    #[error("Parent is immutable: {0}")]
    Immutable(String),

    #[error("Invalid request: {0}")]
    Invalid(String),

    #[error("Authentication failure")]
    AuthFailure,

    #[error("Attribute lock held by another owner: {0}")]
    AttributeLocked(String),

    #[error("Resource busy: {0}")]
    Busy(String),

    /// Size disagreement between the committing storage node and the stored metadata.
    #[error("Commit size mismatch: {0}")]
    SizeMismatch(String),

    /// Checksum disagreement between the committing storage node and the stored metadata.
    #[error("Commit checksum mismatch: {0}")]
    ChecksumMismatch(String),

    /// The entity vanished between lookup and mutation.
    #[error("Identifier removed: {0}")]
    Gone(String),

    #[error("Out of space: {0}")]
    OutOfSpace(String),

    /// Broker or out-of-band peer unreachable. Never fatal.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Filesystem is in a non-operational state: {0}")]
    NonOperational(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Maps the error kind onto the POSIX errno value reported over the
    /// storage protocol surfaces.
    pub fn errno(&self) -> i32 {
        match self {
            CoreError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            CoreError::NotFound(_) => libc::ENOENT,
            CoreError::NoSuchAttribute(_) => libc::ENODATA,
            CoreError::NoSuchLocation(_) => libc::ENODATA,
            CoreError::AlreadyExists(_) => libc::EEXIST,
            CoreError::PermissionDenied(_) => libc::EACCES,
            CoreError::NotPermitted(_) => libc::EPERM,
            CoreError::Immutable(_) => libc::EPERM,
            CoreError::Invalid(_) => libc::EINVAL,
            CoreError::AuthFailure => libc::EACCES,
            CoreError::AttributeLocked(_) => libc::EBUSY,
            CoreError::Busy(_) => libc::ETXTBSY,
            CoreError::SizeMismatch(_) => libc::EBADE,
            CoreError::ChecksumMismatch(_) => libc::EBADR,
            CoreError::Gone(_) => libc::EIDRM,
            CoreError::OutOfSpace(_) => libc::ENOSPC,
            CoreError::Transport(_) => libc::ECOMM,
            CoreError::NonOperational(_) => libc::EIO,
            CoreError::Internal(_) => libc::EIO,
        }
    }
}

// Manual implementation of Clone because `std::io::Error` is not cloneable.
// We wrap it in an Arc to allow for cheap, shared cloning.
impl Clone for CoreError {
    fn clone(&self) -> Self {
        match self {
            CoreError::Io(e) => CoreError::Io(Arc::clone(e)),
            CoreError::NotFound(s) => CoreError::NotFound(s.clone()),
            CoreError::NoSuchAttribute(s) => CoreError::NoSuchAttribute(s.clone()),
            CoreError::NoSuchLocation(s) => CoreError::NoSuchLocation(s.clone()),
            CoreError::AlreadyExists(s) => CoreError::AlreadyExists(s.clone()),
            CoreError::PermissionDenied(s) => CoreError::PermissionDenied(s.clone()),
            CoreError::NotPermitted(s) => CoreError::NotPermitted(s.clone()),
            CoreError::Immutable(s) => CoreError::Immutable(s.clone()),
            CoreError::Invalid(s) => CoreError::Invalid(s.clone()),
            CoreError::AuthFailure => CoreError::AuthFailure,
            CoreError::AttributeLocked(s) => CoreError::AttributeLocked(s.clone()),
            CoreError::Busy(s) => CoreError::Busy(s.clone()),
            CoreError::SizeMismatch(s) => CoreError::SizeMismatch(s.clone()),
            CoreError::ChecksumMismatch(s) => CoreError::ChecksumMismatch(s.clone()),
            CoreError::Gone(s) => CoreError::Gone(s.clone()),
            CoreError::OutOfSpace(s) => CoreError::OutOfSpace(s.clone()),
            CoreError::Transport(s) => CoreError::Transport(s.clone()),
            CoreError::NonOperational(s) => CoreError::NonOperational(s.clone()),
            CoreError::Internal(s) => CoreError::Internal(s.clone()),
        }
    }
}

impl PartialEq for CoreError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (CoreError::Io(e1), CoreError::Io(e2)) => e1.to_string() == e2.to_string(),
            (CoreError::NotFound(s1), CoreError::NotFound(s2)) => s1 == s2,
            (CoreError::NoSuchAttribute(s1), CoreError::NoSuchAttribute(s2)) => s1 == s2,
            (CoreError::NoSuchLocation(s1), CoreError::NoSuchLocation(s2)) => s1 == s2,
            (CoreError::AlreadyExists(s1), CoreError::AlreadyExists(s2)) => s1 == s2,
            (CoreError::PermissionDenied(s1), CoreError::PermissionDenied(s2)) => s1 == s2,
            (CoreError::NotPermitted(s1), CoreError::NotPermitted(s2)) => s1 == s2,
            (CoreError::Immutable(s1), CoreError::Immutable(s2)) => s1 == s2,
            (CoreError::Invalid(s1), CoreError::Invalid(s2)) => s1 == s2,
            (CoreError::AttributeLocked(s1), CoreError::AttributeLocked(s2)) => s1 == s2,
            (CoreError::Busy(s1), CoreError::Busy(s2)) => s1 == s2,
            (CoreError::SizeMismatch(s1), CoreError::SizeMismatch(s2)) => s1 == s2,
            (CoreError::ChecksumMismatch(s1), CoreError::ChecksumMismatch(s2)) => s1 == s2,
            (CoreError::Gone(s1), CoreError::Gone(s2)) => s1 == s2,
            (CoreError::OutOfSpace(s1), CoreError::OutOfSpace(s2)) => s1 == s2,
            (CoreError::Transport(s1), CoreError::Transport(s2)) => s1 == s2,
            (CoreError::NonOperational(s1), CoreError::NonOperational(s2)) => s1 == s2,
            (CoreError::Internal(s1), CoreError::Internal(s2)) => s1 == s2,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        CoreError::Io(Arc::new(e))
    }
}

impl From<std::str::Utf8Error> for CoreError {
    fn from(e: std::str::Utf8Error) -> Self {
        CoreError::Invalid(format!("invalid utf-8: {e}"))
    }
}

impl From<std::string::FromUtf8Error> for CoreError {
    fn from(e: std::string::FromUtf8Error) -> Self {
        CoreError::Invalid(format!("invalid utf-8: {e}"))
    }
}

impl From<ParseIntError> for CoreError {
    fn from(e: ParseIntError) -> Self {
        CoreError::Invalid(format!("not an integer: {e}"))
    }
}

impl From<ParseFloatError> for CoreError {
    fn from(e: ParseFloatError) -> Self {
        CoreError::Invalid(format!("not a float: {e}"))
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Internal(format!("JSON serialization/deserialization error: {e}"))
    }
}
