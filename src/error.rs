//! Error types for host garbage collection

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type for host GC operations
pub type HostGcResult<T> = Result<T, HostGcError>;

/// Crate-wide error taxonomy.
///
/// Initialization errors are fatal and abort the run. Lock contention,
/// already-gone targets and per-object deletion failures are recoverable:
/// the cleanup engine records them and keeps going.
#[derive(Error, Debug)]
pub enum HostGcError {
    /// A subsystem failed to start; the run must abort
    #[error("initialization error: {0}")]
    Init(String),

    /// A named resource is held by another cooperating process
    #[error("lock contention on {resource}: held by {holder}")]
    LockContention { resource: String, holder: String },

    /// A named resource stayed busy past the acquisition deadline
    #[error("lock on {resource} not acquired within {timeout:?}")]
    LockTimeout { resource: String, timeout: Duration },

    /// Lock bookkeeping failed (unreadable metadata, release failure)
    #[error("lock error: {0}")]
    Lock(String),

    /// Delete target vanished between enumeration and deletion
    #[error("already gone: {0}")]
    AlreadyGone(String),

    /// The engine or filesystem refused a specific deletion
    #[error("failed to delete {object}: {message}")]
    Deletion { object: String, message: String },

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Container engine call failed
    #[error("container engine error: {0}")]
    Engine(String),

    /// Remote registry call failed
    #[error("registry error: {0}")]
    Registry(String),

    /// Local git helper failed
    #[error("git error: {0}")]
    Git(String),
}

impl HostGcError {
    /// Create an initialization error
    pub fn init<E: fmt::Display>(err: E) -> Self {
        Self::Init(err.to_string())
    }

    /// Create a lock bookkeeping error
    pub fn lock<E: fmt::Display>(err: E) -> Self {
        Self::Lock(err.to_string())
    }

    /// Create a deletion failure for a specific object
    pub fn deletion<O: fmt::Display, E: fmt::Display>(object: O, err: E) -> Self {
        Self::Deletion {
            object: object.to_string(),
            message: err.to_string(),
        }
    }

    /// Create a container engine error
    pub fn engine<E: fmt::Display>(err: E) -> Self {
        Self::Engine(err.to_string())
    }

    /// Create a registry error
    pub fn registry<E: fmt::Display>(err: E) -> Self {
        Self::Registry(err.to_string())
    }

    /// Create a git helper error
    pub fn git<E: fmt::Display>(err: E) -> Self {
        Self::Git(err.to_string())
    }

    /// Check if this error means the resource is busy (contention or timeout)
    pub fn is_contention(&self) -> bool {
        matches!(self, Self::LockContention { .. } | Self::LockTimeout { .. })
    }

    /// Check if this error means the target was already removed
    pub fn is_already_gone(&self) -> bool {
        matches!(self, Self::AlreadyGone(_))
    }

    /// Check if this error is fatal for the whole run
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Init(_))
    }
}

impl From<serde_json::Error> for HostGcError {
    fn from(err: serde_json::Error) -> Self {
        Self::Lock(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contention_classification() {
        let contention = HostGcError::LockContention {
            resource: "tmp/a".into(),
            holder: "123@host".into(),
        };
        let timeout = HostGcError::LockTimeout {
            resource: "tmp/a".into(),
            timeout: Duration::from_secs(30),
        };
        assert!(contention.is_contention());
        assert!(timeout.is_contention());
        assert!(!contention.is_fatal());
        assert!(!HostGcError::AlreadyGone("img".into()).is_contention());
    }

    #[test]
    fn init_errors_are_fatal() {
        assert!(HostGcError::init("no home dir").is_fatal());
        assert!(!HostGcError::deletion("c1", "busy").is_fatal());
    }

    #[test]
    fn already_gone_is_soft() {
        let err = HostGcError::AlreadyGone("container abc".into());
        assert!(err.is_already_gone());
        assert!(!err.is_fatal());
    }

    #[test]
    fn messages_carry_context() {
        let err = HostGcError::deletion("image sha256:12ab", "layer in use");
        assert_eq!(
            err.to_string(),
            "failed to delete image sha256:12ab: layer in use"
        );
    }
}
