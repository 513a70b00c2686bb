//! # hostgc
//!
//! Host-level garbage collector for a build tool's local machine state:
//! leftover containers and images from interrupted builds, stale
//! per-invocation tmp dirs, and the local git clone/worktree caches.
//!
//! Designed to run periodically and unattended while sibling invocations
//! (builds, deploys, other cleanups) run on the same host. Coexistence
//! rests on host-wide named advisory locks: every mutation of a shared
//! resource happens under the lock for that resource's name, so cleanup
//! skips or waits on objects a live operation is using.
//!
//! ## Modules
//!
//! - `config` - Per-process run configuration resolved from CLI and environment
//! - `workspace` - Process-wide directory layout, initialized before anything else
//! - `lock` - Host-wide named advisory lock manager
//! - `docker` - Container engine collaborator (trait + bollard client)
//! - `registry` - Remote registry collaborator
//! - `git` - Local version-control helper
//! - `cleanup` - The cleanup engine: per-category enumeration and guarded deletion
//! - `run` - Orchestration of one cleanup run
//! - `error` - Crate-wide error taxonomy

pub mod cleanup;
pub mod config;
pub mod docker;
pub mod error;
pub mod git;
pub mod lock;
pub mod registry;
pub mod run;
pub mod workspace;

pub use cleanup::{CleanupOptions, CleanupSummary, RetentionPolicy, StaleObjectCategory};
pub use config::{ConfigOverrides, RunConfiguration};
pub use error::{HostGcError, HostGcResult};
pub use lock::{HostLockManager, LockGuard};
pub use workspace::Workspace;
