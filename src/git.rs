//! Local version-control helper
//!
//! The clone and worktree caches are populated by `git` running as a
//! subprocess. Init verifies that a usable binary of a supported version
//! is on PATH so cleanup never races an unusable toolchain.

use std::path::Path;

use tokio::process::Command;
use tracing::debug;

use crate::error::{HostGcError, HostGcResult};

/// Oldest git version the cache layout supports
pub const MIN_GIT_VERSION: (u32, u32) = (2, 18);

/// Handle proving a usable git binary was found at init.
#[derive(Debug, Clone)]
pub struct GitHelper {
    version: (u32, u32),
}

impl GitHelper {
    /// Locate `git` and verify its version. Idempotent per process.
    pub async fn init() -> HostGcResult<Self> {
        let output = Command::new("git")
            .arg("version")
            .output()
            .await
            .map_err(|e| HostGcError::init(format!("failed to run git: {e}")))?;

        if !output.status.success() {
            return Err(HostGcError::init("git version exited with failure"));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let version = parse_git_version(&stdout).ok_or_else(|| {
            HostGcError::init(format!("unrecognized git version output: {}", stdout.trim()))
        })?;

        if version < MIN_GIT_VERSION {
            return Err(HostGcError::init(format!(
                "git {}.{} is too old, need at least {}.{}",
                version.0, version.1, MIN_GIT_VERSION.0, MIN_GIT_VERSION.1
            )));
        }

        debug!(major = version.0, minor = version.1, "git helper ready");
        Ok(Self { version })
    }

    /// Detected git version as (major, minor)
    pub fn version(&self) -> (u32, u32) {
        self.version
    }

    /// Check whether `path` is a bare repository (the shape of entries in
    /// the remote-clone cache).
    pub async fn is_bare_repo(&self, path: &Path) -> HostGcResult<bool> {
        let output = Command::new("git")
            .arg("-C")
            .arg(path)
            .args(["rev-parse", "--is-bare-repository"])
            .output()
            .await
            .map_err(HostGcError::git)?;

        if !output.status.success() {
            return Ok(false);
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim() == "true")
    }
}

/// Parse `git version 2.39.5 (Apple Git-154)` into (2, 39).
/// Pure helper, no I/O.
fn parse_git_version(output: &str) -> Option<(u32, u32)> {
    let rest = output.trim().strip_prefix("git version ")?;
    let mut parts = rest.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts
        .next()?
        .chars()
        .take_while(char::is_ascii_digit)
        .collect::<String>()
        .parse()
        .ok()?;
    Some((major, minor))
}
