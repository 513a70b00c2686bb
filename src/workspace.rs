//! Process-wide workspace initialization
//!
//! Establishes the on-disk layout everything else depends on: the tmp root
//! for per-invocation service dirs and the home root holding locks and the
//! local caches. Must run before any other subsystem.

use std::path::{Path, PathBuf};

use anyhow::Context;
use tokio::fs;

use crate::config::RunConfiguration;
use crate::error::{HostGcError, HostGcResult};

/// Resolved workspace layout.
///
/// ```text
/// <tmp_root>/                 per-invocation service tmp dirs
/// <home_root>/locks/          host-wide advisory lock files
/// <home_root>/git/remotes/    remote git clone cache
/// <home_root>/git/worktrees/  working-tree checkout cache
/// ```
#[derive(Debug, Clone)]
pub struct Workspace {
    tmp_root: PathBuf,
    home_root: PathBuf,
}

impl Workspace {
    /// Initialize the workspace, creating every required directory.
    pub async fn init(config: &RunConfiguration) -> HostGcResult<Self> {
        let workspace = Self {
            tmp_root: config.tmp_root.clone(),
            home_root: config.home_root.clone(),
        };

        for dir in [
            workspace.tmp_root.clone(),
            workspace.locks_dir(),
            workspace.git_cache_dir(),
            workspace.worktree_cache_dir(),
        ] {
            fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("failed to create {}", dir.display()))
                .map_err(|e| HostGcError::init(format!("{e:#}")))?;
        }

        Ok(workspace)
    }

    /// Root for per-invocation service tmp dirs
    pub fn tmp_root(&self) -> &Path {
        &self.tmp_root
    }

    /// Root for persistent local state
    pub fn home_root(&self) -> &Path {
        &self.home_root
    }

    /// Directory holding host-wide lock files
    pub fn locks_dir(&self) -> PathBuf {
        self.home_root.join("locks")
    }

    /// Cache of remote git clones
    pub fn git_cache_dir(&self) -> PathBuf {
        self.home_root.join("git").join("remotes")
    }

    /// Cache of git working-tree checkouts
    pub fn worktree_cache_dir(&self) -> PathBuf {
        self.home_root.join("git").join("worktrees")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigOverrides;
    use tempfile::TempDir;

    fn test_config(root: &Path) -> RunConfiguration {
        RunConfiguration::resolve(ConfigOverrides {
            tmp_dir: Some(root.join("tmp")),
            home_dir: Some(root.join("home")),
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn init_creates_layout() {
        let root = TempDir::new().unwrap();
        let config = test_config(root.path());

        let workspace = Workspace::init(&config).await.unwrap();

        assert!(workspace.tmp_root().is_dir());
        assert!(workspace.locks_dir().is_dir());
        assert!(workspace.git_cache_dir().is_dir());
        assert!(workspace.worktree_cache_dir().is_dir());
    }

    #[tokio::test]
    async fn init_is_idempotent() {
        let root = TempDir::new().unwrap();
        let config = test_config(root.path());

        Workspace::init(&config).await.unwrap();
        Workspace::init(&config).await.unwrap();
    }

    #[tokio::test]
    async fn init_fails_when_root_is_a_file() {
        let root = TempDir::new().unwrap();
        let config = test_config(root.path());
        std::fs::write(root.path().join("home"), b"not a dir").unwrap();

        let err = Workspace::init(&config).await.unwrap_err();
        assert!(err.is_fatal());
    }
}
