//! Top-level orchestration of a host cleanup run
//!
//! Initializes every shared subsystem in dependency order, then hands off
//! to the cleanup engine. The first initializer to fail aborts the run;
//! nothing is deleted before every collaborator is ready.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tracing::info;

use crate::cleanup::{CleanupEngine, CleanupOptions, CleanupSummary, RetentionPolicy};
use crate::config::RunConfiguration;
use crate::docker::DockerClient;
use crate::git::GitHelper;
use crate::lock::HostLockManager;
use crate::registry::RegistryClient;
use crate::workspace::Workspace;

/// Execute one cleanup run with the given configuration.
///
/// Order matters: the workspace establishes the paths everything else
/// lives under, the lock manager needs the lock directory, and the
/// clients must all be up before the engine starts touching shared state.
pub async fn run(config: &RunConfiguration) -> Result<CleanupSummary> {
    let started = Instant::now();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        dry_run = config.dry_run,
        "host cleanup starting"
    );

    let workspace = Workspace::init(config).await?;
    let locks = HostLockManager::init(workspace.locks_dir())?;
    let git = GitHelper::init().await?;
    let registry = RegistryClient::init(config.allow_insecure_registry)?;
    let docker = DockerClient::init(config)?;

    info!(
        git_version = format!("{}.{}", git.version().0, git.version().1),
        insecure_registry = registry.allows_insecure(),
        docker_auth = docker.docker_config().is_some(),
        "subsystems initialized"
    );

    let engine = CleanupEngine::new(
        Arc::new(docker),
        locks,
        workspace,
        RetentionPolicy::default(),
    );
    let summary = engine
        .host_cleanup(CleanupOptions {
            dry_run: config.dry_run,
        })
        .await;

    info!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        removed = summary.total_removed(),
        "host cleanup finished"
    );

    Ok(summary)
}
