//! Cleanup engine: enumerate stale objects and remove them under lock
//!
//! Each category enumerates candidates, applies its staleness predicate,
//! then takes the per-candidate host lock before touching anything. A
//! candidate whose lock is busy is in active use by a sibling process and
//! is skipped; a candidate that vanished is counted as already done. The
//! run is best-effort: individual failures are recorded in the report and
//! never abort the remaining candidates or categories.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::docker::ContainerEngine;
use crate::error::{HostGcError, HostGcResult};
use crate::lock::{HostLockManager, LockGuard};
use crate::workspace::Workspace;

/// How long to wait for a candidate's lock before skipping it.
/// Short on purpose: a busy resource means a live operation owns it.
const CANDIDATE_LOCK_TIMEOUT: Duration = Duration::from_millis(500);

/// Options consumed by [`CleanupEngine::host_cleanup`]
#[derive(Debug, Clone, Copy, Default)]
pub struct CleanupOptions {
    /// Report candidates without mutating anything
    pub dry_run: bool,
}

/// Staleness thresholds per category.
///
/// Defaults suit a periodic unattended job; cooperating tools must agree
/// on the same order of magnitude or cleanup will race their working set.
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    /// Service tmp dirs left by interrupted invocations
    pub tmp_dirs: chrono::Duration,
    /// Remote-clone and worktree cache entries
    pub caches: chrono::Duration,
    /// Leftover service containers
    pub containers: chrono::Duration,
    /// Dangling managed images
    pub images: chrono::Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            tmp_dirs: chrono::Duration::hours(2),
            caches: chrono::Duration::days(14),
            containers: chrono::Duration::hours(48),
            images: chrono::Duration::hours(48),
        }
    }
}

/// Categories of stale objects the engine knows how to collect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleObjectCategory {
    Containers,
    Images,
    TmpDirs,
    GitCache,
    WorktreeCache,
}

impl StaleObjectCategory {
    /// All categories in processing order
    pub const ALL: [Self; 5] = [
        Self::Containers,
        Self::Images,
        Self::TmpDirs,
        Self::GitCache,
        Self::WorktreeCache,
    ];

    /// Category label used in reports
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Containers => "containers",
            Self::Images => "images",
            Self::TmpDirs => "tmp dirs",
            Self::GitCache => "git cache",
            Self::WorktreeCache => "worktree cache",
        }
    }

    /// Lock-name prefix for candidates of this category
    fn lock_prefix(&self) -> &'static str {
        match self {
            Self::Containers => "container",
            Self::Images => "image",
            Self::TmpDirs => "tmp",
            Self::GitCache => "git-cache",
            Self::WorktreeCache => "worktree-cache",
        }
    }
}

/// Outcome for one category
#[derive(Debug, Clone)]
pub struct CategoryReport {
    pub category: StaleObjectCategory,
    /// Candidates examined
    pub scanned: usize,
    /// Objects removed, or that would be removed in dry-run
    pub removed: Vec<String>,
    /// Candidates skipped because a sibling process holds their lock
    pub skipped_in_use: usize,
    /// Bytes freed (filesystem categories only)
    pub bytes_reclaimed: u64,
    /// Non-fatal errors encountered along the way
    pub errors: Vec<String>,
}

impl CategoryReport {
    fn new(category: StaleObjectCategory) -> Self {
        Self {
            category,
            scanned: 0,
            removed: Vec::new(),
            skipped_in_use: 0,
            bytes_reclaimed: 0,
            errors: Vec::new(),
        }
    }
}

/// Aggregated outcome of one cleanup run
#[derive(Debug, Clone)]
pub struct CleanupSummary {
    pub dry_run: bool,
    pub reports: Vec<CategoryReport>,
}

impl CleanupSummary {
    /// True when nothing was (or would be) removed and nothing failed
    pub fn is_empty(&self) -> bool {
        self.reports
            .iter()
            .all(|r| r.removed.is_empty() && r.errors.is_empty())
    }

    /// Total bytes freed across filesystem categories
    pub fn total_bytes_reclaimed(&self) -> u64 {
        self.reports.iter().map(|r| r.bytes_reclaimed).sum()
    }

    /// Total removed (or would-remove) count
    pub fn total_removed(&self) -> usize {
        self.reports.iter().map(|r| r.removed.len()).sum()
    }
}

impl fmt::Display for CleanupSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = if self.dry_run { "would remove" } else { "removed" };
        for report in &self.reports {
            writeln!(
                f,
                "{}: scanned {}, {} {}, {} in use{}",
                report.category.as_str(),
                report.scanned,
                verb,
                report.removed.len(),
                report.skipped_in_use,
                if report.errors.is_empty() {
                    String::new()
                } else {
                    format!(", {} errors", report.errors.len())
                }
            )?;
            for name in &report.removed {
                writeln!(f, "  {verb} {name}")?;
            }
            for err in &report.errors {
                writeln!(f, "  error: {err}")?;
            }
        }
        write!(
            f,
            "total: {} {} objects, {}",
            verb,
            self.total_removed(),
            format_bytes(self.total_bytes_reclaimed())
        )
    }
}

/// Format a byte count for the summary
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.2} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.2} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// The cleanup engine, wired with the collaborators it needs.
pub struct CleanupEngine {
    engine: Arc<dyn ContainerEngine>,
    locks: HostLockManager,
    workspace: Workspace,
    policy: RetentionPolicy,
}

impl CleanupEngine {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        locks: HostLockManager,
        workspace: Workspace,
        policy: RetentionPolicy,
    ) -> Self {
        Self {
            engine,
            locks,
            workspace,
            policy,
        }
    }

    /// Run every category, best-effort. A category that fails to
    /// enumerate records the failure in its report and the run moves on;
    /// only the aggregated summary comes back.
    pub async fn host_cleanup(&self, options: CleanupOptions) -> CleanupSummary {
        let mut reports = Vec::with_capacity(StaleObjectCategory::ALL.len());

        for category in StaleObjectCategory::ALL {
            let report = match category {
                StaleObjectCategory::Containers => self.clean_containers(options).await,
                StaleObjectCategory::Images => self.clean_images(options).await,
                StaleObjectCategory::TmpDirs => {
                    self.clean_cache_dir(
                        category,
                        self.workspace.tmp_root(),
                        self.policy.tmp_dirs,
                        options,
                    )
                    .await
                }
                StaleObjectCategory::GitCache => {
                    self.clean_cache_dir(
                        category,
                        &self.workspace.git_cache_dir(),
                        self.policy.caches,
                        options,
                    )
                    .await
                }
                StaleObjectCategory::WorktreeCache => {
                    self.clean_cache_dir(
                        category,
                        &self.workspace.worktree_cache_dir(),
                        self.policy.caches,
                        options,
                    )
                    .await
                }
            };

            info!(
                category = category.as_str(),
                scanned = report.scanned,
                removed = report.removed.len(),
                skipped = report.skipped_in_use,
                errors = report.errors.len(),
                "category processed"
            );
            reports.push(report);
        }

        CleanupSummary {
            dry_run: options.dry_run,
            reports,
        }
    }

    /// Take the candidate's lock, or classify why we should not touch it.
    async fn guard_candidate(
        &self,
        category: StaleObjectCategory,
        identifier: &str,
        report: &mut CategoryReport,
    ) -> Option<LockGuard> {
        let resource = format!("{}/{}", category.lock_prefix(), identifier);
        match self
            .locks
            .acquire_timeout(&resource, CANDIDATE_LOCK_TIMEOUT)
            .await
        {
            Ok(guard) => Some(guard),
            Err(e) if e.is_contention() => {
                debug!(resource, "candidate in use, skipping");
                report.skipped_in_use += 1;
                None
            }
            Err(e) => {
                report.errors.push(format!("{resource}: {e}"));
                None
            }
        }
    }

    async fn clean_containers(&self, options: CleanupOptions) -> CategoryReport {
        let mut report = CategoryReport::new(StaleObjectCategory::Containers);
        let cutoff = Utc::now() - self.policy.containers;

        let containers = match self.engine.list_service_containers().await {
            Ok(containers) => containers,
            Err(e) => {
                report.errors.push(format!("listing containers: {e}"));
                return report;
            }
        };

        for container in containers {
            report.scanned += 1;
            if container.created_at >= cutoff {
                continue;
            }

            let Some(_guard) = self
                .guard_candidate(StaleObjectCategory::Containers, &container.name, &mut report)
                .await
            else {
                continue;
            };

            if options.dry_run {
                report.removed.push(container.name.clone());
                continue;
            }

            match self.engine.remove_container(&container.id).await {
                Ok(()) => report.removed.push(container.name.clone()),
                Err(e) if e.is_already_gone() => {
                    debug!(name = %container.name, "container already gone");
                    report.removed.push(container.name.clone());
                }
                Err(e) => report.errors.push(e.to_string()),
            }
        }

        report
    }

    async fn clean_images(&self, options: CleanupOptions) -> CategoryReport {
        let mut report = CategoryReport::new(StaleObjectCategory::Images);
        let cutoff = Utc::now() - self.policy.images;

        let images = match self.engine.list_dangling_images().await {
            Ok(images) => images,
            Err(e) => {
                report.errors.push(format!("listing images: {e}"));
                return report;
            }
        };

        for image in images {
            report.scanned += 1;
            if image.created_at >= cutoff {
                continue;
            }

            let Some(_guard) = self
                .guard_candidate(StaleObjectCategory::Images, &image.id, &mut report)
                .await
            else {
                continue;
            };

            if options.dry_run {
                report.removed.push(image.id.clone());
                continue;
            }

            match self.engine.remove_image(&image.id).await {
                Ok(()) => report.removed.push(image.id.clone()),
                Err(e) if e.is_already_gone() => {
                    debug!(id = %image.id, "image already gone");
                    report.removed.push(image.id.clone());
                }
                Err(e) => report.errors.push(e.to_string()),
            }
        }

        report
    }

    /// Shared filesystem path: remove direct children of `dir` whose
    /// mtime is older than `retention`.
    async fn clean_cache_dir(
        &self,
        category: StaleObjectCategory,
        dir: &Path,
        retention: chrono::Duration,
        options: CleanupOptions,
    ) -> CategoryReport {
        let mut report = CategoryReport::new(category);
        let cutoff = Utc::now() - retention;

        if !dir.exists() {
            return report;
        }

        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) => {
                report
                    .errors
                    .push(format!("reading {}: {e}", dir.display()));
                return report;
            }
        };

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    report
                        .errors
                        .push(format!("reading {}: {e}", dir.display()));
                    break;
                }
            };

            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            report.scanned += 1;

            let metadata = match fs::metadata(&path).await {
                Ok(m) => m,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    report.errors.push(format!("stat {}: {e}", path.display()));
                    continue;
                }
            };

            let modified: DateTime<Utc> = match metadata.modified() {
                Ok(t) => t.into(),
                Err(e) => {
                    report.errors.push(format!("mtime {}: {e}", path.display()));
                    continue;
                }
            };
            if modified >= cutoff {
                continue;
            }

            let Some(_guard) = self.guard_candidate(category, &name, &mut report).await else {
                continue;
            };

            let size = if metadata.is_dir() {
                dir_size(&path).await.unwrap_or(0)
            } else {
                metadata.len()
            };

            if options.dry_run {
                report.removed.push(name);
                report.bytes_reclaimed += size;
                continue;
            }

            let result = if metadata.is_dir() {
                fs::remove_dir_all(&path).await
            } else {
                fs::remove_file(&path).await
            };

            match result {
                Ok(()) => {
                    report.removed.push(name);
                    report.bytes_reclaimed += size;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    // Vanished between enumeration and deletion
                    report.removed.push(name);
                }
                Err(e) => {
                    warn!(path = %path.display(), "deletion failed: {e}");
                    report
                        .errors
                        .push(HostGcError::deletion(path.display(), e).to_string());
                }
            }
        }

        report
    }
}

/// Total size of a directory tree
async fn dir_size(dir: &Path) -> HostGcResult<u64> {
    let mut total = 0u64;
    let mut stack = vec![dir.to_path_buf()];

    while let Some(current) = stack.pop() {
        let mut entries = match fs::read_dir(&current).await {
            Ok(entries) => entries,
            Err(_) => continue, // unreadable subtree, skip
        };

        while let Some(entry) = entries.next_entry().await? {
            let metadata = match entry.metadata().await {
                Ok(m) => m,
                Err(_) => continue,
            };
            if metadata.is_dir() {
                stack.push(entry.path());
            } else {
                total += metadata.len();
            }
        }
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_bytes_scales() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.00 MB");
        assert_eq!(format_bytes(5 * 1024 * 1024 * 1024), "5.00 GB");
    }

    #[test]
    fn empty_summary_reports_empty() {
        let summary = CleanupSummary {
            dry_run: false,
            reports: vec![CategoryReport::new(StaleObjectCategory::TmpDirs)],
        };
        assert!(summary.is_empty());
        assert_eq!(summary.total_removed(), 0);
    }

    #[test]
    fn summary_with_errors_is_not_empty() {
        let mut report = CategoryReport::new(StaleObjectCategory::Images);
        report.errors.push("boom".to_string());
        let summary = CleanupSummary {
            dry_run: false,
            reports: vec![report],
        };
        assert!(!summary.is_empty());
    }

    #[test]
    fn display_mentions_dry_run_verb() {
        let mut report = CategoryReport::new(StaleObjectCategory::TmpDirs);
        report.scanned = 1;
        report.removed.push("hostgc-old".to_string());
        let summary = CleanupSummary {
            dry_run: true,
            reports: vec![report],
        };
        let rendered = summary.to_string();
        assert!(rendered.contains("would remove hostgc-old"));
    }

    #[tokio::test]
    async fn dir_size_sums_nested_files() {
        let dir = tempfile::TempDir::new().unwrap();
        tokio::fs::write(dir.path().join("a"), b"hello").await.unwrap();
        tokio::fs::create_dir(dir.path().join("sub")).await.unwrap();
        tokio::fs::write(dir.path().join("sub").join("b"), b"world")
            .await
            .unwrap();

        assert_eq!(dir_size(dir.path()).await.unwrap(), 10);
    }
}
