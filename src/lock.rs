//! Host-wide named advisory locks
//!
//! Lock files under `<home>/locks` serialize access to shared resources
//! (a specific image, a specific cache entry) across every cooperating
//! process on the host. A lock is a file created with `create_new`, so
//! acquisition is atomic at the filesystem level; the file body records
//! who holds it. Granularity is per resource name: locking one cache
//! entry never blocks work on an unrelated image.
//!
//! Naming convention (the host-wide contract every cooperating tool must
//! follow): `"{category}/{identifier}"`, e.g. `container/hostgc.build.1f3a`,
//! `tmp/hostgc-20260828-091500`, `git-cache/github.com-org-repo`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{HostGcError, HostGcResult};

/// Default deadline for blocking acquisition
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);
/// Poll interval while waiting for a busy resource
const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Metadata stored in a lock file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostLock {
    /// Resource name, e.g. `git-cache/github.com-org-repo`
    pub resource: String,
    /// Pid of the holding process
    pub process_id: u32,
    /// Hostname of the holding process
    pub hostname: String,
    /// When the lock was acquired
    pub acquired_at: DateTime<Utc>,
    /// Token distinguishing re-acquisitions of the same name
    pub token: String,
}

impl HostLock {
    fn new(resource: &str) -> Self {
        Self {
            resource: resource.to_string(),
            process_id: std::process::id(),
            hostname: local_hostname(),
            acquired_at: Utc::now(),
            token: Uuid::new_v4().to_string(),
        }
    }

    /// Human-readable holder identity, `pid@hostname`
    pub fn holder(&self) -> String {
        format!("{}@{}", self.process_id, self.hostname)
    }
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Manager for host-wide named advisory locks.
///
/// One instance per process; independent instances (in this process or a
/// sibling process) pointed at the same lock directory cooperate through
/// the shared filesystem state.
#[derive(Debug, Clone)]
pub struct HostLockManager {
    locks_dir: PathBuf,
}

impl HostLockManager {
    /// One-time process setup: ensure the lock directory exists.
    pub fn init(locks_dir: PathBuf) -> HostGcResult<Self> {
        std::fs::create_dir_all(&locks_dir).map_err(|e| {
            HostGcError::init(format!(
                "failed to create lock directory {}: {e}",
                locks_dir.display()
            ))
        })?;
        Ok(Self { locks_dir })
    }

    /// Acquire `resource`, waiting up to [`DEFAULT_ACQUIRE_TIMEOUT`].
    pub async fn acquire(&self, resource: &str) -> HostGcResult<LockGuard> {
        self.acquire_timeout(resource, DEFAULT_ACQUIRE_TIMEOUT).await
    }

    /// Acquire `resource`, waiting up to `timeout` before failing with
    /// [`HostGcError::LockTimeout`]. Never deadlocks.
    pub async fn acquire_timeout(
        &self,
        resource: &str,
        timeout: Duration,
    ) -> HostGcResult<LockGuard> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            match self.try_acquire(resource).await {
                Ok(guard) => return Ok(guard),
                Err(e) if e.is_contention() => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(HostGcError::LockTimeout {
                            resource: resource.to_string(),
                            timeout,
                        });
                    }
                    tokio::time::sleep(ACQUIRE_POLL_INTERVAL).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Single acquisition attempt. Fails immediately with
    /// [`HostGcError::LockContention`] when the resource is busy.
    pub async fn try_acquire(&self, resource: &str) -> HostGcResult<LockGuard> {
        if let Some(guard) = self.create_lock_file(resource).await? {
            return Ok(guard);
        }

        if self.break_if_stale(resource).await? {
            // The recorded holder is dead on this host; retry once. A
            // sibling may still win the race for the freed name.
            if let Some(guard) = self.create_lock_file(resource).await? {
                return Ok(guard);
            }
        }

        let holder = self
            .read_holder(resource)
            .await
            .unwrap_or_else(|_| "unknown process".to_string());
        Err(HostGcError::LockContention {
            resource: resource.to_string(),
            holder,
        })
    }

    /// Atomically create the lock file and write holder metadata.
    /// Returns `None` when another process already holds the name.
    async fn create_lock_file(&self, resource: &str) -> HostGcResult<Option<LockGuard>> {
        let path = self.lock_path(resource);

        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true) // atomic: fails if the file exists
            .open(&path)
            .await
        {
            Ok(mut file) => {
                let lock = HostLock::new(resource);
                let json = serde_json::to_string_pretty(&lock)?;
                tokio::io::AsyncWriteExt::write_all(&mut file, json.as_bytes())
                    .await
                    .map_err(|e| HostGcError::lock(format!("failed to write lock data: {e}")))?;

                debug!(resource, "acquired lock");
                Ok(Some(LockGuard {
                    lock,
                    path: Some(path),
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(HostGcError::lock(format!(
                "failed to create lock file {}: {e}",
                path.display()
            ))),
        }
    }

    /// Remove the lock file if its recorded holder is a dead process on
    /// this host. Locks held from other hosts are never broken here.
    ///
    /// Removal is gated by a claim file named after the stale lock's
    /// token, created with `create_new`, so for a given stale instance
    /// exactly one contender may break it. Losers treat the name as held
    /// and come back on the next poll. The winner re-checks the token
    /// under the claim before removing, so a lock released and
    /// re-acquired in the meantime is never touched.
    ///
    /// Returns true when the caller freed the name and may retry creation.
    async fn break_if_stale(&self, resource: &str) -> HostGcResult<bool> {
        let path = self.lock_path(resource);

        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            // Holder released between our create attempt and this read.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(HostGcError::lock(format!("failed to read lock file: {e}"))),
        };

        let lock: HostLock = match serde_json::from_str(&contents) {
            Ok(lock) => lock,
            // Torn write in progress; treat as held.
            Err(_) => return Ok(false),
        };

        if lock.hostname != local_hostname() || is_process_running(lock.process_id) {
            return Ok(false);
        }

        let claim = self
            .locks_dir
            .join(format!("{}.{}.breaking", sanitize(resource), lock.token));
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&claim)
            .await
        {
            Ok(mut file) => {
                let breaker = HostLock::new(resource);
                let json = serde_json::to_string_pretty(&breaker)?;
                tokio::io::AsyncWriteExt::write_all(&mut file, json.as_bytes())
                    .await
                    .map_err(|e| HostGcError::lock(format!("failed to write claim data: {e}")))?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                // Another contender is breaking this instance.
                self.reap_dead_breaker(&claim).await;
                return Ok(false);
            }
            Err(e) => {
                return Err(HostGcError::lock(format!(
                    "failed to create claim file {}: {e}",
                    claim.display()
                )))
            }
        }

        // We hold the claim, so no sibling may remove this instance now.
        let broke = match tokio::fs::read_to_string(&path).await {
            Ok(c) => match serde_json::from_str::<HostLock>(&c) {
                Ok(current) if current.token == lock.token => {
                    warn!(
                        resource,
                        pid = lock.process_id,
                        "removing stale lock (holder no longer running)"
                    );
                    match tokio::fs::remove_file(&path).await {
                        Ok(()) => true,
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
                        Err(e) => {
                            let _ = tokio::fs::remove_file(&claim).await;
                            return Err(HostGcError::lock(format!(
                                "failed to remove stale lock: {e}"
                            )));
                        }
                    }
                }
                // Already broken and re-acquired; leave the new holder be.
                _ => false,
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
            Err(_) => false,
        };

        if let Err(e) = tokio::fs::remove_file(&claim).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(resource, "failed to remove claim file: {e}");
            }
        }
        Ok(broke)
    }

    /// Remove a leftover claim file whose breaker died mid-break, so a
    /// crashed breaker never wedges the name permanently. Best effort.
    async fn reap_dead_breaker(&self, claim: &Path) {
        let breaker: Option<HostLock> = tokio::fs::read_to_string(claim)
            .await
            .ok()
            .and_then(|c| serde_json::from_str(&c).ok());
        if let Some(breaker) = breaker {
            if breaker.hostname == local_hostname() && !is_process_running(breaker.process_id) {
                let _ = tokio::fs::remove_file(claim).await;
            }
        }
    }

    async fn read_holder(&self, resource: &str) -> HostGcResult<String> {
        let contents = tokio::fs::read_to_string(self.lock_path(resource))
            .await
            .map_err(HostGcError::lock)?;
        let lock: HostLock = serde_json::from_str(&contents)?;
        Ok(format!(
            "{} (acquired {})",
            lock.holder(),
            lock.acquired_at.format("%Y-%m-%d %H:%M:%S UTC")
        ))
    }

    fn lock_path(&self, resource: &str) -> PathBuf {
        self.locks_dir.join(format!("{}.lock", sanitize(resource)))
    }
}

/// Map a resource name to a flat lock file name. Alphanumerics, `.` and
/// `-` pass through; `_` escapes to `__`; every other character becomes
/// `_` plus two hex digits per UTF-8 byte. The encoding is injective, so
/// distinct resource names never share a lock file.
fn sanitize(resource: &str) -> String {
    let mut out = String::with_capacity(resource.len());
    for c in resource.chars() {
        if c.is_ascii_alphanumeric() || matches!(c, '.' | '-') {
            out.push(c);
        } else if c == '_' {
            out.push_str("__");
        } else {
            let mut buf = [0u8; 4];
            for b in c.encode_utf8(&mut buf).bytes() {
                out.push_str(&format!("_{b:02x}"));
            }
        }
    }
    out
}

/// Check whether a process with the given pid is alive on this host.
fn is_process_running(pid: u32) -> bool {
    #[cfg(unix)]
    {
        use std::process::Command;

        // kill -0 probes existence without signalling
        Command::new("kill")
            .arg("-0")
            .arg(pid.to_string())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        // No cheap probe available; treat the holder as alive.
        true
    }
}

/// RAII handle for a held lock.
///
/// Released explicitly via [`LockGuard::release`] or implicitly on drop,
/// so the resource is freed on every exit path including early returns
/// and unwinding.
#[derive(Debug)]
pub struct LockGuard {
    lock: HostLock,
    path: Option<PathBuf>,
}

impl LockGuard {
    /// The resource name this guard holds
    pub fn resource(&self) -> &str {
        &self.lock.resource
    }

    /// The lock metadata written to disk
    pub fn lock_info(&self) -> &HostLock {
        &self.lock
    }

    /// Explicitly release the lock, surfacing any I/O failure.
    pub async fn release(mut self) -> HostGcResult<()> {
        if let Some(path) = self.path.take() {
            tokio::fs::remove_file(&path)
                .await
                .map_err(|e| HostGcError::lock(format!("failed to release lock: {e}")))?;
            info!(resource = %self.lock.resource, "released lock");
        }
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(resource = %self.lock.resource, "failed to release lock: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> HostLockManager {
        HostLockManager::init(dir.path().join("locks")).unwrap()
    }

    #[tokio::test]
    async fn acquire_and_release() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);

        let guard = locks.acquire("tmp/build-1").await.unwrap();
        assert_eq!(guard.resource(), "tmp/build-1");
        assert_eq!(guard.lock_info().process_id, std::process::id());
        guard.release().await.unwrap();

        // Free again after release
        locks.try_acquire("tmp/build-1").await.unwrap();
    }

    #[tokio::test]
    async fn second_acquire_contends() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);

        let _guard = locks.try_acquire("image/app-v1").await.unwrap();
        let err = locks.try_acquire("image/app-v1").await.unwrap_err();
        assert!(err.is_contention());
    }

    #[tokio::test]
    async fn unrelated_resources_are_independent() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);

        let _a = locks.try_acquire("git-cache/repo-a").await.unwrap();
        let _b = locks.try_acquire("git-cache/repo-b").await.unwrap();
        let _c = locks.try_acquire("image/repo-a").await.unwrap();
    }

    #[tokio::test]
    async fn drop_releases_the_lock() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);

        {
            let _guard = locks.try_acquire("tmp/scoped").await.unwrap();
        }
        locks.try_acquire("tmp/scoped").await.unwrap();
    }

    #[tokio::test]
    async fn cooperating_managers_share_state() {
        let dir = TempDir::new().unwrap();
        let first = manager(&dir);
        let second = HostLockManager::init(dir.path().join("locks")).unwrap();

        let _guard = first.try_acquire("worktree-cache/x").await.unwrap();
        let err = second.try_acquire("worktree-cache/x").await.unwrap_err();
        assert!(err.is_contention());
    }

    #[tokio::test]
    async fn acquire_times_out_instead_of_deadlocking() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);

        let _guard = locks.try_acquire("tmp/busy").await.unwrap();
        let err = locks
            .acquire_timeout("tmp/busy", Duration::from_millis(250))
            .await
            .unwrap_err();
        assert!(matches!(err, HostGcError::LockTimeout { .. }));
    }

    #[tokio::test]
    async fn acquire_waits_for_release() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);

        let guard = locks.try_acquire("tmp/handoff").await.unwrap();
        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                locks
                    .acquire_timeout("tmp/handoff", Duration::from_secs(5))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(200)).await;
        guard.release().await.unwrap();

        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn stale_lock_from_dead_process_is_broken() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);

        // Fabricate a lock held by a dead pid on this host.
        let stale = HostLock {
            resource: "image/stale".to_string(),
            process_id: 3_999_999, // nothing plausible runs with this pid
            hostname: local_hostname(),
            acquired_at: Utc::now(),
            token: Uuid::new_v4().to_string(),
        };
        let path = dir.path().join("locks").join("image_2fstale.lock");
        std::fs::write(&path, serde_json::to_string_pretty(&stale).unwrap()).unwrap();

        locks.try_acquire("image/stale").await.unwrap();
    }

    #[tokio::test]
    async fn foreign_host_lock_is_not_broken() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);

        let foreign = HostLock {
            resource: "image/remote".to_string(),
            process_id: 3_999_999,
            hostname: "some-other-host".to_string(),
            acquired_at: Utc::now(),
            token: Uuid::new_v4().to_string(),
        };
        let path = dir.path().join("locks").join("image_2fremote.lock");
        std::fs::write(&path, serde_json::to_string_pretty(&foreign).unwrap()).unwrap();

        let err = locks.try_acquire("image/remote").await.unwrap_err();
        assert!(err.is_contention());
    }

    #[test]
    fn sanitize_encodes_separators() {
        assert_eq!(
            sanitize("git-cache/github.com/org/repo"),
            "git-cache_2fgithub.com_2forg_2frepo"
        );
        assert_eq!(sanitize("tmp/build 1"), "tmp_2fbuild_201");
    }

    #[test]
    fn sanitize_keeps_distinct_names_distinct() {
        // `/` and `_` must not collide in the flattened name.
        assert_ne!(sanitize("tmp/a_b"), sanitize("tmp/a/b"));
        assert_eq!(sanitize("tmp/a_b"), "tmp_2fa__b");
        assert_eq!(sanitize("tmp/a/b"), "tmp_2fa_2fb");
    }
}
