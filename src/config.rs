//! Run configuration resolved once per process
//!
//! Every downstream component reads the same immutable `RunConfiguration`.
//! Resolution order for directories: explicit CLI override, then environment
//! variable, then the built-in default.

use std::env;
use std::path::PathBuf;

use crate::error::{HostGcError, HostGcResult};

/// Environment variable overriding the tmp root
pub const TMP_DIR_ENV: &str = "HOSTGC_TMP_DIR";
/// Environment variable overriding the home root
pub const HOME_DIR_ENV: &str = "HOSTGC_HOME_DIR";
/// Environment variable pointing at the container engine auth config
pub const DOCKER_CONFIG_ENV: &str = "DOCKER_CONFIG";

/// Immutable per-process configuration.
///
/// Built once at startup and passed by reference to every initializer;
/// nothing mutates it afterwards.
#[derive(Debug, Clone)]
pub struct RunConfiguration {
    /// Root for per-invocation service tmp dirs
    pub tmp_root: PathBuf,
    /// Root for persistent local state (caches, locks)
    pub home_root: PathBuf,
    /// Report candidates without mutating anything
    pub dry_run: bool,
    /// Allow non-TLS/unverified registry access
    pub allow_insecure_registry: bool,
    /// Path to the container engine auth config, if any
    pub docker_config: Option<PathBuf>,
}

/// Raw overrides collected from the CLI surface
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub tmp_dir: Option<PathBuf>,
    pub home_dir: Option<PathBuf>,
    pub docker_config: Option<PathBuf>,
    pub insecure_registry: bool,
    pub dry_run: bool,
}

impl RunConfiguration {
    /// Resolve the run configuration from overrides, environment and defaults.
    pub fn resolve(overrides: ConfigOverrides) -> HostGcResult<Self> {
        let tmp_root = overrides
            .tmp_dir
            .or_else(|| env_path(TMP_DIR_ENV))
            .unwrap_or_else(|| env::temp_dir().join("hostgc"));

        let home_root = match overrides.home_dir.or_else(|| env_path(HOME_DIR_ENV)) {
            Some(dir) => dir,
            None => dirs::home_dir()
                .ok_or_else(|| HostGcError::init("cannot determine home directory"))?
                .join(".hostgc"),
        };

        let docker_config = overrides
            .docker_config
            .or_else(|| env_path(DOCKER_CONFIG_ENV));

        Ok(Self {
            tmp_root,
            home_root,
            dry_run: overrides.dry_run,
            allow_insecure_registry: overrides.insecure_registry,
            docker_config,
        })
    }
}

fn env_path(var: &str) -> Option<PathBuf> {
    env::var_os(var).filter(|v| !v.is_empty()).map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_overrides_win() {
        let config = RunConfiguration::resolve(ConfigOverrides {
            tmp_dir: Some(PathBuf::from("/var/tmp/gc")),
            home_dir: Some(PathBuf::from("/srv/gc-home")),
            docker_config: Some(PathBuf::from("/etc/docker-auth")),
            insecure_registry: true,
            dry_run: true,
        })
        .unwrap();

        assert_eq!(config.tmp_root, PathBuf::from("/var/tmp/gc"));
        assert_eq!(config.home_root, PathBuf::from("/srv/gc-home"));
        assert_eq!(config.docker_config, Some(PathBuf::from("/etc/docker-auth")));
        assert!(config.dry_run);
        assert!(config.allow_insecure_registry);
    }

    #[test]
    fn defaults_apply_without_overrides() {
        let config = RunConfiguration::resolve(ConfigOverrides::default()).unwrap();
        assert!(config.tmp_root.ends_with("hostgc"));
        assert!(config.home_root.ends_with(".hostgc"));
        assert!(!config.dry_run);
        assert!(!config.allow_insecure_registry);
    }
}
