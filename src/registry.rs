//! Remote registry client
//!
//! Initialized once per process alongside the other collaborators. Init
//! only builds the HTTP client (honoring the insecure-registry flag);
//! no network traffic happens until a query is made.

use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::error::{HostGcError, HostGcResult};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Docker Registry HTTP API v2 client.
pub struct RegistryClient {
    http: reqwest::Client,
    allow_insecure: bool,
}

#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

impl RegistryClient {
    /// Build the client. With `allow_insecure` set, certificate
    /// verification is disabled and plain HTTP registries are accepted.
    pub fn init(allow_insecure: bool) -> HostGcResult<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("hostgc/", env!("CARGO_PKG_VERSION")));

        if allow_insecure {
            builder = builder.danger_accept_invalid_certs(true);
        }

        let http = builder
            .build()
            .map_err(|e| HostGcError::init(format!("failed to build registry client: {e}")))?;

        Ok(Self {
            http,
            allow_insecure,
        })
    }

    /// Whether unverified registry access was allowed at init
    pub fn allows_insecure(&self) -> bool {
        self.allow_insecure
    }

    /// Check that `registry` speaks the v2 API.
    pub async fn ping(&self, registry: &str) -> HostGcResult<()> {
        let url = self.base_url(registry, "/v2/");
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(HostGcError::registry)?;

        // 401 still proves a live v2 endpoint; only 404/5xx mean trouble.
        if response.status().is_success() || response.status().as_u16() == 401 {
            debug!(registry, "registry reachable");
            Ok(())
        } else {
            Err(HostGcError::registry(format!(
                "{registry} responded {}",
                response.status()
            )))
        }
    }

    /// List tags of a repository, e.g. `list_tags("registry.example.com", "team/app")`.
    pub async fn list_tags(&self, registry: &str, repository: &str) -> HostGcResult<Vec<String>> {
        let url = self.base_url(registry, &format!("/v2/{repository}/tags/list"));
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(HostGcError::registry)?
            .error_for_status()
            .map_err(HostGcError::registry)?;

        let list: TagList = response.json().await.map_err(HostGcError::registry)?;
        Ok(list.tags.unwrap_or_default())
    }

    fn base_url(&self, registry: &str, path: &str) -> String {
        let scheme = if self.allow_insecure { "http" } else { "https" };
        if registry.contains("://") {
            format!("{}{}", registry.trim_end_matches('/'), path)
        } else {
            format!("{scheme}://{registry}{path}")
        }
    }
}
