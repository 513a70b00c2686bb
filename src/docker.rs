//! Container engine client
//!
//! Thin wrapper over the local engine API exposing just the query/delete
//! surface the cleanup engine needs. The [`ContainerEngine`] trait is the
//! collaborator seam: production uses [`DockerClient`] (bollard), tests
//! substitute an in-memory engine.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use bollard::container::{ListContainersOptions, RemoveContainerOptions};
use bollard::image::{ListImagesOptions, RemoveImageOptions};
use bollard::Docker;
use chrono::{DateTime, TimeZone, Utc};
use tracing::debug;

use crate::config::RunConfiguration;
use crate::error::{HostGcError, HostGcResult};

/// Label carried by every container and image this toolchain creates
pub const MANAGED_LABEL: &str = "sh.hostgc.managed";
/// Name prefix of service containers left behind by interrupted builds
pub const SERVICE_CONTAINER_PREFIX: &str = "hostgc.build.";

/// A container as seen by the cleanup engine
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// An image as seen by the cleanup engine
#[derive(Debug, Clone)]
pub struct ImageInfo {
    pub id: String,
    pub created_at: DateTime<Utc>,
}

/// Collaborator contract for the local container engine.
///
/// Initialized once per process; safe to call concurrently with sibling
/// processes against the same daemon. Removal of an object that is
/// already gone surfaces as [`HostGcError::AlreadyGone`] so callers can
/// treat it as success.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// List this toolchain's service containers, running or not
    async fn list_service_containers(&self) -> HostGcResult<Vec<ContainerInfo>>;

    /// Remove a container by id
    async fn remove_container(&self, id: &str) -> HostGcResult<()>;

    /// List dangling images carrying the managed label
    async fn list_dangling_images(&self) -> HostGcResult<Vec<ImageInfo>>;

    /// Remove an image by id
    async fn remove_image(&self, id: &str) -> HostGcResult<()>;
}

/// Production engine client backed by the local Docker daemon.
pub struct DockerClient {
    docker: Docker,
    /// Auth config dir forwarded to registry-authenticated calls
    docker_config: Option<PathBuf>,
}

impl DockerClient {
    /// Build a client for the local daemon. Fails on malformed connection
    /// config (a bad `DOCKER_HOST`, say); an unreachable daemon surfaces
    /// at the first list call instead.
    pub fn init(config: &RunConfiguration) -> HostGcResult<Self> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| {
            HostGcError::init(format!("failed to connect to container engine: {e}"))
        })?;

        Ok(Self {
            docker,
            docker_config: config.docker_config.clone(),
        })
    }

    /// Auth config dir, if one was configured
    pub fn docker_config(&self) -> Option<&PathBuf> {
        self.docker_config.as_ref()
    }

    fn map_remove_error(err: bollard::errors::Error, object: &str) -> HostGcError {
        match err {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            } => HostGcError::AlreadyGone(object.to_string()),
            other => HostGcError::deletion(object, other),
        }
    }
}

#[async_trait]
impl ContainerEngine for DockerClient {
    async fn list_service_containers(&self) -> HostGcResult<Vec<ContainerInfo>> {
        let mut filters = HashMap::new();
        filters.insert("name", vec![SERVICE_CONTAINER_PREFIX]);

        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(HostGcError::engine)?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let id = c.id?;
                let name = c
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|n| n.trim_start_matches('/').to_string())?;
                let created_at = Utc
                    .timestamp_opt(c.created.unwrap_or_default(), 0)
                    .single()
                    .unwrap_or_else(Utc::now);
                Some(ContainerInfo {
                    id,
                    name,
                    created_at,
                })
            })
            .collect())
    }

    async fn remove_container(&self, id: &str) -> HostGcResult<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| Self::map_remove_error(e, &format!("container {id}")))?;

        debug!(id, "removed container");
        Ok(())
    }

    async fn list_dangling_images(&self) -> HostGcResult<Vec<ImageInfo>> {
        let mut filters = HashMap::new();
        filters.insert("dangling", vec!["true"]);
        filters.insert("label", vec![MANAGED_LABEL]);

        let options = ListImagesOptions {
            all: false,
            filters,
            ..Default::default()
        };

        let images = self
            .docker
            .list_images(Some(options))
            .await
            .map_err(HostGcError::engine)?;

        Ok(images
            .into_iter()
            .map(|img| ImageInfo {
                id: img.id,
                created_at: Utc
                    .timestamp_opt(img.created, 0)
                    .single()
                    .unwrap_or_else(Utc::now),
            })
            .collect())
    }

    async fn remove_image(&self, id: &str) -> HostGcResult<()> {
        let options = RemoveImageOptions {
            force: false,
            noprune: false,
        };

        self.docker
            .remove_image(id, Some(options), None)
            .await
            .map_err(|e| Self::map_remove_error(e, &format!("image {id}")))?;

        debug!(id, "removed image");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remove_error_maps_404_to_already_gone() {
        let err = bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "No such container".to_string(),
        };
        let mapped = DockerClient::map_remove_error(err, "container abc");
        assert!(mapped.is_already_gone());
    }

    #[test]
    fn remove_error_maps_conflict_to_deletion_failure() {
        let err = bollard::errors::Error::DockerResponseServerError {
            status_code: 409,
            message: "image is in use".to_string(),
        };
        let mapped = DockerClient::map_remove_error(err, "image xyz");
        assert!(matches!(mapped, HostGcError::Deletion { .. }));
    }
}
