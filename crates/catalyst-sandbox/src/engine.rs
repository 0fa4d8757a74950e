//! The container engine seam.
//!
//! [`ContainerEngine`] is the small set of Docker calls one job needs. The
//! runtime adds deadlines, cancellation and cleanup on top; engines only
//! translate calls.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::Result;

/// Everything needed to create the container of one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Container name; lets a container be removed even when its ID was
    /// never returned.
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    pub working_dir: String,
    pub network: String,
}

#[async_trait]
pub trait ContainerEngine: Send + Sync + 'static {
    async fn image_exists(&self, image: &str) -> Result<bool>;

    /// Pull `image` and return the progress output.
    async fn pull_image(&self, image: &str) -> Result<String>;

    /// Create a stopped container and return its ID.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    /// Unpack a tar archive into the container at `path`.
    async fn upload_archive(&self, id: &str, path: &str, archive: Bytes) -> Result<()>;

    async fn start_container(&self, id: &str) -> Result<()>;

    /// Follow the container's stderr until it stops.
    fn stderr(&self, id: &str) -> BoxStream<'static, Result<Bytes>>;

    /// Block until the container is no longer running; returns the exit code.
    async fn wait_container(&self, id: &str) -> Result<i64>;

    /// Everything the container wrote to stdout.
    async fn stdout(&self, id: &str) -> Result<Bytes>;

    /// Force-remove the container, by ID or name.
    async fn remove_container(&self, id: &str) -> Result<()>;
}
