//! [`ContainerEngine`] backed by the local Docker daemon.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, UploadToContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use bytes::{Bytes, BytesMut};
use futures::stream::{BoxStream, StreamExt};
use tracing::debug;

use crate::engine::{ContainerEngine, ContainerSpec};
use crate::{Result, SandboxError};

/// Shared Docker client. Clones reuse the same connection pool.
#[derive(Debug, Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connect using `DOCKER_HOST` or the platform's default socket.
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::Engine(e.to_string()))?;
        Ok(Self { docker })
    }

    pub fn from_client(docker: Docker) -> Self {
        Self { docker }
    }
}

/// Split an image reference into repository and tag (or digest).
///
/// An empty tag makes the daemon pull every tag of the repository, so a
/// bare name defaults to `latest`. A `:` before the last `/` is a registry
/// port, not a tag.
fn split_reference(image: &str) -> (&str, &str) {
    if let Some((repo, digest)) = image.split_once('@') {
        return (repo, digest);
    }
    let name_start = image.rfind('/').map_or(0, |i| i + 1);
    match image[name_start..].rfind(':') {
        Some(i) => (&image[..name_start + i], &image[name_start + i + 1..]),
        None => (image, "latest"),
    }
}

fn is_not_found(e: &BollardError) -> bool {
    matches!(
        e,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(SandboxError::Engine(e.to_string())),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<String> {
        let (repo, tag) = split_reference(image);
        let options = CreateImageOptions {
            from_image: repo,
            tag,
            ..Default::default()
        };
        let mut progress = std::pin::pin!(self.docker.create_image(Some(options), None, None));
        let mut log = String::new();
        while let Some(info) = progress.next().await {
            let info = info.map_err(|e| SandboxError::Pull {
                image: image.to_string(),
                message: e.to_string(),
            })?;
            if let Some(message) = info.error {
                return Err(SandboxError::Pull {
                    image: image.to_string(),
                    message,
                });
            }
            let Some(status) = info.status else { continue };
            match (info.id, info.progress) {
                (Some(id), Some(bar)) => log.push_str(&format!("{id}: {status} {bar}\n")),
                (Some(id), None) => log.push_str(&format!("{id}: {status}\n")),
                (None, _) => log.push_str(&format!("{status}\n")),
            }
        }
        debug!(image, "image pulled");
        Ok(log)
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.cmd.clone()),
            working_dir: Some(spec.working_dir.clone()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            host_config: Some(HostConfig {
                network_mode: Some(spec.network.clone()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.as_str(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| SandboxError::Create {
                image: spec.image.clone(),
                message: e.to_string(),
            })?;
        Ok(created.id)
    }

    async fn upload_archive(&self, id: &str, path: &str, archive: Bytes) -> Result<()> {
        let options = UploadToContainerOptions {
            path: path.to_string(),
            ..Default::default()
        };
        self.docker
            .upload_to_container(id, Some(options), archive)
            .await
            .map_err(|e| SandboxError::Upload {
                container: id.to_string(),
                message: e.to_string(),
            })
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| SandboxError::Start {
                container: id.to_string(),
                message: e.to_string(),
            })
    }

    fn stderr(&self, id: &str) -> BoxStream<'static, Result<Bytes>> {
        let options = LogsOptions::<String> {
            follow: true,
            stderr: true,
            ..Default::default()
        };
        self.docker
            .logs(id, Some(options))
            .filter_map(|chunk| async move {
                match chunk {
                    Ok(LogOutput::StdErr { message }) => Some(Ok(message)),
                    Ok(_) => None,
                    Err(e) => Some(Err(SandboxError::Engine(e.to_string()))),
                }
            })
            .boxed()
    }

    async fn wait_container(&self, id: &str) -> Result<i64> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut waits = std::pin::pin!(self.docker.wait_container(id, Some(options)));
        match waits.next().await {
            Some(Ok(exit)) => Ok(exit.status_code),
            // bollard reports a non-zero exit as an error carrying the code.
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(SandboxError::Engine(e.to_string())),
            None => Err(SandboxError::Engine(format!(
                "wait stream for container {id} ended without a status"
            ))),
        }
    }

    async fn stdout(&self, id: &str) -> Result<Bytes> {
        let options = LogsOptions::<String> {
            stdout: true,
            ..Default::default()
        };
        let mut logs = std::pin::pin!(self.docker.logs(id, Some(options)));
        let mut out = BytesMut::new();
        while let Some(chunk) = logs.next().await {
            match chunk.map_err(|e| SandboxError::Engine(e.to_string()))? {
                LogOutput::StdOut { message } | LogOutput::Console { message } => {
                    out.extend_from_slice(&message)
                }
                _ => {}
            }
        }
        Ok(out.freeze())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| SandboxError::Engine(e.to_string()))
    }
}
