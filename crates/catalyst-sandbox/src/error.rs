use std::time::Duration;

use catalyst_core::ErrorKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("container engine error: {0}")]
    Engine(String),

    #[error("failed to pull image {image}: {message}")]
    Pull { image: String, message: String },

    #[error("failed to create container from {image}: {message}")]
    Create { image: String, message: String },

    #[error("failed to copy script into container {container}: {message}")]
    Upload { container: String, message: String },

    #[error("failed to start container {container}: {message}")]
    Start { container: String, message: String },

    #[error("container returned status code {code}: stderr: {stderr}")]
    NonZeroExit { code: i64, stderr: String },

    #[error("{stage} timed out after {}s", after.as_secs())]
    Timeout { stage: &'static str, after: Duration },

    #[error("{stage} cancelled")]
    Cancelled { stage: &'static str },

    #[error("failed to build script archive: {0}")]
    Archive(#[from] std::io::Error),
}

impl SandboxError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout { .. } => ErrorKind::Timeout,
            _ => ErrorKind::Sandbox,
        }
    }
}
