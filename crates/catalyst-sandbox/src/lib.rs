//! `catalyst-sandbox`: runs an automation script in a throwaway container.
//!
//! # Architecture
//!
//! ```text
//! Sandbox (trait)          ← what the job coordinator calls
//!     │
//!     ▼
//! ContainerRuntime<E>      ← deadlines, cancellation, cleanup, stderr lines
//!     │
//!     ▼
//! ContainerEngine (trait)  ← raw engine calls
//!     ├─ DockerEngine      ← bollard, one shared client
//!     └─ ScriptedEngine    ← in-memory, tests only
//! ```

pub mod archive;
pub mod docker;
pub mod engine;
pub mod error;
pub mod lines;
pub mod runtime;

#[cfg(any(test, feature = "test-utils"))]
pub mod scripted;

pub use docker::DockerEngine;
pub use engine::{ContainerEngine, ContainerSpec};
pub use error::SandboxError;
pub use runtime::{container_name, ContainerRuntime, CreatedContainer, LogSink, Sandbox};

pub use tokio_util::sync::CancellationToken;

/// Convenience `Result` alias for this crate.
pub type Result<T> = std::result::Result<T, SandboxError>;
