//! One container per job.
//!
//! ```text
//! create:  [pull if missing] ─► create <name> ─► upload /script  (pull / create deadlines)
//! run:     start ─► follow stderr ──► sink (line by line)     (run deadline)
//!                └► wait ─► exit 0 ? stdout : NonZeroExit{stderr}
//!          force-remove, whatever happened
//! ```
//!
//! Every engine call races the job's [`CancellationToken`]; a container that
//! exists when a deadline or cancellation hits is removed before returning.
//! Containers are named after their job so that one whose creation was cut
//! short can still be removed by name.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use catalyst_core::config::TimeoutConfig;
use futures::stream::{BoxStream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::archive::{script_archive, SCRIPT_PATH, UPLOAD_PATH};
use crate::engine::{ContainerEngine, ContainerSpec};
use crate::lines::LineSplitter;
use crate::{Result, SandboxError};

/// Working directory of every automation container.
pub const WORKING_DIR: &str = "/home";

/// How long stderr may keep trickling in after the container exited.
const STDERR_DRAIN: Duration = Duration::from_secs(5);

/// Docker name of the container that runs `job_id`.
///
/// Characters Docker does not accept in names become `-`.
pub fn container_name(job_id: &str) -> String {
    let sanitized: String = job_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    format!("catalyst-{sanitized}")
}

/// A created, not yet started container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedContainer {
    pub id: String,
    /// Image pull output; empty when the image was already present.
    pub pull_log: String,
}

/// Receives the script's stderr one line at a time while it runs.
///
/// Implementations report their own failures; the stream keeps going.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn append_line(&self, line: &str);
}

/// What the job coordinator needs from a sandbox.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Prepare a container called `name` that will run `script` with
    /// `payload` as its only argument.
    async fn create(
        &self,
        name: &str,
        image: &str,
        script: &str,
        payload: &str,
        cancel: &CancellationToken,
    ) -> Result<CreatedContainer>;

    /// Start the container, stream stderr into `log` and return stdout once
    /// it exited cleanly. The container is gone when this returns.
    async fn run(
        &self,
        container: &str,
        log: Arc<dyn LogSink>,
        cancel: &CancellationToken,
    ) -> Result<Bytes>;
}

// ---------------------------------------------------------------------------
// ContainerRuntime
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ContainerRuntime<E> {
    engine: Arc<E>,
    network: String,
    timeouts: TimeoutConfig,
}

impl<E> Clone for ContainerRuntime<E> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            network: self.network.clone(),
            timeouts: self.timeouts.clone(),
        }
    }
}

impl<E: ContainerEngine> ContainerRuntime<E> {
    pub fn new(engine: Arc<E>, network: impl Into<String>, timeouts: TimeoutConfig) -> Self {
        Self {
            engine,
            network: network.into(),
            timeouts,
        }
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    /// Inspect and pull share one `pull_secs` deadline.
    async fn ensure_image(&self, image: &str, cancel: &CancellationToken) -> Result<String> {
        let budget = self.timeouts.pull();
        let started = tokio::time::Instant::now();
        let present = bounded("pull", budget, cancel, self.engine.image_exists(image)).await?;
        if present {
            debug!(image, "image already present");
            return Ok(String::new());
        }
        info!(image, "pulling image");
        let remaining = budget.saturating_sub(started.elapsed());
        bounded("pull", remaining, cancel, self.engine.pull_image(image))
            .await
            .map_err(|e| full_budget(e, budget))
    }

    async fn prepare(&self, id: &str, script: &str, cancel: &CancellationToken) -> Result<()> {
        let archive = script_archive(script)?;
        bounded(
            "upload",
            self.timeouts.create(),
            cancel,
            self.engine.upload_archive(id, UPLOAD_PATH, archive),
        )
        .await
    }

    async fn execute(
        &self,
        id: &str,
        log: Arc<dyn LogSink>,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        let budget = self.timeouts.run();
        let started = tokio::time::Instant::now();
        bounded("start", budget, cancel, self.engine.start_container(id)).await?;

        let mut stderr = tokio::spawn(follow_stderr(self.engine.stderr(id), log));

        let remaining = budget.saturating_sub(started.elapsed());
        let code = match bounded("run", remaining, cancel, self.engine.wait_container(id)).await {
            Ok(code) => code,
            Err(e) => {
                stderr.abort();
                return Err(full_budget(e, budget));
            }
        };

        let captured = match tokio::time::timeout(STDERR_DRAIN, &mut stderr).await {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                warn!(container = id, error = %e, "stderr reader failed");
                String::new()
            }
            Err(_) => {
                stderr.abort();
                warn!(container = id, "stderr did not close after exit");
                String::new()
            }
        };

        if code != 0 {
            return Err(SandboxError::NonZeroExit {
                code,
                stderr: captured,
            });
        }
        bounded("stdout", self.timeouts.create(), cancel, self.engine.stdout(id)).await
    }

    /// Best effort; bounded by the create deadline and deliberately not by
    /// the job's cancellation, which has usually fired already.
    async fn remove(&self, id: &str) {
        let after = self.timeouts.create();
        match tokio::time::timeout(after, self.engine.remove_container(id)).await {
            Ok(Ok(())) => debug!(container = id, "container removed"),
            Ok(Err(e)) => warn!(container = id, error = %e, "failed to remove container"),
            Err(_) => warn!(
                container = id,
                after_secs = after.as_secs(),
                "container removal timed out"
            ),
        }
    }
}

#[async_trait]
impl<E: ContainerEngine> Sandbox for ContainerRuntime<E> {
    async fn create(
        &self,
        name: &str,
        image: &str,
        script: &str,
        payload: &str,
        cancel: &CancellationToken,
    ) -> Result<CreatedContainer> {
        let pull_log = self.ensure_image(image, cancel).await?;

        let spec = ContainerSpec {
            name: name.to_string(),
            image: image.to_string(),
            cmd: vec![SCRIPT_PATH.to_string(), payload.to_string()],
            working_dir: WORKING_DIR.to_string(),
            network: self.network.clone(),
        };
        let id = match bounded(
            "create",
            self.timeouts.create(),
            cancel,
            self.engine.create_container(&spec),
        )
        .await
        {
            Ok(id) => id,
            Err(e @ (SandboxError::Timeout { .. } | SandboxError::Cancelled { .. })) => {
                // The daemon may have created it without telling us.
                self.remove(name).await;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        if let Err(e) = self.prepare(&id, script, cancel).await {
            self.remove(&id).await;
            return Err(e);
        }
        info!(container = %id, image, "container created");
        Ok(CreatedContainer { id, pull_log })
    }

    async fn run(
        &self,
        container: &str,
        log: Arc<dyn LogSink>,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        let outcome = self.execute(container, log, cancel).await;
        self.remove(container).await;
        outcome
    }
}

/// Race `fut` against its deadline and the cancellation token.
async fn bounded<T, F>(
    stage: &'static str,
    after: Duration,
    cancel: &CancellationToken,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(SandboxError::Cancelled { stage }),
        res = tokio::time::timeout(after, fut) => {
            res.unwrap_or(Err(SandboxError::Timeout { stage, after }))
        }
    }
}

/// Report a timeout against the stage's whole budget rather than the
/// remainder it was last given.
fn full_budget(err: SandboxError, budget: Duration) -> SandboxError {
    match err {
        SandboxError::Timeout { stage, .. } => SandboxError::Timeout {
            stage,
            after: budget,
        },
        other => other,
    }
}

/// Forward stderr to `sink` line by line and return all of it.
async fn follow_stderr(
    mut chunks: BoxStream<'static, Result<Bytes>>,
    sink: Arc<dyn LogSink>,
) -> String {
    let mut splitter = LineSplitter::default();
    let mut captured = String::new();
    while let Some(chunk) = chunks.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(error = %e, "stderr stream broke off");
                break;
            }
        };
        for line in splitter.push(&chunk) {
            forward(sink.as_ref(), &mut captured, &line).await;
        }
    }
    if let Some(rest) = splitter.finish() {
        forward(sink.as_ref(), &mut captured, &rest).await;
    }
    captured
}

async fn forward(sink: &dyn LogSink, captured: &mut String, line: &str) {
    let line = format!("{line}\n");
    captured.push_str(&line);
    sink.append_line(&line).await;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
