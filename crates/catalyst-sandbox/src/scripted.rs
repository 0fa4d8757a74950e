//! In-memory [`ContainerEngine`] that replays a scripted outcome.
//!
//! Records every call so tests can assert on what the runtime asked for.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};

use crate::engine::{ContainerEngine, ContainerSpec};
use crate::{Result, SandboxError};

/// How a scripted container behaves once started.
#[derive(Debug, Clone, Default)]
pub struct ScriptedRun {
    pub exit_code: i64,
    pub stdout: Vec<u8>,
    /// Chunks emitted on stderr, split however the test likes.
    pub stderr: Vec<Vec<u8>>,
    /// Delay before the container exits.
    pub runtime: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    ImageExists(String),
    Pull(String),
    Create(ContainerSpec),
    Upload { id: String, path: String, archive: Bytes },
    Start(String),
    Wait(String),
    Remove(String),
}

#[derive(Debug, Default)]
struct State {
    calls: Vec<EngineCall>,
    next_id: usize,
}

/// Behaviour is fixed at construction; the `fail_*` flags inject errors.
#[derive(Debug, Clone, Default)]
pub struct ScriptedEngine {
    pub run: ScriptedRun,
    pub image_present: bool,
    pub pull_log: String,
    pub fail_pull: bool,
    pub fail_create: bool,
    pub fail_upload: bool,
    pub fail_start: bool,
    pub fail_remove: bool,
    /// Latency of the matching engine calls.
    pub inspect_delay: Duration,
    pub pull_delay: Duration,
    /// Applied after the container exists, as a slow daemon would.
    pub create_delay: Duration,
    pub remove_delay: Duration,
    /// Computes stdout from the container command line instead of
    /// returning `run.stdout`.
    pub stdout_from_cmd: Option<StdoutFn>,
    state: Arc<Mutex<State>>,
}

/// Stand-in for the script itself: maps the command line to stdout.
#[derive(Clone)]
pub struct StdoutFn(pub Arc<dyn Fn(&[String]) -> Vec<u8> + Send + Sync>);

impl std::fmt::Debug for StdoutFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StdoutFn")
    }
}

impl ScriptedEngine {
    pub fn new(run: ScriptedRun) -> Self {
        Self {
            run,
            pull_log: "latest: Pulling from library/python\n".into(),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.lock().calls.clone()
    }

    pub fn created(&self) -> Vec<ContainerSpec> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                EngineCall::Create(spec) => Some(spec),
                _ => None,
            })
            .collect()
    }

    pub fn removed(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                EngineCall::Remove(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, call: EngineCall) {
        self.lock().calls.push(call);
    }

    async fn delay(by: Duration) {
        if !by.is_zero() {
            tokio::time::sleep(by).await;
        }
    }

    fn cmd_of(&self, id: &str) -> Vec<String> {
        let state = self.lock();
        let index: usize = id.trim_start_matches("container-").parse().unwrap_or(0);
        state
            .calls
            .iter()
            .filter_map(|c| match c {
                EngineCall::Create(spec) => Some(spec.cmd.clone()),
                _ => None,
            })
            .nth(index)
            .unwrap_or_default()
    }
}

#[async_trait]
impl ContainerEngine for ScriptedEngine {
    async fn image_exists(&self, image: &str) -> Result<bool> {
        self.record(EngineCall::ImageExists(image.to_string()));
        Self::delay(self.inspect_delay).await;
        Ok(self.image_present)
    }

    async fn pull_image(&self, image: &str) -> Result<String> {
        self.record(EngineCall::Pull(image.to_string()));
        Self::delay(self.pull_delay).await;
        if self.fail_pull {
            return Err(SandboxError::Pull {
                image: image.to_string(),
                message: "manifest unknown".into(),
            });
        }
        Ok(self.pull_log.clone())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        if self.fail_create {
            return Err(SandboxError::Create {
                image: spec.image.clone(),
                message: "network catalyst not found".into(),
            });
        }
        let id = {
            let mut state = self.lock();
            state.calls.push(EngineCall::Create(spec.clone()));
            let id = format!("container-{}", state.next_id);
            state.next_id += 1;
            id
        };
        Self::delay(self.create_delay).await;
        Ok(id)
    }

    async fn upload_archive(&self, id: &str, path: &str, archive: Bytes) -> Result<()> {
        self.record(EngineCall::Upload {
            id: id.to_string(),
            path: path.to_string(),
            archive,
        });
        if self.fail_upload {
            return Err(SandboxError::Upload {
                container: id.to_string(),
                message: "no space left on device".into(),
            });
        }
        Ok(())
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.record(EngineCall::Start(id.to_string()));
        if self.fail_start {
            return Err(SandboxError::Start {
                container: id.to_string(),
                message: "exec format error".into(),
            });
        }
        Ok(())
    }

    fn stderr(&self, _id: &str) -> BoxStream<'static, Result<Bytes>> {
        let chunks: Vec<Result<Bytes>> = self
            .run
            .stderr
            .iter()
            .map(|c| Ok(Bytes::from(c.clone())))
            .collect();
        stream::iter(chunks).boxed()
    }

    async fn wait_container(&self, id: &str) -> Result<i64> {
        self.record(EngineCall::Wait(id.to_string()));
        tokio::time::sleep(self.run.runtime).await;
        Ok(self.run.exit_code)
    }

    async fn stdout(&self, id: &str) -> Result<Bytes> {
        match &self.stdout_from_cmd {
            Some(StdoutFn(f)) => Ok(Bytes::from(f(self.cmd_of(id).as_slice()))),
            None => Ok(Bytes::from(self.run.stdout.clone())),
        }
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        self.record(EngineCall::Remove(id.to_string()));
        Self::delay(self.remove_delay).await;
        if self.fail_remove {
            return Err(SandboxError::Engine("removal already in progress".into()));
        }
        Ok(())
    }
}
