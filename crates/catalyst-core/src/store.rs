//! Collaborator interfaces.
//!
//! The automation core never talks to a database directly; it only needs
//! these narrow seams. [`crate::db::CatalystDb`] implements all of them on
//! top of redb, and tests plug in in-memory fakes.

use async_trait::async_trait;

use crate::error::Result;
use crate::messages::{ArtifactOrigin, AutomationOutput, TaskOrigin};
use crate::model::{Automation, Enrichment, Job, JobUpdate, LogEntry};

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job; fails if the ID is taken.
    async fn create_job(&self, job: &Job) -> Result<()>;

    async fn update_job(&self, id: &str, update: JobUpdate) -> Result<Job>;

    /// Store the output and mark the job `completed`.
    async fn complete_job(&self, id: &str, output: &AutomationOutput) -> Result<()>;

    /// Mark the job `failed`, recording why.
    async fn fail_job(&self, id: &str, reason: &str) -> Result<()>;

    /// Append one line of sandbox output to the job log.
    async fn append_job_log(&self, id: &str, line: &str) -> Result<()>;
}

#[async_trait]
pub trait AutomationStore: Send + Sync {
    async fn get_automation(&self, id: &str) -> Result<Automation>;
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn complete_task(&self, task: &TaskOrigin, data: &AutomationOutput) -> Result<()>;
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn enrich_artifact(&self, artifact: &ArtifactOrigin, enrichment: Enrichment)
        -> Result<()>;
}

#[async_trait]
pub trait LogStore: Send + Sync {
    async fn batch_create_logs(&self, entries: Vec<LogEntry>) -> Result<()>;
}
