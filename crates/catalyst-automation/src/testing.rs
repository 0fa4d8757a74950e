//! In-memory store fakes with call recording and failure injection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use catalyst_core::messages::{ArtifactOrigin, AutomationOutput, TaskOrigin};
use catalyst_core::model::{Automation, Enrichment, Job, JobStatus, JobUpdate, LogEntry};
use catalyst_core::store::{ArtifactStore, AutomationStore, JobStore, LogStore, TaskStore};
use catalyst_core::{CatalystError, Result};

#[derive(Debug, Default)]
pub struct MemoryState {
    pub jobs: HashMap<String, Job>,
    pub automations: HashMap<String, Automation>,
    pub completed_tasks: Vec<(TaskOrigin, AutomationOutput)>,
    pub enrichments: Vec<(ArtifactOrigin, Enrichment)>,
    pub log_batches: Vec<Vec<LogEntry>>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    pub fail_job_create: bool,
    pub fail_job_update: bool,
    pub fail_log_append: bool,
    pub fail_routing: bool,
    pub fail_log_batch: bool,
}

impl MemoryStore {
    pub fn with_automation(automation: Automation) -> Self {
        let store = Self::default();
        store
            .lock()
            .automations
            .insert(automation.id.clone(), automation);
        store
    }

    pub fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap()
    }

    pub fn job(&self, id: &str) -> Job {
        self.lock().jobs.get(id).cloned().unwrap()
    }

    pub fn routing_calls(&self) -> usize {
        let state = self.lock();
        state.completed_tasks.len() + state.enrichments.len()
    }
}

fn modify(store: &MemoryStore, id: &str, f: impl FnOnce(&mut Job)) -> Result<()> {
    let mut state = store.lock();
    let job = state
        .jobs
        .get_mut(id)
        .ok_or_else(|| CatalystError::JobNotFound(id.to_string()))?;
    f(job);
    Ok(())
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn create_job(&self, job: &Job) -> Result<()> {
        if self.fail_job_create {
            return Err(CatalystError::Db("disk full".into()));
        }
        let mut state = self.lock();
        if state.jobs.contains_key(&job.id) {
            return Err(CatalystError::JobExists(job.id.clone()));
        }
        state.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn update_job(&self, id: &str, update: JobUpdate) -> Result<Job> {
        if self.fail_job_update {
            return Err(CatalystError::Db("write conflict".into()));
        }
        modify(self, id, |job| {
            if let Some(status) = update.status {
                job.status = status;
            }
            if let Some(container) = update.container {
                job.container = Some(container);
            }
            if let Some(log) = update.log {
                job.log.push_str(&log);
            }
        })?;
        Ok(self.job(id))
    }

    async fn complete_job(&self, id: &str, output: &AutomationOutput) -> Result<()> {
        modify(self, id, |job| {
            job.status = JobStatus::Completed;
            job.output = Some(output.clone());
        })
    }

    async fn fail_job(&self, id: &str, reason: &str) -> Result<()> {
        modify(self, id, |job| {
            job.status = JobStatus::Failed;
            job.error = Some(reason.to_string());
        })
    }

    async fn append_job_log(&self, id: &str, line: &str) -> Result<()> {
        if self.fail_log_append {
            return Err(CatalystError::Db("log table locked".into()));
        }
        modify(self, id, |job| job.log.push_str(line))
    }
}

#[async_trait]
impl AutomationStore for MemoryStore {
    async fn get_automation(&self, id: &str) -> Result<Automation> {
        self.lock()
            .automations
            .get(id)
            .cloned()
            .ok_or_else(|| CatalystError::AutomationNotFound(id.to_string()))
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn complete_task(&self, task: &TaskOrigin, data: &AutomationOutput) -> Result<()> {
        self.lock()
            .completed_tasks
            .push((task.clone(), data.clone()));
        if self.fail_routing {
            return Err(CatalystError::TaskNotFound {
                ticket_id: task.ticket_id,
                playbook_id: task.playbook_id.clone(),
                task_id: task.task_id.clone(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ArtifactStore for MemoryStore {
    async fn enrich_artifact(&self, artifact: &ArtifactOrigin, enrichment: Enrichment) -> Result<()> {
        self.lock()
            .enrichments
            .push((artifact.clone(), enrichment));
        if self.fail_routing {
            return Err(CatalystError::ArtifactNotFound {
                ticket_id: artifact.ticket_id,
                artifact: artifact.artifact.clone(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl LogStore for MemoryStore {
    async fn batch_create_logs(&self, entries: Vec<LogEntry>) -> Result<()> {
        if self.fail_log_batch {
            return Err(CatalystError::Db("log table locked".into()));
        }
        self.lock().log_batches.push(entries);
        Ok(())
    }
}
