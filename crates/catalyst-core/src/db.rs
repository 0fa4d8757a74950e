//! Embedded storage for jobs, automations and their downstream records.
//!
//! # Table design
//!
//! ```text
//! jobs          &str id                          -> JSON Job
//! automations   &str id                          -> JSON Automation
//! logs          u64 sequence                     -> JSON LogEntry
//! task_results  (i64, &str, &str) ticket/playbook/task  -> JSON TaskResult
//! enrichments   (i64, &str, &str) ticket/artifact/name  -> JSON Enrichment
//! ```
//!
//! Composite keys are tuples, never joined strings: artifact names are
//! free text and may contain any separator. Values are JSON so records stay readable with any redb tool. Writes go
//! through redb's single-writer transactions, which is what serialises
//! concurrent jobs touching the same record.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use crate::bus::Bus;
use crate::error::{CatalystError, Result};
use crate::messages::{
    ArtifactOrigin, AutomationOutput, DatabaseUpdateMsg, DatabaseUpdateType, TaskOrigin,
};
use crate::model::{Automation, Enrichment, Job, JobStatus, JobUpdate, LogEntry};
use crate::store::{ArtifactStore, AutomationStore, JobStore, LogStore, TaskStore};

// ---------------------------------------------------------------------------
// Table definitions
// ---------------------------------------------------------------------------

const JOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("jobs");
const AUTOMATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("automations");
const LOGS: TableDefinition<u64, &[u8]> = TableDefinition::new("logs");
const TASK_RESULTS: TableDefinition<(i64, &str, &str), &[u8]> =
    TableDefinition::new("task_results");
const ENRICHMENTS: TableDefinition<(i64, &str, &str), &[u8]> =
    TableDefinition::new("enrichments");

fn db_err(e: impl std::fmt::Display) -> CatalystError {
    CatalystError::Db(e.to_string())
}

fn task_key(task: &TaskOrigin) -> (i64, &str, &str) {
    (task.ticket_id, task.playbook_id.as_str(), task.task_id.as_str())
}

/// A task closed by an automation result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task: TaskOrigin,
    pub data: AutomationOutput,
    pub closed: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// CatalystDb
// ---------------------------------------------------------------------------

/// redb-backed implementation of every store trait.
///
/// Cheap to clone; clones share the same database handle.
#[derive(Clone)]
pub struct CatalystDb {
    db: Arc<Database>,
    bus: Option<Arc<Bus>>,
}

impl std::fmt::Debug for CatalystDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalystDb")
            .field("publishes_updates", &self.bus.is_some())
            .finish()
    }
}

impl CatalystDb {
    /// Open or create the database at `path`, creating missing tables.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = Database::create(path).map_err(db_err)?;
        let wt = db.begin_write().map_err(db_err)?;
        wt.open_table(JOBS).map_err(db_err)?;
        wt.open_table(AUTOMATIONS).map_err(db_err)?;
        wt.open_table(LOGS).map_err(db_err)?;
        wt.open_table(TASK_RESULTS).map_err(db_err)?;
        wt.open_table(ENRICHMENTS).map_err(db_err)?;
        wt.commit().map_err(db_err)?;
        Ok(Self {
            db: Arc::new(db),
            bus: None,
        })
    }

    /// Publish a [`DatabaseUpdateMsg`] on `bus` after every write.
    pub fn with_bus(mut self, bus: Arc<Bus>) -> Self {
        self.bus = Some(bus);
        self
    }

    fn notify(&self, ids: Vec<String>, kind: DatabaseUpdateType) {
        if let Some(bus) = &self.bus {
            bus.database_update.publish(DatabaseUpdateMsg { ids, kind });
        }
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&CatalystDb) -> Result<T> + Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| CatalystError::Join(e.to_string()))?
    }

    // -----------------------------------------------------------------------
    // Jobs
    // -----------------------------------------------------------------------

    pub fn insert_job(&self, job: &Job) -> Result<()> {
        let value = serde_json::to_vec(job)?;
        let wt = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = wt.open_table(JOBS).map_err(db_err)?;
            if table.get(job.id.as_str()).map_err(db_err)?.is_some() {
                return Err(CatalystError::JobExists(job.id.clone()));
            }
            table
                .insert(job.id.as_str(), value.as_slice())
                .map_err(db_err)?;
        }
        wt.commit().map_err(db_err)?;
        self.notify(vec![format!("jobs/{}", job.id)], DatabaseUpdateType::Created);
        Ok(())
    }

    /// Read-modify-write of one job inside a single write transaction.
    pub fn modify_job(&self, id: &str, f: impl FnOnce(&mut Job)) -> Result<Job> {
        let wt = self.db.begin_write().map_err(db_err)?;
        let job = {
            let mut table = wt.open_table(JOBS).map_err(db_err)?;
            let mut job: Job = match table.get(id).map_err(db_err)? {
                Some(v) => serde_json::from_slice(v.value())?,
                None => return Err(CatalystError::JobNotFound(id.to_string())),
            };
            f(&mut job);
            job.updated_at = Utc::now();
            let value = serde_json::to_vec(&job)?;
            table.insert(id, value.as_slice()).map_err(db_err)?;
            job
        };
        wt.commit().map_err(db_err)?;
        self.notify(vec![format!("jobs/{id}")], DatabaseUpdateType::Updated);
        Ok(job)
    }

    pub fn job(&self, id: &str) -> Result<Job> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(JOBS).map_err(db_err)?;
        let job = match table.get(id).map_err(db_err)? {
            Some(v) => serde_json::from_slice(v.value())?,
            None => return Err(CatalystError::JobNotFound(id.to_string())),
        };
        Ok(job)
    }

    /// All jobs, newest first.
    pub fn list_jobs(&self) -> Result<Vec<Job>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(JOBS).map_err(db_err)?;
        let mut jobs = Vec::new();
        for entry in table.iter().map_err(db_err)? {
            let (_, v) = entry.map_err(db_err)?;
            jobs.push(serde_json::from_slice::<Job>(v.value())?);
        }
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    // -----------------------------------------------------------------------
    // Automations
    // -----------------------------------------------------------------------

    /// Insert or replace an automation definition.
    pub fn put_automation(&self, automation: &Automation) -> Result<()> {
        let value = serde_json::to_vec(automation)?;
        let wt = self.db.begin_write().map_err(db_err)?;
        let existed = {
            let mut table = wt.open_table(AUTOMATIONS).map_err(db_err)?;
            let previous = table
                .insert(automation.id.as_str(), value.as_slice())
                .map_err(db_err)?;
            previous.is_some()
        };
        wt.commit().map_err(db_err)?;
        let kind = if existed {
            DatabaseUpdateType::Updated
        } else {
            DatabaseUpdateType::Created
        };
        self.notify(vec![format!("automations/{}", automation.id)], kind);
        Ok(())
    }

    pub fn automation(&self, id: &str) -> Result<Automation> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(AUTOMATIONS).map_err(db_err)?;
        let automation = match table.get(id).map_err(db_err)? {
            Some(v) => serde_json::from_slice(v.value())?,
            None => return Err(CatalystError::AutomationNotFound(id.to_string())),
        };
        Ok(automation)
    }

    /// All automations, sorted by ID.
    pub fn list_automations(&self) -> Result<Vec<Automation>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(AUTOMATIONS).map_err(db_err)?;
        let mut out = Vec::new();
        for entry in table.iter().map_err(db_err)? {
            let (_, v) = entry.map_err(db_err)?;
            out.push(serde_json::from_slice::<Automation>(v.value())?);
        }
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Audit log
    // -----------------------------------------------------------------------

    pub fn insert_logs(&self, entries: &[LogEntry]) -> Result<Vec<u64>> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        let wt = self.db.begin_write().map_err(db_err)?;
        let keys = {
            let mut table = wt.open_table(LOGS).map_err(db_err)?;
            let mut next = table
                .last()
                .map_err(db_err)?
                .map(|(k, _)| k.value() + 1)
                .unwrap_or(0);
            let mut keys = Vec::with_capacity(entries.len());
            for entry in entries {
                let value = serde_json::to_vec(entry)?;
                table.insert(next, value.as_slice()).map_err(db_err)?;
                keys.push(next);
                next += 1;
            }
            keys
        };
        wt.commit().map_err(db_err)?;
        self.notify(
            keys.iter().map(|k| format!("logs/{k}")).collect(),
            DatabaseUpdateType::Created,
        );
        Ok(keys)
    }

    /// Log entries referencing `reference`, oldest first.
    pub fn logs_for(&self, reference: &str) -> Result<Vec<LogEntry>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(LOGS).map_err(db_err)?;
        let mut out = Vec::new();
        for entry in table.iter().map_err(db_err)? {
            let (_, v) = entry.map_err(db_err)?;
            let log: LogEntry = serde_json::from_slice(v.value())?;
            if log.reference == reference {
                out.push(log);
            }
        }
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Task results and enrichments
    // -----------------------------------------------------------------------

    pub fn insert_task_result(&self, result: &TaskResult) -> Result<()> {
        let key = task_key(&result.task);
        let value = serde_json::to_vec(result)?;
        let wt = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = wt.open_table(TASK_RESULTS).map_err(db_err)?;
            table.insert(key, value.as_slice()).map_err(db_err)?;
        }
        wt.commit().map_err(db_err)?;
        self.notify(
            vec![format!("tickets/{}", result.task.ticket_id)],
            DatabaseUpdateType::Updated,
        );
        Ok(())
    }

    pub fn task_result(&self, task: &TaskOrigin) -> Result<Option<TaskResult>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(TASK_RESULTS).map_err(db_err)?;
        let result = match table.get(task_key(task)).map_err(db_err)? {
            Some(v) => Some(serde_json::from_slice(v.value())?),
            None => None,
        };
        Ok(result)
    }

    pub fn insert_enrichment(&self, artifact: &ArtifactOrigin, enrichment: &Enrichment) -> Result<()> {
        let key = (
            artifact.ticket_id,
            artifact.artifact.as_str(),
            enrichment.name.as_str(),
        );
        let value = serde_json::to_vec(enrichment)?;
        let wt = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = wt.open_table(ENRICHMENTS).map_err(db_err)?;
            table.insert(key, value.as_slice()).map_err(db_err)?;
        }
        wt.commit().map_err(db_err)?;
        self.notify(
            vec![format!("tickets/{}", artifact.ticket_id)],
            DatabaseUpdateType::Updated,
        );
        Ok(())
    }

    /// Enrichments of one artifact, keyed by automation name.
    pub fn enrichments(&self, artifact: &ArtifactOrigin) -> Result<Vec<Enrichment>> {
        let (ticket, name) = (artifact.ticket_id, artifact.artifact.as_str());
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(ENRICHMENTS).map_err(db_err)?;
        let mut out = Vec::new();
        for entry in table.range((ticket, name, "")..).map_err(db_err)? {
            let (k, v) = entry.map_err(db_err)?;
            let (t, a, _) = k.value();
            if t != ticket || a != name {
                break;
            }
            out.push(serde_json::from_slice::<Enrichment>(v.value())?);
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Store trait implementations
// ---------------------------------------------------------------------------

#[async_trait]
impl JobStore for CatalystDb {
    async fn create_job(&self, job: &Job) -> Result<()> {
        let job = job.clone();
        self.blocking(move |db| db.insert_job(&job)).await
    }

    async fn update_job(&self, id: &str, update: JobUpdate) -> Result<Job> {
        let id = id.to_string();
        self.blocking(move |db| {
            db.modify_job(&id, |job| {
                if let Some(status) = update.status {
                    job.status = status;
                }
                if let Some(container) = update.container {
                    job.container = Some(container);
                }
                if let Some(log) = update.log {
                    job.log.push_str(&log);
                }
            })
        })
        .await
    }

    async fn complete_job(&self, id: &str, output: &AutomationOutput) -> Result<()> {
        let id = id.to_string();
        let output = output.clone();
        self.blocking(move |db| {
            db.modify_job(&id, |job| {
                job.status = JobStatus::Completed;
                job.output = Some(output);
            })
            .map(|_| ())
        })
        .await
    }

    async fn fail_job(&self, id: &str, reason: &str) -> Result<()> {
        let id = id.to_string();
        let reason = reason.to_string();
        self.blocking(move |db| {
            db.modify_job(&id, |job| {
                job.status = JobStatus::Failed;
                job.error = Some(reason);
            })
            .map(|_| ())
        })
        .await
    }

    async fn append_job_log(&self, id: &str, line: &str) -> Result<()> {
        let id = id.to_string();
        let line = line.to_string();
        self.blocking(move |db| db.modify_job(&id, |job| job.log.push_str(&line)).map(|_| ()))
            .await
    }
}

#[async_trait]
impl AutomationStore for CatalystDb {
    async fn get_automation(&self, id: &str) -> Result<Automation> {
        let id = id.to_string();
        self.blocking(move |db| db.automation(&id)).await
    }
}

#[async_trait]
impl TaskStore for CatalystDb {
    async fn complete_task(&self, task: &TaskOrigin, data: &AutomationOutput) -> Result<()> {
        let result = TaskResult {
            task: task.clone(),
            data: data.clone(),
            closed: Utc::now(),
        };
        self.blocking(move |db| db.insert_task_result(&result)).await
    }
}

#[async_trait]
impl ArtifactStore for CatalystDb {
    async fn enrich_artifact(&self, artifact: &ArtifactOrigin, enrichment: Enrichment) -> Result<()> {
        let artifact = artifact.clone();
        self.blocking(move |db| db.insert_enrichment(&artifact, &enrichment))
            .await
    }
}

#[async_trait]
impl LogStore for CatalystDb {
    async fn batch_create_logs(&self, entries: Vec<LogEntry>) -> Result<()> {
        self.blocking(move |db| db.insert_logs(&entries).map(|_| ()))
            .await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
