//! Records owned by the automation core.
//!
//! A [`Job`] follows `Created → Running → Completed | Failed`. The coordinator
//! writes `Running` together with the container handle, `Completed` once a
//! result has been published, and `Failed` when the pipeline stopped before a
//! sandbox ever produced anything.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::messages::{AutomationOutput, JobMsg, JsonMap, Origin};

// ---------------------------------------------------------------------------
// JobStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Created,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// One execution of an automation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub automation: String,
    #[serde(default)]
    pub origin: Origin,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub status: JobStatus,
    /// Sandbox handle; set once the container exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    /// Image pull output followed by the script's stderr, line by line.
    #[serde(default)]
    pub log: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<AutomationOutput>,
    /// Why the job stopped short of a result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// A freshly received job, before any automation lookup happened.
    pub fn from_msg(msg: &JobMsg) -> Self {
        let now = Utc::now();
        Self {
            id: msg.id.clone(),
            automation: msg.automation.clone(),
            origin: msg.origin.clone(),
            payload: msg.message.payload.clone(),
            status: JobStatus::Created,
            container: None,
            log: String::new(),
            output: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update applied after the container was created.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub container: Option<String>,
    /// Appended to the existing log.
    pub log: Option<String>,
}

// ---------------------------------------------------------------------------
// Automation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutomationType {
    Global,
    Artifact,
    Playbook,
}

impl AutomationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Artifact => "artifact",
            Self::Playbook => "playbook",
        }
    }
}

impl std::str::FromStr for AutomationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "global" => Ok(Self::Global),
            "artifact" => Ok(Self::Artifact),
            "playbook" => Ok(Self::Playbook),
            other => Err(format!(
                "unknown automation type '{other}' (expected global, artifact or playbook)"
            )),
        }
    }
}

/// A script and the image it runs in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Automation {
    pub id: String,
    pub image: String,
    pub script: String,
    /// JSON schema of the expected payload; stored for the UI, not enforced here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<serde_json::Value>,
    /// Where the automation may be triggered from.
    #[serde(default)]
    pub types: Vec<AutomationType>,
}

// ---------------------------------------------------------------------------
// Audit log and downstream records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(rename = "type")]
    pub kind: String,
    pub reference: String,
    pub creator: String,
    pub message: String,
    pub created: DateTime<Utc>,
}

/// Named enrichment attached to an artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Enrichment {
    pub name: String,
    pub data: JsonMap,
    pub created: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::ScriptMessage;
    use serde_json::json;

    #[test]
    fn job_from_msg_starts_created() {
        let msg = JobMsg {
            id: "j1".into(),
            automation: "hash.sha1".into(),
            origin: Origin::artifact(1, "evil.exe"),
            message: ScriptMessage {
                payload: json!({"default": "hello"}),
                ..Default::default()
            },
        };
        let job = Job::from_msg(&msg);
        assert_eq!(job.status, JobStatus::Created);
        assert_eq!(job.payload, json!({"default": "hello"}));
        assert_eq!(job.origin, Origin::artifact(1, "evil.exe"));
        assert!(job.container.is_none());
    }

    #[test]
    fn terminal_statuses() {
        assert!(!JobStatus::Created.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn automation_type_parses() {
        assert_eq!("artifact".parse::<AutomationType>(), Ok(AutomationType::Artifact));
        assert!("ticket".parse::<AutomationType>().is_err());
    }

    #[test]
    fn log_entry_type_field() {
        let entry = LogEntry {
            kind: "request".into(),
            reference: "tickets/1".into(),
            creator: "bob".into(),
            message: "GetTicket".into(),
            created: Utc::now(),
        };
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["type"], "request");
    }
}
