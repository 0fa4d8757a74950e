//! Bus payloads.
//!
//! These structs are the wire contract for anything subscribed to the bus.
//! Field names match the JSON the rest of the platform already speaks, so a
//! message can be logged or forwarded verbatim with `serde_json`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CatalystError, ErrorKind};

/// Secret injected so a script can authenticate against the platform API.
pub const SECRET_API_KEY: &str = "catalyst_apikey";
/// Secret injected so a script knows where the platform API lives.
pub const SECRET_API_URL: &str = "catalyst_apiurl";

pub type JsonMap = serde_json::Map<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Origin
// ---------------------------------------------------------------------------

/// A playbook task that asked for an automation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOrigin {
    pub ticket_id: i64,
    pub playbook_id: String,
    pub task_id: String,
}

/// A ticket artifact that asked for an enrichment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactOrigin {
    pub ticket_id: i64,
    pub artifact: String,
}

/// Where the result of a job has to be applied.
///
/// On the wire this is `{"task_origin": {...}}`, `{"artifact_origin": {...}}`
/// or `null`. Objects that carry both alternatives are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "Option<OriginRepr>", into = "Option<OriginRepr>")]
pub enum Origin {
    Task(TaskOrigin),
    Artifact(ArtifactOrigin),
    /// Global automation; the result is not applied anywhere.
    #[default]
    None,
}

impl Origin {
    pub fn task(ticket_id: i64, playbook_id: impl Into<String>, task_id: impl Into<String>) -> Self {
        Self::Task(TaskOrigin {
            ticket_id,
            playbook_id: playbook_id.into(),
            task_id: task_id.into(),
        })
    }

    pub fn artifact(ticket_id: i64, artifact: impl Into<String>) -> Self {
        Self::Artifact(ArtifactOrigin {
            ticket_id,
            artifact: artifact.into(),
        })
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OriginRepr {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    task_origin: Option<TaskOrigin>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    artifact_origin: Option<ArtifactOrigin>,
}

impl TryFrom<Option<OriginRepr>> for Origin {
    type Error = CatalystError;

    fn try_from(repr: Option<OriginRepr>) -> Result<Self, Self::Error> {
        let Some(repr) = repr else {
            return Ok(Origin::None);
        };
        match (repr.task_origin, repr.artifact_origin) {
            (Some(_), Some(_)) => Err(CatalystError::AmbiguousOrigin),
            (Some(task), None) => Ok(Origin::Task(task)),
            (None, Some(artifact)) => Ok(Origin::Artifact(artifact)),
            (None, None) => Ok(Origin::None),
        }
    }
}

impl From<Origin> for Option<OriginRepr> {
    fn from(origin: Origin) -> Self {
        match origin {
            Origin::Task(task) => Some(OriginRepr {
                task_origin: Some(task),
                artifact_origin: None,
            }),
            Origin::Artifact(artifact) => Some(OriginRepr {
                task_origin: None,
                artifact_origin: Some(artifact),
            }),
            Origin::None => None,
        }
    }
}

// ---------------------------------------------------------------------------
// AutomationOutput
// ---------------------------------------------------------------------------

/// Error payload reported in place of an automation's own output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AutomationError {
    pub error: String,
}

/// What an automation produced.
///
/// Serialises as a plain JSON object either way: the script's own object,
/// or `{"error": "..."}` when the sandbox failed or printed something that
/// was not a JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AutomationOutput {
    Failed(AutomationError),
    Data(JsonMap),
}

impl AutomationOutput {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Failed(AutomationError {
            error: message.into(),
        })
    }

    /// Interpret raw sandbox stdout. Anything that is not a JSON object is
    /// kept verbatim under `"error"`. An object that is exactly
    /// `{"error": "<text>"}` is a failure, the same as when it is read back
    /// from storage or the bus.
    pub fn from_stdout(stdout: &[u8]) -> Self {
        match serde_json::from_slice::<Self>(stdout) {
            Ok(out) => out,
            Err(_) => Self::error(String::from_utf8_lossy(stdout).into_owned()),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    pub fn to_map(&self) -> JsonMap {
        match self {
            Self::Data(map) => map.clone(),
            Self::Failed(e) => {
                let mut map = JsonMap::new();
                map.insert("error".into(), serde_json::Value::String(e.error.clone()));
                map
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Envelopes
// ---------------------------------------------------------------------------

/// The single argument handed to a sandboxed script.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScriptMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub secrets: BTreeMap<String, String>,
}

/// Request to run an automation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMsg {
    pub id: String,
    pub automation: String,
    #[serde(default)]
    pub origin: Origin,
    #[serde(default)]
    pub message: ScriptMessage,
}

/// Outcome of a finished job, addressed to its origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMsg {
    pub automation: String,
    pub data: AutomationOutput,
    #[serde(default)]
    pub target: Origin,
}

/// Audit record of a user-facing call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMsg {
    pub ids: Vec<String>,
    pub function: String,
    pub user: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseUpdateType {
    Read,
    Created,
    Updated,
}

/// Emitted by the store after a write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseUpdateMsg {
    pub ids: Vec<String>,
    #[serde(rename = "type")]
    pub kind: DatabaseUpdateType,
}

/// A failure that was handled without stopping the pipeline but that an
/// operator should still see.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub kind: ErrorKind,
    pub stage: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl ErrorEvent {
    pub fn new(
        job_id: Option<&str>,
        kind: ErrorKind,
        stage: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            job_id: job_id.map(str::to_owned),
            kind,
            stage: stage.into(),
            message: message.into(),
            at: Utc::now(),
        }
    }
}
