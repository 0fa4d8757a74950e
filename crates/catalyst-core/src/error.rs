use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure classes of the automation pipeline.
///
/// Every error raised by the core maps onto exactly one kind; the kind decides
/// whether the failure ends up inside a job's result, aborts the job, or is
/// only reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Unknown automation, empty script, malformed message.
    Configuration,
    /// Image pull, container create/start failures and non-zero exits.
    Sandbox,
    /// Persistence and log-append failures.
    Storage,
    /// Result could not be applied to its task or artifact.
    Routing,
    /// An external call exceeded its deadline.
    Timeout,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::Sandbox => "sandbox",
            Self::Storage => "storage",
            Self::Routing => "routing",
            Self::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum CatalystError {
    #[error("automation not found: {0}")]
    AutomationNotFound(String),

    #[error("automation '{0}' has an empty script")]
    EmptyScript(String),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("job already exists: {0}")]
    JobExists(String),

    #[error("task not found: ticket {ticket_id}, playbook {playbook_id}, task {task_id}")]
    TaskNotFound {
        ticket_id: i64,
        playbook_id: String,
        task_id: String,
    },

    #[error("artifact not found: ticket {ticket_id}, artifact {artifact}")]
    ArtifactNotFound { ticket_id: i64, artifact: String },

    #[error("origin must name either a task or an artifact, not both")]
    AmbiguousOrigin,

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("database error: {0}")]
    Db(String),

    #[error("background task failed: {0}")]
    Join(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl CatalystError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AutomationNotFound(_)
            | Self::EmptyScript(_)
            | Self::AmbiguousOrigin
            | Self::InvalidConfig(_)
            | Self::Yaml(_) => ErrorKind::Configuration,
            Self::TaskNotFound { .. } | Self::ArtifactNotFound { .. } => ErrorKind::Routing,
            Self::JobNotFound(_)
            | Self::JobExists(_)
            | Self::Db(_)
            | Self::Join(_)
            | Self::Io(_)
            | Self::Json(_) => ErrorKind::Storage,
        }
    }
}

pub type Result<T> = std::result::Result<T, CatalystError>;
