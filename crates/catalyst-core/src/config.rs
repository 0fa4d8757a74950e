use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CatalystError, Result};

// ---------------------------------------------------------------------------
// TimeoutConfig
// ---------------------------------------------------------------------------

/// Deadlines for the container lifecycle, in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_pull_secs")]
    pub pull_secs: u64,
    #[serde(default = "default_create_secs")]
    pub create_secs: u64,
    #[serde(default = "default_run_secs")]
    pub run_secs: u64,
}

fn default_pull_secs() -> u64 {
    600
}

fn default_create_secs() -> u64 {
    60
}

fn default_run_secs() -> u64 {
    900
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            pull_secs: default_pull_secs(),
            create_secs: default_create_secs(),
            run_secs: default_run_secs(),
        }
    }
}

impl TimeoutConfig {
    pub fn pull(&self) -> Duration {
        Duration::from_secs(self.pull_secs)
    }

    pub fn create(&self) -> Duration {
        Duration::from_secs(self.create_secs)
    }

    pub fn run(&self) -> Duration {
        Duration::from_secs(self.run_secs)
    }
}

// ---------------------------------------------------------------------------
// BusConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Handler invocations allowed in flight per subscriber.
    #[serde(default = "default_dispatch_concurrency")]
    pub dispatch_concurrency: usize,
}

fn default_dispatch_concurrency() -> usize {
    16
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            dispatch_concurrency: default_dispatch_concurrency(),
        }
    }
}

// ---------------------------------------------------------------------------
// ServiceConfig (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Base URL scripts use to call back into the platform.
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// Key scripts use to call back into the platform.
    #[serde(default)]
    pub api_key: String,
    /// Docker network automation containers are attached to.
    #[serde(default = "default_network")]
    pub network: String,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub bus: BusConfig,
}

fn default_api_url() -> String {
    "http://localhost:8000/api".to_string()
}

fn default_network() -> String {
    "catalyst".to_string()
}

fn default_db_path() -> PathBuf {
    PathBuf::from("catalyst.redb")
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            api_key: String::new(),
            network: default_network(),
            db_path: default_db_path(),
            timeouts: TimeoutConfig::default(),
            bus: BusConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Read a YAML config file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let cfg: ServiceConfig = serde_yaml::from_str(&data)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.network.trim().is_empty() {
            return Err(CatalystError::InvalidConfig("network must not be empty".into()));
        }
        if self.api_url.trim().is_empty() {
            return Err(CatalystError::InvalidConfig("api_url must not be empty".into()));
        }
        for (name, secs) in [
            ("timeouts.pull_secs", self.timeouts.pull_secs),
            ("timeouts.create_secs", self.timeouts.create_secs),
            ("timeouts.run_secs", self.timeouts.run_secs),
        ] {
            if secs == 0 {
                return Err(CatalystError::InvalidConfig(format!("{name} must be positive")));
            }
        }
        if self.bus.dispatch_concurrency == 0 {
            return Err(CatalystError::InvalidConfig(
                "bus.dispatch_concurrency must be positive".into(),
            ));
        }
        Ok(())
    }
}
