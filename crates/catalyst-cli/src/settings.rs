use std::path::PathBuf;

use anyhow::Context;
use catalyst_core::ServiceConfig;
use clap::Args;

/// Global flags that override the config file.
#[derive(Args, Debug, Default)]
pub struct Overrides {
    /// YAML config file
    #[arg(long, global = true, env = "CATALYST_CONFIG")]
    pub config: Option<PathBuf>,

    /// Database file
    #[arg(long, global = true, env = "CATALYST_DB")]
    pub db: Option<PathBuf>,

    /// Platform API URL handed to scripts
    #[arg(long, global = true, env = "CATALYST_API_URL")]
    pub api_url: Option<String>,

    /// Platform API key handed to scripts
    #[arg(long, global = true, env = "CATALYST_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Docker network automation containers join
    #[arg(long, global = true, env = "CATALYST_NETWORK")]
    pub network: Option<String>,
}

/// Config file (or defaults) with flag and environment overrides applied.
pub fn resolve(overrides: &Overrides) -> anyhow::Result<ServiceConfig> {
    let mut config = match &overrides.config {
        Some(path) => ServiceConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => ServiceConfig::default(),
    };
    if let Some(db) = &overrides.db {
        config.db_path = db.clone();
    }
    if let Some(url) = &overrides.api_url {
        config.api_url = url.clone();
    }
    if let Some(key) = &overrides.api_key {
        config.api_key = key.clone();
    }
    if let Some(network) = &overrides.network {
        config.network = network.clone();
    }
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_defaults() {
        let config = resolve(&Overrides {
            network: Some("isolated".into()),
            db: Some(PathBuf::from("/tmp/c.redb")),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(config.network, "isolated");
        assert_eq!(config.db_path, PathBuf::from("/tmp/c.redb"));
        assert_eq!(config.timeouts.run_secs, 900);
    }

    #[test]
    fn empty_network_override_is_rejected() {
        let err = resolve(&Overrides {
            network: Some(String::new()),
            ..Default::default()
        })
        .unwrap_err();
        assert!(err.to_string().contains("network"));
    }
}
