//! Configuration management.
//!
//! Loads configuration from TOML files with environment variable
//! substitution.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::isolation::IsolationLevel;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub postgres: PostgresConfig,
    pub sqlite: SqliteConfig,
    #[serde(default)]
    pub transaction: TransactionConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PostgresConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default)]
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SqliteConfig {
    pub path: String,
    #[serde(default = "default_create_if_missing")]
    pub create_if_missing: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransactionConfig {
    #[serde(default)]
    pub isolation: IsolationLevel,
    pub timeout_secs: Option<u64>,
}

impl TransactionConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

fn default_max_connections() -> u32 {
    5
}

fn default_create_if_missing() -> bool {
    true
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("DTX_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        // Substitute environment variables
        let config_str = substitute_env_vars(&config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.postgres.url.is_empty() {
            anyhow::bail!("postgres.url must not be empty");
        }
        if self.postgres.min_connections > self.postgres.max_connections {
            anyhow::bail!("postgres.min_connections exceeds max_connections");
        }
        if self.sqlite.path.is_empty() {
            anyhow::bail!("sqlite.path must not be empty");
        }
        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}
