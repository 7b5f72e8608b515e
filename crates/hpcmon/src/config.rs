//! Daemon configuration
//!
//! Layers, lowest precedence first: built-in defaults, an optional file named
//! by `HPCMON_CONFIG` (TOML, YAML or JSON by extension), then environment
//! variables such as `HPCMON__EBPF__POLL_INTERVAL_MS=50`.

use anyhow::{Context, Result};
use hpcmon_lib::config::MonitorConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const CONFIG_PATH_VAR: &str = "HPCMON_CONFIG";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(flatten)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Where the final JSON report is written; stdout when unset
    #[serde(default)]
    pub output_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Json,
            level: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the environment and the optional config file
    pub fn load() -> Result<Self> {
        let file = std::env::var_os(CONFIG_PATH_VAR).map(PathBuf::from);
        Self::from_sources(file.as_deref())
    }

    pub fn from_sources(file: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix("HPCMON")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read configuration")?;

        let config: AppConfig = settings
            .try_deserialize()
            .context("Invalid configuration")?;
        config
            .monitor
            .validate()
            .context("Configuration failed validation")?;
        Ok(config)
    }
}
