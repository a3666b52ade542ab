use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, SquashError};

/// Default number of layers fetched ahead of the fold.
pub const DEFAULT_PREFETCH_LAYERS: usize = 3;

/// Squash configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SquashConfig {
    /// Parent directory for per-run working areas (system temp dir if unset)
    pub work_dir: Option<PathBuf>,

    /// Maximum number of layers acquired ahead of the one being folded
    pub prefetch_layers: usize,

    /// Compression applied to the published archive
    pub output_compression: OutputCompression,

    /// Archive-root prefix stripped from every layer member path
    pub strip_prefix: Option<String>,

    /// Log level used when `RUST_LOG` is not set
    pub log_level: LogLevel,

    /// Registry client settings
    pub registry: RegistryConfig,
}

impl Default for SquashConfig {
    fn default() -> Self {
        Self {
            work_dir: None,
            prefetch_layers: DEFAULT_PREFETCH_LAYERS,
            output_compression: OutputCompression::None,
            strip_prefix: None,
            log_level: LogLevel::Warn,
            registry: RegistryConfig::default(),
        }
    }
}

impl SquashConfig {
    /// Load configuration from a YAML or JSON file.
    ///
    /// The format is picked from the extension; anything other than
    /// `.json` is parsed as YAML.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            SquashError::ConfigError(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let config: SquashConfig = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            _ => serde_yaml::from_str(&content)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Check invariants that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.prefetch_layers == 0 {
            return Err(SquashError::ConfigError(
                "prefetch_layers must be at least 1".to_string(),
            ));
        }

        if let Some(prefix) = &self.strip_prefix {
            if prefix.split('/').any(|segment| segment == "..") {
                return Err(SquashError::ConfigError(format!(
                    "strip_prefix must not contain '..': {}",
                    prefix
                )));
            }
        }

        if self.registry.username.is_some() != self.registry.password.is_some() {
            return Err(SquashError::ConfigError(
                "registry username and password must be set together".to_string(),
            ));
        }

        Ok(())
    }

    /// Directory under which working areas are created.
    pub fn work_root(&self) -> PathBuf {
        self.work_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// Registry client configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Talk plain HTTP instead of HTTPS
    pub insecure: bool,

    /// Username for basic auth (falls back to env and docker config)
    pub username: Option<String>,

    /// Password for basic auth
    pub password: Option<String>,

    /// Path to a Docker `config.json` holding registry auths
    pub docker_config: Option<PathBuf>,
}

/// Compression of the published archive
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputCompression {
    /// Plain tar
    #[default]
    None,
    /// gzip-compressed tar
    Gzip,
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Filter directive understood by `tracing_subscriber::EnvFilter`.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}
