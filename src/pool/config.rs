use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ledger::RetentionPolicy;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Identity of this server instance in the usage ledger. Defaults to
    /// `http://<listen>` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub validator: ValidatorConfig,
    #[serde(default)]
    pub allocator: AllocatorConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub admin: AdminConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            instance_id: None,
            listen: default_listen(),
            validator: ValidatorConfig::default(),
            allocator: AllocatorConfig::default(),
            telemetry: TelemetryConfig::default(),
            admin: AdminConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ValidatorConfig {
    #[serde(default = "default_validator_base_url")]
    pub base_url: String,
    #[serde(default = "default_validator_model")]
    pub model: String,
    #[serde(default = "default_validator_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            base_url: default_validator_base_url(),
            model: default_validator_model(),
            timeout_seconds: default_validator_timeout_seconds(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AllocatorConfig {
    /// Upper bound on validations performed by a single allocation call.
    #[serde(default = "default_max_candidates_per_call")]
    pub max_candidates_per_call: usize,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            max_candidates_per_call: default_max_candidates_per_call(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_daily_retention")]
    pub daily_retention: usize,
    #[serde(default = "default_hourly_retention")]
    pub hourly_retention: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            daily_retention: default_daily_retention(),
            hourly_retention: default_hourly_retention(),
        }
    }
}

impl TelemetryConfig {
    pub fn retention(&self) -> RetentionPolicy {
        RetentionPolicy {
            daily_buckets: self.daily_retention.max(1),
            hourly_buckets: self.hourly_retention.max(1),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_bulk_validation_concurrency")]
    pub bulk_validation_concurrency: usize,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            bulk_validation_concurrency: default_bulk_validation_concurrency(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {reason}")]
    Invalid { reason: String },
}

impl PoolConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Invalid {
                reason: "listen must not be empty".to_string(),
            });
        }
        if self.validator.timeout_seconds == 0 {
            return Err(ConfigError::Invalid {
                reason: "validator.timeout_seconds must be > 0".to_string(),
            });
        }
        if self.allocator.max_candidates_per_call == 0 {
            return Err(ConfigError::Invalid {
                reason: "allocator.max_candidates_per_call must be > 0".to_string(),
            });
        }
        if let Some(instance_id) = self.instance_id.as_deref() {
            if instance_id.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    reason: "instance_id must not be blank".to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn instance_id(&self) -> String {
        self.instance_id
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("http://{}", self.listen.trim()))
    }
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_validator_base_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}

fn default_validator_model() -> String {
    "gemini-2.5-flash".to_string()
}

fn default_validator_timeout_seconds() -> u64 {
    8
}

fn default_max_candidates_per_call() -> usize {
    16
}

fn default_daily_retention() -> usize {
    30
}

fn default_hourly_retention() -> usize {
    24
}

fn default_bulk_validation_concurrency() -> usize {
    4
}
