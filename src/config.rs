//! Configuration types, built from environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Default image lookback when the store holds no records yet.
pub const DEFAULT_LOOKBACK_DAYS: i64 = 30;

/// Default cron schedule: once a day at 06:00 UTC.
pub const DEFAULT_SCHEDULE: &str = "0 0 6 * * *";

/// Minimum length of the blob URL signing key.
const MIN_SIGNING_KEY_LEN: usize = 32;

/// Record store and blob store locations.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Path to the libSQL database file.
    pub db_path: PathBuf,
    /// Directory holding image blobs.
    pub blob_dir: PathBuf,
    /// Public base URL under which blobs are served; locators are `{base}/{key}`.
    pub blob_base_url: String,
    /// Key used to sign time-limited read URLs. Signing is disabled when unset.
    pub signing_key: Option<SecretString>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/wildboar.db"),
            blob_dir: PathBuf::from("./data/blobs"),
            blob_base_url: "http://localhost:8080/blobs".to_string(),
            signing_key: None,
        }
    }
}

impl StorageConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let signing_key = match std::env::var("WILDBOAR_BLOB_SIGNING_KEY") {
            Ok(key) if key.len() < MIN_SIGNING_KEY_LEN => {
                return Err(ConfigError::InvalidValue {
                    key: "WILDBOAR_BLOB_SIGNING_KEY".into(),
                    message: format!("must be at least {MIN_SIGNING_KEY_LEN} characters"),
                });
            }
            Ok(key) => Some(SecretString::from(key)),
            Err(_) => None,
        };

        Ok(Self {
            db_path: std::env::var("WILDBOAR_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            blob_dir: std::env::var("WILDBOAR_BLOB_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.blob_dir),
            blob_base_url: std::env::var("WILDBOAR_BLOB_BASE_URL")
                .map(|s| s.trim_end_matches('/').to_string())
                .unwrap_or(defaults.blob_base_url),
            signing_key,
        })
    }
}

/// Ingestion run settings.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// How far back to search when the store is empty.
    pub lookback_days: i64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            lookback_days: DEFAULT_LOOKBACK_DAYS,
        }
    }
}

impl IngestConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let lookback_days = env_or("WILDBOAR_LOOKBACK_DAYS", DEFAULT_LOOKBACK_DAYS)?;
        if lookback_days <= 0 {
            return Err(ConfigError::InvalidValue {
                key: "WILDBOAR_LOOKBACK_DAYS".into(),
                message: "must be positive".into(),
            });
        }
        Ok(Self { lookback_days })
    }
}

/// Processing run settings.
#[derive(Debug, Clone)]
pub struct ProcessingConfig {
    /// Additional attempts after the first one fails.
    pub max_retries: u32,
    /// Base of the exponential backoff: delays are `base * 2^(attempt-1)`.
    pub backoff_base: Duration,
    /// Path to the model artifact loaded at startup.
    pub model_path: PathBuf,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_secs(1),
            model_path: PathBuf::from("./model/wildboar-model.json"),
        }
    }
}

impl ProcessingConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            max_retries: env_or("WILDBOAR_MAX_RETRIES", defaults.max_retries)?,
            backoff_base: Duration::from_secs(env_or(
                "WILDBOAR_BACKOFF_BASE_SECS",
                defaults.backoff_base.as_secs(),
            )?),
            model_path: std::env::var("WILDBOAR_MODEL_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.model_path),
        })
    }
}

/// Scheduler and query API settings.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Six-field cron expression (seconds first) for scheduled runs.
    pub schedule: String,
    /// Port of the read-only query API.
    pub api_port: u16,
    /// Directory for rolling log files. Logs go to stderr only when unset.
    pub log_dir: Option<PathBuf>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            schedule: DEFAULT_SCHEDULE.to_string(),
            api_port: 8080,
            log_dir: None,
        }
    }
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            schedule: std::env::var("WILDBOAR_SCHEDULE").unwrap_or(defaults.schedule),
            api_port: env_or("WILDBOAR_API_PORT", defaults.api_port)?,
            log_dir: std::env::var("WILDBOAR_LOG_DIR").ok().map(PathBuf::from),
        })
    }
}

/// Read and parse an environment variable, falling back to `default` when unset.
fn env_or<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn processing_defaults_match_backoff_schedule() {
        let config = ProcessingConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.backoff_base, Duration::from_secs(1));
    }

    #[test]
    fn env_or_falls_back_when_unset() {
        let value: u32 = env_or("WILDBOAR_TEST_UNSET_VARIABLE", 7).unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn env_or_rejects_garbage() {
        // SAFETY: This variable is unique to this test; no other thread reads it.
        unsafe { std::env::set_var("WILDBOAR_TEST_GARBAGE_RETRIES", "three") };
        let result: Result<u32, _> = env_or("WILDBOAR_TEST_GARBAGE_RETRIES", 3);
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn default_schedule_parses() {
        use std::str::FromStr;
        assert!(cron::Schedule::from_str(DEFAULT_SCHEDULE).is_ok());
    }
}
