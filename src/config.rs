use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {message}")]
    InvalidValue { name: String, message: String },
    #[error("failed to parse {name} as integer: {source}")]
    ParseInt {
        name: String,
        #[source]
        source: std::num::ParseIntError,
    },
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Database
    pub database_path: PathBuf,

    // Derived output
    pub derived_dir: PathBuf,

    // Workers
    pub worker_concurrency: usize,
    pub worker_id: String,
    pub failure_policy: FailurePolicy,
    /// `None` drains the backlog and exits; `Some` idles this long between
    /// empty polls instead.
    pub watch_interval: Option<Duration>,
}

/// What a coordinator does after a job fails to derive or publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Stop this worker and surface the error.
    Abort,
    /// Log the failure, leave the job claimed, and claim the next one.
    Continue,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if an environment variable is present but invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        let watch_secs = parse_env_u64("WATCH_INTERVAL_SECS", 0)?;

        Ok(Self {
            // Database
            database_path: PathBuf::from(env_or_default(
                "DATABASE_PATH",
                "./data/captures.sqlite",
            )),

            // Derived output
            derived_dir: PathBuf::from(env_or_default("DERIVED_DIR", "./data/derived")),

            // Workers
            worker_concurrency: parse_env_usize("WORKER_CONCURRENCY", 1)?,
            worker_id: optional_env("WORKER_ID").unwrap_or_else(default_worker_id),
            failure_policy: parse_failure_policy(&env_or_default("ON_FAILURE", "abort"))?,
            watch_interval: (watch_secs > 0).then(|| Duration::from_secs(watch_secs)),
        })
    }

    /// Defaults suitable for tests; callers override the paths.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            database_path: PathBuf::from("./test.sqlite"),
            derived_dir: PathBuf::from("./derived"),
            worker_concurrency: 1,
            worker_id: "derive:test".to_string(),
            failure_policy: FailurePolicy::Abort,
            watch_interval: None,
        }
    }

    /// Validate that the configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                name: "WORKER_CONCURRENCY".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.worker_id.is_empty() {
            return Err(ConfigError::InvalidValue {
                name: "WORKER_ID".to_string(),
                message: "cannot be empty".to_string(),
            });
        }
        if self.database_path.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                name: "DATABASE_PATH".to_string(),
                message: "cannot be empty".to_string(),
            });
        }
        Ok(())
    }

    /// Claimant identity for the `n`th coordinator in this process.
    #[must_use]
    pub fn claimant_id(&self, n: usize) -> String {
        format!("{}/{n}", self.worker_id)
    }
}

fn default_worker_id() -> String {
    let host = optional_env("HOSTNAME").unwrap_or_else(|| "localhost".to_string());
    format!("derive:{host}:{}", std::process::id())
}

fn optional_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn env_or_default(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_env_u64(name: &str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_env_usize(name: &str, default: usize) -> Result<usize, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_failure_policy(value: &str) -> Result<FailurePolicy, ConfigError> {
    match value.to_lowercase().as_str() {
        "abort" => Ok(FailurePolicy::Abort),
        "continue" => Ok(FailurePolicy::Continue),
        _ => Err(ConfigError::InvalidValue {
            name: "ON_FAILURE".to_string(),
            message: format!("must be 'abort' or 'continue', got '{value}'"),
        }),
    }
}
