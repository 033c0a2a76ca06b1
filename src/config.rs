//! Configuration for the task registry.

use std::time::Duration;

use crate::error::ConfigError;

const DEFAULT_MAX_TASKS: usize = 1024;
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 5_000;

/// Task registry configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Maximum number of live (launched, not yet closed) tasks.
    pub max_tasks: usize,
    /// Deadline attached to every launched task, if any.
    pub default_timeout: Option<Duration>,
    /// How long `shutdown` waits for tasks to close after cancelling them.
    pub shutdown_grace: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_tasks: DEFAULT_MAX_TASKS,
            default_timeout: None,
            shutdown_grace: Duration::from_millis(DEFAULT_SHUTDOWN_GRACE_MS),
        }
    }
}

impl RegistryConfig {
    /// Load configuration from environment variables.
    ///
    /// A `.env` file in the working directory is read first if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();
        Self::resolve()
    }

    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let max_tasks = parse_optional_env("TASKCTX_MAX_TASKS", DEFAULT_MAX_TASKS)?;
        if max_tasks == 0 {
            return Err(ConfigError::InvalidValue {
                key: "TASKCTX_MAX_TASKS".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        // 0 disables the default deadline.
        let default_timeout = match parse_optional_env::<u64>("TASKCTX_DEFAULT_TIMEOUT_MS", 0)? {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };

        let shutdown_grace = Duration::from_millis(parse_optional_env(
            "TASKCTX_SHUTDOWN_GRACE_MS",
            DEFAULT_SHUTDOWN_GRACE_MS,
        )?);

        Ok(Self {
            max_tasks,
            default_timeout,
            shutdown_grace,
        })
    }
}

pub(crate) fn optional_env(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(val) if val.is_empty() => Ok(None),
        Ok(val) => Ok(Some(val)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(ConfigError::ParseError(format!(
            "failed to read {key}: {e}"
        ))),
    }
}

pub(crate) fn parse_optional_env<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    optional_env(key)?
        .map(|s| {
            s.parse().map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{e}"),
            })
        })
        .transpose()
        .map(|opt| opt.unwrap_or(default))
}
