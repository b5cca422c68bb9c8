//! Settings of a worker, read from environment variables.
//!
//! | variable | default |
//! |---|---|
//! | `DATA_MANAGEMENT_READ_URL` | `http://localhost:8085/management` |
//! | `DATA_MANAGEMENT_WRITE_URL` | the read URL |
//! | `REDIS_HOST` | `127.0.0.1` |
//! | `REDIS_PORT` | `6379` |
//! | `SCRATCH_DIR` | `<tmp>/script-engine` |
//! | `PLUGIN_INTERPRETER` | `node` |
//! | `PLUGIN_FILE_EXTENSION` | `js` |
//! | `PLUGIN_TIMEOUT_SECS` | `300` |
//! | `JOB_MAX_ATTEMPTS` | `3` |
//! | `JOB_RETENTION_HOURS` | `24` |
use std::{fmt::Display, path::PathBuf, str::FromStr, time::Duration};

use chrono::TimeDelta;
use thiserror::Error;

pub const DATA_MANAGEMENT_READ_URL: &str = "DATA_MANAGEMENT_READ_URL";
pub const DATA_MANAGEMENT_WRITE_URL: &str = "DATA_MANAGEMENT_WRITE_URL";
pub const REDIS_HOST: &str = "REDIS_HOST";
pub const REDIS_PORT: &str = "REDIS_PORT";
pub const SCRATCH_DIR: &str = "SCRATCH_DIR";
pub const PLUGIN_INTERPRETER: &str = "PLUGIN_INTERPRETER";
pub const PLUGIN_FILE_EXTENSION: &str = "PLUGIN_FILE_EXTENSION";
pub const PLUGIN_TIMEOUT_SECS: &str = "PLUGIN_TIMEOUT_SECS";
pub const JOB_MAX_ATTEMPTS: &str = "JOB_MAX_ATTEMPTS";
pub const JOB_RETENTION_HOURS: &str = "JOB_RETENTION_HOURS";

const DEFAULT_DATA_MANAGEMENT_URL: &str = "http://localhost:8085/management";
const DEFAULT_REDIS_HOST: &str = "127.0.0.1";
const DEFAULT_REDIS_PORT: u16 = 6379;
const DEFAULT_PLUGIN_INTERPRETER: &str = "node";
const DEFAULT_PLUGIN_FILE_EXTENSION: &str = "js";
const DEFAULT_PLUGIN_TIMEOUT_SECS: u64 = 300;
const DEFAULT_JOB_MAX_ATTEMPTS: u16 = 3;
const DEFAULT_JOB_RETENTION_HOURS: i64 = 24;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Invalid value {value:?} for {variable}: {reason}")]
pub struct ConfigError {
    pub variable: &'static str,
    pub value: String,
    pub reason: String,
}

impl ConfigError {
    fn new(variable: &'static str, value: &str, reason: impl Display) -> Self {
        Self {
            variable,
            value: value.to_owned(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub data_management_read_url: String,
    pub data_management_write_url: String,
    pub redis_host: String,
    pub redis_port: u16,
    pub scratch_dir: PathBuf,
    /// Program and leading arguments used to run a plugin file.
    pub plugin_interpreter: Vec<String>,
    pub plugin_file_extension: String,
    pub plugin_timeout: Duration,
    pub job_max_attempts: u16,
    pub job_retention: TimeDelta,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|variable| std::env::var(variable).ok())
    }

    /// Read the settings through `lookup`, unset and empty variables take their default.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |variable: &str| lookup(variable).filter(|value| !value.trim().is_empty());

        let data_management_read_url = lookup(DATA_MANAGEMENT_READ_URL)
            .unwrap_or_else(|| DEFAULT_DATA_MANAGEMENT_URL.to_owned());
        let data_management_write_url =
            lookup(DATA_MANAGEMENT_WRITE_URL).unwrap_or_else(|| data_management_read_url.clone());

        let redis_port = match lookup(REDIS_PORT) {
            Some(value) => parse::<u16>(REDIS_PORT, &value)?,
            None => DEFAULT_REDIS_PORT,
        };

        let plugin_interpreter: Vec<String> = lookup(PLUGIN_INTERPRETER)
            .unwrap_or_else(|| DEFAULT_PLUGIN_INTERPRETER.to_owned())
            .split_whitespace()
            .map(ToOwned::to_owned)
            .collect();

        let plugin_file_extension = lookup(PLUGIN_FILE_EXTENSION)
            .map(|extension| extension.trim_start_matches('.').to_owned())
            .unwrap_or_else(|| DEFAULT_PLUGIN_FILE_EXTENSION.to_owned());

        let plugin_timeout = match lookup(PLUGIN_TIMEOUT_SECS) {
            Some(value) => match parse::<u64>(PLUGIN_TIMEOUT_SECS, &value)? {
                0 => return Err(ConfigError::new(PLUGIN_TIMEOUT_SECS, &value, "must be positive")),
                seconds => seconds,
            },
            None => DEFAULT_PLUGIN_TIMEOUT_SECS,
        };

        let job_max_attempts = match lookup(JOB_MAX_ATTEMPTS) {
            Some(value) => match parse::<u16>(JOB_MAX_ATTEMPTS, &value)? {
                0 => return Err(ConfigError::new(JOB_MAX_ATTEMPTS, &value, "must be positive")),
                attempts => attempts,
            },
            None => DEFAULT_JOB_MAX_ATTEMPTS,
        };

        let job_retention = match lookup(JOB_RETENTION_HOURS) {
            Some(value) => {
                let hours = parse::<i64>(JOB_RETENTION_HOURS, &value)?;
                TimeDelta::try_hours(hours)
                    .filter(|retention| *retention >= TimeDelta::zero())
                    .ok_or_else(|| ConfigError::new(JOB_RETENTION_HOURS, &value, "out of range"))?
            }
            None => TimeDelta::hours(DEFAULT_JOB_RETENTION_HOURS),
        };

        Ok(Self {
            data_management_read_url,
            data_management_write_url,
            redis_host: lookup(REDIS_HOST).unwrap_or_else(|| DEFAULT_REDIS_HOST.to_owned()),
            redis_port,
            scratch_dir: lookup(SCRATCH_DIR)
                .map(PathBuf::from)
                .unwrap_or_else(|| std::env::temp_dir().join("script-engine")),
            plugin_interpreter,
            plugin_file_extension,
            plugin_timeout: Duration::from_secs(plugin_timeout),
            job_max_attempts,
            job_retention,
        })
    }

    pub fn redis_url(&self) -> String {
        format!("redis://{}:{}/", self.redis_host, self.redis_port)
    }

    pub fn plugin_directory(&self) -> PathBuf {
        self.scratch_dir.join("plugins")
    }

    pub fn progress_directory(&self) -> PathBuf {
        self.scratch_dir.join("progress")
    }

    pub fn results_directory(&self) -> PathBuf {
        self.scratch_dir.join("results")
    }
}

fn parse<T>(variable: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    value
        .trim()
        .parse()
        .map_err(|error| ConfigError::new(variable, value, error))
}
