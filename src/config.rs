use std::{str::FromStr, time::Duration};

use anyhow::{bail, Context, Result};

use crate::store::RetryPolicy;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres URL. Without one the service keeps everything in memory.
    pub database_url: Option<String>,
    pub server_host: String,
    pub server_port: u16,
    /// Greenhouse the simulated sensor reports for and the control loop reads.
    pub greenhouse_id: Option<i32>,
    /// Sensor sampling interval in seconds.
    pub sample_interval_secs: u64,
    /// Control loop interval in seconds.
    pub control_interval_secs: u64,
    pub retention_days: u32,
    pub retention_batch_size: u32,
    /// How often the sweeper checks whether a new calendar day started.
    pub retention_check_interval_secs: u64,
    pub storage_timeout_ms: u64,
    pub storage_attempts: u32,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let optional = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_owned());

        let config = Self {
            database_url: lookup("DATABASE_URL").filter(|s| !s.trim().is_empty()),
            server_host: optional("SERVER_HOST", "0.0.0.0"),
            server_port: parse(&optional("SERVER_PORT", "8080"), "SERVER_PORT")?,
            greenhouse_id: lookup("GREENHOUSE_ID")
                .filter(|s| !s.trim().is_empty())
                .map(|s| parse(&s, "GREENHOUSE_ID"))
                .transpose()?,
            sample_interval_secs: parse(&optional("SAMPLE_INTERVAL_SECS", "5"), "SAMPLE_INTERVAL_SECS")?,
            control_interval_secs: parse(&optional("CONTROL_INTERVAL_SECS", "5"), "CONTROL_INTERVAL_SECS")?,
            retention_days: parse(&optional("RETENTION_DAYS", "7"), "RETENTION_DAYS")?,
            retention_batch_size: parse(&optional("RETENTION_BATCH_SIZE", "500"), "RETENTION_BATCH_SIZE")?,
            retention_check_interval_secs: parse(
                &optional("RETENTION_CHECK_INTERVAL_SECS", "60"),
                "RETENTION_CHECK_INTERVAL_SECS",
            )?,
            storage_timeout_ms: parse(&optional("STORAGE_TIMEOUT_MS", "2000"), "STORAGE_TIMEOUT_MS")?,
            storage_attempts: parse(&optional("STORAGE_ATTEMPTS", "2"), "STORAGE_ATTEMPTS")?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let positive = [
            ("SAMPLE_INTERVAL_SECS", self.sample_interval_secs),
            ("CONTROL_INTERVAL_SECS", self.control_interval_secs),
            ("RETENTION_DAYS", u64::from(self.retention_days)),
            ("RETENTION_BATCH_SIZE", u64::from(self.retention_batch_size)),
            ("RETENTION_CHECK_INTERVAL_SECS", self.retention_check_interval_secs),
            ("STORAGE_TIMEOUT_MS", self.storage_timeout_ms),
            ("STORAGE_ATTEMPTS", u64::from(self.storage_attempts)),
        ];
        for (key, value) in positive {
            if value == 0 {
                bail!("{key} must be greater than zero");
            }
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.storage_attempts,
            timeout: Duration::from_millis(self.storage_timeout_ms),
            ..RetryPolicy::default()
        }
    }
}

fn parse<T>(raw: &str, key: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.trim()
        .parse()
        .with_context(|| format!("{key} must be a valid number, got {raw:?}"))
}
