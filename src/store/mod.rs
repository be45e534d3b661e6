//! Narrow storage contracts the control core talks through.
//!
//! `PgStore` backs them with Postgres; `MemoryStore` keeps everything in
//! process and is what the service falls back to without `DATABASE_URL`.

mod memory;
mod postgres;

use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time;
use tracing::warn;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::{
    db::models::{
        Alert, AlertFilter, Band, Device, DeviceRecord, DeviceStatus, HandleOutcome,
        HistoryPoint, Parameter, Reading, ScheduledTask, SensorSample, Thresholds,
    },
    error::StoreError,
};

pub type StoreResult<T> = Result<T, StoreError>;

/// History windows longer than this are returned as hourly averages.
pub const RAW_HISTORY_MAX_HOURS: u32 = 48;

#[async_trait]
pub trait SampleStore: Send + Sync {
    async fn insert_sample(
        &self,
        greenhouse_id: Option<i32>,
        reading: Reading,
        recorded_at: DateTime<Utc>,
    ) -> StoreResult<SensorSample>;

    /// Most recent sample overall, or for one greenhouse.
    async fn latest_sample(&self, greenhouse_id: Option<i32>) -> StoreResult<Option<SensorSample>>;

    /// Samples from the last `hours`, ascending. Raw up to
    /// `RAW_HISTORY_MAX_HOURS`, hourly averages beyond.
    async fn history(&self, hours: u32, greenhouse_id: Option<i32>) -> StoreResult<Vec<HistoryPoint>>;

    /// Delete at most `limit` of the oldest samples older than `days`.
    async fn delete_samples_older_than(&self, days: u32, limit: u32) -> StoreResult<u64>;

    async fn count_samples_older_than(&self, days: u32) -> StoreResult<i64>;
}

#[async_trait]
pub trait ThresholdStore: Send + Sync {
    /// Stored bands; parameters without a row resolve to compiled defaults.
    async fn get_thresholds(&self) -> StoreResult<Thresholds>;

    async fn set_threshold(&self, parameter: Parameter, band: Band) -> StoreResult<()>;
}

#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// Append a record; never updates in place.
    async fn write_device_state(&self, device: Device, status: DeviceStatus) -> StoreResult<DeviceRecord>;

    /// Latest record per device that has one, ordered by device.
    async fn current_states(&self) -> StoreResult<Vec<DeviceRecord>>;

    /// Latest record for `device` at or before `at`.
    async fn status_at(&self, device: Device, at: DateTime<Utc>) -> StoreResult<Option<DeviceRecord>>;
}

#[async_trait]
pub trait AlertStore: Send + Sync {
    async fn raise_alert(&self, parameter: Parameter, value: f64, message: &str) -> StoreResult<Alert>;

    /// Newest first.
    async fn list_alerts(&self, filter: AlertFilter, limit: u32) -> StoreResult<Vec<Alert>>;

    /// Unhandled → handled, once. Never reverts.
    async fn handle_alert(&self, id: i64, operator: &str) -> StoreResult<HandleOutcome>;
}

#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn get_enabled_scheduled_tasks(&self) -> StoreResult<Vec<ScheduledTask>>;

    /// Every task, ordered by schedule time.
    async fn list_tasks(&self) -> StoreResult<Vec<ScheduledTask>>;

    async fn add_task(&self, device: Device, action: DeviceStatus, schedule_time: &str) -> StoreResult<ScheduledTask>;

    /// Flip `enabled`; `None` when the task does not exist.
    async fn toggle_task(&self, id: i64) -> StoreResult<Option<ScheduledTask>>;

    async fn delete_task(&self, id: i64) -> StoreResult<bool>;
}

#[async_trait]
pub trait ModeStore: Send + Sync {
    async fn get_auto_mode(&self) -> StoreResult<bool>;

    async fn set_auto_mode(&self, auto_mode: bool) -> StoreResult<()>;
}

/// Every storage contract, cheaply cloneable across tasks and handlers.
#[derive(Clone)]
pub struct Stores {
    pub samples: Arc<dyn SampleStore>,
    pub thresholds: Arc<dyn ThresholdStore>,
    pub devices: Arc<dyn DeviceStore>,
    pub alerts: Arc<dyn AlertStore>,
    pub schedules: Arc<dyn ScheduleStore>,
    pub mode: Arc<dyn ModeStore>,
}

impl Stores {
    fn from_shared<S>(store: Arc<S>) -> Self
    where
        S: SampleStore + ThresholdStore + DeviceStore + AlertStore + ScheduleStore + ModeStore + 'static,
    {
        Self {
            samples: store.clone(),
            thresholds: store.clone(),
            devices: store.clone(),
            alerts: store.clone(),
            schedules: store.clone(),
            mode: store,
        }
    }

    pub fn postgres(store: PgStore) -> Self {
        Self::from_shared(Arc::new(store))
    }

    /// Clones of `store` share state, so callers can keep one to inspect.
    pub fn memory(store: MemoryStore) -> Self {
        Self::from_shared(Arc::new(store))
    }
}

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Bounds every storage call a background loop makes: each attempt is capped
/// by `timeout`, and only transient failures are retried, at most
/// `attempts` times in total.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub timeout: Duration,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 2,
            timeout: Duration::from_secs(2),
            backoff: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    pub async fn run<T, F, Fut>(&self, op: &'static str, f: F) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        self.run_while(op, StoreError::is_transient, f).await
    }

    /// For writes that are not idempotent. An attempt that timed out or lost
    /// its connection may already have committed, so only failures that
    /// never reached the database are retried.
    pub async fn run_insert<T, F, Fut>(&self, op: &'static str, f: F) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        self.run_while(op, StoreError::never_reached_storage, f).await
    }

    async fn run_while<T, F, Fut>(
        &self,
        op: &'static str,
        retryable: fn(&StoreError) -> bool,
        mut f: F,
    ) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            let result = match time::timeout(self.timeout, f()).await {
                Ok(r) => r,
                Err(_) => Err(StoreError::Timeout(self.timeout)),
            };
            match result {
                Err(e) if retryable(&e) && attempt < attempts => {
                    warn!(op, attempt, error = %e, "Transient storage failure; retrying");
                    time::sleep(self.backoff).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn policy(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            timeout: Duration::from_millis(50),
            backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn retries_transient_errors_up_to_the_bound() {
        let calls = AtomicU32::new(0);
        let result: StoreResult<()> = policy(3)
            .run("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::from(sqlx::Error::PoolTimedOut))
            })
            .await;
        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_permanent_errors() {
        let calls = AtomicU32::new(0);
        let result: StoreResult<()> = policy(3)
            .run("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::from(sqlx::Error::RowNotFound))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn recovers_after_one_transient_failure() {
        let calls = AtomicU32::new(0);
        let result = policy(2)
            .run("test", || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(StoreError::from(sqlx::Error::PoolClosed))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn slow_operation_times_out() {
        let result: StoreResult<()> = policy(1)
            .run("test", || async {
                time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(StoreError::Timeout(_))));
    }

    #[tokio::test]
    async fn insert_is_not_repeated_after_a_timeout() {
        let calls = AtomicU32::new(0);
        let result: StoreResult<()> = policy(3)
            .run_insert("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(StoreError::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn insert_retries_when_no_connection_was_handed_out() {
        let calls = AtomicU32::new(0);
        let result = policy(3)
            .run_insert("test", || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(StoreError::from(sqlx::Error::PoolTimedOut))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
