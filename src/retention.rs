use std::{sync::Arc, time::Duration};

use chrono::{Local, NaiveDate};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::store::{RetryPolicy, SampleStore};

/// Result of one daily sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    /// Rows removed by each batch, in order.
    pub batches: Vec<u64>,
    pub deleted: u64,
    /// Rows older than the cutoff still present after the last batch.
    pub remaining: i64,
    pub completed: bool,
}

/// Deletes sensor samples older than the retention window, in bounded
/// batches, at most once per local calendar day.
pub struct RetentionSweeper {
    store: Arc<dyn SampleStore>,
    retention_days: u32,
    batch_size: u32,
    retry: RetryPolicy,
    last_swept: Option<NaiveDate>,
}

impl RetentionSweeper {
    pub fn new(store: Arc<dyn SampleStore>, retention_days: u32, batch_size: u32, retry: RetryPolicy) -> Self {
        Self {
            store,
            retention_days,
            batch_size: batch_size.max(1),
            retry,
            last_swept: None,
        }
    }

    /// Sweeps when `today` has not been swept yet. The day is marked even if
    /// the sweep aborts; leftovers are picked up on the next day.
    pub async fn sweep_if_due(&mut self, today: NaiveDate) -> Option<SweepOutcome> {
        if self.last_swept == Some(today) {
            return None;
        }
        self.last_swept = Some(today);
        Some(self.sweep().await)
    }

    pub async fn sweep(&self) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();
        let store = &self.store;
        let (days, limit) = (self.retention_days, self.batch_size);

        loop {
            let deleted = match self
                .retry
                .run("delete_samples_older_than", move || store.delete_samples_older_than(days, limit))
                .await
            {
                Ok(n) => n,
                Err(e) => {
                    error!(error = %e, deleted = outcome.deleted, "Retention batch failed; aborting sweep");
                    return outcome;
                }
            };
            outcome.batches.push(deleted);
            outcome.deleted += deleted;

            let remaining = match self
                .retry
                .run("count_samples_older_than", move || store.count_samples_older_than(days))
                .await
            {
                Ok(n) => n,
                Err(e) => {
                    error!(error = %e, deleted = outcome.deleted, "Could not count expired samples; aborting sweep");
                    return outcome;
                }
            };
            outcome.remaining = remaining;

            if remaining == 0 {
                outcome.completed = true;
                info!(
                    deleted = outcome.deleted,
                    batches = outcome.batches.len(),
                    retention_days = days,
                    "Retention sweep finished"
                );
                return outcome;
            }
            if deleted == 0 {
                warn!(remaining, "Retention batch deleted nothing; aborting sweep");
                return outcome;
            }
        }
    }

    /// Checks every `interval` whether today's sweep is still due, until
    /// `cancel` fires.
    pub async fn run(mut self, interval: Duration, cancel: CancellationToken) {
        info!(
            retention_days = self.retention_days,
            batch_size = self.batch_size,
            "Retention sweeper started"
        );
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep_if_due(Local::now().date_naive()).await;
                }
            }
        }

        info!("Retention sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use chrono::{DateTime, Duration as ChronoDuration, Utc};

    use super::*;
    use crate::{
        db::models::{HistoryPoint, Reading, SensorSample},
        error::StoreError,
        store::{MemoryStore, StoreResult},
    };

    fn reading() -> Reading {
        Reading { temperature: 22.0, humidity: 60.0, light_intensity: 4000.0, co2_level: 600.0 }
    }

    async fn seed(store: &MemoryStore, old: usize, fresh: usize) {
        let old_at = Utc::now() - ChronoDuration::days(10);
        for i in 0..old {
            let at = old_at + ChronoDuration::seconds(i as i64);
            store.insert_sample(None, reading(), at).await.unwrap();
        }
        for _ in 0..fresh {
            store.insert_sample(None, reading(), Utc::now()).await.unwrap();
        }
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, d).unwrap()
    }

    #[tokio::test]
    async fn deletes_in_bounded_batches_until_nothing_is_left() {
        let store = MemoryStore::new();
        seed(&store, 1200, 3).await;
        let sweeper = RetentionSweeper::new(Arc::new(store.clone()), 7, 500, RetryPolicy::default());

        let outcome = sweeper.sweep().await;

        assert_eq!(outcome.batches, vec![500, 500, 200]);
        assert_eq!(outcome.deleted, 1200);
        assert_eq!(outcome.remaining, 0);
        assert!(outcome.completed);
        assert_eq!(store.count_samples_older_than(7).await.unwrap(), 0);
        assert!(store.latest_sample(None).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn nothing_expired_is_a_single_empty_batch() {
        let store = MemoryStore::new();
        seed(&store, 0, 5).await;
        let sweeper = RetentionSweeper::new(Arc::new(store), 7, 500, RetryPolicy::default());

        let outcome = sweeper.sweep().await;
        assert_eq!(outcome.batches, vec![0]);
        assert!(outcome.completed);
    }

    #[tokio::test]
    async fn sweeps_at_most_once_per_day() {
        let store = MemoryStore::new();
        seed(&store, 10, 0).await;
        let mut sweeper = RetentionSweeper::new(Arc::new(store.clone()), 7, 500, RetryPolicy::default());

        assert!(sweeper.sweep_if_due(day(1)).await.is_some());
        seed(&store, 10, 0).await;
        assert!(sweeper.sweep_if_due(day(1)).await.is_none());
        assert_eq!(store.count_samples_older_than(7).await.unwrap(), 10);

        let outcome = sweeper.sweep_if_due(day(2)).await.unwrap();
        assert_eq!(outcome.deleted, 10);
    }

    /// Deletes fail until `healthy` is set.
    struct Flaky {
        inner: MemoryStore,
        healthy: AtomicBool,
    }

    #[async_trait]
    impl SampleStore for Flaky {
        async fn insert_sample(
            &self,
            greenhouse_id: Option<i32>,
            reading: Reading,
            recorded_at: DateTime<Utc>,
        ) -> StoreResult<SensorSample> {
            self.inner.insert_sample(greenhouse_id, reading, recorded_at).await
        }

        async fn latest_sample(&self, greenhouse_id: Option<i32>) -> StoreResult<Option<SensorSample>> {
            self.inner.latest_sample(greenhouse_id).await
        }

        async fn history(&self, hours: u32, greenhouse_id: Option<i32>) -> StoreResult<Vec<HistoryPoint>> {
            self.inner.history(hours, greenhouse_id).await
        }

        async fn delete_samples_older_than(&self, days: u32, limit: u32) -> StoreResult<u64> {
            if !self.healthy.load(Ordering::SeqCst) {
                return Err(StoreError::from(sqlx::Error::RowNotFound));
            }
            self.inner.delete_samples_older_than(days, limit).await
        }

        async fn count_samples_older_than(&self, days: u32) -> StoreResult<i64> {
            self.inner.count_samples_older_than(days).await
        }
    }

    #[tokio::test]
    async fn failed_sweep_waits_for_the_next_day() {
        let inner = MemoryStore::new();
        seed(&inner, 20, 0).await;
        let flaky = Arc::new(Flaky { inner: inner.clone(), healthy: AtomicBool::new(false) });
        let mut sweeper = RetentionSweeper::new(flaky.clone(), 7, 5, RetryPolicy::default());

        let outcome = sweeper.sweep_if_due(day(1)).await.unwrap();
        assert!(!outcome.completed);
        assert!(outcome.batches.is_empty());

        flaky.healthy.store(true, Ordering::SeqCst);
        assert!(sweeper.sweep_if_due(day(1)).await.is_none());

        let outcome = sweeper.sweep_if_due(day(2)).await.unwrap();
        assert!(outcome.completed);
        assert_eq!(outcome.batches, vec![5, 5, 5, 5]);
        assert_eq!(inner.count_samples_older_than(7).await.unwrap(), 0);
    }
}
