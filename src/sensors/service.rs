use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::SensorSource;
use crate::{
    db::models::SensorSample,
    error::StoreError,
    reading_cache::ReadingCache,
    store::{RetryPolicy, SampleStore},
};

pub struct SensorService {
    store: Arc<dyn SampleStore>,
    cache: ReadingCache,
    source: Box<dyn SensorSource>,
    greenhouse_id: Option<i32>,
    retry: RetryPolicy,
}

impl SensorService {
    pub fn new(
        store: Arc<dyn SampleStore>,
        cache: ReadingCache,
        source: Box<dyn SensorSource>,
        greenhouse_id: Option<i32>,
        retry: RetryPolicy,
    ) -> Self {
        Self { store, cache, source, greenhouse_id, retry }
    }

    /// Takes one reading from the source, persists it and updates the shared
    /// in-memory cache. The cache only sees samples that made it to storage.
    pub async fn sample_and_persist(&mut self) -> Result<SensorSample, StoreError> {
        let reading = self.source.read();
        let recorded_at = Utc::now();
        let store = &self.store;
        let greenhouse_id = self.greenhouse_id;

        let sample = self
            .retry
            .run_insert("insert_sample", move || store.insert_sample(greenhouse_id, reading, recorded_at))
            .await?;

        self.cache.update(sample.clone()).await;
        debug!(
            greenhouse_id = ?sample.greenhouse_id,
            temperature = sample.temperature,
            humidity = sample.humidity,
            light_intensity = sample.light_intensity,
            co2_level = sample.co2_level,
            "Sensor sample persisted"
        );
        Ok(sample)
    }

    /// Samples until `cancel` fires. Spawn this via `tokio::spawn`.
    pub async fn run(mut self, interval: Duration, cancel: CancellationToken) {
        info!(interval_secs = interval.as_secs(), "Sensor sampling loop started");
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sample_and_persist().await {
                        error!(error = %e, "Failed to persist sensor sample");
                    }
                }
            }
        }

        info!("Sensor sampling loop stopped");
    }
}
