use std::{collections::HashMap, sync::Arc};

use tokio::sync::RwLock;

use crate::db::models::SensorSample;

/// In-memory store of the most recent `SensorSample` per greenhouse.
///
/// Wrapped in `Arc` so it can be cheaply cloned and shared across tasks.
/// Uses `tokio::sync::RwLock` so concurrent readers never block each other.
#[derive(Clone, Default)]
pub struct ReadingCache {
    inner: Arc<RwLock<HashMap<Option<i32>, SensorSample>>>,
}

impl ReadingCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the cached sample for `sample.greenhouse_id` unless the cached
    /// one is newer.
    pub async fn update(&self, sample: SensorSample) {
        let mut inner = self.inner.write().await;
        match inner.get(&sample.greenhouse_id) {
            Some(current) if current.recorded_at > sample.recorded_at => {}
            _ => {
                inner.insert(sample.greenhouse_id, sample);
            }
        }
    }

    /// Latest sample for one greenhouse, or the newest across all of them
    /// when `greenhouse_id` is `None`.
    pub async fn latest(&self, greenhouse_id: Option<i32>) -> Option<SensorSample> {
        let inner = self.inner.read().await;
        match greenhouse_id {
            Some(_) => inner.get(&greenhouse_id).cloned(),
            None => inner.values().max_by_key(|s| s.recorded_at).cloned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    use super::*;

    fn make_sample(greenhouse_id: Option<i32>, temperature: f64, age_secs: i64) -> SensorSample {
        SensorSample {
            id: Uuid::new_v4(),
            greenhouse_id,
            temperature,
            humidity: 60.0,
            light_intensity: 5000.0,
            co2_level: 600.0,
            recorded_at: Utc::now() - Duration::seconds(age_secs),
        }
    }

    #[tokio::test]
    async fn empty_cache_returns_nothing() {
        let cache = ReadingCache::new();
        assert!(cache.latest(None).await.is_none());
        assert!(cache.latest(Some(1)).await.is_none());
    }

    #[tokio::test]
    async fn update_overwrites_previous_sample() {
        let cache = ReadingCache::new();
        cache.update(make_sample(Some(1), 20.0, 10)).await;
        cache.update(make_sample(Some(1), 25.0, 0)).await;

        assert_eq!(cache.latest(Some(1)).await.unwrap().temperature, 25.0);
    }

    #[tokio::test]
    async fn older_sample_does_not_replace_newer() {
        let cache = ReadingCache::new();
        cache.update(make_sample(Some(1), 25.0, 0)).await;
        cache.update(make_sample(Some(1), 20.0, 60)).await;

        assert_eq!(cache.latest(Some(1)).await.unwrap().temperature, 25.0);
    }

    #[tokio::test]
    async fn greenhouses_are_separate_entries() {
        let cache = ReadingCache::new();
        cache.update(make_sample(Some(1), 20.0, 30)).await;
        cache.update(make_sample(Some(2), 30.0, 0)).await;

        assert_eq!(cache.latest(Some(1)).await.unwrap().temperature, 20.0);
        assert_eq!(cache.latest(Some(2)).await.unwrap().temperature, 30.0);
        assert_eq!(cache.latest(None).await.unwrap().temperature, 30.0);
    }

    #[tokio::test]
    async fn clone_shares_state() {
        let cache = ReadingCache::new();
        let clone = cache.clone();

        cache.update(make_sample(None, 22.0, 0)).await;

        assert_eq!(clone.latest(None).await.unwrap().temperature, 22.0);
    }
}
