use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Duration, DurationRound, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    AlertStore, DeviceStore, ModeStore, SampleStore, ScheduleStore, StoreResult, ThresholdStore,
    RAW_HISTORY_MAX_HOURS,
};
use crate::db::models::{
    Alert, AlertFilter, Band, Device, DeviceRecord, DeviceStatus, HandleOutcome, HistoryPoint,
    Parameter, Reading, ScheduledTask, SensorSample, Threshold, Thresholds,
};

#[derive(Default)]
struct Inner {
    /// Kept in insertion order; callers insert in time order.
    samples: Vec<SensorSample>,
    thresholds: BTreeMap<Parameter, Band>,
    device_records: Vec<DeviceRecord>,
    alerts: Vec<Alert>,
    tasks: Vec<ScheduledTask>,
    auto_mode: Option<bool>,
    next_id: i64,
}

impl Inner {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-process implementation of every storage contract.
///
/// Wrapped in `Arc` so clones share state, like the reading cache.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Full append-only device timeline, oldest first.
    pub async fn device_log(&self) -> Vec<DeviceRecord> {
        self.inner.read().await.device_records.clone()
    }
}

fn cutoff(days: u32) -> DateTime<Utc> {
    Utc::now() - Duration::days(i64::from(days))
}

fn average(bucket: DateTime<Utc>, samples: &[&SensorSample]) -> HistoryPoint {
    let n = samples.len() as f64;
    let mean = |f: fn(&SensorSample) -> f64| samples.iter().map(|s| f(s)).sum::<f64>() / n;
    HistoryPoint {
        recorded_at: bucket,
        temperature: mean(|s| s.temperature),
        humidity: mean(|s| s.humidity),
        light_intensity: mean(|s| s.light_intensity),
        co2_level: mean(|s| s.co2_level),
    }
}

#[async_trait]
impl SampleStore for MemoryStore {
    async fn insert_sample(
        &self,
        greenhouse_id: Option<i32>,
        reading: Reading,
        recorded_at: DateTime<Utc>,
    ) -> StoreResult<SensorSample> {
        let sample = SensorSample {
            id: Uuid::new_v4(),
            greenhouse_id,
            temperature: reading.temperature,
            humidity: reading.humidity,
            light_intensity: reading.light_intensity,
            co2_level: reading.co2_level,
            recorded_at,
        };
        self.inner.write().await.samples.push(sample.clone());
        Ok(sample)
    }

    async fn latest_sample(&self, greenhouse_id: Option<i32>) -> StoreResult<Option<SensorSample>> {
        let inner = self.inner.read().await;
        Ok(inner
            .samples
            .iter()
            .filter(|s| greenhouse_id.is_none() || s.greenhouse_id == greenhouse_id)
            // max_by_key keeps the last of equal keys, i.e. the later insert
            .max_by_key(|s| s.recorded_at)
            .cloned())
    }

    async fn history(&self, hours: u32, greenhouse_id: Option<i32>) -> StoreResult<Vec<HistoryPoint>> {
        let since = Utc::now() - Duration::hours(i64::from(hours));
        let inner = self.inner.read().await;
        let mut window: Vec<&SensorSample> = inner
            .samples
            .iter()
            .filter(|s| s.recorded_at >= since)
            .filter(|s| greenhouse_id.is_none() || s.greenhouse_id == greenhouse_id)
            .collect();
        window.sort_by_key(|s| s.recorded_at);

        if hours <= RAW_HISTORY_MAX_HOURS {
            return Ok(window
                .into_iter()
                .map(|s| HistoryPoint {
                    recorded_at: s.recorded_at,
                    temperature: s.temperature,
                    humidity: s.humidity,
                    light_intensity: s.light_intensity,
                    co2_level: s.co2_level,
                })
                .collect());
        }

        let mut buckets: BTreeMap<DateTime<Utc>, Vec<&SensorSample>> = BTreeMap::new();
        for s in window {
            let bucket = s
                .recorded_at
                .duration_trunc(Duration::hours(1))
                .unwrap_or(s.recorded_at);
            buckets.entry(bucket).or_default().push(s);
        }
        Ok(buckets
            .into_iter()
            .map(|(bucket, samples)| average(bucket, &samples))
            .collect())
    }

    async fn delete_samples_older_than(&self, days: u32, limit: u32) -> StoreResult<u64> {
        let cutoff = cutoff(days);
        let mut inner = self.inner.write().await;

        let mut expired: Vec<(DateTime<Utc>, Uuid)> = inner
            .samples
            .iter()
            .filter(|s| s.recorded_at < cutoff)
            .map(|s| (s.recorded_at, s.id))
            .collect();
        expired.sort();
        expired.truncate(limit as usize);

        let doomed: std::collections::HashSet<Uuid> = expired.into_iter().map(|(_, id)| id).collect();
        inner.samples.retain(|s| !doomed.contains(&s.id));
        Ok(doomed.len() as u64)
    }

    async fn count_samples_older_than(&self, days: u32) -> StoreResult<i64> {
        let cutoff = cutoff(days);
        let inner = self.inner.read().await;
        Ok(inner.samples.iter().filter(|s| s.recorded_at < cutoff).count() as i64)
    }
}

#[async_trait]
impl ThresholdStore for MemoryStore {
    async fn get_thresholds(&self) -> StoreResult<Thresholds> {
        let inner = self.inner.read().await;
        Ok(Thresholds::from_rows(inner.thresholds.iter().map(|(p, b)| Threshold {
            parameter: *p,
            min: b.min,
            max: b.max,
        })))
    }

    async fn set_threshold(&self, parameter: Parameter, band: Band) -> StoreResult<()> {
        self.inner.write().await.thresholds.insert(parameter, band);
        Ok(())
    }
}

#[async_trait]
impl DeviceStore for MemoryStore {
    async fn write_device_state(&self, device: Device, status: DeviceStatus) -> StoreResult<DeviceRecord> {
        let mut inner = self.inner.write().await;
        let record = DeviceRecord {
            id: inner.next_id(),
            device_name: device,
            status,
            recorded_at: Utc::now(),
        };
        inner.device_records.push(record.clone());
        Ok(record)
    }

    async fn current_states(&self) -> StoreResult<Vec<DeviceRecord>> {
        let inner = self.inner.read().await;
        let mut latest: BTreeMap<Device, &DeviceRecord> = BTreeMap::new();
        for record in &inner.device_records {
            latest.insert(record.device_name, record);
        }
        Ok(latest.into_values().cloned().collect())
    }

    async fn status_at(&self, device: Device, at: DateTime<Utc>) -> StoreResult<Option<DeviceRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .device_records
            .iter()
            .rev()
            .find(|r| r.device_name == device && r.recorded_at <= at)
            .cloned())
    }
}

#[async_trait]
impl AlertStore for MemoryStore {
    async fn raise_alert(&self, parameter: Parameter, value: f64, message: &str) -> StoreResult<Alert> {
        let mut inner = self.inner.write().await;
        let alert = Alert {
            id: inner.next_id(),
            parameter,
            value,
            message: message.to_owned(),
            handled: false,
            handled_by: None,
            handled_at: None,
            created_at: Utc::now(),
        };
        inner.alerts.push(alert.clone());
        Ok(alert)
    }

    async fn list_alerts(&self, filter: AlertFilter, limit: u32) -> StoreResult<Vec<Alert>> {
        let inner = self.inner.read().await;
        Ok(inner
            .alerts
            .iter()
            .rev()
            .filter(|a| filter.matches(a))
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn handle_alert(&self, id: i64, operator: &str) -> StoreResult<HandleOutcome> {
        let mut inner = self.inner.write().await;
        let Some(alert) = inner.alerts.iter_mut().find(|a| a.id == id) else {
            return Ok(HandleOutcome::NotFound);
        };
        if alert.handled {
            return Ok(HandleOutcome::AlreadyHandled);
        }
        alert.handled = true;
        alert.handled_by = Some(operator.to_owned());
        alert.handled_at = Some(Utc::now());
        Ok(HandleOutcome::Handled)
    }
}

#[async_trait]
impl ScheduleStore for MemoryStore {
    async fn get_enabled_scheduled_tasks(&self) -> StoreResult<Vec<ScheduledTask>> {
        Ok(self
            .list_tasks()
            .await?
            .into_iter()
            .filter(|t| t.enabled)
            .collect())
    }

    async fn list_tasks(&self) -> StoreResult<Vec<ScheduledTask>> {
        let mut tasks = self.inner.read().await.tasks.clone();
        tasks.sort_by(|a, b| a.schedule_time.cmp(&b.schedule_time).then(a.id.cmp(&b.id)));
        Ok(tasks)
    }

    async fn add_task(&self, device: Device, action: DeviceStatus, schedule_time: &str) -> StoreResult<ScheduledTask> {
        let mut inner = self.inner.write().await;
        let task = ScheduledTask {
            id: inner.next_id(),
            device_name: device.to_string(),
            action,
            schedule_time: schedule_time.to_owned(),
            enabled: true,
        };
        inner.tasks.push(task.clone());
        Ok(task)
    }

    async fn toggle_task(&self, id: i64) -> StoreResult<Option<ScheduledTask>> {
        let mut inner = self.inner.write().await;
        Ok(inner.tasks.iter_mut().find(|t| t.id == id).map(|t| {
            t.enabled = !t.enabled;
            t.clone()
        }))
    }

    async fn delete_task(&self, id: i64) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        let before = inner.tasks.len();
        inner.tasks.retain(|t| t.id != id);
        Ok(inner.tasks.len() != before)
    }
}

#[async_trait]
impl ModeStore for MemoryStore {
    async fn get_auto_mode(&self) -> StoreResult<bool> {
        Ok(self.inner.read().await.auto_mode.unwrap_or(true))
    }

    async fn set_auto_mode(&self, auto_mode: bool) -> StoreResult<()> {
        self.inner.write().await.auto_mode = Some(auto_mode);
        Ok(())
    }
}

impl MemoryStore {
    /// Store a task verbatim, bypassing device validation. Models rows that
    /// predate a device being removed from the fixed set.
    #[cfg(test)]
    pub(crate) async fn insert_raw_task(&self, device_name: &str, action: DeviceStatus, schedule_time: &str) {
        let mut inner = self.inner.write().await;
        let task = ScheduledTask {
            id: inner.next_id(),
            device_name: device_name.to_owned(),
            action,
            schedule_time: schedule_time.to_owned(),
            enabled: true,
        };
        inner.tasks.push(task);
    }
}
