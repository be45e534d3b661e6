use std::time::Duration;

use chrono::{Local, NaiveTime};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    actuator::{Actuator, AlertSink, CommandSource},
    mode::ControlMode,
    rules,
    schedule::{self, MinuteGate},
};
use crate::{
    db::models::SensorSample,
    error::StoreError,
    reading_cache::ReadingCache,
    store::{RetryPolicy, Stores},
};

/// What one tick did; returned for logging and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub sample_seen: bool,
    pub threshold_writes: usize,
    pub alerts_raised: usize,
    pub scheduled_fired: usize,
    pub failed_writes: usize,
}

pub struct ControlService {
    stores: Stores,
    cache: ReadingCache,
    mode: ControlMode,
    actuator: Actuator,
    alerts: AlertSink,
    greenhouse_id: Option<i32>,
    retry: RetryPolicy,
    minute_gate: MinuteGate,
}

impl ControlService {
    pub fn new(
        stores: Stores,
        cache: ReadingCache,
        mode: ControlMode,
        greenhouse_id: Option<i32>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            actuator: Actuator::new(stores.devices.clone(), retry),
            alerts: AlertSink::new(stores.alerts.clone(), retry),
            stores,
            cache,
            mode,
            greenhouse_id,
            retry,
            minute_gate: MinuteGate::new(),
        }
    }

    /// Runs the control loop until `cancel` fires. A tick in progress always
    /// completes. Spawn this via `tokio::spawn`.
    pub async fn run(mut self, interval: Duration, cancel: CancellationToken) {
        info!(interval_secs = interval.as_secs(), "Control loop started");
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.tick(Local::now().time()).await;
                    debug!(?report, "Control iteration finished");
                }
            }
        }

        info!("Control loop stopped");
    }

    /// One control iteration: threshold rules first, then any scheduled
    /// tasks due in the current wall-clock minute. Never fails; every storage
    /// problem is logged and the affected step is retried next tick.
    pub async fn tick(&mut self, now: NaiveTime) -> TickReport {
        let mut report = TickReport::default();
        self.adjust_devices(&mut report).await;
        self.run_scheduled_tasks(now, &mut report).await;
        report
    }

    /// Storage is authoritative; the cache only stands in while storage is
    /// unreachable.
    async fn latest_sample(&self) -> Result<Option<SensorSample>, StoreError> {
        let samples = &self.stores.samples;
        let greenhouse_id = self.greenhouse_id;
        match self
            .retry
            .run("latest_sample", move || samples.latest_sample(greenhouse_id))
            .await
        {
            Ok(sample) => Ok(sample),
            Err(e) => match self.cache.latest(greenhouse_id).await {
                Some(sample) => {
                    warn!(error = %e, sample_id = %sample.id, "Storage unavailable; using cached sensor sample");
                    Ok(Some(sample))
                }
                None => Err(e),
            },
        }
    }

    async fn adjust_devices(&self, report: &mut TickReport) {
        let sample = match self.latest_sample().await {
            Ok(Some(sample)) => sample,
            Ok(None) => {
                info!("No sensor sample yet; skipping device adjustment");
                return;
            }
            Err(e) => {
                error!(error = %e, "Could not read latest sensor sample; skipping device adjustment");
                return;
            }
        };
        report.sample_seen = true;

        let thresholds = &self.stores.thresholds;
        let thresholds = match self
            .retry
            .run("get_thresholds", move || thresholds.get_thresholds())
            .await
        {
            Ok(t) => t,
            Err(e) => {
                error!(error = %e, "Could not read thresholds; skipping device adjustment");
                return;
            }
        };

        if !self.mode.is_auto().await {
            debug!("Manual mode; threshold actuation skipped");
            return;
        }

        let reading = sample.reading();
        debug!(
            sample_id = %sample.id,
            temperature = reading.temperature,
            humidity = reading.humidity,
            light_intensity = reading.light_intensity,
            co2_level = reading.co2_level,
            "Control iteration: latest reading"
        );

        let plan = rules::plan(&reading, &thresholds);
        for (parameter, e) in &plan.skipped {
            warn!(%parameter, error = %e, "Skipping parameter this tick");
        }

        for &(device, status) in &plan.commands {
            if self.actuator.write(device, status, CommandSource::Threshold).await {
                report.threshold_writes += 1;
            } else {
                report.failed_writes += 1;
            }
        }

        for alert in &plan.alerts {
            if self.alerts.raise(alert.parameter, alert.value, &alert.message).await {
                report.alerts_raised += 1;
            }
        }
    }

    async fn run_scheduled_tasks(&mut self, now: NaiveTime, report: &mut TickReport) {
        let Some(minute) = self.minute_gate.pending(now) else {
            return;
        };

        let schedules = &self.stores.schedules;
        let tasks = match self
            .retry
            .run("get_enabled_scheduled_tasks", move || schedules.get_enabled_scheduled_tasks())
            .await
        {
            Ok(tasks) => tasks,
            Err(e) => {
                // Leave the minute pending so the next tick inside it retries.
                error!(%minute, error = %e, "Could not load scheduled tasks");
                return;
            }
        };
        self.minute_gate.mark_evaluated(minute.clone());

        for task in schedule::due(&tasks, &minute) {
            let device = match task.device() {
                Ok(device) => device,
                Err(e) => {
                    warn!(task_id = task.id, error = %e, "Skipping scheduled task");
                    continue;
                }
            };
            if self.actuator.write(device, task.action, CommandSource::Schedule).await {
                info!(task_id = task.id, %device, status = %task.action, %minute, "Scheduled task executed");
                report.scheduled_fired += 1;
            } else {
                report.failed_writes += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};

    use super::*;
    use crate::{
        db::models::{
            AlertFilter, Band, Device, DeviceStatus, HistoryPoint, Parameter, Reading, ScheduledTask,
            Thresholds,
        },
        store::{
            AlertStore, DeviceStore, MemoryStore, ModeStore, SampleStore, ScheduleStore, StoreResult,
            ThresholdStore,
        },
    };

    struct Harness {
        store: MemoryStore,
        cache: ReadingCache,
        service: ControlService,
    }

    async fn harness_with(stores: Stores, store: MemoryStore) -> Harness {
        let cache = ReadingCache::new();
        let mode = ControlMode::load(stores.mode.clone(), RetryPolicy::default()).await;
        let service = ControlService::new(stores, cache.clone(), mode, None, RetryPolicy::default());
        Harness { store, cache, service }
    }

    async fn harness() -> Harness {
        let store = MemoryStore::new();
        harness_with(Stores::memory(store.clone()), store).await
    }

    fn at(h: u32, m: u32, s: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, s).unwrap()
    }

    fn noon() -> NaiveTime {
        at(12, 0, 0)
    }

    fn neutral() -> Reading {
        Reading { temperature: 23.0, humidity: 65.0, light_intensity: 5000.0, co2_level: 700.0 }
    }

    impl Harness {
        async fn sample(&self, reading: Reading) {
            self.store.insert_sample(None, reading, Utc::now()).await.unwrap();
        }

        async fn status(&self, device: Device) -> Option<DeviceStatus> {
            self.store
                .current_states()
                .await
                .unwrap()
                .into_iter()
                .find(|r| r.device_name == device)
                .map(|r| r.status)
        }

        async fn alerts(&self) -> usize {
            self.store.list_alerts(AlertFilter::All, 1000).await.unwrap().len()
        }
    }

    #[tokio::test]
    async fn no_sample_skips_adjustment() {
        let mut h = harness().await;
        let report = h.service.tick(noon()).await;

        assert!(!report.sample_seen);
        assert_eq!(report.threshold_writes, 0);
        assert!(h.store.device_log().await.is_empty());
    }

    #[tokio::test]
    async fn hot_reading_drives_cooling() {
        let mut h = harness().await;
        h.sample(Reading { temperature: 29.0, ..neutral() }).await;

        let report = h.service.tick(noon()).await;

        assert!(report.sample_seen);
        assert_eq!(h.status(Device::Heater).await, Some(DeviceStatus::Off));
        assert_eq!(h.status(Device::Cooler).await, Some(DeviceStatus::On));
        assert_eq!(h.status(Device::Fan).await, Some(DeviceStatus::On));
        // within the hysteresis band: no alert
        assert_eq!(report.alerts_raised, 0);
        assert_eq!(h.alerts().await, 0);
    }

    #[tokio::test]
    async fn newer_stored_sample_wins_over_stale_cache() {
        let mut h = harness().await;
        let hour_ago = Utc::now() - chrono::Duration::hours(1);
        let stale = h.store.insert_sample(None, Reading { temperature: 35.0, ..neutral() }, hour_ago).await.unwrap();
        h.cache.update(stale).await;
        // written by another process, never seen by this cache
        h.sample(neutral()).await;

        let report = h.service.tick(noon()).await;

        assert!(report.sample_seen);
        assert_eq!(report.alerts_raised, 0);
        assert_eq!(h.status(Device::Cooler).await, Some(DeviceStatus::Off));
    }

    struct BrokenSamples;

    #[async_trait]
    impl SampleStore for BrokenSamples {
        async fn insert_sample(&self, _: Option<i32>, _: Reading, _: DateTime<Utc>) -> StoreResult<SensorSample> {
            Err(StoreError::from(sqlx::Error::PoolTimedOut))
        }

        async fn latest_sample(&self, _: Option<i32>) -> StoreResult<Option<SensorSample>> {
            Err(StoreError::from(sqlx::Error::PoolTimedOut))
        }

        async fn history(&self, _: u32, _: Option<i32>) -> StoreResult<Vec<HistoryPoint>> {
            Err(StoreError::from(sqlx::Error::PoolTimedOut))
        }

        async fn delete_samples_older_than(&self, _: u32, _: u32) -> StoreResult<u64> {
            Err(StoreError::from(sqlx::Error::PoolTimedOut))
        }

        async fn count_samples_older_than(&self, _: u32) -> StoreResult<i64> {
            Err(StoreError::from(sqlx::Error::PoolTimedOut))
        }
    }

    #[tokio::test]
    async fn cached_sample_covers_sample_store_outage() {
        let store = MemoryStore::new();
        let mut stores = Stores::memory(store.clone());
        stores.samples = Arc::new(BrokenSamples);
        let mut h = harness_with(stores, store).await;
        h.service.retry.backoff = Duration::from_millis(1);

        let report = h.service.tick(noon()).await;
        assert!(!report.sample_seen);

        let cached = h.store.insert_sample(None, Reading { temperature: 35.0, ..neutral() }, Utc::now()).await.unwrap();
        h.cache.update(cached).await;

        let report = h.service.tick(noon()).await;
        assert!(report.sample_seen);
        assert_eq!(h.status(Device::Cooler).await, Some(DeviceStatus::On));
    }

    /// Mode reads answer at once; writes never complete.
    struct StuckModeWrites;

    #[async_trait]
    impl ModeStore for StuckModeWrites {
        async fn get_auto_mode(&self) -> StoreResult<bool> {
            Ok(true)
        }

        async fn set_auto_mode(&self, _: bool) -> StoreResult<()> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn stuck_mode_toggle_does_not_stall_the_tick() {
        let store = MemoryStore::new();
        let mut stores = Stores::memory(store.clone());
        stores.mode = Arc::new(StuckModeWrites);
        let mut h = harness_with(stores, store).await;
        h.sample(Reading { temperature: 35.0, ..neutral() }).await;

        let mode = h.service.mode.clone();
        let toggle = tokio::spawn(async move { mode.toggle().await });
        tokio::task::yield_now().await;

        let report = time::timeout(Duration::from_secs(1), h.service.tick(noon()))
            .await
            .expect("tick stalled behind the mode toggle");
        assert!(report.threshold_writes > 0);

        toggle.abort();
    }

    #[tokio::test]
    async fn alert_beyond_secondary_band_is_reraised_every_tick() {
        let mut h = harness().await;
        h.sample(Reading { temperature: 15.9, ..neutral() }).await;

        let first = h.service.tick(noon()).await;
        let second = h.service.tick(noon()).await;

        assert_eq!(first.alerts_raised, 1);
        assert_eq!(second.alerts_raised, 1);
        let alerts = h.store.list_alerts(AlertFilter::Unhandled, 10).await.unwrap();
        assert_eq!(alerts.len(), 2);
        assert!(alerts.iter().all(|a| a.parameter == Parameter::Temperature));
        assert_eq!(h.status(Device::Heater).await, Some(DeviceStatus::On));
    }

    #[tokio::test]
    async fn low_side_within_margin_actuates_without_alert() {
        let mut h = harness().await;
        h.sample(Reading { temperature: 16.0, ..neutral() }).await;

        let report = h.service.tick(noon()).await;

        assert_eq!(report.alerts_raised, 0);
        assert_eq!(h.status(Device::Heater).await, Some(DeviceStatus::On));
        assert_eq!(h.status(Device::Cooler).await, Some(DeviceStatus::Off));
    }

    #[tokio::test]
    async fn fan_state_follows_evaluation_order() {
        let mut h = harness().await;
        h.sample(Reading { temperature: 31.0, humidity: 45.0, light_intensity: 5000.0, co2_level: 1050.0 }).await;

        h.service.tick(noon()).await;

        assert_eq!(h.status(Device::Fan).await, Some(DeviceStatus::On));
        assert_eq!(h.status(Device::WaterPump).await, Some(DeviceStatus::On));
        assert_eq!(h.status(Device::Light).await, Some(DeviceStatus::Off));
        assert_eq!(h.status(Device::Co2Generator).await, Some(DeviceStatus::Off));
    }

    #[tokio::test]
    async fn unchanged_reading_reasserts_same_commands() {
        let mut h = harness().await;
        h.sample(Reading { temperature: 30.0, humidity: 40.0, ..neutral() }).await;

        let first = h.service.tick(noon()).await;
        let second = h.service.tick(noon()).await;
        assert_eq!(first, second);

        let log: Vec<_> = h.store.device_log().await.into_iter().map(|r| (r.device_name, r.status)).collect();
        let (a, b) = log.split_at(log.len() / 2);
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn manual_mode_blocks_threshold_writes_but_not_schedules() {
        let mut h = harness().await;
        h.store.set_auto_mode(false).await.unwrap();
        h.store.add_task(Device::Light, DeviceStatus::On, "12:00").await.unwrap();
        let mode = ControlMode::load(Arc::new(h.store.clone()), RetryPolicy::default()).await;
        h.service.mode = mode;
        h.sample(Reading { temperature: 35.0, ..neutral() }).await;

        let report = h.service.tick(noon()).await;

        assert_eq!(report.threshold_writes, 0);
        assert_eq!(report.alerts_raised, 0);
        assert_eq!(report.scheduled_fired, 1);
        let log = h.store.device_log().await;
        assert_eq!(log.len(), 1);
        assert_eq!((log[0].device_name, log[0].status), (Device::Light, DeviceStatus::On));
    }

    #[tokio::test]
    async fn toggling_mode_takes_effect_next_tick() {
        let mut h = harness().await;
        h.sample(Reading { temperature: 35.0, ..neutral() }).await;

        h.service.mode.set(false).await.unwrap();
        assert_eq!(h.service.tick(noon()).await.threshold_writes, 0);

        h.service.mode.toggle().await.unwrap();
        assert!(h.service.tick(noon()).await.threshold_writes > 0);
    }

    #[tokio::test]
    async fn scheduled_task_fires_once_across_minute_sweep() {
        let mut h = harness().await;
        h.store.add_task(Device::Light, DeviceStatus::On, "06:00").await.unwrap();

        let ticks = [
            at(5, 59, 0),
            at(5, 59, 30),
            at(6, 0, 0),
            at(6, 0, 10),
            at(6, 0, 20),
            at(6, 0, 30),
            at(6, 0, 40),
            at(6, 0, 50),
            at(6, 1, 0),
        ];
        let mut fired = 0;
        for now in ticks {
            fired += h.service.tick(now).await.scheduled_fired;
        }

        assert_eq!(fired, 1);
        let log = h.store.device_log().await;
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].device_name, Device::Light);
        assert_eq!(log[0].status, DeviceStatus::On);
    }

    #[tokio::test]
    async fn disabled_and_other_minute_tasks_do_not_fire() {
        let mut h = harness().await;
        let disabled = h.store.add_task(Device::Fan, DeviceStatus::On, "06:00").await.unwrap();
        h.store.toggle_task(disabled.id).await.unwrap();
        h.store.add_task(Device::Heater, DeviceStatus::On, "07:00").await.unwrap();

        let report = h.service.tick(at(6, 0, 0)).await;
        assert_eq!(report.scheduled_fired, 0);
        assert!(h.store.device_log().await.is_empty());
    }

    #[tokio::test]
    async fn tasks_sharing_a_minute_fire_independently() {
        let mut h = harness().await;
        h.store.add_task(Device::Light, DeviceStatus::On, "06:00").await.unwrap();
        h.store.insert_raw_task("sprinkler", DeviceStatus::On, "06:00").await;
        h.store.add_task(Device::WaterPump, DeviceStatus::On, "06:00").await.unwrap();

        let report = h.service.tick(at(6, 0, 0)).await;

        assert_eq!(report.scheduled_fired, 2);
        assert_eq!(h.status(Device::Light).await, Some(DeviceStatus::On));
        assert_eq!(h.status(Device::WaterPump).await, Some(DeviceStatus::On));
    }

    #[tokio::test]
    async fn threshold_edits_apply_on_the_next_tick() {
        let mut h = harness().await;
        h.sample(Reading { temperature: 26.0, ..neutral() }).await;

        h.service.tick(noon()).await;
        assert_eq!(h.status(Device::Cooler).await, Some(DeviceStatus::Off));

        h.store.set_threshold(Parameter::Temperature, Band::new(18.0, 25.0)).await.unwrap();
        h.service.tick(noon()).await;
        assert_eq!(h.status(Device::Cooler).await, Some(DeviceStatus::On));
    }

    struct BrokenThresholds;

    #[async_trait]
    impl ThresholdStore for BrokenThresholds {
        async fn get_thresholds(&self) -> StoreResult<Thresholds> {
            Err(StoreError::from(sqlx::Error::PoolTimedOut))
        }

        async fn set_threshold(&self, _: Parameter, _: Band) -> StoreResult<()> {
            Err(StoreError::from(sqlx::Error::PoolTimedOut))
        }
    }

    #[tokio::test]
    async fn threshold_outage_skips_adjustment_only() {
        let store = MemoryStore::new();
        let mut stores = Stores::memory(store.clone());
        stores.thresholds = Arc::new(BrokenThresholds);
        let mut h = harness_with(stores, store).await;
        h.service.retry.backoff = Duration::from_millis(1);
        h.sample(Reading { temperature: 35.0, ..neutral() }).await;
        h.store.add_task(Device::Light, DeviceStatus::On, "12:00").await.unwrap();

        let report = h.service.tick(noon()).await;

        assert!(report.sample_seen);
        assert_eq!(report.threshold_writes, 0);
        assert_eq!(report.scheduled_fired, 1);
    }

    /// Fails the first fetch, then behaves.
    struct FlakySchedules {
        inner: MemoryStore,
        failed: AtomicBool,
    }

    #[async_trait]
    impl ScheduleStore for FlakySchedules {
        async fn get_enabled_scheduled_tasks(&self) -> StoreResult<Vec<ScheduledTask>> {
            if !self.failed.swap(true, Ordering::SeqCst) {
                return Err(StoreError::from(sqlx::Error::RowNotFound));
            }
            self.inner.get_enabled_scheduled_tasks().await
        }

        async fn list_tasks(&self) -> StoreResult<Vec<ScheduledTask>> {
            self.inner.list_tasks().await
        }

        async fn add_task(&self, device: Device, action: DeviceStatus, time: &str) -> StoreResult<ScheduledTask> {
            self.inner.add_task(device, action, time).await
        }

        async fn toggle_task(&self, id: i64) -> StoreResult<Option<ScheduledTask>> {
            self.inner.toggle_task(id).await
        }

        async fn delete_task(&self, id: i64) -> StoreResult<bool> {
            self.inner.delete_task(id).await
        }
    }

    #[tokio::test]
    async fn failed_task_fetch_is_retried_within_the_minute() {
        let store = MemoryStore::new();
        store.add_task(Device::Light, DeviceStatus::On, "06:00").await.unwrap();
        let mut stores = Stores::memory(store.clone());
        stores.schedules = Arc::new(FlakySchedules { inner: store.clone(), failed: AtomicBool::new(false) });
        let mut h = harness_with(stores, store).await;

        assert_eq!(h.service.tick(at(6, 0, 0)).await.scheduled_fired, 0);
        assert_eq!(h.service.tick(at(6, 0, 5)).await.scheduled_fired, 1);
        assert_eq!(h.service.tick(at(6, 0, 10)).await.scheduled_fired, 0);
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let h = harness().await;
        h.sample(neutral()).await;
        let store = h.store.clone();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(h.service.run(Duration::from_millis(10), cancel.clone()));

        time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert!(!store.device_log().await.is_empty());
    }
}
