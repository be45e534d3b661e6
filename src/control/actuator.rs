use std::{fmt, sync::Arc};

use tracing::{debug, error, info, warn};

use crate::{
    db::models::{Device, DeviceStatus, Parameter},
    store::{AlertStore, DeviceStore, RetryPolicy},
};

/// Who asked for a device write; only used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandSource {
    Threshold,
    Schedule,
    Startup,
}

impl fmt::Display for CommandSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CommandSource::Threshold => "threshold",
            CommandSource::Schedule => "schedule",
            CommandSource::Startup => "startup",
        })
    }
}

/// Appends desired device states. Writes are re-asserted every tick rather
/// than diffed, so repeating a command that is already in effect must be
/// harmless.
#[derive(Clone)]
pub struct Actuator {
    devices: Arc<dyn DeviceStore>,
    retry: RetryPolicy,
}

impl Actuator {
    pub fn new(devices: Arc<dyn DeviceStore>, retry: RetryPolicy) -> Self {
        Self { devices, retry }
    }

    /// Append one record. Failures are logged, never returned.
    pub async fn write(&self, device: Device, status: DeviceStatus, source: CommandSource) -> bool {
        let devices = &self.devices;
        match self
            .retry
            .run("write_device_state", move || devices.write_device_state(device, status))
            .await
        {
            Ok(_) => {
                debug!(%device, %status, %source, "Device state written");
                true
            }
            Err(e) => {
                error!(%device, %status, %source, error = %e, "Failed to write device state");
                false
            }
        }
    }

    /// Give every device without any record an initial `OFF` entry, so the
    /// timeline has a defined state from startup on.
    pub async fn initialize(&self) -> bool {
        let devices = &self.devices;
        let current = match self.retry.run("current_states", move || devices.current_states()).await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "Could not read device states; skipping initialisation");
                return false;
            }
        };

        let mut ok = true;
        for device in Device::ALL {
            if !current.iter().any(|r| r.device_name == device) {
                ok &= self.write(device, DeviceStatus::Off, CommandSource::Startup).await;
            }
        }
        info!("Device states initialised");
        ok
    }
}

/// Records threshold violations.
#[derive(Clone)]
pub struct AlertSink {
    alerts: Arc<dyn AlertStore>,
    retry: RetryPolicy,
}

impl AlertSink {
    pub fn new(alerts: Arc<dyn AlertStore>, retry: RetryPolicy) -> Self {
        Self { alerts, retry }
    }

    pub async fn raise(&self, parameter: Parameter, value: f64, message: &str) -> bool {
        let alerts = &self.alerts;
        match self
            .retry
            .run_insert("raise_alert", move || alerts.raise_alert(parameter, value, message))
            .await
        {
            Ok(alert) => {
                warn!(%parameter, value, alert_id = alert.id, text = message, "Alert raised");
                true
            }
            Err(e) => {
                error!(%parameter, value, error = %e, "Failed to record alert");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::{
        db::models::{Alert, AlertFilter, HandleOutcome},
        store::{MemoryStore, StoreResult},
    };

    #[tokio::test]
    async fn initialize_seeds_missing_devices_off() {
        let store = Arc::new(MemoryStore::new());
        store.write_device_state(Device::Fan, DeviceStatus::On).await.unwrap();

        let actuator = Actuator::new(store.clone(), RetryPolicy::default());
        assert!(actuator.initialize().await);

        let states = store.current_states().await.unwrap();
        assert_eq!(states.len(), Device::ALL.len());
        for record in states {
            let expected = if record.device_name == Device::Fan { DeviceStatus::On } else { DeviceStatus::Off };
            assert_eq!(record.status, expected);
        }

        // A second run has nothing to seed.
        let before = store.device_log().await.len();
        assert!(actuator.initialize().await);
        assert_eq!(store.device_log().await.len(), before);
    }

    #[tokio::test]
    async fn repeated_writes_append_and_keep_state() {
        let store = Arc::new(MemoryStore::new());
        let actuator = Actuator::new(store.clone(), RetryPolicy::default());

        assert!(actuator.write(Device::Fan, DeviceStatus::On, CommandSource::Threshold).await);
        assert!(actuator.write(Device::Fan, DeviceStatus::On, CommandSource::Threshold).await);

        assert_eq!(store.device_log().await.len(), 2);
        let states = store.current_states().await.unwrap();
        assert_eq!(states[0].status, DeviceStatus::On);
    }

    #[tokio::test]
    async fn raise_records_unhandled_alert() {
        let store = Arc::new(MemoryStore::new());
        let sink = AlertSink::new(store.clone(), RetryPolicy::default());

        assert!(sink.raise(Parameter::Light, 1500.0, "light too low: 1500 lux").await);

        let alerts = store.list_alerts(AlertFilter::Unhandled, 10).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].parameter, Parameter::Light);
        assert!(!alerts[0].handled);
    }

    /// Commits the alert, then answers too late.
    struct SlowAlerts(MemoryStore);

    #[async_trait]
    impl AlertStore for SlowAlerts {
        async fn raise_alert(&self, parameter: Parameter, value: f64, message: &str) -> StoreResult<Alert> {
            let alert = self.0.raise_alert(parameter, value, message).await?;
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(alert)
        }

        async fn list_alerts(&self, filter: AlertFilter, limit: u32) -> StoreResult<Vec<Alert>> {
            self.0.list_alerts(filter, limit).await
        }

        async fn handle_alert(&self, id: i64, operator: &str) -> StoreResult<HandleOutcome> {
            self.0.handle_alert(id, operator).await
        }
    }

    #[tokio::test]
    async fn timed_out_raise_is_not_recorded_twice() {
        let store = MemoryStore::new();
        let retry = RetryPolicy {
            attempts: 3,
            timeout: Duration::from_millis(50),
            backoff: Duration::from_millis(1),
        };
        let sink = AlertSink::new(Arc::new(SlowAlerts(store.clone())), retry);

        assert!(!sink.raise(Parameter::Temperature, 40.0, "temperature too high: 40").await);

        let alerts = store.list_alerts(AlertFilter::All, 10).await.unwrap();
        assert_eq!(alerts.len(), 1);
    }
}
