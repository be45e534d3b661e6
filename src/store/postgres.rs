use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::{
    AlertStore, DeviceStore, ModeStore, SampleStore, ScheduleStore, StoreResult, ThresholdStore,
    RAW_HISTORY_MAX_HOURS,
};
use crate::db::models::{
    Alert, AlertFilter, Band, Device, DeviceRecord, DeviceStatus, HandleOutcome, HistoryPoint,
    Parameter, Reading, ScheduledTask, SensorSample, Threshold, Thresholds,
};

/// Postgres-backed implementation of every storage contract.
///
/// Each write is a single statement so a shutdown can never leave one half
/// applied.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn to_i32(n: u32) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

#[async_trait]
impl SampleStore for PgStore {
    async fn insert_sample(
        &self,
        greenhouse_id: Option<i32>,
        reading: Reading,
        recorded_at: DateTime<Utc>,
    ) -> StoreResult<SensorSample> {
        let sample = sqlx::query_as::<_, SensorSample>(
            r#"
            INSERT INTO sensor_samples
                (greenhouse_id, temperature, humidity, light_intensity, co2_level, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, greenhouse_id, temperature, humidity, light_intensity, co2_level, recorded_at
            "#,
        )
        .bind(greenhouse_id)
        .bind(reading.temperature)
        .bind(reading.humidity)
        .bind(reading.light_intensity)
        .bind(reading.co2_level)
        .bind(recorded_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(sample)
    }

    async fn latest_sample(&self, greenhouse_id: Option<i32>) -> StoreResult<Option<SensorSample>> {
        let sample = sqlx::query_as::<_, SensorSample>(
            r#"
            SELECT id, greenhouse_id, temperature, humidity, light_intensity, co2_level, recorded_at
            FROM sensor_samples
            WHERE ($1::integer IS NULL OR greenhouse_id = $1)
            ORDER BY recorded_at DESC
            LIMIT 1
            "#,
        )
        .bind(greenhouse_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(sample)
    }

    async fn history(&self, hours: u32, greenhouse_id: Option<i32>) -> StoreResult<Vec<HistoryPoint>> {
        let query = if hours <= RAW_HISTORY_MAX_HOURS {
            r#"
            SELECT recorded_at, temperature, humidity, light_intensity, co2_level
            FROM sensor_samples
            WHERE recorded_at >= now() - make_interval(hours => $1)
              AND ($2::integer IS NULL OR greenhouse_id = $2)
            ORDER BY recorded_at ASC
            "#
        } else {
            r#"
            SELECT date_trunc('hour', recorded_at) AS recorded_at,
                   AVG(temperature)     AS temperature,
                   AVG(humidity)        AS humidity,
                   AVG(light_intensity) AS light_intensity,
                   AVG(co2_level)       AS co2_level
            FROM sensor_samples
            WHERE recorded_at >= now() - make_interval(hours => $1)
              AND ($2::integer IS NULL OR greenhouse_id = $2)
            GROUP BY 1
            ORDER BY 1 ASC
            "#
        };
        let rows = sqlx::query_as::<_, HistoryPoint>(query)
            .bind(to_i32(hours))
            .bind(greenhouse_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn delete_samples_older_than(&self, days: u32, limit: u32) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM sensor_samples
            WHERE id IN (
                SELECT id FROM sensor_samples
                WHERE recorded_at < now() - make_interval(days => $1)
                ORDER BY recorded_at ASC
                LIMIT $2
            )
            "#,
        )
        .bind(to_i32(days))
        .bind(i64::from(limit))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn count_samples_older_than(&self, days: u32) -> StoreResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sensor_samples WHERE recorded_at < now() - make_interval(days => $1)",
        )
        .bind(to_i32(days))
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

#[async_trait]
impl ThresholdStore for PgStore {
    async fn get_thresholds(&self) -> StoreResult<Thresholds> {
        let rows = sqlx::query_as::<_, Threshold>(
            "SELECT parameter, min_value, max_value FROM thresholds",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(Thresholds::from_rows(rows))
    }

    async fn set_threshold(&self, parameter: Parameter, band: Band) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO thresholds (parameter, min_value, max_value)
            VALUES ($1, $2, $3)
            ON CONFLICT (parameter) DO UPDATE
                SET min_value = EXCLUDED.min_value,
                    max_value = EXCLUDED.max_value
            "#,
        )
        .bind(parameter)
        .bind(band.min)
        .bind(band.max)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl DeviceStore for PgStore {
    async fn write_device_state(&self, device: Device, status: DeviceStatus) -> StoreResult<DeviceRecord> {
        let record = sqlx::query_as::<_, DeviceRecord>(
            r#"
            INSERT INTO device_records (device_name, status)
            VALUES ($1, $2)
            RETURNING id, device_name, status, recorded_at
            "#,
        )
        .bind(device)
        .bind(status)
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    async fn current_states(&self) -> StoreResult<Vec<DeviceRecord>> {
        let rows = sqlx::query_as::<_, DeviceRecord>(
            r#"
            SELECT DISTINCT ON (device_name) id, device_name, status, recorded_at
            FROM device_records
            ORDER BY device_name, recorded_at DESC, id DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn status_at(&self, device: Device, at: DateTime<Utc>) -> StoreResult<Option<DeviceRecord>> {
        let row = sqlx::query_as::<_, DeviceRecord>(
            r#"
            SELECT id, device_name, status, recorded_at
            FROM device_records
            WHERE device_name = $1 AND recorded_at <= $2
            ORDER BY recorded_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(device)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}

const ALERT_COLUMNS: &str =
    "id, parameter, value, message, handled, handled_by, handled_at, created_at";

#[async_trait]
impl AlertStore for PgStore {
    async fn raise_alert(&self, parameter: Parameter, value: f64, message: &str) -> StoreResult<Alert> {
        let alert = sqlx::query_as::<_, Alert>(&format!(
            "INSERT INTO alerts (parameter, value, message) VALUES ($1, $2, $3) RETURNING {ALERT_COLUMNS}"
        ))
        .bind(parameter)
        .bind(value)
        .bind(message)
        .fetch_one(&self.pool)
        .await?;
        Ok(alert)
    }

    async fn list_alerts(&self, filter: AlertFilter, limit: u32) -> StoreResult<Vec<Alert>> {
        let handled = match filter {
            AlertFilter::All => None,
            AlertFilter::Unhandled => Some(false),
            AlertFilter::Handled => Some(true),
        };
        let rows = sqlx::query_as::<_, Alert>(&format!(
            "SELECT {ALERT_COLUMNS} FROM alerts \
             WHERE ($1::boolean IS NULL OR handled = $1) \
             ORDER BY created_at DESC, id DESC LIMIT $2"
        ))
        .bind(handled)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn handle_alert(&self, id: i64, operator: &str) -> StoreResult<HandleOutcome> {
        let updated = sqlx::query(
            r#"
            UPDATE alerts
            SET handled = TRUE, handled_by = $2, handled_at = now()
            WHERE id = $1 AND NOT handled
            "#,
        )
        .bind(id)
        .bind(operator)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 1 {
            return Ok(HandleOutcome::Handled);
        }

        let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM alerts WHERE id = $1)")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        Ok(if exists { HandleOutcome::AlreadyHandled } else { HandleOutcome::NotFound })
    }
}

const TASK_COLUMNS: &str = "id, device_name, action, schedule_time, enabled";

#[async_trait]
impl ScheduleStore for PgStore {
    async fn get_enabled_scheduled_tasks(&self) -> StoreResult<Vec<ScheduledTask>> {
        let rows = sqlx::query_as::<_, ScheduledTask>(&format!(
            "SELECT {TASK_COLUMNS} FROM scheduled_tasks WHERE enabled ORDER BY schedule_time, id"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn list_tasks(&self) -> StoreResult<Vec<ScheduledTask>> {
        let rows = sqlx::query_as::<_, ScheduledTask>(&format!(
            "SELECT {TASK_COLUMNS} FROM scheduled_tasks ORDER BY schedule_time, id"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn add_task(&self, device: Device, action: DeviceStatus, schedule_time: &str) -> StoreResult<ScheduledTask> {
        let task = sqlx::query_as::<_, ScheduledTask>(&format!(
            "INSERT INTO scheduled_tasks (device_name, action, schedule_time) \
             VALUES ($1, $2, $3) RETURNING {TASK_COLUMNS}"
        ))
        .bind(device.to_string())
        .bind(action)
        .bind(schedule_time)
        .fetch_one(&self.pool)
        .await?;
        Ok(task)
    }

    async fn toggle_task(&self, id: i64) -> StoreResult<Option<ScheduledTask>> {
        let task = sqlx::query_as::<_, ScheduledTask>(&format!(
            "UPDATE scheduled_tasks SET enabled = NOT enabled WHERE id = $1 RETURNING {TASK_COLUMNS}"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(task)
    }

    async fn delete_task(&self, id: i64) -> StoreResult<bool> {
        let deleted = sqlx::query("DELETE FROM scheduled_tasks WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted > 0)
    }
}

#[async_trait]
impl ModeStore for PgStore {
    async fn get_auto_mode(&self) -> StoreResult<bool> {
        let auto_mode: Option<bool> =
            sqlx::query_scalar("SELECT auto_mode FROM control_mode WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;
        Ok(auto_mode.unwrap_or(true))
    }

    async fn set_auto_mode(&self, auto_mode: bool) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO control_mode (id, auto_mode, updated_at)
            VALUES (1, $1, now())
            ON CONFLICT (id) DO UPDATE
                SET auto_mode = EXCLUDED.auto_mode, updated_at = now()
            "#,
        )
        .bind(auto_mode)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
