use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::db::models::{Device, DeviceRecord, DeviceStatus};

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DeviceStateDto {
    pub device: Device,
    pub status: DeviceStatus,
    /// When the current status was written.
    pub since: DateTime<Utc>,
}

impl From<DeviceRecord> for DeviceStateDto {
    fn from(r: DeviceRecord) -> Self {
        Self {
            device: r.device_name,
            status: r.status,
            since: r.recorded_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ControlModeDto {
    pub auto_mode: bool,
}

/// Request body for `POST /schedules`.
#[derive(Debug, Deserialize, ToSchema)]
pub struct NewScheduleRequest {
    /// One of the fixed device names, e.g. `water_pump`.
    pub device_name: String,
    pub action: DeviceStatus,
    /// Wall-clock minute, `HH:MM`.
    pub schedule_time: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum HandleResult {
    Handled,
    AlreadyHandled,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HandleAlertResponse {
    pub id: i64,
    pub result: HandleResult,
}
