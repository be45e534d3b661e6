use std::{collections::BTreeMap, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::ValidationError;

// ---------------------------------------------------------------------------
// Parameter
// ---------------------------------------------------------------------------

/// Mirrors the `parameter` Postgres enum.
///
/// Declaration order is the evaluation order of the control loop rules; the
/// shared `fan` ends up in whatever state the last rule touching it wrote.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
    sqlx::Type, ToSchema,
)]
#[sqlx(type_name = "parameter", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Parameter {
    Temperature,
    Humidity,
    Light,
    Co2,
}

impl Parameter {
    /// Rule evaluation order.
    pub const ALL: [Parameter; 4] = [
        Parameter::Temperature,
        Parameter::Humidity,
        Parameter::Light,
        Parameter::Co2,
    ];

    /// Secondary band beyond the threshold; crossing it raises an alert.
    pub fn hysteresis(self) -> f64 {
        match self {
            Parameter::Temperature => 2.0,
            Parameter::Humidity => 5.0,
            Parameter::Light => 1000.0,
            Parameter::Co2 => 100.0,
        }
    }

    pub fn unit(self) -> &'static str {
        match self {
            Parameter::Temperature => "°C",
            Parameter::Humidity => "%",
            Parameter::Light => " lux",
            Parameter::Co2 => " ppm",
        }
    }

    /// Compiled-in band used whenever storage has no entry for `self`.
    pub fn default_band(self) -> Band {
        match self {
            Parameter::Temperature => Band::new(18.0, 28.0),
            Parameter::Humidity => Band::new(50.0, 80.0),
            Parameter::Light => Band::new(3000.0, 8000.0),
            Parameter::Co2 => Band::new(400.0, 1000.0),
        }
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Parameter::Temperature => "temperature",
            Parameter::Humidity => "humidity",
            Parameter::Light => "light",
            Parameter::Co2 => "co2",
        };
        f.write_str(s)
    }
}

impl FromStr for Parameter {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "temperature" => Ok(Self::Temperature),
            "humidity" => Ok(Self::Humidity),
            "light" => Ok(Self::Light),
            "co2" => Ok(Self::Co2),
            other => Err(ValidationError::UnknownParameter(other.to_owned())),
        }
    }
}

// ---------------------------------------------------------------------------
// Devices
// ---------------------------------------------------------------------------

/// Mirrors the `device_name` Postgres enum: the fixed set of actuators.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
    sqlx::Type, ToSchema,
)]
#[sqlx(type_name = "device_name", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Device {
    Heater,
    Cooler,
    Fan,
    Light,
    Co2Generator,
    WaterPump,
}

impl Device {
    pub const ALL: [Device; 6] = [
        Device::Heater,
        Device::Cooler,
        Device::Fan,
        Device::Light,
        Device::Co2Generator,
        Device::WaterPump,
    ];
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Device::Heater => "heater",
            Device::Cooler => "cooler",
            Device::Fan => "fan",
            Device::Light => "light",
            Device::Co2Generator => "co2_generator",
            Device::WaterPump => "water_pump",
        };
        f.write_str(s)
    }
}

impl FromStr for Device {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Device::ALL
            .into_iter()
            .find(|d| d.to_string() == s)
            .ok_or_else(|| ValidationError::UnknownDevice(s.to_owned()))
    }
}

/// Mirrors the `device_status` Postgres enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(type_name = "device_status")]
pub enum DeviceStatus {
    #[sqlx(rename = "ON")]
    #[serde(rename = "ON")]
    On,
    #[sqlx(rename = "OFF")]
    #[serde(rename = "OFF")]
    Off,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeviceStatus::On => "ON",
            DeviceStatus::Off => "OFF",
        })
    }
}

/// One row of the append-only device timeline.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize, ToSchema)]
pub struct DeviceRecord {
    pub id: i64,
    pub device_name: Device,
    pub status: DeviceStatus,
    pub recorded_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Sensor samples
// ---------------------------------------------------------------------------

/// A raw environmental reading as produced by a `SensorSource`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Reading {
    /// Degrees Celsius
    pub temperature: f64,
    /// Relative humidity percentage
    pub humidity: f64,
    /// Lux
    pub light_intensity: f64,
    /// ppm
    pub co2_level: f64,
}

impl Reading {
    pub fn value(&self, parameter: Parameter) -> f64 {
        match parameter {
            Parameter::Temperature => self.temperature,
            Parameter::Humidity => self.humidity,
            Parameter::Light => self.light_intensity,
            Parameter::Co2 => self.co2_level,
        }
    }
}

/// A persisted reading. Immutable once stored.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize, ToSchema)]
pub struct SensorSample {
    pub id: Uuid,
    pub greenhouse_id: Option<i32>,
    pub temperature: f64,
    pub humidity: f64,
    pub light_intensity: f64,
    pub co2_level: f64,
    pub recorded_at: DateTime<Utc>,
}

impl SensorSample {
    pub fn reading(&self) -> Reading {
        Reading {
            temperature: self.temperature,
            humidity: self.humidity,
            light_intensity: self.light_intensity,
            co2_level: self.co2_level,
        }
    }
}

/// A point on the history chart: a raw sample or an hourly average.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize, ToSchema)]
pub struct HistoryPoint {
    pub recorded_at: DateTime<Utc>,
    pub temperature: f64,
    pub humidity: f64,
    pub light_intensity: f64,
    pub co2_level: f64,
}

// ---------------------------------------------------------------------------
// Thresholds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Band {
    pub min: f64,
    pub max: f64,
}

impl Band {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn validate(self, parameter: Parameter) -> Result<Self, ValidationError> {
        if self.min.is_finite() && self.max.is_finite() && self.min <= self.max {
            Ok(self)
        } else {
            Err(ValidationError::InvalidBand {
                parameter,
                min: self.min,
                max: self.max,
            })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, FromRow, Serialize, Deserialize, ToSchema)]
pub struct Threshold {
    pub parameter: Parameter,
    #[sqlx(rename = "min_value")]
    pub min: f64,
    #[sqlx(rename = "max_value")]
    pub max: f64,
}

/// Effective band per parameter. Lookups never fail: a parameter without a
/// stored entry resolves to its compiled-in default.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Thresholds {
    stored: BTreeMap<Parameter, Band>,
}

impl Thresholds {
    pub fn from_rows(rows: impl IntoIterator<Item = Threshold>) -> Self {
        Self {
            stored: rows
                .into_iter()
                .map(|t| (t.parameter, Band::new(t.min, t.max)))
                .collect(),
        }
    }

    pub fn with(mut self, parameter: Parameter, band: Band) -> Self {
        self.stored.insert(parameter, band);
        self
    }

    pub fn band(&self, parameter: Parameter) -> Band {
        self.stored
            .get(&parameter)
            .copied()
            .unwrap_or_else(|| parameter.default_band())
    }

    /// All four parameters in evaluation order, defaults filled in.
    pub fn effective(&self) -> Vec<Threshold> {
        Parameter::ALL
            .into_iter()
            .map(|parameter| {
                let band = self.band(parameter);
                Threshold { parameter, min: band.min, max: band.max }
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Scheduled tasks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize, ToSchema)]
pub struct ScheduledTask {
    pub id: i64,
    /// Stored as free text; resolved against the fixed device set when fired.
    pub device_name: String,
    pub action: DeviceStatus,
    /// Wall-clock minute, `HH:MM`.
    pub schedule_time: String,
    pub enabled: bool,
}

impl ScheduledTask {
    pub fn device(&self) -> Result<Device, ValidationError> {
        self.device_name.parse()
    }
}

/// Validate a `HH:MM` wall-clock minute in `00:00..=23:59`.
pub fn parse_schedule_time(raw: &str) -> Result<String, ValidationError> {
    let invalid = || ValidationError::InvalidScheduleTime(raw.to_owned());
    let (hh, mm) = raw.split_once(':').ok_or_else(invalid)?;
    let digits = |s: &str| s.len() == 2 && s.bytes().all(|b| b.is_ascii_digit());
    if !digits(hh) || !digits(mm) {
        return Err(invalid());
    }
    let h: u8 = hh.parse().map_err(|_| invalid())?;
    let m: u8 = mm.parse().map_err(|_| invalid())?;
    if h > 23 || m > 59 {
        return Err(invalid());
    }
    Ok(format!("{h:02}:{m:02}"))
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize, ToSchema)]
pub struct Alert {
    pub id: i64,
    pub parameter: Parameter,
    pub value: f64,
    pub message: String,
    pub handled: bool,
    pub handled_by: Option<String>,
    pub handled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AlertFilter {
    #[default]
    All,
    Unhandled,
    Handled,
}

impl AlertFilter {
    pub fn matches(self, alert: &Alert) -> bool {
        match self {
            AlertFilter::All => true,
            AlertFilter::Unhandled => !alert.handled,
            AlertFilter::Handled => alert.handled,
        }
    }
}

/// Result of marking an alert handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    Handled,
    AlreadyHandled,
    NotFound,
}
