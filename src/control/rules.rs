//! Per-parameter actuation rules.
//!
//! Each parameter maps to a fixed set of device commands for its low side,
//! high side and in-band (neutral) state. Readings beyond the threshold by
//! more than the parameter's hysteresis margin additionally raise an alert.
//!
//! Rules are evaluated in `Parameter::ALL` order and their commands are
//! issued in that order, so when several rules command the same device (the
//! `fan` is shared by temperature, humidity and CO2) the last one evaluated
//! decides its state for the tick.

use std::collections::BTreeMap;

use crate::{
    db::models::{Band, Device, DeviceStatus, Parameter, Reading, Thresholds},
    error::ValidationError,
};

use Device::*;
use DeviceStatus::{Off, On};

type Commands = &'static [(Device, DeviceStatus)];

/// What one parameter drives on each side of its band.
struct Actuation {
    low: Commands,
    high: Commands,
    neutral: Commands,
}

const TEMPERATURE: Actuation = Actuation {
    low: &[(Heater, On), (Cooler, Off)],
    high: &[(Heater, Off), (Cooler, On), (Fan, On)],
    neutral: &[(Heater, Off), (Cooler, Off), (Fan, Off)],
};

const HUMIDITY: Actuation = Actuation {
    low: &[(WaterPump, On)],
    high: &[(WaterPump, Off), (Fan, On)],
    neutral: &[(WaterPump, Off)],
};

const LIGHT: Actuation = Actuation {
    low: &[(Light, On)],
    high: &[(Light, Off)],
    neutral: &[(Light, Off)],
};

const CO2: Actuation = Actuation {
    low: &[(Co2Generator, On)],
    high: &[(Co2Generator, Off), (Fan, On)],
    neutral: &[(Co2Generator, Off)],
};

fn actuation(parameter: Parameter) -> &'static Actuation {
    match parameter {
        Parameter::Temperature => &TEMPERATURE,
        Parameter::Humidity => &HUMIDITY,
        Parameter::Light => &LIGHT,
        Parameter::Co2 => &CO2,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Zone {
    Low,
    Neutral,
    High,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingAlert {
    pub parameter: Parameter,
    pub value: f64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub parameter: Parameter,
    pub zone: Zone,
    pub commands: Vec<(Device, DeviceStatus)>,
    pub alert: Option<PendingAlert>,
}

/// Apply the rule for one parameter.
pub fn evaluate(parameter: Parameter, value: f64, band: Band) -> Result<Decision, ValidationError> {
    let band = band.validate(parameter)?;
    if !value.is_finite() {
        return Err(ValidationError::NonFiniteReading { parameter, value });
    }

    let table = actuation(parameter);
    let margin = parameter.hysteresis();
    let unit = parameter.unit();

    let (zone, commands, alert) = if value < band.min {
        let alert = (value < band.min - margin).then(|| format!("{parameter} too low: {value}{unit}"));
        (Zone::Low, table.low, alert)
    } else if value > band.max {
        let alert = (value > band.max + margin).then(|| format!("{parameter} too high: {value}{unit}"));
        (Zone::High, table.high, alert)
    } else {
        (Zone::Neutral, table.neutral, None)
    };

    Ok(Decision {
        parameter,
        zone,
        commands: commands.to_vec(),
        alert: alert.map(|message| PendingAlert { parameter, value, message }),
    })
}

/// Everything one tick's threshold rules want done, in issue order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    pub commands: Vec<(Device, DeviceStatus)>,
    pub alerts: Vec<PendingAlert>,
    /// Parameters left untouched this tick, with the reason.
    pub skipped: Vec<(Parameter, ValidationError)>,
}

impl Plan {
    /// State each commanded device ends the tick in (last write wins).
    pub fn final_states(&self) -> BTreeMap<Device, DeviceStatus> {
        self.commands.iter().copied().collect()
    }
}

/// Run every parameter rule in evaluation order. An invalid band or reading
/// skips only that parameter.
pub fn plan(reading: &Reading, thresholds: &Thresholds) -> Plan {
    let mut plan = Plan::default();
    for parameter in Parameter::ALL {
        match evaluate(parameter, reading.value(parameter), thresholds.band(parameter)) {
            Ok(decision) => {
                plan.commands.extend(decision.commands);
                plan.alerts.extend(decision.alert);
            }
            Err(e) => plan.skipped.push((parameter, e)),
        }
    }
    plan
}
