use rand::{rngs::StdRng, Rng, SeedableRng};

use super::SensorSource;
use crate::db::models::Reading;

/// Random-walk simulator. Each read nudges every value by a bounded step,
/// clamps it to a plausible range and rounds to one decimal.
pub struct SimulatedSensors {
    rng: StdRng,
    state: Reading,
}

const TEMPERATURE_STEP: f64 = 0.5;
const HUMIDITY_STEP: f64 = 1.0;
const LIGHT_STEP: f64 = 200.0;
const CO2_STEP: f64 = 20.0;

impl SimulatedSensors {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_os_rng())
    }

    /// Deterministic walk for tests.
    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            rng,
            state: Reading {
                temperature: 25.0,
                humidity: 60.0,
                light_intensity: 5000.0,
                co2_level: 600.0,
            },
        }
    }
}

impl Default for SimulatedSensors {
    fn default() -> Self {
        Self::new()
    }
}

fn step(rng: &mut StdRng, value: f64, delta: f64, min: f64, max: f64) -> f64 {
    (value + rng.random_range(-delta..=delta)).clamp(min, max)
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

impl SensorSource for SimulatedSensors {
    fn read(&mut self) -> Reading {
        let s = &mut self.state;
        s.temperature = step(&mut self.rng, s.temperature, TEMPERATURE_STEP, 10.0, 40.0);
        s.humidity = step(&mut self.rng, s.humidity, HUMIDITY_STEP, 30.0, 90.0);
        s.light_intensity = step(&mut self.rng, s.light_intensity, LIGHT_STEP, 0.0, 10_000.0);
        s.co2_level = step(&mut self.rng, s.co2_level, CO2_STEP, 300.0, 1500.0);

        Reading {
            temperature: round1(s.temperature),
            humidity: round1(s.humidity),
            light_intensity: round1(s.light_intensity),
            co2_level: round1(s.co2_level),
        }
    }
}
