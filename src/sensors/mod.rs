mod service;
mod simulated;

pub use service::SensorService;
pub use simulated::SimulatedSensors;

use crate::db::models::Reading;

/// Produces one environmental reading per call. The simulator implements it
/// today; a hardware driver would slot in the same way.
pub trait SensorSource: Send {
    fn read(&mut self) -> Reading;
}
