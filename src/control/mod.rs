//! The control core: threshold rules, scheduled tasks and the loop that
//! drives both.

pub mod actuator;
pub mod mode;
pub mod rules;
pub mod schedule;
pub mod service;

pub use actuator::{Actuator, AlertSink, CommandSource};
pub use mode::ControlMode;
pub use service::{ControlService, TickReport};
