//! Hardware boundary consumed by the room controller.
//!
//! The controller only ever talks to these traits; GPIO and 1-Wire adapters
//! live in the controller binary.

use crate::{
    error::{ActuatorError, SensorError},
    types::OutputRole,
};

/// Drives a heater or fan relay for one room.
pub trait Actuator: Send + Sync {
    /// `active = true` switches the output on, whatever its electrical level.
    fn set_output(&self, role: OutputRole, room: &str, active: bool) -> Result<(), ActuatorError>;
}

/// Single-shot temperature read. Retrying is the caller's business.
pub trait TemperatureSensor: Send + Sync {
    fn read_celsius(&self, room: &str) -> Result<f32, SensorError>;
}
