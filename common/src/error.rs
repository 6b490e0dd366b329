use thiserror::Error;

use crate::types::OutputRole;

#[derive(Debug, Error)]
pub enum ActuatorError {
    #[error("failed to drive {role} output for {room}: {source}")]
    Io {
        room: String,
        role: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("no {role} output configured for {room}")]
    Unmapped { room: String, role: &'static str },
}

impl ActuatorError {
    pub fn io(room: &str, role: OutputRole, source: std::io::Error) -> Self {
        Self::Io {
            room: room.to_string(),
            role: role.as_str(),
            source,
        }
    }

    pub fn unmapped(room: &str, role: OutputRole) -> Self {
        Self::Unmapped {
            room: room.to_string(),
            role: role.as_str(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("unknown room {0:?}")]
    UnknownRoom(String),
    #[error(transparent)]
    Actuator(#[from] ActuatorError),
}

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("sensor conversion not complete")]
    NotReady,
    #[error("malformed sensor payload: {0}")]
    Malformed(String),
    #[error("no sensor mapped to {0}")]
    Unmapped(String),
    #[error("sensor read failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("no valid reading for {room} after {attempts} attempts")]
    RetriesExhausted { room: String, attempts: u32 },
}

impl SensorError {
    /// Errors worth another attempt after a short delay.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NotReady | Self::Malformed(_) | Self::Io(_))
    }
}

#[derive(Debug, Error)]
pub enum ShadowError {
    #[error("invalid shadow document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("shadow document has no state object")]
    MissingState,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("at least one room must be configured")]
    NoRooms,
    #[error("room key must not be empty")]
    EmptyRoomKey,
    #[error("room {0:?} is configured more than once")]
    DuplicateRoom(String),
    #[error("gpio pin {pin} is assigned to both {first} and {second}")]
    PinConflict {
        pin: u32,
        first: String,
        second: String,
    },
    #[error("thing name must not be empty")]
    EmptyThingName,
}
