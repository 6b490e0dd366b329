pub mod config;
pub mod error;
pub mod ports;
pub mod room;
pub mod sensor;
pub mod shadow;
pub mod timer;
pub mod topics;
pub mod types;

pub use config::{GpioConfig, MqttConfig, RoomConfig, RuntimeConfig, SensorConfig, TlsConfig};
pub use error::{ActuatorError, ConfigError, ControlError, SensorError, ShadowError};
pub use ports::{Actuator, TemperatureSensor};
pub use room::{RoomChange, RoomController};
pub use sensor::{parse_w1_slave, read_until_valid, RetryPolicy};
pub use shadow::{OutboundMessage, ShadowGateway};
pub use timer::{TimerService, TimerToken};
pub use topics::ShadowTopics;
pub use types::{ClimateMode, OutputRole, ReportedRoom, RoomState, ShadowUpdatePayload};
