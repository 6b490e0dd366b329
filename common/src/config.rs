use std::{collections::HashMap, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoomConfig {
    pub key: String,
    pub heater_pin: u32,
    pub fan_pin: u32,
    /// Explicit `w1_slave` path; discovered from the bus when absent.
    #[serde(default)]
    pub sensor_path: Option<PathBuf>,
}

impl RoomConfig {
    fn new(key: &str, heater_pin: u32, fan_pin: u32) -> Self {
        Self {
            key: key.to_string(),
            heater_pin,
            fan_pin,
            sensor_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TlsConfig {
    pub root_ca: PathBuf,
    pub certificate: PathBuf,
    pub private_key: PathBuf,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            root_ca: PathBuf::from("./deviceSDK/root-ca.pem"),
            certificate: PathBuf::from("./deviceSDK/certificate.pem.crt"),
            private_key: PathBuf::from("./deviceSDK/private.pem.key"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub thing_name: String,
    pub keep_alive_secs: u64,
    /// Plain TCP when absent.
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8883,
            client_id: "MyRaspberryPi".to_string(),
            thing_name: "MyRaspberryPi".to_string(),
            keep_alive_secs: 60,
            tls: Some(TlsConfig::default()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpioConfig {
    pub sysfs_root: PathBuf,
    /// Relay boards on this controller switch on when the pin is pulled low.
    pub active_low: bool,
    /// Log output changes instead of touching sysfs.
    pub dry_run: bool,
}

impl Default for GpioConfig {
    fn default() -> Self {
        Self {
            sysfs_root: PathBuf::from("/sys/class/gpio"),
            active_low: true,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    pub w1_devices_dir: PathBuf,
    pub retry_interval_ms: u64,
    pub max_attempts: u32,
    /// Re-read and republish temperatures on this period. One read at
    /// startup when absent.
    #[serde(default)]
    pub refresh_interval_secs: Option<u64>,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            w1_devices_dir: PathBuf::from("/sys/bus/w1/devices"),
            retry_interval_ms: 200,
            max_attempts: 50,
            refresh_interval_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub rooms: Vec<RoomConfig>,
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub gpio: GpioConfig,
    #[serde(default)]
    pub sensor: SensorConfig,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

fn default_http_port() -> u16 {
    8080
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            rooms: vec![
                RoomConfig::new("room0", 17, 27),
                RoomConfig::new("room1", 22, 14),
                RoomConfig::new("room2", 15, 18),
            ],
            mqtt: MqttConfig::default(),
            gpio: GpioConfig::default(),
            sensor: SensorConfig::default(),
            http_port: default_http_port(),
        }
    }
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.sensor.retry_interval_ms = self.sensor.retry_interval_ms.clamp(50, 5_000);
        self.sensor.max_attempts = self.sensor.max_attempts.clamp(1, 1_000);
        if let Some(secs) = self.sensor.refresh_interval_secs.as_mut() {
            *secs = (*secs).max(5);
        }
        self.mqtt.keep_alive_secs = self.mqtt.keep_alive_secs.clamp(5, 1_200);
        for room in &mut self.rooms {
            room.key = room.key.trim().to_string();
        }
    }

    /// Room keys are fixed for the life of the process, so anything wrong
    /// with them is fatal at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rooms.is_empty() {
            return Err(ConfigError::NoRooms);
        }
        if self.mqtt.thing_name.trim().is_empty() {
            return Err(ConfigError::EmptyThingName);
        }

        let mut keys = Vec::with_capacity(self.rooms.len());
        let mut pins: HashMap<u32, String> = HashMap::new();
        for room in &self.rooms {
            if room.key.is_empty() {
                return Err(ConfigError::EmptyRoomKey);
            }
            if keys.contains(&room.key.as_str()) {
                return Err(ConfigError::DuplicateRoom(room.key.clone()));
            }
            keys.push(room.key.as_str());

            for (pin, label) in [(room.heater_pin, "heater"), (room.fan_pin, "fan")] {
                let owner = format!("{}/{label}", room.key);
                if let Some(first) = pins.insert(pin, owner.clone()) {
                    return Err(ConfigError::PinConflict {
                        pin,
                        first,
                        second: owner,
                    });
                }
            }
        }
        Ok(())
    }

    pub fn room_keys(&self) -> impl Iterator<Item = &str> {
        self.rooms.iter().map(|room| room.key.as_str())
    }
}
