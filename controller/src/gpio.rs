use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use tracing::{debug, info, warn};

use climate_common::{Actuator, ActuatorError, GpioConfig, OutputRole, RoomConfig};

/// Relay outputs driven through `/sys/class/gpio`.
pub struct SysfsGpio {
    root: PathBuf,
    active_low: bool,
    pins: HashMap<(String, OutputRole), u32>,
}

impl SysfsGpio {
    /// Exports every configured pin as an output already at its "off" level.
    pub fn open(config: &GpioConfig, rooms: &[RoomConfig]) -> anyhow::Result<Self> {
        let mut pins = HashMap::new();
        for room in rooms {
            pins.insert((room.key.clone(), OutputRole::Heater), room.heater_pin);
            pins.insert((room.key.clone(), OutputRole::Fan), room.fan_pin);
        }

        let gpio = Self {
            root: config.sysfs_root.clone(),
            active_low: config.active_low,
            pins,
        };

        for pin in gpio.pins.values() {
            gpio.export(*pin)
                .with_context(|| format!("failed to export gpio{pin}"))?;
            // "high"/"low" set direction and initial value in one write.
            let initial = if gpio.active_low { "high" } else { "low" };
            fs::write(gpio.pin_dir(*pin).join("direction"), initial)
                .with_context(|| format!("failed to configure gpio{pin} as output"))?;
        }

        info!(pins = gpio.pins.len(), "gpio outputs configured");
        Ok(gpio)
    }

    /// Unexports every pin, leaving the board as it was found.
    pub fn release(&self) {
        for pin in self.pins.values() {
            if let Err(err) = fs::write(self.root.join("unexport"), pin.to_string()) {
                warn!("failed to unexport gpio{pin}: {err}");
            }
        }
    }

    fn export(&self, pin: u32) -> std::io::Result<()> {
        if self.pin_dir(pin).exists() {
            return Ok(());
        }
        fs::write(self.root.join("export"), pin.to_string())
    }

    fn pin_dir(&self, pin: u32) -> PathBuf {
        self.root.join(format!("gpio{pin}"))
    }

    fn level(&self, active: bool) -> &'static str {
        if active != self.active_low {
            "1"
        } else {
            "0"
        }
    }
}

impl Actuator for SysfsGpio {
    fn set_output(&self, role: OutputRole, room: &str, active: bool) -> Result<(), ActuatorError> {
        let pin = self
            .pins
            .get(&(room.to_string(), role))
            .copied()
            .ok_or_else(|| ActuatorError::unmapped(room, role))?;

        write_value(&self.pin_dir(pin), self.level(active))
            .map_err(|err| ActuatorError::io(room, role, err))?;
        debug!(room, role = role.as_str(), pin, active, "output written");
        Ok(())
    }
}

fn write_value(pin_dir: &Path, level: &str) -> std::io::Result<()> {
    fs::write(pin_dir.join("value"), level)
}

/// Stand-in used on hosts without relays.
pub struct LoggingActuator;

impl Actuator for LoggingActuator {
    fn set_output(&self, role: OutputRole, room: &str, active: bool) -> Result<(), ActuatorError> {
        info!(room, role = role.as_str(), active, "dry-run output");
        Ok(())
    }
}
