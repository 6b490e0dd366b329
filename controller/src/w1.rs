use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use tracing::{info, warn};

use climate_common::{parse_w1_slave, RoomConfig, SensorConfig, SensorError, TemperatureSensor};

const DS18B20_FAMILY_PREFIX: &str = "28-";

/// DS18B20 probes exposed by the `w1-therm` kernel driver.
pub struct W1Sensors {
    paths: HashMap<String, PathBuf>,
}

impl W1Sensors {
    /// Rooms with an explicit `sensor_path` keep it; the rest take discovered
    /// probes in sorted device-id order, following the room order.
    pub fn discover(config: &SensorConfig, rooms: &[RoomConfig]) -> Self {
        let pinned: Vec<&PathBuf> = rooms
            .iter()
            .filter_map(|room| room.sensor_path.as_ref())
            .collect();
        let mut discovered = list_probes(&config.w1_devices_dir)
            .into_iter()
            .filter(|probe| !pinned.contains(&probe));
        let mut paths = HashMap::new();

        for room in rooms {
            let path = room.sensor_path.clone().or_else(|| discovered.next());
            match path {
                Some(path) => {
                    info!(
                        room = room.key.as_str(),
                        path = %path.display(),
                        "temperature probe mapped"
                    );
                    paths.insert(room.key.clone(), path);
                }
                None => warn!(room = room.key.as_str(), "no temperature probe for room"),
            }
        }

        Self { paths }
    }
}

impl TemperatureSensor for W1Sensors {
    fn read_celsius(&self, room: &str) -> Result<f32, SensorError> {
        let path = self
            .paths
            .get(room)
            .ok_or_else(|| SensorError::Unmapped(room.to_string()))?;
        let raw = fs::read_to_string(path)?;
        parse_w1_slave(&raw)
    }
}

fn list_probes(devices_dir: &Path) -> Vec<PathBuf> {
    let entries = match fs::read_dir(devices_dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(dir = %devices_dir.display(), "cannot list 1-wire devices: {err}");
            return Vec::new();
        }
    };

    let mut probes: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .filter(|entry| {
            entry
                .file_name()
                .to_string_lossy()
                .starts_with(DS18B20_FAMILY_PREFIX)
        })
        .map(|entry| entry.path().join("w1_slave"))
        .collect();
    probes.sort();
    probes
}

/// Fixed readings for hosts without probes.
pub struct SimulatedSensors {
    readings: HashMap<String, f32>,
}

impl SimulatedSensors {
    pub fn new(rooms: &[RoomConfig]) -> Self {
        let readings = rooms
            .iter()
            .enumerate()
            .map(|(index, room)| (room.key.clone(), 20.0 + index as f32 * 0.5))
            .collect();
        Self { readings }
    }
}

impl TemperatureSensor for SimulatedSensors {
    fn read_celsius(&self, room: &str) -> Result<f32, SensorError> {
        self.readings
            .get(room)
            .copied()
            .ok_or_else(|| SensorError::Unmapped(room.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room(key: &str, sensor_path: Option<PathBuf>) -> RoomConfig {
        RoomConfig {
            key: key.to_string(),
            heater_pin: 0,
            fan_pin: 1,
            sensor_path,
        }
    }

    fn fake_bus(name: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!("climate-w1-{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&root);
        fs::create_dir_all(&root).unwrap();
        root
    }

    fn add_probe(bus: &Path, id: &str, millidegrees: i32) {
        let dir = bus.join(id);
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("w1_slave"),
            format!(
                "72 01 4b 46 7f ff 0e 10 57 : crc=57 YES\n\
                 72 01 4b 46 7f ff 0e 10 57 t={millidegrees}\n"
            ),
        )
        .unwrap();
    }

    #[test]
    fn maps_discovered_probes_in_sorted_order() {
        let bus = fake_bus("sorted");
        add_probe(&bus, "28-0000000000bb", 21_000);
        add_probe(&bus, "28-0000000000aa", 19_500);
        fs::create_dir_all(bus.join("w1_bus_master1")).unwrap();

        let config = SensorConfig {
            w1_devices_dir: bus.clone(),
            ..SensorConfig::default()
        };
        let sensors = W1Sensors::discover(&config, &[room("room0", None), room("room1", None)]);

        assert_eq!(sensors.read_celsius("room0").unwrap(), 19.5);
        assert_eq!(sensors.read_celsius("room1").unwrap(), 21.0);

        fs::remove_dir_all(bus).unwrap();
    }

    #[test]
    fn explicit_path_takes_precedence() {
        let bus = fake_bus("explicit");
        add_probe(&bus, "28-0000000000aa", 19_500);
        add_probe(&bus, "28-0000000000ff", 25_250);

        let config = SensorConfig {
            w1_devices_dir: bus.clone(),
            ..SensorConfig::default()
        };
        let pinned = bus.join("28-0000000000ff").join("w1_slave");
        let sensors = W1Sensors::discover(
            &config,
            &[room("room0", Some(pinned)), room("room1", None)],
        );

        assert_eq!(sensors.read_celsius("room0").unwrap(), 25.25);
        assert_eq!(sensors.read_celsius("room1").unwrap(), 19.5);

        fs::remove_dir_all(bus).unwrap();
    }

    #[test]
    fn pinned_probe_is_not_handed_out_again() {
        let bus = fake_bus("pinned");
        add_probe(&bus, "28-0000000000aa", 19_500);
        add_probe(&bus, "28-0000000000bb", 21_000);

        let config = SensorConfig {
            w1_devices_dir: bus.clone(),
            ..SensorConfig::default()
        };
        let pinned = bus.join("28-0000000000aa").join("w1_slave");
        let sensors = W1Sensors::discover(
            &config,
            &[
                room("room0", None),
                room("room1", Some(pinned)),
                room("room2", None),
            ],
        );

        assert_eq!(sensors.read_celsius("room0").unwrap(), 21.0);
        assert_eq!(sensors.read_celsius("room1").unwrap(), 19.5);
        assert!(matches!(
            sensors.read_celsius("room2"),
            Err(SensorError::Unmapped(_))
        ));

        fs::remove_dir_all(bus).unwrap();
    }

    #[test]
    fn rooms_beyond_probe_count_are_unmapped() {
        let config = SensorConfig {
            w1_devices_dir: PathBuf::from("/nonexistent/w1/devices"),
            ..SensorConfig::default()
        };
        let sensors = W1Sensors::discover(&config, &[room("room0", None)]);

        assert!(matches!(
            sensors.read_celsius("room0"),
            Err(SensorError::Unmapped(_))
        ));
    }
}
