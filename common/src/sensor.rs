use std::time::Duration;

use tracing::{debug, warn};

use crate::{config::SensorConfig, error::SensorError, ports::TemperatureSensor};

/// Parses the two-line `w1_slave` payload of a DS18B20.
///
/// ```text
/// 72 01 4b 46 7f ff 0e 10 57 : crc=57 YES
/// 72 01 4b 46 7f ff 0e 10 57 t=23125
/// ```
pub fn parse_w1_slave(raw: &str) -> Result<f32, SensorError> {
    let mut lines = raw.lines();
    let status = lines.next().unwrap_or_default();
    if !status.trim().ends_with("YES") {
        return Err(SensorError::NotReady);
    }

    let data = lines
        .next()
        .ok_or_else(|| SensorError::Malformed("missing data line".to_string()))?;
    let Some(pos) = data.find("t=") else {
        return Err(SensorError::Malformed(format!("no t= field in {data:?}")));
    };
    let millidegrees: f32 = data[pos + 2..]
        .trim()
        .parse()
        .map_err(|_| SensorError::Malformed(format!("bad temperature in {data:?}")))?;

    Ok(millidegrees / 1000.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl From<&SensorConfig> for RetryPolicy {
    fn from(config: &SensorConfig) -> Self {
        Self {
            interval: Duration::from_millis(config.retry_interval_ms),
            max_attempts: config.max_attempts.max(1),
        }
    }
}

/// Reads until the sensor yields a valid value, sleeping between attempts.
/// Non-transient errors (an unmapped room) are returned immediately.
pub async fn read_until_valid<S>(
    sensor: &S,
    room: &str,
    policy: RetryPolicy,
) -> Result<f32, SensorError>
where
    S: TemperatureSensor + ?Sized,
{
    let attempts = policy.max_attempts.max(1);
    for attempt in 1..=attempts {
        match sensor.read_celsius(room) {
            Ok(celsius) => return Ok(celsius),
            Err(err) if err.is_transient() => {
                debug!(room, attempt, "sensor not ready: {err}");
                if attempt < attempts {
                    tokio::time::sleep(policy.interval).await;
                }
            }
            Err(err) => return Err(err),
        }
    }

    warn!(room, attempts, "giving up on sensor read");
    Err(SensorError::RetriesExhausted {
        room: room.to_string(),
        attempts,
    })
}
