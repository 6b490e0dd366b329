use std::collections::BTreeMap;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClimateMode {
    Off,
    Heat,
    Cool,
}

impl ClimateMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "OFF",
            Self::Heat => "HEAT",
            Self::Cool => "COOL",
        }
    }

    /// Exact, case-sensitive match against the shadow vocabulary.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "OFF" => Some(Self::Off),
            "HEAT" => Some(Self::Heat),
            "COOL" => Some(Self::Cool),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputRole {
    Heater,
    Fan,
}

impl OutputRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Heater => "heater",
            Self::Fan => "fan",
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Self::Heater => Self::Fan,
            Self::Fan => Self::Heater,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoomState {
    pub mode: ClimateMode,
    pub remaining_minutes: u32,
    pub last_temperature_c: Option<f32>,
}

impl RoomState {
    pub fn off() -> Self {
        Self {
            mode: ClimateMode::Off,
            remaining_minutes: 0,
            last_temperature_c: None,
        }
    }

    pub fn reported(&self, include_temp: bool) -> ReportedRoom {
        ReportedRoom {
            mode: self.mode.as_str(),
            time: self.remaining_minutes,
            temp: if include_temp {
                self.last_temperature_c.map(round_temp)
            } else {
                None
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportedRoom {
    pub mode: &'static str,
    pub time: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportedState {
    pub reported: BTreeMap<String, ReportedRoom>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShadowUpdatePayload {
    pub state: ReportedState,
}

impl ShadowUpdatePayload {
    pub fn from_rooms<'a>(
        rooms: impl IntoIterator<Item = (&'a str, &'a RoomState)>,
        include_temp: bool,
    ) -> Self {
        let reported = rooms
            .into_iter()
            .map(|(key, state)| (key.to_string(), state.reported(include_temp)))
            .collect();
        Self {
            state: ReportedState { reported },
        }
    }
}

fn round_temp(celsius: f32) -> f32 {
    (celsius * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn mode_parse_is_exact() {
        assert_eq!(ClimateMode::parse("HEAT"), Some(ClimateMode::Heat));
        assert_eq!(ClimateMode::parse("COOL"), Some(ClimateMode::Cool));
        assert_eq!(ClimateMode::parse("OFF"), Some(ClimateMode::Off));
        assert_eq!(ClimateMode::parse("heat"), None);
        assert_eq!(ClimateMode::parse("FREEZE"), None);
    }

    #[test]
    fn reported_payload_omits_temp_unless_requested() {
        let state = RoomState {
            mode: ClimateMode::Heat,
            remaining_minutes: 10,
            last_temperature_c: Some(21.4375),
        };
        let without = ShadowUpdatePayload::from_rooms([("room0", &state)], false);
        let with = ShadowUpdatePayload::from_rooms([("room0", &state)], true);

        assert_eq!(
            serde_json::to_string(&without).unwrap(),
            r#"{"state":{"reported":{"room0":{"mode":"HEAT","time":10}}}}"#
        );
        assert_eq!(
            serde_json::to_string(&with).unwrap(),
            r#"{"state":{"reported":{"room0":{"mode":"HEAT","time":10,"temp":21.438}}}}"#
        );
    }
}
