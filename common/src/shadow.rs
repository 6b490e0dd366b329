//! Device shadow translation: desired-state deltas in, reported state out.
//!
//! Inbound deltas look like
//!
//! ```json
//! {"version": 12, "state": {"room0": {"mode": "HEAT", "time": 10}}}
//! ```
//!
//! and every handled delta answers with the full reported `{mode, time}` of
//! every configured room, not just the ones it touched.

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, error, warn};

use crate::{
    error::ShadowError,
    room::RoomController,
    topics::ShadowTopics,
    types::{ClimateMode, ShadowUpdatePayload},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Deserialize)]
struct DeltaEnvelope {
    state: Option<Map<String, Value>>,
}

#[derive(Clone)]
pub struct ShadowGateway {
    controller: RoomController,
    topics: ShadowTopics,
}

impl ShadowGateway {
    pub fn new(controller: RoomController, topics: ShadowTopics) -> Self {
        Self { controller, topics }
    }

    pub fn topics(&self) -> &ShadowTopics {
        &self.topics
    }

    pub fn controller(&self) -> &RoomController {
        &self.controller
    }

    /// Entry point for every inbound publish.
    pub async fn dispatch(
        &self,
        topic: &str,
        payload: &[u8],
    ) -> Result<Option<OutboundMessage>, ShadowError> {
        if topic == self.topics.delta {
            let report = self.on_delta(payload).await?;
            return self.encode(&report).map(Some);
        }

        if topic == self.topics.rejected {
            warn!(
                "shadow update rejected: {}",
                String::from_utf8_lossy(payload)
            );
        } else {
            debug!(topic, "ignoring message on unexpected topic");
        }
        Ok(None)
    }

    /// Applies each room entry in document order, then reads back every room.
    pub async fn on_delta(&self, payload: &[u8]) -> Result<ShadowUpdatePayload, ShadowError> {
        let envelope: DeltaEnvelope = serde_json::from_slice(payload)?;
        let state = envelope.state.ok_or(ShadowError::MissingState)?;

        for (room, update) in &state {
            self.apply_room_delta(room, update).await;
        }

        Ok(self.mode_report().await)
    }

    /// `{mode, time, temp}` for every room, published once connected.
    pub async fn full_report(&self) -> ShadowUpdatePayload {
        let rooms = self.controller.snapshot().await;
        ShadowUpdatePayload::from_rooms(
            rooms.iter().map(|(key, state)| (key.as_str(), state)),
            true,
        )
    }

    /// `{mode, time}` for every room.
    pub async fn mode_report(&self) -> ShadowUpdatePayload {
        let rooms = self.controller.snapshot().await;
        ShadowUpdatePayload::from_rooms(
            rooms.iter().map(|(key, state)| (key.as_str(), state)),
            false,
        )
    }

    pub fn encode(&self, report: &ShadowUpdatePayload) -> Result<OutboundMessage, ShadowError> {
        Ok(OutboundMessage {
            topic: self.topics.update.clone(),
            payload: serde_json::to_vec(report)?,
        })
    }

    async fn apply_room_delta(&self, room: &str, update: &Value) {
        if !self.controller.contains(room) {
            warn!(room, "delta for unknown room ignored");
            return;
        }
        let Some(fields) = update.as_object() else {
            warn!(room, "delta entry is not an object");
            return;
        };
        // A bare duration is not actionable.
        let Some(raw_mode) = fields.get("mode") else {
            return;
        };
        let Some(mode) = raw_mode.as_str().and_then(ClimateMode::parse) else {
            warn!(room, mode = %raw_mode, "unrecognized mode ignored");
            return;
        };
        let minutes = delta_minutes(fields.get("time"));

        if let Err(err) = self.controller.set_mode(room, mode, minutes).await {
            error!(room, "failed to apply delta: {err}");
        }
    }
}

/// Whole minutes from a delta `time` field. Fractions are truncated and
/// anything negative or non-numeric counts as zero.
fn delta_minutes(value: Option<&Value>) -> u32 {
    let Some(value) = value else {
        return 0;
    };
    if let Some(minutes) = value.as_u64() {
        return u32::try_from(minutes).unwrap_or(u32::MAX);
    }
    match value.as_f64() {
        Some(minutes) if minutes.is_finite() && minutes > 0.0 => minutes.trunc() as u32,
        Some(_) => 0,
        None => {
            warn!(time = %value, "non-numeric time treated as 0");
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::{ports::testing::RecordingActuator, types::OutputRole};

    fn gateway() -> (ShadowGateway, Arc<RecordingActuator>) {
        let actuator = Arc::new(RecordingActuator::default());
        let controller =
            RoomController::new(["room0", "room1", "room2"], actuator.clone()).unwrap();
        let gateway = ShadowGateway::new(controller, ShadowTopics::for_thing("MyRaspberryPi"));
        (gateway, actuator)
    }

    fn to_json(report: &ShadowUpdatePayload) -> Value {
        serde_json::to_value(report).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn delta_reports_every_room() {
        let (gateway, _) = gateway();
        gateway
            .controller()
            .set_mode("room2", ClimateMode::Cool, 3)
            .await
            .unwrap();

        let delta = json!({
            "version": 7,
            "timestamp": 1_500_000_000,
            "state": {
                "room0": {"mode": "HEAT", "time": 10},
                "room1": {"mode": "COOL", "time": 5}
            }
        });
        let report = gateway
            .on_delta(delta.to_string().as_bytes())
            .await
            .unwrap();

        assert_eq!(
            to_json(&report),
            json!({"state": {"reported": {
                "room0": {"mode": "HEAT", "time": 10},
                "room1": {"mode": "COOL", "time": 5},
                "room2": {"mode": "COOL", "time": 3}
            }}})
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unrecognized_mode_leaves_room_untouched() {
        let (gateway, _) = gateway();
        gateway
            .controller()
            .set_mode("room2", ClimateMode::Heat, 4)
            .await
            .unwrap();

        let report = gateway
            .on_delta(br#"{"state": {"room2": {"mode": "FREEZE"}, "room0": {"mode": "COOL"}}}"#)
            .await
            .unwrap();

        let reported = &to_json(&report)["state"]["reported"];
        assert_eq!(reported["room2"], json!({"mode": "HEAT", "time": 4}));
        assert_eq!(reported["room0"], json!({"mode": "COOL", "time": 0}));
    }

    #[tokio::test(start_paused = true)]
    async fn time_without_mode_is_ignored() {
        let (gateway, actuator) = gateway();
        let before = actuator.calls().len();

        let report = gateway
            .on_delta(br#"{"state": {"room1": {"time": 15}}}"#)
            .await
            .unwrap();

        assert_eq!(actuator.calls().len(), before);
        assert_eq!(
            to_json(&report)["state"]["reported"]["room1"],
            json!({"mode": "OFF", "time": 0})
        );
        assert!(!gateway.controller().has_pending_timer("room1"));
    }

    #[tokio::test(start_paused = true)]
    async fn fractional_time_is_truncated() {
        let (gateway, _) = gateway();

        gateway
            .on_delta(br#"{"state": {"room0": {"mode": "HEAT", "time": 3.0}, "room1": {"mode": "COOL", "time": 2.9}}}"#)
            .await
            .unwrap();

        let room0 = gateway.controller().current_state("room0").await.unwrap();
        let room1 = gateway.controller().current_state("room1").await.unwrap();
        assert_eq!(room0.remaining_minutes, 3);
        assert_eq!(room1.remaining_minutes, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn negative_or_textual_time_means_indefinite() {
        let (gateway, _) = gateway();

        gateway
            .on_delta(br#"{"state": {"room0": {"mode": "HEAT", "time": -4}, "room1": {"mode": "COOL", "time": "ten"}}}"#)
            .await
            .unwrap();

        assert!(!gateway.controller().has_pending_timer("room0"));
        assert!(!gateway.controller().has_pending_timer("room1"));
        assert_eq!(
            gateway.controller().current_state("room1").await.unwrap().mode,
            ClimateMode::Cool
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_rooms_do_not_block_known_ones() {
        let (gateway, _) = gateway();

        let report = gateway
            .on_delta(br#"{"state": {"garage": {"mode": "HEAT"}, "room1": {"mode": "HEAT", "time": 1}}}"#)
            .await
            .unwrap();

        let reported = to_json(&report)["state"]["reported"].clone();
        assert!(reported.get("garage").is_none());
        assert_eq!(reported["room1"], json!({"mode": "HEAT", "time": 1}));
    }

    #[tokio::test(start_paused = true)]
    async fn rooms_apply_in_document_order() {
        let (gateway, actuator) = gateway();
        let before = actuator.calls().len();

        gateway
            .on_delta(br#"{"state": {"room2": {"mode": "HEAT"}, "room0": {"mode": "COOL"}}}"#)
            .await
            .unwrap();

        let rooms: Vec<String> = actuator.calls()[before..]
            .iter()
            .map(|(room, _, _)| room.clone())
            .collect();
        assert_eq!(rooms, ["room2", "room2", "room0", "room0"]);
    }

    #[tokio::test(start_paused = true)]
    async fn off_delta_switches_both_outputs_off() {
        let (gateway, actuator) = gateway();
        gateway
            .on_delta(br#"{"state": {"room0": {"mode": "COOL", "time": 20}}}"#)
            .await
            .unwrap();

        gateway
            .on_delta(br#"{"state": {"room0": {"mode": "OFF", "time": 20}}}"#)
            .await
            .unwrap();

        let state = gateway.controller().current_state("room0").await.unwrap();
        assert_eq!(state.mode, ClimateMode::Off);
        assert_eq!(state.remaining_minutes, 0);
        assert!(!actuator.is_active("room0", OutputRole::Fan));
        assert!(!gateway.controller().has_pending_timer("room0"));
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_documents_are_errors() {
        let (gateway, _) = gateway();

        assert!(matches!(
            gateway.on_delta(b"not json").await,
            Err(ShadowError::Json(_))
        ));
        assert!(matches!(
            gateway.on_delta(br#"{"version": 3}"#).await,
            Err(ShadowError::MissingState)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn full_report_carries_temperature() {
        let (gateway, _) = gateway();
        gateway
            .controller()
            .record_temperature("room1", 20.5)
            .await
            .unwrap();

        let report = to_json(&gateway.full_report().await);

        assert_eq!(
            report["state"]["reported"]["room1"],
            json!({"mode": "OFF", "time": 0, "temp": 20.5})
        );
        assert_eq!(
            report["state"]["reported"]["room0"],
            json!({"mode": "OFF", "time": 0})
        );
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch_routes_by_topic() {
        let (gateway, _) = gateway();
        let delta = br#"{"state": {"room0": {"mode": "HEAT", "time": 2}}}"#;

        let reply = gateway
            .dispatch("$aws/things/MyRaspberryPi/shadow/update/delta", delta)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.topic, "$aws/things/MyRaspberryPi/shadow/update");
        let body: Value = serde_json::from_slice(&reply.payload).unwrap();
        assert_eq!(
            body["state"]["reported"]["room0"],
            json!({"mode": "HEAT", "time": 2})
        );

        let ignored = gateway
            .dispatch("$aws/things/MyRaspberryPi/shadow/update/rejected", b"{}")
            .await
            .unwrap();
        assert_eq!(ignored, None);
        assert_eq!(gateway.dispatch("other/topic", delta).await.unwrap(), None);
    }
}
