use std::{
    collections::HashMap,
    sync::{Arc, Weak},
    time::Duration,
};

use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

use crate::{
    error::{ActuatorError, ControlError},
    ports::Actuator,
    timer::{TimerService, TimerToken},
    types::{ClimateMode, OutputRole, RoomState},
};

const CHANGE_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomChange {
    /// An auto-shutoff timer switched the room off.
    Expired { room: String },
}

#[derive(Debug)]
struct RoomRecord {
    state: RoomState,
    pending: Option<TimerToken>,
}

struct RoomSlot {
    key: String,
    record: Mutex<RoomRecord>,
}

struct Inner {
    rooms: Vec<RoomSlot>,
    index: HashMap<String, usize>,
    actuator: Arc<dyn Actuator>,
    timers: TimerService<String>,
    changes: broadcast::Sender<RoomChange>,
}

/// Per-room OFF/HEAT/COOL state machine.
///
/// Every mutation of a room (outputs, mode, timer slot) happens while holding
/// that room's lock. Rooms never share a lock.
#[derive(Clone)]
pub struct RoomController {
    inner: Arc<Inner>,
}

impl RoomController {
    /// Builds the registry and drives every output off.
    pub fn new<I, S>(rooms: I, actuator: Arc<dyn Actuator>) -> Result<Self, ControlError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut slots = Vec::new();
        let mut index = HashMap::new();
        for key in rooms {
            let key = key.into();
            if index.contains_key(&key) {
                continue;
            }
            actuator.set_output(OutputRole::Heater, &key, false)?;
            actuator.set_output(OutputRole::Fan, &key, false)?;
            index.insert(key.clone(), slots.len());
            slots.push(RoomSlot {
                key,
                record: Mutex::new(RoomRecord {
                    state: RoomState::off(),
                    pending: None,
                }),
            });
        }

        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Ok(Self {
            inner: Arc::new(Inner {
                rooms: slots,
                index,
                actuator,
                timers: TimerService::new(),
                changes,
            }),
        })
    }

    pub fn rooms(&self) -> impl Iterator<Item = &str> {
        self.inner.rooms.iter().map(|slot| slot.key.as_str())
    }

    pub fn contains(&self, room: &str) -> bool {
        self.inner.index.contains_key(room)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoomChange> {
        self.inner.changes.subscribe()
    }

    pub fn has_pending_timer(&self, room: &str) -> bool {
        self.inner.timers.is_armed(&room.to_string())
    }

    /// Applies a commanded mode. `minutes` is ignored for OFF; for HEAT/COOL
    /// a non-zero value arms an auto-shutoff and zero clears any armed one.
    pub async fn set_mode(
        &self,
        room: &str,
        mode: ClimateMode,
        minutes: u32,
    ) -> Result<RoomState, ControlError> {
        let index = self.index_of(room)?;
        let slot = &self.inner.rooms[index];
        let mut record = slot.record.lock().await;
        let result = self.apply(index, &mut record, mode, minutes);
        let state = record.state;
        drop(record);

        match &result {
            Ok(()) => info!(
                room,
                mode = mode.as_str(),
                minutes = state.remaining_minutes,
                "room mode applied"
            ),
            Err(err) => error!(room, mode = mode.as_str(), "room mode failed: {err}"),
        }
        result.map(|()| state)
    }

    pub async fn current_state(&self, room: &str) -> Option<RoomState> {
        let index = self.inner.index.get(room)?;
        Some(self.inner.rooms[*index].record.lock().await.state)
    }

    /// Every room in configuration order.
    pub async fn snapshot(&self) -> Vec<(String, RoomState)> {
        let mut rooms = Vec::with_capacity(self.inner.rooms.len());
        for slot in &self.inner.rooms {
            let state = slot.record.lock().await.state;
            rooms.push((slot.key.clone(), state));
        }
        rooms
    }

    pub async fn record_temperature(&self, room: &str, celsius: f32) -> Result<(), ControlError> {
        let index = self.index_of(room)?;
        let mut record = self.inner.rooms[index].record.lock().await;
        record.state.last_temperature_c = Some(celsius);
        Ok(())
    }

    /// Switches every room off and drops all armed timers.
    pub async fn shutdown(&self) {
        for (index, slot) in self.inner.rooms.iter().enumerate() {
            let mut record = slot.record.lock().await;
            if let Err(err) = self.apply(index, &mut record, ClimateMode::Off, 0) {
                warn!(room = slot.key.as_str(), "shutdown could not switch room off: {err}");
            }
        }
        self.inner.timers.cancel_all();
    }

    fn index_of(&self, room: &str) -> Result<usize, ControlError> {
        self.inner
            .index
            .get(room)
            .copied()
            .ok_or_else(|| ControlError::UnknownRoom(room.to_string()))
    }

    fn apply(
        &self,
        index: usize,
        record: &mut RoomRecord,
        mode: ClimateMode,
        minutes: u32,
    ) -> Result<(), ControlError> {
        let key = self.inner.rooms[index].key.as_str();
        let actuator = &self.inner.actuator;

        let role = match mode {
            ClimateMode::Off => {
                self.clear_timer(key, record);
                record.state.mode = ClimateMode::Off;
                record.state.remaining_minutes = 0;
                return self.outputs_off(key).map_err(ControlError::from);
            }
            ClimateMode::Heat => OutputRole::Heater,
            ClimateMode::Cool => OutputRole::Fan,
        };

        let switched = actuator
            .set_output(role.opposite(), key, false)
            .and_then(|()| actuator.set_output(role, key, true));
        if let Err(err) = switched {
            self.clear_timer(key, record);
            record.state.mode = ClimateMode::Off;
            record.state.remaining_minutes = 0;
            // Already logged per output; the switching error is the one returned.
            let _ = self.outputs_off(key);
            return Err(err.into());
        }

        record.state.mode = mode;
        if minutes > 0 {
            let token = self.arm_timer(index, minutes);
            record.pending = Some(token);
            record.state.remaining_minutes = minutes;
        } else {
            self.clear_timer(key, record);
            record.state.remaining_minutes = 0;
        }
        Ok(())
    }

    /// Drives both outputs low, attempting the fan even when the heater write
    /// fails. Returns the first failure.
    fn outputs_off(&self, key: &str) -> Result<(), ActuatorError> {
        let mut first_err = None;
        for role in [OutputRole::Heater, OutputRole::Fan] {
            if let Err(err) = self.inner.actuator.set_output(role, key, false) {
                warn!(room = key, role = role.as_str(), "could not switch output off: {err}");
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn clear_timer(&self, key: &str, record: &mut RoomRecord) {
        if record.pending.take().is_some() {
            self.inner.timers.cancel(&key.to_string());
        }
    }

    fn arm_timer(&self, index: usize, minutes: u32) -> TimerToken {
        let key = self.inner.rooms[index].key.clone();
        let weak = Arc::downgrade(&self.inner);
        let delay = Duration::from_secs(u64::from(minutes) * 60);
        self.inner
            .timers
            .schedule(key, delay, move |token| expire(weak, index, token))
    }
}

async fn expire(weak: Weak<Inner>, index: usize, token: TimerToken) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let controller = RoomController { inner };
    let slot = &controller.inner.rooms[index];
    let room = slot.key.clone();

    {
        let mut record = slot.record.lock().await;
        if record.pending != Some(token) {
            debug!(room = room.as_str(), "dropping stale timer expiry");
            return;
        }
        record.pending = None;
        if let Err(err) = controller.apply(index, &mut record, ClimateMode::Off, 0) {
            error!(room = room.as_str(), "auto-shutoff failed: {err}");
        }
    }

    info!(room = room.as_str(), "auto-shutoff timer expired");
    let _ = controller.inner.changes.send(RoomChange::Expired { room });
}
