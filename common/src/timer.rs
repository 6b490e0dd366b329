//! One-shot timers with a single slot per key.
//!
//! Arming a key that already holds a timer aborts the old one. A timer that
//! reaches its deadline clears its own slot before running the action, so a
//! later `cancel` is a no-op and a cancelled timer never runs its action.

use std::{
    collections::HashMap,
    future::Future,
    hash::Hash,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken(u64);

struct ArmedTimer {
    token: TimerToken,
    handle: JoinHandle<()>,
}

struct TimerSlots<K> {
    next_token: u64,
    armed: HashMap<K, ArmedTimer>,
}

pub struct TimerService<K> {
    slots: Arc<Mutex<TimerSlots<K>>>,
}

impl<K> Clone for TimerService<K> {
    fn clone(&self) -> Self {
        Self {
            slots: Arc::clone(&self.slots),
        }
    }
}

impl<K> Default for TimerService<K> {
    fn default() -> Self {
        Self {
            slots: Arc::new(Mutex::new(TimerSlots {
                next_token: 0,
                armed: HashMap::new(),
            })),
        }
    }
}

impl<K> TimerService<K>
where
    K: Clone + Eq + Hash + Send + std::fmt::Debug + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms `action` to run once after `delay`, replacing any timer already
    /// armed for `key`. Must be called from within a tokio runtime.
    pub fn schedule<F, Fut>(&self, key: K, delay: Duration, action: F) -> TimerToken
    where
        F: FnOnce(TimerToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut slots = lock(&self.slots);
        if let Some(previous) = slots.armed.remove(&key) {
            previous.handle.abort();
            debug!(?key, "replaced armed timer");
        }

        slots.next_token = slots.next_token.wrapping_add(1);
        let token = TimerToken(slots.next_token);

        let shared = Arc::clone(&self.slots);
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let still_armed = {
                let mut slots = lock(&shared);
                match slots.armed.get(&task_key) {
                    Some(armed) if armed.token == token => {
                        slots.armed.remove(&task_key);
                        true
                    }
                    _ => false,
                }
            };

            if still_armed {
                debug!(key = ?task_key, "timer fired");
                action(token).await;
            }
        });

        slots.armed.insert(key, ArmedTimer { token, handle });
        token
    }

    /// Returns true when a live timer was cancelled.
    pub fn cancel(&self, key: &K) -> bool {
        match lock(&self.slots).armed.remove(key) {
            Some(armed) => {
                armed.handle.abort();
                debug!(?key, "cancelled timer");
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self, key: &K) -> bool {
        lock(&self.slots).armed.contains_key(key)
    }

    #[cfg(test)]
    pub fn armed_count(&self) -> usize {
        lock(&self.slots).armed.len()
    }

    pub fn cancel_all(&self) {
        for (_, armed) in lock(&self.slots).armed.drain() {
            armed.handle.abort();
        }
    }
}

fn lock<K>(slots: &Mutex<TimerSlots<K>>) -> MutexGuard<'_, TimerSlots<K>> {
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}
