//! Timer scheduling for the unit runner.
//!
//! Each [`TimerId`] names at most one live timer. Setting an id that is
//! already armed replaces it, so the periodic re-arm pattern the state
//! machines use (`SetTimer` from the handler of the previous expiry)
//! never stacks duplicates.

use std::collections::HashMap;
use std::time::Duration;

use gridmesh_core::{timer_event, Event, TimerId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

/// Spawns one sleep task per armed timer and delivers expiries as events.
pub struct TimerManager {
    timers: HashMap<TimerId, JoinHandle<()>>,
    event_tx: mpsc::Sender<Event>,
}

impl TimerManager {
    pub fn new(event_tx: mpsc::Sender<Event>) -> Self {
        Self {
            timers: HashMap::new(),
            event_tx,
        }
    }

    /// Arm `id` to fire after `duration`, replacing any pending instance.
    pub fn set(&mut self, id: TimerId, duration: Duration) {
        if let Some(existing) = self.timers.remove(&id) {
            existing.abort();
        }

        let event_tx = self.event_tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            trace!(timer = ?id, "timer fired");
            // Delivery fails only when the runner is gone.
            let _ = event_tx.send(timer_event(id)).await;
        });
        self.timers.insert(id, handle);
    }

    /// Disarm `id` if it is pending. Disarming a timer that is not armed
    /// is a no-op.
    pub fn cancel(&mut self, id: TimerId) {
        if let Some(handle) = self.timers.remove(&id) {
            handle.abort();
        }
    }

    /// Disarm everything. Used on runner exit.
    pub fn cancel_all(&mut self) {
        for (_, handle) in self.timers.drain() {
            handle.abort();
        }
    }

    /// Number of armed timers, counting ones that fired but whose task
    /// has not been reaped yet.
    pub fn active_count(&self) -> usize {
        self.timers.len()
    }
}

impl Drop for TimerManager {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
