//! Per-session state change channel
//!
//! The engine publishes after every committed change; connected clients
//! subscribe instead of polling. A session's channel is closed right after
//! its terminal event, so subscribers see `Ended` and then `Closed`.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::{BattleSession, EndStatus};

/// Default per-session buffer; slow subscribers see `Lagged` and resync
const DEFAULT_CAPACITY: usize = 32;

/// Event emitted by the session store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum SessionEvent {
    Updated(BattleSession),
    Ended(EndStatus),
}

impl SessionEvent {
    pub fn session_uuid(&self) -> Uuid {
        match self {
            SessionEvent::Updated(session) => session.session_uuid,
            SessionEvent::Ended(status) => status.session_uuid,
        }
    }
}

pub struct SessionBus {
    channels: Mutex<HashMap<Uuid, broadcast::Sender<SessionEvent>>>,
    capacity: usize,
}

impl SessionBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    pub fn subscribe(&self, session_uuid: Uuid) -> broadcast::Receiver<SessionEvent> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels
            .entry(session_uuid)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Returns how many subscribers received the event
    pub fn publish(&self, event: SessionEvent) -> usize {
        let channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels
            .get(&event.session_uuid())
            .and_then(|tx| tx.send(event).ok())
            .unwrap_or(0)
    }

    /// Drop the sender; receivers drain what is buffered and then see `Closed`
    pub fn close(&self, session_uuid: Uuid) {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&session_uuid);
    }

    pub fn channel_count(&self) -> usize {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for SessionBus {
    fn default() -> Self {
        Self::new()
    }
}
