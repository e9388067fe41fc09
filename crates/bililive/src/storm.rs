//! Storm filter.
//!
//! A storm broadcast is re-sent to each room as an ordinary chat message.
//! While a room has active storms, chat messages whose text matches a
//! tracked storm content are suppressed.
//!
//! State is kept per room behind its own lock so several dispatcher workers
//! can touch different rooms concurrently.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::RoomId;
use crate::event::{StormAction, StormLifecycle};

/// Per-room storm table.
#[derive(Debug, Default)]
pub struct StormState {
    active: bool,
    contents: HashMap<String, String>,
}

impl StormState {
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn apply(&mut self, event: &StormLifecycle) {
        match event.action {
            StormAction::Start => {
                self.contents.insert(event.id.clone(), event.content.clone());
                self.active = true;
            }
            StormAction::End => {
                self.contents.remove(&event.id);
                self.active = !self.contents.is_empty();
            }
            StormAction::Unknown => {}
        }
    }

    pub fn matches(&self, text: &str) -> bool {
        self.active && self.contents.values().any(|content| content == text)
    }
}

/// Storm tables for every registered room.
#[derive(Debug, Default)]
pub struct StormFilter {
    rooms: RwLock<HashMap<RoomId, Arc<Mutex<StormState>>>>,
}

impl StormFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `room_id` with an empty table.
    pub fn track(&self, room_id: RoomId) {
        self.rooms.write().entry(room_id).or_default();
    }

    pub fn untrack(&self, room_id: RoomId) {
        self.rooms.write().remove(&room_id);
    }

    /// Apply a storm start/end notice. Notices for untracked rooms are ignored.
    pub fn apply(&self, room_id: RoomId, event: &StormLifecycle) {
        let Some(state) = self.state(room_id) else {
            debug!(room_id, "storm notice for untracked room");
            return;
        };
        let mut state = state.lock();
        state.apply(event);
        debug!(
            room_id,
            storm_id = %event.id,
            active = state.active,
            "storm state updated"
        );
    }

    /// Whether a chat message with `text` duplicates an active storm.
    pub fn should_suppress(&self, room_id: RoomId, text: &str) -> bool {
        self.state(room_id)
            .is_some_and(|state| state.lock().matches(text))
    }

    pub fn is_active(&self, room_id: RoomId) -> bool {
        self.state(room_id)
            .is_some_and(|state| state.lock().is_active())
    }

    fn state(&self, room_id: RoomId) -> Option<Arc<Mutex<StormState>>> {
        self.rooms.read().get(&room_id).cloned()
    }
}
