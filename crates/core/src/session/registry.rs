//! Camera id -> active session map.
//!
//! The registry enforces at most one active session per camera. A slot is
//! claimed atomically by [`SessionRegistry::reserve`] before the session's
//! thread exists, filled by [`SessionRegistry::attach`], and freed by
//! [`SessionRegistry::release`] when the session ends.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::camera::CameraId;
use crate::session::Session;

/// Result of a reservation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    Reserved,
    /// The camera already holds a slot.
    Duplicate,
    /// `limit` slots are already held.
    AtCapacity,
}

/// Slot storage for a [`SessionManager`](crate::session::SessionManager).
///
/// Implementations serialize all mutations and never hold their lock
/// across I/O.
pub trait SessionRegistry: Send + Sync {
    /// Insert a placeholder for `camera` unless it is present or `limit`
    /// slots are already held. Both checks happen under one lock.
    fn reserve(&self, camera: &CameraId, limit: Option<usize>) -> Reservation;

    /// Insert-if-absent with no capacity limit.
    fn try_reserve(&self, camera: &CameraId) -> bool {
        self.reserve(camera, None) == Reservation::Reserved
    }

    /// Fill `camera`'s reserved slot with its session. Returns `false` if
    /// the camera holds no slot.
    fn attach(&self, camera: &CameraId, session: Arc<Session>) -> bool;

    /// Free `camera`'s slot. Releasing an absent camera is a no-op that
    /// returns `false`.
    fn release(&self, camera: &CameraId) -> bool;

    /// The session attached to `camera`'s slot.
    fn get(&self, camera: &CameraId) -> Option<Arc<Session>>;

    /// Whether `camera` holds a slot, reserved or attached.
    fn contains(&self, camera: &CameraId) -> bool;

    /// Every attached session.
    fn active(&self) -> Vec<Arc<Session>>;

    /// Slots held, reserved or attached.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
enum Slot {
    Reserved,
    Attached(Arc<Session>),
}

/// In-process registry over a `parking_lot::Mutex<HashMap>`.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    slots: Mutex<HashMap<CameraId, Slot>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionRegistry for InMemoryRegistry {
    fn reserve(&self, camera: &CameraId, limit: Option<usize>) -> Reservation {
        let mut slots = self.slots.lock();
        if slots.contains_key(camera) {
            return Reservation::Duplicate;
        }
        if limit.is_some_and(|limit| slots.len() >= limit) {
            return Reservation::AtCapacity;
        }
        slots.insert(camera.clone(), Slot::Reserved);
        let total = slots.len();
        drop(slots);

        tracing::debug!(%camera, total_slots = total, "slot reserved");
        Reservation::Reserved
    }

    fn attach(&self, camera: &CameraId, session: Arc<Session>) -> bool {
        match self.slots.lock().get_mut(camera) {
            Some(slot) => {
                *slot = Slot::Attached(session);
                true
            }
            None => false,
        }
    }

    fn release(&self, camera: &CameraId) -> bool {
        let mut slots = self.slots.lock();
        let removed = slots.remove(camera).is_some();
        let total = slots.len();
        drop(slots);

        if removed {
            tracing::debug!(%camera, total_slots = total, "slot released");
        }
        removed
    }

    fn get(&self, camera: &CameraId) -> Option<Arc<Session>> {
        match self.slots.lock().get(camera) {
            Some(Slot::Attached(session)) => Some(session.clone()),
            _ => None,
        }
    }

    fn contains(&self, camera: &CameraId) -> bool {
        self.slots.lock().contains_key(camera)
    }

    fn active(&self) -> Vec<Arc<Session>> {
        self.slots
            .lock()
            .values()
            .filter_map(|slot| match slot {
                Slot::Attached(session) => Some(session.clone()),
                Slot::Reserved => None,
            })
            .collect()
    }

    fn len(&self) -> usize {
        self.slots.lock().len()
    }
}
