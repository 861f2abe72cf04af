//! Bounded, generation-counted session table.
//!
//! Handles pack a slot index and a per-slot generation counter into a
//! `u64`. The generation bumps every time a slot is freed, so a handle to
//! a deleted session can never alias a session created later in the same
//! slot; stale handles fail lookup with `NotInitialized`, matching the
//! behavior callers of the native library see for dead handles.

use crate::session::SessionEntry;
use dtcp_core::{DeviceType, Error, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Opaque session identifier: `(slot index << 32) | generation`.
pub type SessionHandle = u64;

struct Slot {
    generation: u32,
    entry: Option<Arc<Mutex<SessionEntry>>>,
}

/// Fixed-capacity arena of live sessions.
pub struct SessionTable {
    slots: Mutex<Vec<Slot>>,
    capacity: usize,
    source_count: AtomicUsize,
    sink_count: AtomicUsize,
}

impl SessionTable {
    /// Create a table holding at most `capacity` sessions.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
            capacity,
            source_count: AtomicUsize::new(0),
            sink_count: AtomicUsize::new(0),
        }
    }

    fn lock_slots(&self) -> Result<std::sync::MutexGuard<'_, Vec<Slot>>> {
        self.slots
            .lock()
            .map_err(|_| Error::General("Session table lock poisoned".into()))
    }

    /// Insert a session, returning its handle.
    ///
    /// # Errors
    ///
    /// Returns `OutOfSessions` when every slot is occupied.
    pub fn insert(&self, entry: SessionEntry) -> Result<SessionHandle> {
        let device_type = entry.device_type;
        let mut slots = self.lock_slots()?;

        let index = match slots.iter().position(|slot| slot.entry.is_none()) {
            Some(index) => index,
            None if slots.len() < self.capacity => {
                slots.push(Slot {
                    generation: 0,
                    entry: None,
                });
                slots.len() - 1
            }
            None => return Err(Error::OutOfSessions),
        };

        slots[index].entry = Some(Arc::new(Mutex::new(entry)));
        let handle = pack(index, slots[index].generation);
        drop(slots);

        self.counter(device_type).fetch_add(1, Ordering::SeqCst);
        Ok(handle)
    }

    /// Look up a live session.
    ///
    /// # Errors
    ///
    /// Returns `NotInitialized` for handles that were never issued or
    /// whose session has been deleted.
    pub fn get(&self, handle: SessionHandle) -> Result<Arc<Mutex<SessionEntry>>> {
        let (index, generation) = unpack(handle);
        let slots = self.lock_slots()?;

        slots
            .get(index)
            .filter(|slot| slot.generation == generation)
            .and_then(|slot| slot.entry.clone())
            .ok_or(Error::NotInitialized)
    }

    /// Remove a session, invalidating its handle immediately.
    ///
    /// The returned `Arc` lets the caller wait for in-flight operations by
    /// locking the entry after removal; new lookups already fail.
    pub fn remove(&self, handle: SessionHandle) -> Result<Arc<Mutex<SessionEntry>>> {
        let (index, generation) = unpack(handle);
        let mut slots = self.lock_slots()?;

        let slot = slots
            .get_mut(index)
            .filter(|slot| slot.generation == generation)
            .ok_or(Error::NotInitialized)?;
        let entry = slot.entry.take().ok_or(Error::NotInitialized)?;
        slot.generation = slot.generation.wrapping_add(1);
        drop(slots);

        let device_type = match entry.lock() {
            Ok(guard) => guard.device_type,
            Err(poisoned) => poisoned.into_inner().device_type,
        };
        self.counter(device_type).fetch_sub(1, Ordering::SeqCst);
        Ok(entry)
    }

    /// Number of live sessions with the given role; `Unknown` counts all.
    pub fn count(&self, device_type: DeviceType) -> usize {
        match device_type {
            DeviceType::Source => self.source_count.load(Ordering::SeqCst),
            DeviceType::Sink => self.sink_count.load(Ordering::SeqCst),
            DeviceType::Unknown => {
                self.source_count.load(Ordering::SeqCst) + self.sink_count.load(Ordering::SeqCst)
            }
        }
    }

    /// Handles of every live session, in slot order.
    pub fn handles(&self) -> Result<Vec<SessionHandle>> {
        let slots = self.lock_slots()?;
        Ok(slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.entry.is_some())
            .map(|(index, slot)| pack(index, slot.generation))
            .collect())
    }

    /// Remove every session, returning the entries for cleanup.
    pub fn drain(&self) -> Vec<Arc<Mutex<SessionEntry>>> {
        let mut slots = match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let mut entries = Vec::new();
        for slot in slots.iter_mut() {
            if let Some(entry) = slot.entry.take() {
                slot.generation = slot.generation.wrapping_add(1);
                entries.push(entry);
            }
        }
        drop(slots);

        self.source_count.store(0, Ordering::SeqCst);
        self.sink_count.store(0, Ordering::SeqCst);
        entries
    }

    fn counter(&self, device_type: DeviceType) -> &AtomicUsize {
        match device_type {
            DeviceType::Sink => &self.sink_count,
            // Unknown never reaches insert/remove; fold it with Source.
            DeviceType::Source | DeviceType::Unknown => &self.source_count,
        }
    }
}

fn pack(index: usize, generation: u32) -> SessionHandle {
    ((index as u64) << 32) | u64::from(generation)
}

fn unpack(handle: SessionHandle) -> (usize, u32) {
    ((handle >> 32) as usize, handle as u32)
}
