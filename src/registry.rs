//! Handle-addressed per-iteration callback registry.
//!
//! Entries live in a slot table in registration order. Removal tombstones
//! a slot instead of splicing it out, so entries can be added or removed
//! while a sweep over the table is in progress without corrupting the set
//! being traversed: indices below the sweep bound stay stable, additions
//! land past the bound and first run next iteration, and tombstones are
//! compacted once the sweep is over. Compaction preserves order, so
//! iteration is always FIFO by registration time.
//!
//! The table stores opaque values; the reactor instantiates it with boxed
//! callbacks and drives the sweep through [`Registry::take_at`] /
//! [`Registry::restore`], which lets it release its borrow while a
//! callback runs.

/// Stable identifier of a registered entry.
///
/// Identifiers are never reused within one registry, so a stale handle
/// can at worst fail to find its entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

#[derive(Debug)]
enum SlotState<T> {
    /// Entry is present and runnable.
    Occupied(T),
    /// Entry is temporarily checked out by the sweep.
    Running,
    /// Entry was removed; the slot is reclaimed at the next compaction.
    Dead,
}

#[derive(Debug)]
struct Slot<T> {
    id: CallbackId,
    state: SlotState<T>,
}

/// Ordered, tombstoning slot table.
#[derive(Debug)]
pub struct Registry<T> {
    slots: Vec<Slot<T>>,
    next_id: u64,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            next_id: 0,
        }
    }
}

impl<T> Registry<T> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry and returns its handle.
    pub fn insert(&mut self, value: T) -> CallbackId {
        let id = CallbackId(self.next_id);
        self.next_id += 1;
        self.slots.push(Slot {
            id,
            state: SlotState::Occupied(value),
        });
        id
    }

    /// Removes the entry addressed by `id`.
    ///
    /// Safe at any time, including from inside the entry currently being
    /// run by a sweep (self-removal) or against an entry the sweep has not
    /// reached yet, which will then be skipped. Returns whether the entry
    /// was still present.
    pub fn remove(&mut self, id: CallbackId) -> bool {
        match self.slots.iter_mut().find(|slot| slot.id == id) {
            Some(slot) => match slot.state {
                SlotState::Dead => false,
                // For a Running slot the value is checked out; restore()
                // sees the tombstone and drops it.
                SlotState::Occupied(_) | SlotState::Running => {
                    slot.state = SlotState::Dead;
                    true
                }
            },
            None => false,
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| !matches!(slot.state, SlotState::Dead))
            .count()
    }

    /// Whether no live entries remain.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slot count including tombstones; the snapshot bound for a sweep.
    ///
    /// Entries inserted after this is read land at higher indices and are
    /// therefore not visited by the sweep that took the snapshot.
    pub fn sweep_bound(&self) -> usize {
        self.slots.len()
    }

    /// Checks the entry at `index` out of the table, or `None` if the slot
    /// is tombstoned or already checked out.
    pub fn take_at(&mut self, index: usize) -> Option<(CallbackId, T)> {
        let slot = self.slots.get_mut(index)?;
        match std::mem::replace(&mut slot.state, SlotState::Running) {
            SlotState::Occupied(value) => Some((slot.id, value)),
            previous => {
                slot.state = previous;
                None
            }
        }
    }

    /// Returns a checked-out entry to its slot.
    ///
    /// If the entry was removed while checked out, the value is dropped
    /// and the tombstone stands.
    pub fn restore(&mut self, id: CallbackId, value: T) {
        if let Some(slot) = self.slots.iter_mut().find(|slot| slot.id == id)
            && matches!(slot.state, SlotState::Running)
        {
            slot.state = SlotState::Occupied(value);
        }
    }

    /// Reclaims tombstoned slots. Must only be called between sweeps;
    /// relative order of the survivors is untouched.
    pub fn compact(&mut self) {
        self.slots
            .retain(|slot| !matches!(slot.state, SlotState::Dead));
    }
}
