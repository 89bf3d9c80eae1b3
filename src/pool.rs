//! Fixed-capacity slot arena for server, client and connection records
//!
//! Replaces raw fixed-size arrays of nullable pointers: records live in a
//! bounded vector of optional slots, allocation scans for the first free
//! slot and fails immediately when none is left, and lookup is a linear
//! scan. Caller-facing identity comes from the records themselves (caller
//! handles), never from slot indices, so slots can be freed and reused
//! without handle confusion.

/// Bounded arena of optional slots.
pub struct Pool<T> {
    slots: Vec<Option<T>>,
}

impl<T> Pool<T> {
    /// Create a pool with `capacity` slots, all free.
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Pool { slots }
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Whether every slot is free.
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|slot| slot.is_none())
    }

    /// Store `value` in the first free slot.
    ///
    /// Returns the slot index, or gives `value` back when the pool is
    /// exhausted so the caller can report resource exhaustion without
    /// having waited.
    pub fn insert(&mut self, value: T) -> Result<usize, T> {
        match self.slots.iter_mut().enumerate().find(|(_, slot)| slot.is_none()) {
            Some((index, slot)) => {
                *slot = Some(value);
                Ok(index)
            }
            None => Err(value),
        }
    }

    /// Iterate over occupied slots.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter().filter_map(|slot| slot.as_ref())
    }

    /// First occupied slot matching `pred`.
    pub fn find(&self, mut pred: impl FnMut(&T) -> bool) -> Option<&T> {
        self.iter().find(|value| pred(value))
    }

    /// Remove and return the first occupied slot matching `pred`.
    pub fn remove_where(&mut self, mut pred: impl FnMut(&T) -> bool) -> Option<T> {
        for slot in self.slots.iter_mut() {
            if slot.as_ref().is_some_and(&mut pred) {
                return slot.take();
            }
        }
        None
    }

    /// Free every slot.
    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
    }
}
