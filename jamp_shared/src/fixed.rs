//! Fixed-capacity containers.
//!
//! Engine tables (spawn vars, bans, persistent stores, per-client rings) have
//! hard upper bounds that are part of their contract. These containers make
//! the bound explicit: insertion past capacity is a `CapacityError`, never a
//! silent truncation or reallocation.

use thiserror::Error;

/// Insertion into a full fixed-capacity table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{table} exceeded (capacity {capacity})")]
pub struct CapacityError {
    pub table: &'static str,
    pub capacity: usize,
}

/// Append-only vector with a hard capacity.
#[derive(Debug, Clone)]
pub struct FixedVec<T> {
    table: &'static str,
    items: Vec<T>,
    capacity: usize,
}

impl<T> FixedVec<T> {
    pub fn new(table: &'static str, capacity: usize) -> Self {
        Self {
            table,
            items: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn try_push(&mut self, item: T) -> Result<usize, CapacityError> {
        if self.items.len() >= self.capacity {
            return Err(self.full());
        }
        self.items.push(item);
        Ok(self.items.len() - 1)
    }

    pub fn full(&self) -> CapacityError {
        CapacityError {
            table: self.table,
            capacity: self.capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.items.len()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn remove(&mut self, index: usize) -> T {
        self.items.remove(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, T> {
        self.items.iter_mut()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.items.get_mut(index)
    }
}

/// Slot table with a fixed number of positions, each empty or occupied.
#[derive(Debug, Clone)]
pub struct FixedSlots<T> {
    table: &'static str,
    slots: Vec<Option<T>>,
}

impl<T> FixedSlots<T> {
    pub fn new(table: &'static str, capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self { table, slots }
    }

    /// Stores `item` in the first empty slot.
    pub fn try_allocate(&mut self, item: T) -> Result<usize, CapacityError> {
        match self.slots.iter().position(Option::is_none) {
            Some(i) => {
                self.slots[i] = Some(item);
                Ok(i)
            }
            None => Err(CapacityError {
                table: self.table,
                capacity: self.slots.len(),
            }),
        }
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.slots.get_mut(index).and_then(Option::as_mut)
    }

    pub fn take(&mut self, index: usize) -> Option<T> {
        self.slots.get_mut(index).and_then(Option::take)
    }

    pub fn position(&self, mut pred: impl FnMut(&T) -> bool) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.as_ref().map(&mut pred).unwrap_or(false))
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|v| (i, v)))
    }
}
