//! Persistent data store: a mailbox for handing blobs across a game module
//! restart.
//!
//! Blobs are `Bytes`, so storing one shares the caller's buffer instead of
//! copying it. `load` is a one-shot take: the entry is gone afterwards.

use bytes::Bytes;
use tracing::{debug, warn};

use crate::fixed::{CapacityError, FixedSlots};
use crate::limits::{MAX_PERSISTENT_DATA_STORES, MAX_QPATH};

#[derive(Debug, Clone)]
struct Entry {
    name: String,
    data: Bytes,
}

#[derive(Debug)]
pub struct PersistentStore {
    slots: FixedSlots<Entry>,
}

impl Default for PersistentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PersistentStore {
    pub fn new() -> Self {
        Self {
            slots: FixedSlots::new("MAX_PERSISTENT_DATA_STORES", MAX_PERSISTENT_DATA_STORES),
        }
    }

    /// Hands `data` over under `name`. An active entry with the same name is
    /// replaced, keeping names unique.
    pub fn store(&mut self, name: &str, data: Bytes) -> Result<(), CapacityError> {
        let name = truncate_name(name);
        if let Some(i) = self.find(name) {
            debug!(name, "replacing persistent data");
            self.slots.take(i);
        }
        match self.slots.try_allocate(Entry {
            name: name.to_string(),
            data,
        }) {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!("No persistent data store found.");
                Err(e)
            }
        }
    }

    /// Takes the blob stored under `name` (case-insensitive).
    pub fn load(&mut self, name: &str) -> Option<Bytes> {
        let i = self.find(truncate_name(name))?;
        self.slots.take(i).map(|e| e.data)
    }

    pub fn len(&self) -> usize {
        self.slots.occupied()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every entry. Called at process teardown.
    pub fn clear(&mut self) {
        self.slots.clear();
    }

    fn find(&self, name: &str) -> Option<usize> {
        self.slots.position(|e| e.name.eq_ignore_ascii_case(name))
    }
}

fn truncate_name(name: &str) -> &str {
    if name.len() < MAX_QPATH {
        return name;
    }
    let mut cut = MAX_QPATH - 1;
    while !name.is_char_boundary(cut) {
        cut -= 1;
    }
    &name[..cut]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_is_one_shot() {
        let mut pd = PersistentStore::new();
        let blob = Bytes::from_static(b"session data");
        pd.store("g_sessions", blob.clone()).unwrap();

        let got = pd.load("G_SESSIONS").unwrap();
        assert_eq!(got, blob);
        assert_eq!(got.as_ptr(), blob.as_ptr());
        assert!(pd.load("g_sessions").is_none());
    }

    #[test]
    fn full_store_fails() {
        let mut pd = PersistentStore::new();
        for i in 0..MAX_PERSISTENT_DATA_STORES {
            pd.store(&format!("blob{i}"), Bytes::new()).unwrap();
        }
        assert!(pd.store("one_more", Bytes::new()).is_err());
        assert!(pd.load("blob3").is_some());
        pd.store("one_more", Bytes::new()).unwrap();
    }

    #[test]
    fn same_name_replaces() {
        let mut pd = PersistentStore::new();
        pd.store("a", Bytes::from_static(b"1")).unwrap();
        pd.store("A", Bytes::from_static(b"2")).unwrap();
        assert_eq!(pd.len(), 1);
        assert_eq!(pd.load("a").as_deref(), Some(&b"2"[..]));
    }
}
