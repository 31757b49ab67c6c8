//! In-memory store.
//!
//! Keeps keys in insertion order, like a browser `Storage` object does in
//! practice. Overwriting a key keeps its original position.

use crate::backend::KeyValueStore;
use crate::error::StorageResult;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

#[derive(Debug)]
struct Slot {
    value: String,
    /// Index into `Inner::order`
    position: usize,
}

/// Removed keys leave a `None` in `order`; the vector is compacted once
/// holes outnumber live keys.
#[derive(Debug, Default)]
struct Inner {
    values: HashMap<String, Slot>,
    order: Vec<Option<String>>,
}

impl Inner {
    fn insert(&mut self, key: &str, value: String) {
        if let Some(slot) = self.values.get_mut(key) {
            slot.value = value;
            return;
        }
        self.values.insert(
            key.to_string(),
            Slot {
                value,
                position: self.order.len(),
            },
        );
        self.order.push(Some(key.to_string()));
    }

    fn remove(&mut self, key: &str) {
        if let Some(slot) = self.values.remove(key) {
            self.order[slot.position] = None;
            if self.order.len() > 2 * self.values.len() + 16 {
                self.compact();
            }
        }
    }

    fn compact(&mut self) {
        self.order.retain(Option::is_some);
        for (position, key) in self.order.iter().flatten().enumerate() {
            if let Some(slot) = self.values.get_mut(key) {
                slot.position = position;
            }
        }
    }

    fn clear(&mut self) {
        self.values.clear();
        self.order.clear();
    }

    fn keys(&self) -> impl Iterator<Item = &String> {
        self.order.iter().flatten()
    }
}

/// A thread-safe, insertion-ordered in-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store holding `entries`, in order.
    pub fn from_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut inner = Inner::default();
        for (key, value) in entries {
            inner.insert(key.as_ref(), value.into());
        }
        Self {
            inner: RwLock::new(inner),
        }
    }

    /// Returns every `(key, value)` pair in insertion order.
    pub fn entries(&self) -> Vec<(String, String)> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .keys()
            .filter_map(|k| inner.values.get(k).map(|slot| (k.clone(), slot.value.clone())))
            .collect()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.values.get(key).map(|slot| slot.value.clone())
    }

    fn set(&self, key: &str, value: String) -> StorageResult<()> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.insert(key, value);
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.remove(key);
        Ok(())
    }

    fn clear(&self) -> StorageResult<()> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.clear();
        Ok(())
    }

    fn keys(&self) -> Vec<String> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.keys().cloned().collect()
    }

    fn len(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.values.len()
    }
}
