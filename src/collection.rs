//! Collection Operations
//!
//! A collection is a JSON array stored under a single key, holding elements
//! of the instance's item type. Elements are addressed by their `id` field,
//! which may be a string or a number and is compared by its string form.
//!
//! Mutating a collection keeps the envelope's expiry, the same way property
//! updates do. A collection created by [`add_one`](StorageUtilities::add_one),
//! [`add_all`](StorageUtilities::add_all) or
//! [`reset`](StorageUtilities::reset) gets the default TTL, if one is set.

use crate::backend::KeyValueStore;
use crate::envelope::Entry;
use crate::error::{StashError, StashResult};
use crate::settings::StorageKind;
use crate::utilities::StorageUtilities;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

const ID_FIELD: &str = "id";

fn element_id(element: &Value) -> Option<String> {
    match element.get(ID_FIELD)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// A loaded collection and the expiry it must be written back with.
struct Loaded {
    elements: Vec<Value>,
    expiry: Option<i64>,
}

impl<T> StorageUtilities<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Returns the element of the collection under `key` whose id is `id`.
    pub fn find_one(
        &self,
        key: &str,
        id: &str,
        storage: Option<StorageKind>,
    ) -> StashResult<Option<T>> {
        let kind = self.kind(storage);
        let store = self.store(kind)?;

        let Some(loaded) = self.load(store.as_ref(), kind, &self.prefixed(key))? else {
            return Ok(None);
        };
        loaded
            .elements
            .into_iter()
            .find(|e| element_id(e).as_deref() == Some(id))
            .map(serde_json::from_value)
            .transpose()
            .map_err(StashError::from)
    }

    /// Returns every element of the collection under `key`.
    ///
    /// A missing or expired collection reads as empty.
    pub fn find_all(&self, key: &str, storage: Option<StorageKind>) -> StashResult<Vec<T>> {
        let kind = self.kind(storage);
        let store = self.store(kind)?;

        let Some(loaded) = self.load(store.as_ref(), kind, &self.prefixed(key))? else {
            return Ok(Vec::new());
        };
        loaded
            .elements
            .into_iter()
            .map(|e| serde_json::from_value(e).map_err(StashError::from))
            .collect()
    }

    /// Adds `item` to the collection under `key`, creating it if needed.
    ///
    /// An element with the same id is replaced in place.
    pub fn add_one(&self, key: &str, item: &T, storage: Option<StorageKind>) -> StashResult<()> {
        self.add_all(key, std::slice::from_ref(item), storage)
    }

    /// Adds every item, in order, with the same replacement rule as
    /// [`add_one`](Self::add_one).
    pub fn add_all(&self, key: &str, items: &[T], storage: Option<StorageKind>) -> StashResult<()> {
        let kind = self.kind(storage);
        let store = self.store(kind)?;
        let prefixed = self.prefixed(key);

        let mut loaded = self.load_or_new(store.as_ref(), kind, &prefixed)?;
        for item in items {
            let element = serde_json::to_value(item)?;
            let existing = element_id(&element).and_then(|id| {
                loaded
                    .elements
                    .iter()
                    .position(|e| element_id(e).as_deref() == Some(id.as_str()))
            });
            match existing {
                Some(index) => loaded.elements[index] = element,
                None => loaded.elements.push(element),
            }
        }

        self.save(store.as_ref(), kind, &prefixed, loaded)
    }

    /// Removes the element whose id is `id`.
    ///
    /// Returns false if the collection or the element does not exist.
    pub fn remove_one(
        &self,
        key: &str,
        id: &str,
        storage: Option<StorageKind>,
    ) -> StashResult<bool> {
        let kind = self.kind(storage);
        let store = self.store(kind)?;
        let prefixed = self.prefixed(key);

        let Some(mut loaded) = self.load(store.as_ref(), kind, &prefixed)? else {
            return Ok(false);
        };
        let before = loaded.elements.len();
        loaded.elements.retain(|e| element_id(e).as_deref() != Some(id));
        if loaded.elements.len() == before {
            return Ok(false);
        }

        self.save(store.as_ref(), kind, &prefixed, loaded)?;
        Ok(true)
    }

    /// Empties the collection under `key`.
    pub fn reset(&self, key: &str, storage: Option<StorageKind>) -> StashResult<()> {
        let kind = self.kind(storage);
        let store = self.store(kind)?;
        let prefixed = self.prefixed(key);

        let mut loaded = self.load_or_new(store.as_ref(), kind, &prefixed)?;
        loaded.elements.clear();
        self.save(store.as_ref(), kind, &prefixed, loaded)
    }

    fn load(
        &self,
        store: &dyn KeyValueStore,
        kind: StorageKind,
        prefixed: &str,
    ) -> StashResult<Option<Loaded>> {
        let Some(entry) = self.read_entry(store, kind, prefixed)? else {
            return Ok(None);
        };
        match entry.value {
            Value::Array(elements) => Ok(Some(Loaded {
                elements,
                expiry: entry.expiry,
            })),
            _ => Err(StashError::NotACollection {
                key: prefixed.to_string(),
            }),
        }
    }

    fn load_or_new(
        &self,
        store: &dyn KeyValueStore,
        kind: StorageKind,
        prefixed: &str,
    ) -> StashResult<Loaded> {
        Ok(self.load(store, kind, prefixed)?.unwrap_or_else(|| Loaded {
            elements: Vec::new(),
            expiry: self.default_expiry(),
        }))
    }

    fn save(
        &self,
        store: &dyn KeyValueStore,
        kind: StorageKind,
        prefixed: &str,
        loaded: Loaded,
    ) -> StashResult<()> {
        let entry = Entry {
            value: Value::Array(loaded.elements),
            expiry: loaded.expiry,
        };
        self.write_entry(store, kind, prefixed, &entry)
    }
}
