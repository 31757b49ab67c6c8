//! Typed Storage Accessor
//!
//! [`StorageUtilities<T>`] is the public face of stashkv. It owns its
//! [`Settings`], resolves logical keys to prefixed store keys, encodes values
//! as JSON (inside an expiry envelope when a TTL applies) and publishes change
//! events.
//!
//! ## Read Path
//!
//! ```text
//! get_item("p1")
//!   │
//!   ├─ store.get(prefix + "p1") ── None ──────────────> Ok(None)
//!   │
//!   ├─ decode ── no envelope ─────────────────────────> Ok(Some(value))
//!   │
//!   └─ envelope ── now > expiry ── remove + notify ───> Ok(None)
//!               └─ live ──────────────────────────────> Ok(Some(value))
//! ```
//!
//! Expiry is lazy: nothing runs in the background. Entries are purged when a
//! read finds them expired, or when [`StorageUtilities::purge_expired`] is
//! called.
//!
//! ## Example
//!
//! ```
//! use serde::{Deserialize, Serialize};
//! use stashkv::{SettingsPatch, StorageUtilities, Stores};
//! use std::time::Duration;
//!
//! #[derive(Debug, PartialEq, Serialize, Deserialize)]
//! struct Product {
//!     id: u32,
//!     name: String,
//! }
//!
//! let products: StorageUtilities<Product> = StorageUtilities::new(
//!     Stores::in_memory(),
//!     SettingsPatch {
//!         key_prefix: Some("shop-".into()),
//!         ..Default::default()
//!     },
//! )
//! .unwrap();
//!
//! let desk = Product { id: 1, name: "Desk".into() };
//! products.add_item("p1", &desk, Some(Duration::from_secs(60)), None).unwrap();
//!
//! assert_eq!(products.get_item("p1", None).unwrap(), Some(desk));
//! assert_eq!(products.list_keys(None).unwrap(), vec!["shop-p1"]);
//! ```

use crate::backend::{KeyValueStore, RuntimeMode, Stores};
use crate::clock::{self, Clock, SystemClock};
use crate::envelope::Entry;
use crate::error::{StashError, StashResult};
use crate::notify::{ChangeEvent, ChangeNotifier, Subscription};
use crate::returned::Returned;
use crate::settings::{ReturnKind, Settings, SettingsPatch, StorageKind};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// One raw store entry as reported by the listing operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredItem<T> {
    /// The prefixed store key.
    pub key: String,
    /// The payload, unwrapped from its envelope.
    pub value: T,
    /// Absolute deadline in epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<i64>,
}

impl<T> StoredItem<T> {
    /// Returns true if the item's deadline has passed at `now`.
    pub fn is_expired(&self, now: i64) -> bool {
        self.expiry.map(|exp| now > exp).unwrap_or(false)
    }
}

/// Typed, namespaced access to a pair of key-value stores.
///
/// Each instance owns its settings; two instances share data only by sharing
/// [`Stores`] handles.
pub struct StorageUtilities<T> {
    stores: Stores,
    defaults: Settings,
    settings: Settings,
    notifier: ChangeNotifier,
    clock: Arc<dyn Clock>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> fmt::Debug for StorageUtilities<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageUtilities")
            .field("stores", &self.stores)
            .field("settings", &self.settings)
            .field("subscribers", &self.notifier.subscriber_count())
            .finish()
    }
}

impl<T> StorageUtilities<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Creates an instance with [`Settings::default`] as its defaults and
    /// `overrides` merged on top.
    ///
    /// Fails with [`StashError::Configuration`] if the selected storage kind
    /// has no store, unless `stores` runs in [`RuntimeMode::Headless`].
    pub fn new(stores: Stores, overrides: SettingsPatch) -> StashResult<Self> {
        Self::with_defaults(stores, Settings::default(), overrides)
    }

    /// Creates an instance with custom defaults.
    ///
    /// `defaults` is what [`reset_settings`](Self::reset_settings) restores.
    pub fn with_defaults(
        mut stores: Stores,
        defaults: Settings,
        overrides: SettingsPatch,
    ) -> StashResult<Self> {
        let settings = defaults.merged(&overrides);

        if stores.mode() == RuntimeMode::Headless {
            stores.validate(StorageKind::Local)?;
            stores.validate(StorageKind::Session)?;
        }
        stores.validate(settings.storage)?;

        debug!(
            prefix = %settings.key_prefix,
            storage = %settings.storage,
            notify = settings.notify,
            "Storage utilities initialized"
        );

        Ok(Self {
            stores,
            defaults,
            settings,
            notifier: ChangeNotifier::new(),
            clock: Arc::new(SystemClock),
            _marker: PhantomData,
        })
    }

    /// Replaces the clock used for expiry deadlines.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    // ========================================================================
    // Settings
    // ========================================================================

    /// The settings [`reset_settings`](Self::reset_settings) restores.
    pub fn default_settings(&self) -> &Settings {
        &self.defaults
    }

    /// The settings in effect.
    pub fn current_settings(&self) -> &Settings {
        &self.settings
    }

    /// The store registry this instance operates on.
    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    /// Shallow-merges `patch` over the current settings.
    ///
    /// The settings are left unchanged if validation fails.
    pub fn configure(&mut self, patch: SettingsPatch) -> StashResult<()> {
        let next = self.settings.merged(&patch);
        self.install(next)
    }

    /// Replaces the current settings with the defaults plus `patch`.
    ///
    /// Fields the patch leaves unset fall back to the defaults, not to the
    /// previous settings. An empty patch is rejected.
    pub fn set_custom_settings(&mut self, patch: SettingsPatch) -> StashResult<()> {
        if patch.is_empty() {
            return Err(StashError::InvalidSettings(
                "custom settings must set at least one field".into(),
            ));
        }
        let next = self.defaults.merged(&patch);
        self.install(next)
    }

    /// Restores the default settings exactly.
    pub fn reset_settings(&mut self) -> StashResult<()> {
        let defaults = self.defaults.clone();
        self.install(defaults)
    }

    fn install(&mut self, settings: Settings) -> StashResult<()> {
        self.stores.validate(settings.storage)?;
        debug!(
            prefix = %settings.key_prefix,
            storage = %settings.storage,
            notify = settings.notify,
            "Settings updated"
        );
        self.settings = settings;
        Ok(())
    }

    // ========================================================================
    // Item Operations
    // ========================================================================

    /// Stores `value` under `key`.
    ///
    /// With a TTL (explicit, or the configured default) the value is stored
    /// in an expiry envelope. An explicit zero TTL stores the value without
    /// one, as a zero default does. A value that serializes to JSON `null` is
    /// not written.
    pub fn add_item(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
        storage: Option<StorageKind>,
    ) -> StashResult<()> {
        let json = serde_json::to_value(value)?;
        if json.is_null() {
            debug!(key = %key, "Skipping write of null value");
            return Ok(());
        }

        let ttl = match ttl {
            Some(ttl) => Some(ttl).filter(|ttl| !ttl.is_zero()),
            None => self.settings.default_ttl(),
        };
        let entry = match ttl {
            Some(ttl) => Entry::expiring(json, clock::deadline(self.clock.now_millis(), ttl)),
            None => Entry::plain(json),
        };

        let kind = self.kind(storage);
        let store = self.store(kind)?;
        self.write_entry(store.as_ref(), kind, &self.settings.prefixed(key), &entry)
    }

    /// Returns the value stored under `key`.
    ///
    /// Missing, `null` and expired entries all read as `None`; expired
    /// entries are removed as a side effect.
    pub fn get_item(&self, key: &str, storage: Option<StorageKind>) -> StashResult<Option<T>> {
        let kind = self.kind(storage);
        let store = self.store(kind)?;

        match self.read_entry(store.as_ref(), kind, &self.settings.prefixed(key))? {
            Some(entry) => Ok(Some(serde_json::from_value(entry.value)?)),
            None => Ok(None),
        }
    }

    /// [`get_item`](Self::get_item) wrapped in a [`ReturnKind`].
    ///
    /// Uses `kind`, else the configured return kind, else
    /// [`ReturnKind::Direct`].
    pub fn get_item_as(
        &self,
        key: &str,
        storage: Option<StorageKind>,
        kind: Option<ReturnKind>,
    ) -> StashResult<Returned<Option<T>>> {
        let value = self.get_item(key, storage)?;
        Ok(Returned::wrap(value, self.return_kind(kind)))
    }

    /// Sets `prop` on the stored object, keeping its original expiry.
    ///
    /// Returns the updated item, or `None` if the item is missing or expired.
    pub fn update_item_property<V>(
        &self,
        key: &str,
        prop: &str,
        value: &V,
        storage: Option<StorageKind>,
    ) -> StashResult<Option<T>>
    where
        V: Serialize + ?Sized,
    {
        let value = serde_json::to_value(value)?;
        self.modify_item(key, storage, |map| {
            map.insert(prop.to_string(), value);
        })
    }

    /// Removes `prop` from the stored object, keeping its original expiry.
    ///
    /// Returns the updated item, or `None` if the item is missing or expired.
    pub fn remove_item_property(
        &self,
        key: &str,
        prop: &str,
        storage: Option<StorageKind>,
    ) -> StashResult<Option<T>> {
        self.modify_item(key, storage, |map| {
            map.shift_remove(prop);
        })
    }

    /// Removes the item stored under `key`.
    pub fn remove_item(&self, key: &str, storage: Option<StorageKind>) -> StashResult<()> {
        let kind = self.kind(storage);
        let store = self.store(kind)?;
        self.remove_prefixed(store.as_ref(), kind, &self.settings.prefixed(key))
    }

    /// Removes every listed item.
    pub fn remove_items<K>(&self, keys: &[K], storage: Option<StorageKind>) -> StashResult<()>
    where
        K: AsRef<str>,
    {
        let kind = self.kind(storage);
        let store = self.store(kind)?;
        for key in keys {
            self.remove_prefixed(store.as_ref(), kind, &self.settings.prefixed(key.as_ref()))?;
        }
        Ok(())
    }

    /// Removes every entry in this instance's namespace.
    ///
    /// With an empty key prefix the whole store is cleared. No change events
    /// are published.
    pub fn clear_all(&self, storage: Option<StorageKind>) -> StashResult<()> {
        let kind = self.kind(storage);
        let store = self.store(kind)?;

        if self.settings.key_prefix.is_empty() {
            store.clear()?;
            debug!(storage = %kind, "Cleared store");
            return Ok(());
        }

        let keys = self.namespaced_keys(store.as_ref());
        for key in &keys {
            store.remove(key)?;
        }
        debug!(storage = %kind, removed = keys.len(), "Cleared namespace");
        Ok(())
    }

    /// Removes every expired entry in this instance's namespace.
    ///
    /// Returns the number of entries removed.
    pub fn purge_expired(&self, storage: Option<StorageKind>) -> StashResult<usize> {
        let kind = self.kind(storage);
        let store = self.store(kind)?;
        let now = self.clock.now_millis();

        let mut purged = 0;
        for key in self.namespaced_keys(store.as_ref()) {
            let expired = store
                .get(&key)
                .map(|raw| self.decode(kind, &key, &raw).is_expired(now))
                .unwrap_or(false);
            if expired {
                self.remove_prefixed(store.as_ref(), kind, &key)?;
                purged += 1;
            }
        }

        if purged > 0 {
            debug!(storage = %kind, purged = purged, "Purged expired entries");
        }
        Ok(purged)
    }

    // ========================================================================
    // Enumeration
    // ========================================================================

    /// Returns every store key in this instance's namespace.
    pub fn list_keys(&self, storage: Option<StorageKind>) -> StashResult<Vec<String>> {
        let store = self.store(self.kind(storage))?;
        Ok(self.namespaced_keys(store.as_ref()))
    }

    /// Returns every value in this instance's namespace, unwrapped.
    pub fn list_values(&self, storage: Option<StorageKind>) -> StashResult<Vec<T>> {
        Ok(self
            .list_items(storage)?
            .into_iter()
            .map(|item| item.value)
            .collect())
    }

    /// Returns every entry in this instance's namespace with its expiry.
    ///
    /// Listing does not purge expired entries.
    pub fn list_items(&self, storage: Option<StorageKind>) -> StashResult<Vec<StoredItem<T>>> {
        let kind = self.kind(storage);
        let store = self.store(kind)?;

        let mut items = Vec::new();
        for key in self.namespaced_keys(store.as_ref()) {
            let Some(raw) = store.get(&key) else {
                continue;
            };
            let entry = self.decode(kind, &key, &raw);
            items.push(StoredItem {
                value: serde_json::from_value(entry.value)?,
                expiry: entry.expiry,
                key,
            });
        }
        Ok(items)
    }

    /// [`list_keys`](Self::list_keys) wrapped in a [`ReturnKind`].
    pub fn list_keys_as(
        &self,
        storage: Option<StorageKind>,
        kind: Option<ReturnKind>,
    ) -> StashResult<Returned<Vec<String>>> {
        Ok(Returned::wrap(self.list_keys(storage)?, self.return_kind(kind)))
    }

    /// [`list_values`](Self::list_values) wrapped in a [`ReturnKind`].
    pub fn list_values_as(
        &self,
        storage: Option<StorageKind>,
        kind: Option<ReturnKind>,
    ) -> StashResult<Returned<Vec<T>>> {
        Ok(Returned::wrap(self.list_values(storage)?, self.return_kind(kind)))
    }

    /// [`list_items`](Self::list_items) wrapped in a [`ReturnKind`].
    pub fn list_items_as(
        &self,
        storage: Option<StorageKind>,
        kind: Option<ReturnKind>,
    ) -> StashResult<Returned<Vec<StoredItem<T>>>> {
        Ok(Returned::wrap(self.list_items(storage)?, self.return_kind(kind)))
    }

    // ========================================================================
    // Notification
    // ========================================================================

    /// Subscribes to change events.
    ///
    /// The subscription first yields the last published event, if any.
    /// Events are only published while `notify` is enabled.
    pub fn subscribe(&self) -> Subscription {
        self.notifier.subscribe()
    }

    // ========================================================================
    // Internals shared with the collection operations
    // ========================================================================

    pub(crate) fn kind(&self, storage: Option<StorageKind>) -> StorageKind {
        storage.unwrap_or(self.settings.storage)
    }

    pub(crate) fn store(&self, kind: StorageKind) -> StashResult<Arc<dyn KeyValueStore>> {
        self.stores.resolve(kind)
    }

    pub(crate) fn prefixed(&self, key: &str) -> String {
        self.settings.prefixed(key)
    }

    /// Deadline for a freshly created entry under the default TTL.
    pub(crate) fn default_expiry(&self) -> Option<i64> {
        self.settings
            .default_ttl()
            .map(|ttl| clock::deadline(self.clock.now_millis(), ttl))
    }

    fn return_kind(&self, requested: Option<ReturnKind>) -> ReturnKind {
        requested
            .or(self.settings.return_kind)
            .unwrap_or(ReturnKind::Direct)
    }

    fn namespaced_keys(&self, store: &dyn KeyValueStore) -> Vec<String> {
        let prefix = &self.settings.key_prefix;
        store
            .keys()
            .into_iter()
            .filter(|k| k.starts_with(prefix.as_str()))
            .collect()
    }

    /// Reads the live entry under `prefixed`, envelope intact.
    ///
    /// Expired entries are removed and read as `None`, as are `null` values.
    pub(crate) fn read_entry(
        &self,
        store: &dyn KeyValueStore,
        kind: StorageKind,
        prefixed: &str,
    ) -> StashResult<Option<Entry>> {
        let Some(raw) = store.get(prefixed) else {
            trace!(key = %prefixed, storage = %kind, "Miss");
            return Ok(None);
        };

        let entry = self.decode(kind, prefixed, &raw);
        if entry.is_expired(self.clock.now_millis()) {
            debug!(key = %prefixed, storage = %kind, "Entry expired, removing");
            self.remove_prefixed(store, kind, prefixed)?;
            return Ok(None);
        }
        if entry.value.is_null() {
            return Ok(None);
        }

        trace!(key = %prefixed, storage = %kind, "Hit");
        Ok(Some(entry))
    }

    /// Decodes a raw entry, warning when it is not JSON and falls back to a
    /// string.
    fn decode(&self, kind: StorageKind, prefixed: &str, raw: &str) -> Entry {
        Entry::parse(raw).unwrap_or_else(|| {
            warn!(key = %prefixed, storage = %kind, "Unreadable entry, reading as string");
            Entry::plain(Value::String(raw.to_string()))
        })
    }

    /// Persists `entry` under `prefixed` and publishes the change.
    pub(crate) fn write_entry(
        &self,
        store: &dyn KeyValueStore,
        kind: StorageKind,
        prefixed: &str,
        entry: &Entry,
    ) -> StashResult<()> {
        let old_value = self.raw_value(store, prefixed);
        let new_value = entry.to_json();

        store.set(prefixed, new_value.to_string())?;
        debug!(
            key = %prefixed,
            storage = %kind,
            expiry = ?entry.expiry,
            "Wrote entry"
        );

        self.publish(kind, old_value, Some(new_value));
        Ok(())
    }

    fn remove_prefixed(
        &self,
        store: &dyn KeyValueStore,
        kind: StorageKind,
        prefixed: &str,
    ) -> StashResult<()> {
        let old_value = self.raw_value(store, prefixed);
        store.remove(prefixed)?;
        debug!(key = %prefixed, storage = %kind, "Removed entry");

        self.publish(kind, old_value, None);
        Ok(())
    }

    /// Applies `f` to the stored object and writes it back with its expiry.
    fn modify_item<F>(&self, key: &str, storage: Option<StorageKind>, f: F) -> StashResult<Option<T>>
    where
        F: FnOnce(&mut Map<String, Value>),
    {
        let kind = self.kind(storage);
        let store = self.store(kind)?;
        let prefixed = self.prefixed(key);

        let Some(mut entry) = self.read_entry(store.as_ref(), kind, &prefixed)? else {
            return Ok(None);
        };
        let Value::Object(map) = &mut entry.value else {
            return Err(StashError::NotAnObject { key: prefixed });
        };
        f(map);

        // Decode before writing so the store never holds a value T rejects
        let item: T = serde_json::from_value(entry.value.clone())?;
        self.write_entry(store.as_ref(), kind, &prefixed, &entry)?;
        Ok(Some(item))
    }

    /// The raw stored JSON under `prefixed`, as change events report it.
    fn raw_value(&self, store: &dyn KeyValueStore, prefixed: &str) -> Option<Value> {
        if !self.settings.notify {
            return None;
        }
        store.get(prefixed).map(|raw| {
            serde_json::from_str(&raw).unwrap_or(Value::String(raw))
        })
    }

    fn publish(&self, storage: StorageKind, old_value: Option<Value>, new_value: Option<Value>) {
        if self.settings.notify {
            self.notifier.publish(ChangeEvent {
                storage,
                old_value,
                new_value,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryStore;
    use crate::clock::ManualClock;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Customer {
        id: u32,
        #[serde(rename = "firstName")]
        first_name: String,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Product {
        id: u32,
        name: String,
        code: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        customer: Option<Customer>,
    }

    fn desk() -> Product {
        Product {
            id: 1,
            name: "Desk".into(),
            code: "A1".into(),
            customer: Some(Customer {
                id: 10,
                first_name: "John".into(),
            }),
        }
    }

    fn laptop() -> Product {
        Product {
            id: 2,
            name: "Laptop".into(),
            code: "L1".into(),
            customer: None,
        }
    }

    struct Harness {
        products: StorageUtilities<Product>,
        local: Arc<MemoryStore>,
        session: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
    }

    fn harness(patch: SettingsPatch) -> Harness {
        let local = Arc::new(MemoryStore::new());
        let session = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(1_000_000));

        let stores = Stores::new()
            .with_mode(RuntimeMode::Strict)
            .with_store(StorageKind::Local, local.clone())
            .with_store(StorageKind::Session, session.clone());

        let products = StorageUtilities::new(stores, patch)
            .unwrap()
            .with_clock(clock.clone());

        Harness {
            products,
            local,
            session,
            clock,
        }
    }

    fn notifying() -> SettingsPatch {
        SettingsPatch {
            notify: Some(true),
            ..Default::default()
        }
    }

    fn raw_json(store: &MemoryStore, key: &str) -> Option<Value> {
        store.get(key).map(|raw| serde_json::from_str(&raw).unwrap())
    }

    // ========================================================================
    // Read / Write
    // ========================================================================

    #[test]
    fn test_add_without_ttl_stores_bare_json() {
        let h = harness(SettingsPatch::default());
        h.products.add_item("local-product-1", &desk(), None, None).unwrap();

        assert_eq!(
            h.local.get("local-product-1"),
            Some(serde_json::to_string(&desk()).unwrap())
        );
        assert_eq!(h.products.get_item("local-product-1", None).unwrap(), Some(desk()));
    }

    #[test]
    fn test_add_with_ttl_stores_envelope() {
        let h = harness(SettingsPatch::default());
        h.products
            .add_item("p1", &desk(), Some(Duration::from_millis(500)), None)
            .unwrap();

        assert_eq!(
            raw_json(&h.local, "p1"),
            Some(json!({"value": serde_json::to_value(desk()).unwrap(), "expiry": 1_000_500}))
        );

        h.clock.advance(Duration::from_millis(300));
        assert_eq!(h.products.get_item("p1", None).unwrap(), Some(desk()));
    }

    #[test]
    fn test_expired_item_reads_none_and_is_purged() {
        let h = harness(SettingsPatch::default());
        h.products
            .add_item("p1", &desk(), Some(Duration::from_millis(200)), None)
            .unwrap();

        // Still live exactly at the deadline
        h.clock.advance(Duration::from_millis(200));
        assert!(h.products.get_item("p1", None).unwrap().is_some());

        h.clock.advance(Duration::from_millis(100));
        assert_eq!(h.products.get_item("p1", None).unwrap(), None);
        assert_eq!(h.local.get("p1"), None);
    }

    #[test]
    fn test_expiry_with_system_clock() {
        let stores = Stores::in_memory();
        let local = stores.resolve(StorageKind::Local).unwrap();
        let products: StorageUtilities<Product> =
            StorageUtilities::new(stores, SettingsPatch::default()).unwrap();

        products
            .add_item("p1", &desk(), Some(Duration::from_millis(200)), None)
            .unwrap();
        assert_eq!(products.get_item("p1", None).unwrap(), Some(desk()));

        std::thread::sleep(Duration::from_millis(300));

        assert_eq!(products.get_item("p1", None).unwrap(), None);
        assert_eq!(local.get("p1"), None);
    }

    #[test]
    fn test_default_ttl_applies() {
        let h = harness(SettingsPatch {
            default_ttl_millis: Some(1_000),
            ..Default::default()
        });
        h.products.add_item("p1", &desk(), None, None).unwrap();
        h.products
            .add_item("p2", &laptop(), Some(Duration::from_millis(50)), None)
            .unwrap();

        let items = h.products.list_items(None).unwrap();
        assert_eq!(items[0].expiry, Some(1_001_000));
        assert_eq!(items[1].expiry, Some(1_000_050));
    }

    #[test]
    fn test_null_value_is_not_written() {
        let stores = Stores::in_memory();
        let local = stores.resolve(StorageKind::Local).unwrap();
        let maybe: StorageUtilities<Option<u32>> =
            StorageUtilities::new(stores, notifying()).unwrap();
        let mut sub = maybe.subscribe();

        maybe.add_item("a", &Some(3), None, None).unwrap();
        maybe.add_item("a", &None, None, None).unwrap();

        assert_eq!(local.get("a").as_deref(), Some("3"));
        assert_eq!(sub.drain().len(), 1);
    }

    #[test]
    fn test_stored_null_reads_none() {
        let h = harness(SettingsPatch::default());
        h.local.set("p1", "null".into()).unwrap();
        assert_eq!(h.products.get_item("p1", None).unwrap(), None);
    }

    #[test]
    fn test_get_missing_is_none() {
        let h = harness(SettingsPatch::default());
        assert_eq!(h.products.get_item("nope", None).unwrap(), None);
    }

    #[test]
    fn test_session_storage_with_prefix() {
        let h = harness(SettingsPatch {
            key_prefix: Some("test-".into()),
            storage: Some(StorageKind::Session),
            ..Default::default()
        });

        h.products.add_item("product-1", &desk(), None, None).unwrap();
        assert_eq!(
            h.session.get("test-product-1"),
            Some(serde_json::to_string(&desk()).unwrap())
        );
        assert!(h.local.is_empty());

        // Per-call override
        h.products
            .add_item("product-2", &laptop(), None, Some(StorageKind::Local))
            .unwrap();
        assert!(h.local.get("test-product-2").is_some());
        assert_eq!(
            h.products.get_item("product-2", Some(StorageKind::Local)).unwrap(),
            Some(laptop())
        );
    }

    #[test]
    fn test_configure_prefix_then_add() {
        let stores = Stores::in_memory();
        let local = stores.resolve(StorageKind::Local).unwrap();
        let mut values: StorageUtilities<Value> =
            StorageUtilities::new(stores, SettingsPatch::default()).unwrap();

        values
            .configure(SettingsPatch {
                key_prefix: Some("x-".into()),
                ..Default::default()
            })
            .unwrap();
        values.add_item("a", &json!({"v": 1}), None, None).unwrap();

        assert_eq!(local.get("x-a").as_deref(), Some(r#"{"v":1}"#));
        assert_eq!(values.list_keys(None).unwrap(), vec!["x-a"]);
        assert_eq!(values.get_item("a", None).unwrap(), Some(json!({"v": 1})));
    }

    #[test]
    fn test_non_json_raw_entry_reads_as_string() {
        let stores = Stores::in_memory();
        let local = stores.resolve(StorageKind::Local).unwrap();
        let strings: StorageUtilities<String> =
            StorageUtilities::new(stores, SettingsPatch::default()).unwrap();

        local.set("greeting", "hello".into()).unwrap();
        assert_eq!(
            strings.get_item("greeting", None).unwrap().as_deref(),
            Some("hello")
        );
    }

    #[test]
    fn test_non_json_raw_entry_in_listing_and_purge() {
        let stores = Stores::in_memory();
        let local = stores.resolve(StorageKind::Local).unwrap();
        let strings: StorageUtilities<String> =
            StorageUtilities::new(stores, SettingsPatch::default()).unwrap();

        local.set("greeting", "hello there".into()).unwrap();

        let items = strings.list_items(None).unwrap();
        assert_eq!(items[0].value, "hello there");
        assert_eq!(items[0].expiry, None);
        assert_eq!(strings.purge_expired(None).unwrap(), 0);
        assert_eq!(local.get("greeting").as_deref(), Some("hello there"));
    }

    #[test]
    fn test_stored_json_keeps_field_order() {
        let stores = Stores::in_memory();
        let local = stores.resolve(StorageKind::Local).unwrap();
        let docs: StorageUtilities<Value> =
            StorageUtilities::new(stores, SettingsPatch::default()).unwrap();

        docs.add_item("d", &json!({"zeta": 1, "alpha": 2, "mid": 3}), None, None)
            .unwrap();
        assert_eq!(
            local.get("d").as_deref(),
            Some(r#"{"zeta":1,"alpha":2,"mid":3}"#)
        );

        docs.update_item_property("d", "alpha", &20, None).unwrap();
        docs.remove_item_property("d", "zeta", None).unwrap();
        assert_eq!(local.get("d").as_deref(), Some(r#"{"alpha":20,"mid":3}"#));
    }

    #[test]
    fn test_zero_ttl_stores_without_envelope() {
        let h = harness(SettingsPatch {
            default_ttl_millis: Some(1_000),
            ..Default::default()
        });
        h.products
            .add_item("p1", &desk(), Some(Duration::ZERO), None)
            .unwrap();

        assert_eq!(
            h.local.get("p1"),
            Some(serde_json::to_string(&desk()).unwrap())
        );
        h.clock.advance(Duration::from_secs(10));
        assert_eq!(h.products.get_item("p1", None).unwrap(), Some(desk()));
    }

    #[test]
    fn test_failed_file_write_is_not_visible() {
        use crate::backend::FileStore;

        let dir = tempfile::tempdir().unwrap();
        let file = FileStore::open(dir.path().join("missing-dir").join("store.json")).unwrap();
        let stores = Stores::new()
            .with_mode(RuntimeMode::Strict)
            .with_store(StorageKind::Local, Arc::new(file))
            .with_store(StorageKind::Session, Arc::new(MemoryStore::new()));
        let numbers: StorageUtilities<u32> = StorageUtilities::new(stores, notifying()).unwrap();
        let mut sub = numbers.subscribe();

        assert!(matches!(
            numbers.add_item("a", &7, None, None),
            Err(StashError::Storage(_))
        ));
        assert_eq!(numbers.get_item("a", None).unwrap(), None);
        assert!(numbers.list_keys(None).unwrap().is_empty());
        assert!(sub.drain().is_empty());
    }

    #[test]
    fn test_get_item_as_uses_configured_kind() {
        let h = harness(SettingsPatch {
            return_kind: Some(ReturnKind::Deferred),
            ..Default::default()
        });
        h.products.add_item("p1", &desk(), None, None).unwrap();

        let returned = h.products.get_item_as("p1", None, None).unwrap();
        assert_eq!(returned.kind(), ReturnKind::Deferred);
        assert_eq!(tokio_test::block_on(returned.resolve()), Some(desk()));

        let returned = h
            .products
            .get_item_as("p1", None, Some(ReturnKind::Direct))
            .unwrap();
        assert_eq!(returned.into_direct(), Some(Some(desk())));
    }

    #[test]
    fn test_list_as_stream() {
        let h = harness(SettingsPatch::default());
        h.products.add_item("p1", &desk(), None, None).unwrap();

        let keys = h.products.list_keys_as(None, Some(ReturnKind::Stream)).unwrap();
        assert_eq!(keys.kind(), ReturnKind::Stream);
        assert_eq!(tokio_test::block_on(keys.resolve()), vec!["p1"]);

        let values = h.products.list_values_as(None, None).unwrap();
        assert_eq!(values.into_direct(), Some(vec![desk()]));

        let items = h.products.list_items_as(None, Some(ReturnKind::Deferred)).unwrap();
        assert_eq!(tokio_test::block_on(items.resolve())[0].key, "p1");
    }

    // ========================================================================
    // Property Updates
    // ========================================================================

    #[test]
    fn test_update_property_preserves_expiry() {
        let h = harness(SettingsPatch::default());
        h.products
            .add_item("p1", &desk(), Some(Duration::from_millis(500)), None)
            .unwrap();

        h.clock.advance(Duration::from_millis(400));
        let updated = h
            .products
            .update_item_property("p1", "name", "Standing Desk", None)
            .unwrap()
            .unwrap();
        assert_eq!(updated.name, "Standing Desk");

        let items = h.products.list_items(None).unwrap();
        assert_eq!(items[0].expiry, Some(1_000_500));
        assert_eq!(items[0].value.name, "Standing Desk");

        // The deadline did not move
        h.clock.advance(Duration::from_millis(200));
        assert_eq!(h.products.get_item("p1", None).unwrap(), None);
    }

    #[test]
    fn test_update_property_on_plain_item() {
        let h = harness(SettingsPatch::default());
        h.products.add_item("p2", &laptop(), None, None).unwrap();

        let customer = Customer {
            id: 20,
            first_name: "Kate".into(),
        };
        let updated = h
            .products
            .update_item_property("p2", "customer", &customer, None)
            .unwrap();

        assert_eq!(updated.unwrap().customer, Some(customer.clone()));
        assert_eq!(
            h.products.get_item("p2", None).unwrap().unwrap().customer,
            Some(customer)
        );
        assert_eq!(h.products.list_items(None).unwrap()[0].expiry, None);
    }

    #[test]
    fn test_update_property_missing_or_expired() {
        let h = harness(SettingsPatch::default());
        assert_eq!(
            h.products.update_item_property("nope", "name", "x", None).unwrap(),
            None
        );

        h.products
            .add_item("p1", &desk(), Some(Duration::from_millis(10)), None)
            .unwrap();
        h.clock.advance(Duration::from_millis(11));
        assert_eq!(
            h.products.update_item_property("p1", "name", "x", None).unwrap(),
            None
        );
        assert!(h.local.is_empty());
    }

    #[test]
    fn test_remove_property() {
        let h = harness(SettingsPatch::default());
        h.products
            .add_item("p1", &desk(), Some(Duration::from_millis(500)), None)
            .unwrap();

        let updated = h
            .products
            .remove_item_property("p1", "customer", None)
            .unwrap()
            .unwrap();
        assert_eq!(updated.customer, None);
        assert_eq!(h.products.list_items(None).unwrap()[0].expiry, Some(1_000_500));
    }

    #[test]
    fn test_remove_required_property_is_rejected() {
        let h = harness(SettingsPatch::default());
        h.products.add_item("p1", &desk(), None, None).unwrap();

        let result = h.products.remove_item_property("p1", "name", None);
        assert!(matches!(result, Err(StashError::Serialization(_))));

        // Nothing was written
        assert_eq!(h.products.get_item("p1", None).unwrap(), Some(desk()));
    }

    #[test]
    fn test_property_on_non_object() {
        let stores = Stores::in_memory();
        let numbers: StorageUtilities<u32> =
            StorageUtilities::new(stores, SettingsPatch::default()).unwrap();
        numbers.add_item("n", &7, None, None).unwrap();

        match numbers.update_item_property("n", "x", &1, None) {
            Err(StashError::NotAnObject { key }) => assert_eq!(key, "n"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    // ========================================================================
    // Removal
    // ========================================================================

    #[test]
    fn test_remove_item() {
        let h = harness(SettingsPatch::default());
        h.products.add_item("p1", &desk(), None, None).unwrap();
        h.products.remove_item("p1", None).unwrap();
        assert!(h.local.is_empty());
    }

    #[test]
    fn test_remove_items() {
        let h = harness(SettingsPatch {
            key_prefix: Some("test-".into()),
            ..Default::default()
        });
        for i in 0..50 {
            h.products
                .add_item(&format!("product-{}", i), &laptop(), None, None)
                .unwrap();
        }

        h.products.remove_items(&["product-1", "product-2"], None).unwrap();

        assert_eq!(h.local.get("test-product-1"), None);
        assert_eq!(h.local.get("test-product-2"), None);
        assert_eq!(h.local.len(), 48);
    }

    #[test]
    fn test_clear_all_without_prefix_clears_store() {
        let h = harness(SettingsPatch::default());
        h.local.set("foreign", "1".into()).unwrap();
        h.products.add_item("p1", &desk(), None, None).unwrap();

        h.products.clear_all(None).unwrap();
        assert!(h.local.is_empty());
    }

    #[test]
    fn test_clear_all_with_prefix_keeps_other_namespaces() {
        let h = harness(SettingsPatch {
            key_prefix: Some("mine-".into()),
            ..Default::default()
        });
        h.local.set("theirs-1", "1".into()).unwrap();
        h.products.add_item("p1", &desk(), None, None).unwrap();
        h.products.add_item("p2", &laptop(), None, None).unwrap();

        h.products.clear_all(None).unwrap();
        assert_eq!(h.local.keys(), vec!["theirs-1"]);
    }

    #[test]
    fn test_purge_expired() {
        let h = harness(SettingsPatch::default());
        h.products
            .add_item("short", &desk(), Some(Duration::from_millis(10)), None)
            .unwrap();
        h.products
            .add_item("long", &desk(), Some(Duration::from_secs(60)), None)
            .unwrap();
        h.products.add_item("forever", &laptop(), None, None).unwrap();

        h.clock.advance(Duration::from_millis(50));
        assert_eq!(h.products.purge_expired(None).unwrap(), 1);
        assert_eq!(h.local.keys(), vec!["long", "forever"]);
        assert_eq!(h.products.purge_expired(None).unwrap(), 0);
    }

    // ========================================================================
    // Enumeration
    // ========================================================================

    #[test]
    fn test_list_operations() {
        let h = harness(SettingsPatch {
            key_prefix: Some("test-".into()),
            storage: Some(StorageKind::Session),
            ..Default::default()
        });
        h.session
            .set("test-product-1", serde_json::to_string(&desk()).unwrap())
            .unwrap();
        h.products
            .add_item("product-2", &laptop(), Some(Duration::from_millis(100)), None)
            .unwrap();

        assert_eq!(
            h.products.list_keys(None).unwrap(),
            vec!["test-product-1", "test-product-2"]
        );
        assert_eq!(h.products.list_values(None).unwrap(), vec![desk(), laptop()]);
        assert_eq!(
            h.products.list_items(None).unwrap(),
            vec![
                StoredItem {
                    key: "test-product-1".into(),
                    value: desk(),
                    expiry: None,
                },
                StoredItem {
                    key: "test-product-2".into(),
                    value: laptop(),
                    expiry: Some(1_000_100),
                },
            ]
        );
    }

    #[test]
    fn test_listing_does_not_purge() {
        let h = harness(SettingsPatch::default());
        h.products
            .add_item("p1", &desk(), Some(Duration::from_millis(10)), None)
            .unwrap();
        h.clock.advance(Duration::from_millis(20));

        let items = h.products.list_items(None).unwrap();
        assert_eq!(items.len(), 1);
        assert!(items[0].is_expired(h.clock.now_millis()));
        assert_eq!(h.local.len(), 1);
    }

    #[test]
    fn test_prefix_isolation() {
        let stores = Stores::in_memory();
        let a: StorageUtilities<Product> = StorageUtilities::new(
            stores.clone(),
            SettingsPatch {
                key_prefix: Some("a-".into()),
                ..Default::default()
            },
        )
        .unwrap();
        let b: StorageUtilities<Product> = StorageUtilities::new(
            stores,
            SettingsPatch {
                key_prefix: Some("b-".into()),
                ..Default::default()
            },
        )
        .unwrap();

        a.add_item("1", &desk(), None, None).unwrap();
        b.add_item("1", &laptop(), None, None).unwrap();

        assert_eq!(a.list_keys(None).unwrap(), vec!["a-1"]);
        assert_eq!(b.list_keys(None).unwrap(), vec!["b-1"]);
        assert_eq!(a.get_item("1", None).unwrap(), Some(desk()));
        assert_eq!(b.get_item("1", None).unwrap(), Some(laptop()));
    }

    // ========================================================================
    // Settings
    // ========================================================================

    #[test]
    fn test_default_and_current_settings() {
        let h = harness(SettingsPatch {
            key_prefix: Some("local-test-".into()),
            storage: Some(StorageKind::Session),
            ..Default::default()
        });

        assert_eq!(h.products.default_settings(), &Settings::default());
        assert_eq!(h.products.current_settings().key_prefix, "local-test-");
        assert_eq!(h.products.current_settings().storage, StorageKind::Session);
    }

    #[test]
    fn test_set_custom_settings_starts_from_defaults() {
        let mut h = harness(SettingsPatch {
            notify: Some(true),
            ..Default::default()
        });

        h.products
            .set_custom_settings(SettingsPatch {
                key_prefix: Some("custom-".into()),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(
            h.products.current_settings(),
            &Settings {
                key_prefix: "custom-".into(),
                ..Settings::default()
            }
        );
    }

    #[test]
    fn test_set_custom_settings_rejects_empty() {
        let mut h = harness(SettingsPatch::default());
        assert!(matches!(
            h.products.set_custom_settings(SettingsPatch::default()),
            Err(StashError::InvalidSettings(_))
        ));
    }

    #[test]
    fn test_reset_settings() {
        let mut h = harness(SettingsPatch {
            key_prefix: Some("custom-".into()),
            storage: Some(StorageKind::Session),
            ..Default::default()
        });

        h.products.reset_settings().unwrap();
        assert_eq!(h.products.current_settings(), &Settings::default());
    }

    #[test]
    fn test_unsupported_storage_kind_fails_fast() {
        let stores = Stores::new()
            .with_mode(RuntimeMode::Strict)
            .with_store(StorageKind::Local, Arc::new(MemoryStore::new()));

        let result: StashResult<StorageUtilities<Product>> = StorageUtilities::new(
            stores.clone(),
            SettingsPatch {
                storage: Some(StorageKind::Session),
                ..Default::default()
            },
        );
        assert!(matches!(
            result,
            Err(StashError::Configuration {
                storage: StorageKind::Session
            })
        ));

        // configure leaves settings untouched on failure
        let mut products: StorageUtilities<Product> =
            StorageUtilities::new(stores, SettingsPatch::default()).unwrap();
        let result = products.configure(SettingsPatch {
            storage: Some(StorageKind::Session),
            ..Default::default()
        });
        assert!(result.is_err());
        assert_eq!(products.current_settings().storage, StorageKind::Local);

        // Per-call overrides are checked too
        assert!(matches!(
            products.get_item("p1", Some(StorageKind::Session)),
            Err(StashError::Configuration { .. })
        ));
    }

    #[test]
    fn test_headless_mode_injects_stores() {
        let stores = Stores::new().with_mode(RuntimeMode::Headless);
        let products: StorageUtilities<Product> = StorageUtilities::new(
            stores,
            SettingsPatch {
                storage: Some(StorageKind::Session),
                ..Default::default()
            },
        )
        .unwrap();

        products.add_item("p1", &desk(), None, None).unwrap();
        products
            .add_item("p1", &laptop(), None, Some(StorageKind::Local))
            .unwrap();
        assert_eq!(products.get_item("p1", None).unwrap(), Some(desk()));
        assert_eq!(
            products.get_item("p1", Some(StorageKind::Local)).unwrap(),
            Some(laptop())
        );
    }

    // ========================================================================
    // Notification
    // ========================================================================

    #[test]
    fn test_add_publishes_event() {
        let h = harness(notifying());
        let mut sub = h.products.subscribe();

        h.products.add_item("local-product-1", &desk(), None, None).unwrap();

        assert_eq!(
            sub.drain(),
            vec![ChangeEvent {
                storage: StorageKind::Local,
                old_value: None,
                new_value: Some(serde_json::to_value(desk()).unwrap()),
            }]
        );
    }

    #[test]
    fn test_late_subscriber_gets_replay_then_live() {
        let h = harness(notifying());
        h.products.add_item("p1", &desk(), None, None).unwrap();

        let mut sub = h.products.subscribe();
        h.products.add_item("p1", &laptop(), None, None).unwrap();

        let events = sub.drain();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].old_value, None);
        assert_eq!(events[0].new_value, Some(serde_json::to_value(desk()).unwrap()));
        assert_eq!(events[1].old_value, Some(serde_json::to_value(desk()).unwrap()));
        assert_eq!(events[1].new_value, Some(serde_json::to_value(laptop()).unwrap()));
    }

    #[test]
    fn test_events_carry_raw_envelopes() {
        let h = harness(notifying());
        let mut sub = h.products.subscribe();

        h.products
            .add_item("p1", &desk(), Some(Duration::from_millis(5)), None)
            .unwrap();
        h.clock.advance(Duration::from_millis(10));
        assert_eq!(h.products.get_item("p1", None).unwrap(), None);

        let envelope = json!({"value": serde_json::to_value(desk()).unwrap(), "expiry": 1_000_005});
        assert_eq!(
            sub.drain(),
            vec![
                ChangeEvent {
                    storage: StorageKind::Local,
                    old_value: None,
                    new_value: Some(envelope.clone()),
                },
                ChangeEvent {
                    storage: StorageKind::Local,
                    old_value: Some(envelope),
                    new_value: None,
                },
            ]
        );
    }

    #[test]
    fn test_remove_and_update_publish() {
        let h = harness(notifying());
        h.products.add_item("p1", &desk(), None, None).unwrap();
        let mut sub = h.products.subscribe();

        h.products.update_item_property("p1", "code", "B2", None).unwrap();
        h.products.remove_items(&["p1"], None).unwrap();

        let events = sub.drain();
        assert_eq!(events.len(), 3);
        assert_eq!(events[1].new_value.as_ref().unwrap()["code"], json!("B2"));
        assert_eq!(events[2].new_value, None);
        assert_eq!(events[2].old_value.as_ref().unwrap()["code"], json!("B2"));
    }

    #[test]
    fn test_no_events_when_disabled() {
        let h = harness(SettingsPatch::default());
        let mut sub = h.products.subscribe();

        h.products.add_item("p1", &desk(), None, None).unwrap();
        h.products.remove_item("p1", None).unwrap();

        assert!(sub.drain().is_empty());
    }

    #[tokio::test]
    async fn test_subscription_as_stream() {
        use futures::StreamExt;

        let h = harness(notifying());
        let mut sub = h.products.subscribe();
        h.products.add_item("p1", &desk(), None, Some(StorageKind::Session)).unwrap();

        let event = sub.next().await.unwrap();
        assert_eq!(event.storage, StorageKind::Session);
    }
}
