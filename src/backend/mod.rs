//! Store Backends
//!
//! stashkv never owns its stores. A [`KeyValueStore`] is handed in through
//! [`Stores`], which maps each [`StorageKind`] to a shared handle.
//!
//! ```text
//! ┌──────────────────────┐        ┌──────────────────────────┐
//! │ StorageUtilities<T>  │───────>│         Stores           │
//! └──────────────────────┘        │  Local   ──> Arc<dyn ..> │
//!                                 │  Session ──> Arc<dyn ..> │
//!                                 └──────────────────────────┘
//! ```
//!
//! ## Backends
//!
//! - [`MemoryStore`]: insertion-ordered in-memory map
//! - [`FileStore`]: in-memory map mirrored to a JSON file
//!
//! ## Example
//!
//! ```
//! use stashkv::backend::{KeyValueStore, MemoryStore, Stores};
//! use stashkv::settings::StorageKind;
//! use std::sync::Arc;
//!
//! let local = Arc::new(MemoryStore::new());
//! let stores = Stores::new().with_store(StorageKind::Local, local.clone());
//!
//! assert!(stores.resolve(StorageKind::Local).is_ok());
//! assert!(stores.resolve(StorageKind::Session).is_err());
//! ```

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use crate::error::{StashError, StashResult, StorageResult};
use crate::settings::StorageKind;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Environment variable that selects the runtime mode.
pub const MODE_ENV_VAR: &str = "STASHKV_ENV";

/// The capabilities stashkv needs from a key-value store.
///
/// Mirrors the browser `Storage` interface: string keys, string values.
pub trait KeyValueStore: Send + Sync {
    /// Returns the raw value stored under `key`.
    fn get(&self, key: &str) -> Option<String>;

    /// Stores `value` under `key`, replacing any previous value.
    fn set(&self, key: &str, value: String) -> StorageResult<()>;

    /// Removes `key`. Removing a missing key is not an error.
    fn remove(&self, key: &str) -> StorageResult<()>;

    /// Removes every key.
    fn clear(&self) -> StorageResult<()>;

    /// Returns every key in the store's native enumeration order.
    fn keys(&self) -> Vec<String>;

    /// Returns the number of stored keys.
    fn len(&self) -> usize;

    /// Returns true if the store holds no keys.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Whether missing stores are a configuration error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RuntimeMode {
    /// A storage kind without a registered store is rejected.
    #[default]
    Strict,
    /// Test/headless mode: missing stores are replaced with [`MemoryStore`]s.
    Headless,
}

impl RuntimeMode {
    /// Reads the mode from `STASHKV_ENV`: `test` or `headless` selects
    /// [`RuntimeMode::Headless`], anything else is strict.
    pub fn detect() -> Self {
        Self::detect_from(std::env::var(MODE_ENV_VAR).ok().as_deref())
    }

    fn detect_from(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("test") || v.eq_ignore_ascii_case("headless") => {
                RuntimeMode::Headless
            }
            _ => RuntimeMode::Strict,
        }
    }
}

/// Maps each storage kind to an injected store handle.
///
/// Cloning is cheap and clones share the same underlying stores, which is
/// how several utility instances operate on one raw store.
#[derive(Clone)]
pub struct Stores {
    stores: HashMap<StorageKind, Arc<dyn KeyValueStore>>,
    mode: RuntimeMode,
}

impl fmt::Debug for Stores {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.stores.keys().map(StorageKind::as_str).collect();
        kinds.sort_unstable();
        f.debug_struct("Stores")
            .field("kinds", &kinds)
            .field("mode", &self.mode)
            .finish()
    }
}

impl Default for Stores {
    fn default() -> Self {
        Self::new()
    }
}

impl Stores {
    /// Creates an empty registry. The mode is read from the environment.
    pub fn new() -> Self {
        Self {
            stores: HashMap::new(),
            mode: RuntimeMode::detect(),
        }
    }

    /// Creates a registry with a fresh [`MemoryStore`] for both kinds.
    pub fn in_memory() -> Self {
        Self::new()
            .with_store(StorageKind::Local, Arc::new(MemoryStore::new()))
            .with_store(StorageKind::Session, Arc::new(MemoryStore::new()))
    }

    /// Registers the store used for `kind`.
    pub fn with_store(mut self, kind: StorageKind, store: Arc<dyn KeyValueStore>) -> Self {
        self.stores.insert(kind, store);
        self
    }

    /// Overrides the detected runtime mode.
    pub fn with_mode(mut self, mode: RuntimeMode) -> Self {
        self.mode = mode;
        self
    }

    /// Returns the runtime mode.
    pub fn mode(&self) -> RuntimeMode {
        self.mode
    }

    /// Returns true if a store is registered for `kind`.
    pub fn supports(&self, kind: StorageKind) -> bool {
        self.stores.contains_key(&kind)
    }

    /// Returns the store for `kind`.
    pub fn resolve(&self, kind: StorageKind) -> StashResult<Arc<dyn KeyValueStore>> {
        self.stores
            .get(&kind)
            .cloned()
            .ok_or(StashError::Configuration { storage: kind })
    }

    /// Checks that `kind` can be served.
    ///
    /// In headless mode a missing store is filled with a [`MemoryStore`]
    /// instead of failing.
    pub fn validate(&mut self, kind: StorageKind) -> StashResult<()> {
        if self.supports(kind) {
            return Ok(());
        }

        match self.mode {
            RuntimeMode::Strict => Err(StashError::Configuration { storage: kind }),
            RuntimeMode::Headless => {
                debug!(storage = %kind, "Headless mode, injecting in-memory store");
                self.stores.insert(kind, Arc::new(MemoryStore::new()));
                Ok(())
            }
        }
    }
}
