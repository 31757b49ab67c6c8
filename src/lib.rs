//! # stashkv - Typed Key-Value Storage with TTL Envelopes
//!
//! stashkv is a thin, typed layer over a string key-value store shaped like
//! browser local/session storage. It adds key namespacing, JSON
//! (de)serialization, per-item time-to-live and change notification.
//!
//! ## Features
//!
//! - **Typed Access**: `StorageUtilities<T>` reads and writes any serde type
//! - **Namespacing**: every key is prefixed, instances with different
//!   prefixes share a store without seeing each other
//! - **TTL Support**: items can carry an absolute expiry and are purged lazily
//! - **Change Notification**: subscribers get the last event replayed, then
//!   every later one
//! - **Pluggable Stores**: in-memory and JSON-file stores ship with the crate
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          StorageUtilities<T>                            │
//! │                                                                         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐                  │
//! │  │  Settings   │    │  Envelope   │    │   Change    │                  │
//! │  │  Resolver   │    │   Codec     │    │  Notifier   │                  │
//! │  └─────────────┘    └──────┬──────┘    └─────────────┘                  │
//! │                            │                                            │
//! │                            ▼                                            │
//! │  ┌──────────────────────────────────────────────────────────────────┐   │
//! │  │                           Stores                                 │   │
//! │  │     Local ──> Arc<dyn KeyValueStore>                             │   │
//! │  │     Session ──> Arc<dyn KeyValueStore>                           │   │
//! │  └──────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```
//! use stashkv::{SettingsPatch, StorageKind, StorageUtilities, Stores};
//! use std::time::Duration;
//!
//! let mut sessions: StorageUtilities<String> =
//!     StorageUtilities::new(Stores::in_memory(), SettingsPatch::default()).unwrap();
//!
//! sessions
//!     .configure(SettingsPatch {
//!         key_prefix: Some("auth-".into()),
//!         notify: Some(true),
//!         ..Default::default()
//!     })
//!     .unwrap();
//!
//! let mut changes = sessions.subscribe();
//! sessions
//!     .add_item("token", &"abc123".to_string(), Some(Duration::from_secs(3600)), None)
//!     .unwrap();
//!
//! assert_eq!(sessions.get_item("token", None).unwrap().as_deref(), Some("abc123"));
//! assert_eq!(changes.try_next().unwrap().storage, StorageKind::Local);
//! ```
//!
//! ## Module Overview
//!
//! - [`utilities`]: the typed accessor and its read/write/list operations
//! - [`collection`]: id-addressed array items
//! - [`settings`]: settings, partial overrides and their sources
//! - [`envelope`]: the `{value, expiry}` codec
//! - [`notify`]: change events and subscriptions
//! - [`backend`]: the store trait, store registry and bundled stores
//! - [`clock`]: wall-clock sources for expiry deadlines
//!
//! ## Lazy Expiry
//!
//! There is no background sweeper. An expired item is removed when a read
//! finds it, or when [`StorageUtilities::purge_expired`] is called.

pub mod backend;
pub mod clock;
pub mod collection;
pub mod envelope;
pub mod error;
pub mod notify;
pub mod returned;
pub mod settings;
pub mod utilities;

// Re-export commonly used types for convenience
pub use backend::{FileStore, KeyValueStore, MemoryStore, RuntimeMode, Stores};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{StashError, StashResult, StorageError, StorageResult};
pub use notify::{ChangeEvent, Subscription};
pub use returned::Returned;
pub use settings::{ReturnKind, Settings, SettingsPatch, StorageKind};
pub use utilities::{StorageUtilities, StoredItem};

/// Version of stashkv
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
