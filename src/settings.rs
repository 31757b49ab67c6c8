//! Settings Resolution
//!
//! Every [`StorageUtilities`](crate::StorageUtilities) instance owns its own
//! [`Settings`]. Callers adjust them with a [`SettingsPatch`], a partial
//! settings object whose unset fields leave the target untouched.
//!
//! ## Sources
//!
//! - Code: build a [`SettingsPatch`] directly.
//! - Environment: [`SettingsPatch::from_env`] reads `STASHKV_*` variables.
//! - JSON: [`SettingsPatch::from_json`] accepts a camelCase settings object.
//!
//! ## Example
//!
//! ```
//! use stashkv::settings::{Settings, SettingsPatch, StorageKind};
//!
//! let mut settings = Settings::default();
//! settings.apply(&SettingsPatch {
//!     key_prefix: Some("app-".into()),
//!     storage: Some(StorageKind::Session),
//!     ..Default::default()
//! });
//!
//! assert_eq!(settings.key_prefix, "app-");
//! assert_eq!(settings.storage, StorageKind::Session);
//! assert!(!settings.notify);
//! ```

use crate::error::{StashError, StashResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Environment variable prefix for settings overrides.
const ENV_PREFIX: &str = "STASHKV_";

/// Which of the two independent stores an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum StorageKind {
    /// Long-lived store (browser `localStorage`).
    #[default]
    #[serde(rename = "localStorage", alias = "local")]
    Local,
    /// Per-session store (browser `sessionStorage`).
    #[serde(rename = "sessionStorage", alias = "session")]
    Session,
}

impl StorageKind {
    /// Returns the canonical name of this storage kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageKind::Local => "localStorage",
            StorageKind::Session => "sessionStorage",
        }
    }
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageKind {
    type Err = StashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" | "localstorage" => Ok(StorageKind::Local),
            "session" | "sessionstorage" => Ok(StorageKind::Session),
            other => Err(StashError::InvalidSettings(format!(
                "unknown storage kind '{}'",
                other
            ))),
        }
    }
}

/// How read results are handed back to the caller.
///
/// Both wrapping kinds resolve immediately with an already computed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReturnKind {
    /// The plain value.
    Direct,
    /// A ready future.
    #[serde(alias = "promise")]
    Deferred,
    /// A stream that yields the value once.
    #[serde(alias = "observable")]
    Stream,
}

impl FromStr for ReturnKind {
    type Err = StashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(ReturnKind::Direct),
            "deferred" | "promise" => Ok(ReturnKind::Deferred),
            "stream" | "observable" => Ok(ReturnKind::Stream),
            _ => Err(StashError::UnsupportedReturnKind(s.to_string())),
        }
    }
}

/// The active configuration of a storage utility instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Prepended to every logical key.
    pub key_prefix: String,
    /// Store used when an operation does not name one.
    pub storage: StorageKind,
    /// TTL applied to writes that do not pass their own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_ttl_millis: Option<u64>,
    /// Return kind used by the `_as` accessors when the call does not name one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_kind: Option<ReturnKind>,
    /// Publish a change event on every mutation.
    #[serde(default)]
    pub notify: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            key_prefix: String::new(),
            storage: StorageKind::Local,
            default_ttl_millis: None,
            return_kind: None,
            notify: false,
        }
    }
}

impl Settings {
    /// Shallow-merges `patch` into these settings.
    pub fn apply(&mut self, patch: &SettingsPatch) {
        if let Some(prefix) = &patch.key_prefix {
            self.key_prefix = prefix.clone();
        }
        if let Some(storage) = patch.storage {
            self.storage = storage;
        }
        if let Some(ttl) = patch.default_ttl_millis {
            self.default_ttl_millis = Some(ttl);
        }
        if let Some(kind) = patch.return_kind {
            self.return_kind = Some(kind);
        }
        if let Some(notify) = patch.notify {
            self.notify = notify;
        }
    }

    /// Returns a copy of these settings with `patch` merged in.
    pub fn merged(&self, patch: &SettingsPatch) -> Settings {
        let mut merged = self.clone();
        merged.apply(patch);
        merged
    }

    /// Returns the default TTL, treating zero as "no default".
    pub fn default_ttl(&self) -> Option<Duration> {
        self.default_ttl_millis
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    /// Prepends the key prefix to a logical key.
    pub fn prefixed(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }
}

/// A partial [`Settings`] value. `None` fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettingsPatch {
    pub key_prefix: Option<String>,
    pub storage: Option<StorageKind>,
    pub default_ttl_millis: Option<u64>,
    pub return_kind: Option<ReturnKind>,
    pub notify: Option<bool>,
}

/// Wire form of a settings object, before enum names are validated.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawSettings {
    key_prefix: Option<String>,
    storage: Option<String>,
    default_ttl_millis: Option<u64>,
    return_kind: Option<String>,
    notify: Option<bool>,
}

impl SettingsPatch {
    /// Returns true if the patch sets no field at all.
    pub fn is_empty(&self) -> bool {
        self == &SettingsPatch::default()
    }

    /// Parses a camelCase JSON settings object.
    ///
    /// Unknown return kinds fail with
    /// [`StashError::UnsupportedReturnKind`]; an empty object fails with
    /// [`StashError::InvalidSettings`].
    pub fn from_json(json: &str) -> StashResult<SettingsPatch> {
        let invalid = |e: serde_json::Error| StashError::InvalidSettings(e.to_string());
        let map = match serde_json::from_str::<Value>(json).map_err(invalid)? {
            Value::Object(map) => map,
            other => {
                return Err(StashError::InvalidSettings(format!(
                    "expected a settings object, got {}",
                    other
                )))
            }
        };
        let raw: RawSettings = serde_json::from_value(Value::Object(map)).map_err(invalid)?;

        let patch = SettingsPatch {
            key_prefix: raw.key_prefix,
            storage: raw.storage.as_deref().map(str::parse).transpose()?,
            default_ttl_millis: raw.default_ttl_millis,
            return_kind: raw.return_kind.as_deref().map(str::parse).transpose()?,
            notify: raw.notify,
        };

        if patch.is_empty() {
            return Err(StashError::InvalidSettings("empty settings object".into()));
        }
        Ok(patch)
    }

    /// Reads overrides from `STASHKV_KEY_PREFIX`, `STASHKV_STORAGE`,
    /// `STASHKV_DEFAULT_TTL_MS`, `STASHKV_RETURN_KIND` and `STASHKV_NOTIFY`.
    pub fn from_env() -> StashResult<SettingsPatch> {
        Self::from_lookup(|name| std::env::var(format!("{}{}", ENV_PREFIX, name)).ok())
    }

    fn from_lookup<F>(lookup: F) -> StashResult<SettingsPatch>
    where
        F: Fn(&str) -> Option<String>,
    {
        let default_ttl_millis = lookup("DEFAULT_TTL_MS")
            .map(|v| {
                v.trim().parse::<u64>().map_err(|_| {
                    StashError::InvalidSettings(format!("invalid default TTL '{}'", v))
                })
            })
            .transpose()?;

        let notify = lookup("NOTIFY")
            .map(|v| match v.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(StashError::InvalidSettings(format!(
                    "invalid notify flag '{}'",
                    v
                ))),
            })
            .transpose()?;

        Ok(SettingsPatch {
            key_prefix: lookup("KEY_PREFIX"),
            storage: lookup("STORAGE").as_deref().map(str::parse).transpose()?,
            default_ttl_millis,
            return_kind: lookup("RETURN_KIND").as_deref().map(str::parse).transpose()?,
            notify,
        })
    }
}

impl From<Settings> for SettingsPatch {
    fn from(settings: Settings) -> Self {
        Self {
            key_prefix: Some(settings.key_prefix),
            storage: Some(settings.storage),
            default_ttl_millis: settings.default_ttl_millis,
            return_kind: settings.return_kind,
            notify: Some(settings.notify),
        }
    }
}
