//! Local persisted key/value store.
//!
//! Holds what a browser session keeps in local storage: a bearer
//! credential and a profile record per party type, notification
//! preferences, and a short list of recent searches. Values are JSON and
//! every write is flushed to disk immediately.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde_json::Value;

use carechat_proto::identity::{Profile, ProfileSource};
use carechat_proto::party::PartyType;

/// Key for the notification sound preference.
pub const SOUND_ENABLED_KEY: &str = "notification_sound_enabled";

/// Key for the notification vibration preference.
pub const VIBRATION_ENABLED_KEY: &str = "notification_vibration_enabled";

/// Key for the recent search list.
pub const RECENT_SEARCHES_KEY: &str = "recent_searches";

/// Maximum number of recent searches kept.
pub const MAX_RECENT_SEARCHES: usize = 10;

/// Key holding the bearer credential for `kind`.
#[must_use]
pub fn token_key(kind: PartyType) -> String {
    format!("{kind}_token")
}

/// Key holding the profile record for `kind`.
#[must_use]
pub fn info_key(kind: PartyType) -> String {
    format!("{kind}_info")
}

/// Errors from reading or writing the store file.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store file could not be read.
    #[error("failed to read store {path}: {source}")]
    Read {
        /// Store path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// The store file could not be written.
    #[error("failed to write store {path}: {source}")]
    Write {
        /// Store path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// The store file is not a JSON object.
    #[error("store file is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

/// JSON key/value store, optionally backed by a file.
#[derive(Debug, Default)]
pub struct LocalStore {
    path: Option<PathBuf>,
    entries: Mutex<BTreeMap<String, Value>>,
}

impl LocalStore {
    /// Store that lives only in memory.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Default store location: `<data dir>/carechat/storage.json`.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::data_dir().map(|d| d.join("carechat").join("storage.json"))
    }

    /// Open a file-backed store. A missing file is an empty store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the file exists but cannot be read or
    /// parsed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(contents) if contents.trim().is_empty() => BTreeMap::new(),
            Ok(contents) => serde_json::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(StoreError::Read { path, source }),
        };
        Ok(Self {
            path: Some(path),
            entries: Mutex::new(entries),
        })
    }

    /// Backing file, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Read a value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries.lock().get(key).cloned()
    }

    /// Read a string value.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<String> {
        self.get(key).and_then(|v| v.as_str().map(str::to_string))
    }

    /// Write a value and persist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Write`] if the file cannot be written. The
    /// in-memory value is updated regardless.
    pub fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let snapshot = {
            let mut entries = self.entries.lock();
            entries.insert(key.to_string(), value);
            entries.clone()
        };
        self.persist(&snapshot)
    }

    /// Remove a value and persist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Write`] if the file cannot be written.
    pub fn remove(&self, key: &str) -> Result<(), StoreError> {
        let snapshot = {
            let mut entries = self.entries.lock();
            if entries.remove(key).is_none() {
                return Ok(());
            }
            entries.clone()
        };
        self.persist(&snapshot)
    }

    /// Credential cached for `kind`.
    #[must_use]
    pub fn credential(&self, kind: PartyType) -> Option<String> {
        self.get_str(&token_key(kind))
    }

    /// Record a signed-in session for `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Write`] if the file cannot be written.
    pub fn set_session(
        &self,
        kind: PartyType,
        profile: Value,
        credential: &str,
    ) -> Result<(), StoreError> {
        let snapshot = {
            let mut entries = self.entries.lock();
            entries.insert(info_key(kind), profile);
            entries.insert(token_key(kind), Value::from(credential));
            entries.clone()
        };
        self.persist(&snapshot)
    }

    /// Forget the session for `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Write`] if the file cannot be written.
    pub fn clear_session(&self, kind: PartyType) -> Result<(), StoreError> {
        let snapshot = {
            let mut entries = self.entries.lock();
            entries.remove(&info_key(kind));
            entries.remove(&token_key(kind));
            entries.clone()
        };
        self.persist(&snapshot)
    }

    /// Whether notification sounds are on. Anything but `false` counts as on.
    #[must_use]
    pub fn sound_enabled(&self) -> bool {
        self.flag(SOUND_ENABLED_KEY)
    }

    /// Turn notification sounds on or off.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Write`] if the file cannot be written.
    pub fn set_sound_enabled(&self, enabled: bool) -> Result<(), StoreError> {
        self.set(SOUND_ENABLED_KEY, Value::from(enabled))
    }

    /// Whether notification vibration is on. Anything but `false` counts as on.
    #[must_use]
    pub fn vibration_enabled(&self) -> bool {
        self.flag(VIBRATION_ENABLED_KEY)
    }

    /// Turn notification vibration on or off.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Write`] if the file cannot be written.
    pub fn set_vibration_enabled(&self, enabled: bool) -> Result<(), StoreError> {
        self.set(VIBRATION_ENABLED_KEY, Value::from(enabled))
    }

    fn flag(&self, key: &str) -> bool {
        match self.get(key) {
            Some(Value::Bool(enabled)) => enabled,
            Some(Value::String(s)) => s != "false",
            _ => true,
        }
    }

    /// Recent searches, most recent first.
    #[must_use]
    pub fn recent_searches(&self) -> Vec<String> {
        self.get(RECENT_SEARCHES_KEY)
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    /// Record a search term, moving it to the front and trimming the list
    /// to [`MAX_RECENT_SEARCHES`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Write`] if the file cannot be written.
    pub fn push_recent_search(&self, term: &str) -> Result<(), StoreError> {
        let term = term.trim();
        if term.is_empty() {
            return Ok(());
        }
        let mut searches = self.recent_searches();
        searches.retain(|s| s != term);
        searches.insert(0, term.to_string());
        searches.truncate(MAX_RECENT_SEARCHES);
        self.set(RECENT_SEARCHES_KEY, Value::from(searches))
    }

    fn persist(&self, entries: &BTreeMap<String, Value>) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let write_err = |source| StoreError::Write {
            path: path.clone(),
            source,
        };

        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir).map_err(write_err)?;
        }
        let bytes = serde_json::to_vec_pretty(entries)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes).map_err(write_err)?;
        std::fs::rename(&tmp, path).map_err(write_err)?;
        tracing::trace!(path = %path.display(), keys = entries.len(), "store persisted");
        Ok(())
    }
}

impl ProfileSource for LocalStore {
    fn profile(&self, kind: PartyType) -> Option<Profile> {
        let record = self.get(&info_key(kind))?;
        Some(Profile::from_record(&record, self.credential(kind)))
    }
}
