// Copyright (C) 2026 StarHuntingGames
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Durable document holding every link, pending challenge and cached name.
//!
//! All access goes through [`Store`], which turns each logical operation into
//! one load-modify-save unit. Nothing awaits while a unit is open, so units
//! never interleave.

use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    ChatId, cache::CacheSection, registry::StoredLink, verification::VerificationChallenge,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    #[serde(default)]
    pub users: BTreeMap<ChatId, StoredLink>,
    #[serde(default)]
    pub verifications: BTreeMap<ChatId, VerificationChallenge>,
    #[serde(default)]
    pub username_cache: CacheSection,
}

impl Document {
    /// Build a document from arbitrary JSON, keeping every well-formed entry.
    ///
    /// A value that is not an object yields an empty document. Entries that do
    /// not decode are dropped with a warning instead of discarding their
    /// whole section.
    pub fn from_value(value: Value) -> Self {
        let Value::Object(mut root) = value else {
            warn!("document root is not an object; starting from an empty document");
            return Self::default();
        };

        let users = decode_section::<StoredLink>(root.remove("users"), "users");
        let verifications =
            decode_section::<VerificationChallenge>(root.remove("verifications"), "verifications");
        let username_cache = match root.remove("usernameCache") {
            Some(Value::Object(entries)) => CacheSection::from_map(entries),
            Some(Value::Null) | None => CacheSection::default(),
            Some(_) => {
                warn!("usernameCache is not an object; dropping it");
                CacheSection::default()
            }
        };

        Self {
            users,
            verifications,
            username_cache,
        }
    }
}

fn decode_section<T: serde::de::DeserializeOwned>(
    value: Option<Value>,
    section: &str,
) -> BTreeMap<String, T> {
    let entries = match value {
        Some(Value::Object(entries)) => entries,
        Some(Value::Null) | None => return BTreeMap::new(),
        Some(_) => {
            warn!(section, "document section is not an object; dropping it");
            return BTreeMap::new();
        }
    };

    let mut decoded = BTreeMap::new();
    for (key, entry) in entries {
        match serde_json::from_value::<T>(entry) {
            Ok(entry) => {
                decoded.insert(key, entry);
            }
            Err(error) => {
                warn!(section, key = %key, error = %error, "dropping undecodable document entry");
            }
        }
    }
    decoded
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to encode document: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to write document to {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Backing storage for the document. Loading never fails: anything that
/// cannot be read comes back as an empty document.
pub trait DocumentStore: Send + Sync {
    fn load(&self) -> Document;
    fn save(&self, document: &Document) -> Result<(), StoreError>;
}

/// Pretty-printed JSON file, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    /// Open the store at `path`, writing an empty document if none exists yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let store = Self { path: path.into() };
        if let Some(parent) = store
            .path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
        {
            fs::create_dir_all(parent).map_err(|source| StoreError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        if !store.path.exists() {
            debug!(path = %store.path.display(), "initialising empty document");
            store.save(&Document::default())?;
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl DocumentStore for JsonFileStore {
    fn load(&self) -> Document {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "document missing; using empty document");
                return Document::default();
            }
            Err(error) => {
                warn!(path = %self.path.display(), error = %error, "failed to read document; using empty document");
                return Document::default();
            }
        };

        match serde_json::from_str::<Value>(&raw) {
            Ok(value) => Document::from_value(value),
            Err(error) => {
                warn!(path = %self.path.display(), error = %error, "document is not valid JSON; using empty document");
                Document::default()
            }
        }
    }

    fn save(&self, document: &Document) -> Result<(), StoreError> {
        let encoded = serde_json::to_vec_pretty(document)?;
        let temp_path = self.temp_path();
        fs::write(&temp_path, encoded).map_err(|source| StoreError::Write {
            path: temp_path.clone(),
            source,
        })?;
        fs::rename(&temp_path, &self.path).map_err(|source| StoreError::Write {
            path: self.path.clone(),
            source,
        })
    }
}

/// Document kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    document: Mutex<Document>,
    saves: Mutex<usize>,
}

impl MemoryStore {
    pub fn with_document(document: Document) -> Self {
        Self {
            document: Mutex::new(document),
            saves: Mutex::new(0),
        }
    }

    /// Number of completed saves.
    pub fn save_count(&self) -> usize {
        *lock(&self.saves)
    }
}

impl DocumentStore for MemoryStore {
    fn load(&self) -> Document {
        lock(&self.document).clone()
    }

    fn save(&self, document: &Document) -> Result<(), StoreError> {
        *lock(&self.document) = document.clone();
        *lock(&self.saves) += 1;
        Ok(())
    }
}

/// Shared handle that serialises read-modify-write units over a backend.
#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn DocumentStore>,
    unit: Arc<Mutex<()>>,
}

impl Store {
    pub fn new(backend: Arc<dyn DocumentStore>) -> Self {
        Self {
            backend,
            unit: Arc::new(Mutex::new(())),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::default()))
    }

    pub fn load(&self) -> Document {
        let _unit = lock(&self.unit);
        self.backend.load()
    }

    pub fn read<R>(&self, f: impl FnOnce(&Document) -> R) -> R {
        let _unit = lock(&self.unit);
        let document = self.backend.load();
        f(&document)
    }

    /// Run `f` against the current document and save the result.
    pub fn update<R>(&self, f: impl FnOnce(&mut Document) -> R) -> Result<R, StoreError> {
        self.update_if(|document| (f(document), true))
    }

    /// Like [`Store::update`], but only saves when `f` reports a change.
    pub fn update_if<R>(
        &self,
        f: impl FnOnce(&mut Document) -> (R, bool),
    ) -> Result<R, StoreError> {
        let _unit = lock(&self.unit);
        let mut document = self.backend.load();
        let (result, changed) = f(&mut document);
        if changed {
            self.backend.save(&document)?;
        }
        Ok(result)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
