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

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    ExternalId,
    store::{Store, StoreError},
};

/// The `usernameCache` section: external id to last seen display name, in
/// first-insertion order. Values that are not strings are ignored on read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheSection(Map<String, Value>);

impl CacheSection {
    pub fn from_map(entries: Map<String, Value>) -> Self {
        Self(entries)
    }

    /// Returns `true` when the stored name changed.
    pub fn put(&mut self, id: &str, name: &str) -> bool {
        if self.get(id) == Some(name) {
            return false;
        }
        self.0.insert(id.to_string(), Value::String(name.to_string()));
        true
    }

    pub fn get(&self, id: &str) -> Option<&str> {
        self.0.get(id).and_then(Value::as_str)
    }

    pub fn find_id_by_name(&self, name: &str) -> Option<&str> {
        let wanted = name.to_lowercase();
        self.entries()
            .find(|(_, cached)| cached.to_lowercase() == wanted)
            .map(|(id, _)| id)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0
            .iter()
            .filter_map(|(id, name)| name.as_str().map(|name| (id.as_str(), name)))
    }

    pub fn len(&self) -> usize {
        self.entries().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) -> usize {
        let cleared = self.len();
        self.0.clear();
        cleared
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CachedName {
    pub id: ExternalId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CachePage {
    pub page: usize,
    pub page_count: usize,
    pub page_size: usize,
    pub total: usize,
    pub entries: Vec<CachedName>,
}

/// Memo of display names observed on any profile fetch, used to turn a typed
/// username back into an external id.
#[derive(Clone)]
pub struct UsernameCache {
    store: Store,
}

impl UsernameCache {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Upsert a name. Blank ids or names are ignored.
    pub fn put(&self, id: &str, name: &str) -> Result<(), StoreError> {
        let (id, name) = (id.trim(), name.trim());
        if id.is_empty() || name.is_empty() {
            return Ok(());
        }
        self.store.update_if(|document| {
            let changed = document.username_cache.put(id, name);
            ((), changed)
        })
    }

    pub fn get(&self, id: &str) -> Option<String> {
        self.store
            .read(|document| document.username_cache.get(id).map(str::to_string))
    }

    /// Case-insensitive exact match; the first entry in stored order wins.
    pub fn find_id_by_name(&self, name: &str) -> Option<ExternalId> {
        self.store.read(|document| {
            document
                .username_cache
                .find_id_by_name(name)
                .map(str::to_string)
        })
    }

    /// Wipe the cache, returning how many names were dropped.
    pub fn clear(&self) -> Result<usize, StoreError> {
        self.store.update_if(|document| {
            let cleared = document.username_cache.clear();
            (cleared, true)
        })
    }

    pub fn list(&self) -> Vec<CachedName> {
        self.store.read(|document| {
            document
                .username_cache
                .entries()
                .map(|(id, name)| CachedName {
                    id: id.to_string(),
                    name: name.to_string(),
                })
                .collect()
        })
    }

    pub fn len(&self) -> usize {
        self.store.read(|document| document.username_cache.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One page of [`UsernameCache::list`]. `page` is 1-based and clamped into
    /// the valid range; an empty cache still has one (empty) page.
    pub fn page(&self, page: usize, page_size: usize) -> CachePage {
        let page_size = page_size.max(1);
        let entries = self.list();
        let total = entries.len();
        let page_count = total.div_ceil(page_size).max(1);
        let page = page.clamp(1, page_count);
        let entries = entries
            .into_iter()
            .skip((page - 1) * page_size)
            .take(page_size)
            .collect();

        CachePage {
            page,
            page_count,
            page_size,
            total,
            entries,
        }
    }
}
