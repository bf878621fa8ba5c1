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

//! Chat identity to external account links.
//!
//! Records written by the first schema are a bare external id (implicitly
//! `serviceA`). They are upgraded to [`LinkMap`] at this boundary, the first
//! time they are read, and the upgraded form is saved straight away.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    ALL_SERVICES, ChatId, ExternalId, ServiceTag,
    store::{Document, Store, StoreError},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoredLink {
    Legacy(ExternalId),
    Linked(LinkMap),
}

impl StoredLink {
    /// Total, idempotent conversion to the current schema.
    pub fn upgrade(self) -> LinkMap {
        match self {
            Self::Legacy(external_id) => LinkMap::single(ServiceTag::ServiceA, external_id),
            Self::Linked(map) => map,
        }
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self, Self::Legacy(_))
    }

    /// External id for `service`, reading legacy records as `serviceA`.
    pub fn get(&self, service: ServiceTag) -> Option<&str> {
        match self {
            Self::Legacy(external_id) => {
                (service == ServiceTag::ServiceA).then_some(external_id.as_str())
            }
            Self::Linked(map) => map.get(service),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkMap {
    #[serde(default, alias = "ecsr", skip_serializing_if = "Option::is_none")]
    pub service_a: Option<ExternalId>,
    #[serde(default, alias = "korone", skip_serializing_if = "Option::is_none")]
    pub service_b: Option<ExternalId>,
    /// Most recently linked service.
    #[serde(default, alias = "type")]
    pub primary_service: ServiceTag,
}

impl LinkMap {
    pub fn single(service: ServiceTag, external_id: impl Into<ExternalId>) -> Self {
        let mut map = Self::default();
        map.set(service, external_id);
        map
    }

    pub fn get(&self, service: ServiceTag) -> Option<&str> {
        match service {
            ServiceTag::ServiceA => self.service_a.as_deref(),
            ServiceTag::ServiceB => self.service_b.as_deref(),
        }
    }

    pub fn primary(&self) -> Option<&str> {
        self.get(self.primary_service)
    }

    /// Link `service` and make it the primary service.
    pub fn set(&mut self, service: ServiceTag, external_id: impl Into<ExternalId>) {
        let slot = self.slot(service);
        *slot = Some(external_id.into());
        self.primary_service = service;
    }

    /// Unlink `service`. When it was the primary, the remaining service (if
    /// any) becomes primary.
    pub fn remove(&mut self, service: ServiceTag) -> Option<ExternalId> {
        let removed = self.slot(service).take();
        if self.primary_service == service {
            let remaining = self.linked().next().map(|(remaining, _)| remaining);
            if let Some(remaining) = remaining {
                self.primary_service = remaining;
            }
        }
        removed
    }

    pub fn linked(&self) -> impl Iterator<Item = (ServiceTag, &str)> {
        ALL_SERVICES
            .into_iter()
            .filter_map(|service| self.get(service).map(|id| (service, id)))
    }

    pub fn is_empty(&self) -> bool {
        self.linked().next().is_none()
    }

    fn slot(&mut self, service: ServiceTag) -> &mut Option<ExternalId> {
        match service {
            ServiceTag::ServiceA => &mut self.service_a,
            ServiceTag::ServiceB => &mut self.service_b,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkedAccount {
    pub service: ServiceTag,
    pub external_id: ExternalId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkedUser {
    pub chat_id: ChatId,
    pub service: ServiceTag,
    pub external_id: ExternalId,
}

/// Upgrade the record for `chat_id` in place. Returns `true` if it changed.
pub fn migrate_record(document: &mut Document, chat_id: &str) -> bool {
    let Some(record) = document.users.get_mut(chat_id) else {
        return false;
    };
    if !record.is_legacy() {
        return false;
    }

    let upgraded = record.clone().upgrade();
    *record = StoredLink::Linked(upgraded);
    info!(chat_id, "upgraded legacy link record");
    true
}

/// The linked account for `service`, or for the primary service when `None`.
pub fn linked_account(
    document: &Document,
    chat_id: &str,
    service: Option<ServiceTag>,
) -> Option<LinkedAccount> {
    let record = document.users.get(chat_id)?;
    let service = match (service, record) {
        (Some(service), _) => service,
        (None, StoredLink::Legacy(_)) => ServiceTag::ServiceA,
        (None, StoredLink::Linked(map)) => map.primary_service,
    };
    record.get(service).map(|external_id| LinkedAccount {
        service,
        external_id: external_id.to_string(),
    })
}

/// Linear scan for the chat identity holding `external_id` on `service`.
pub fn owner_of(document: &Document, external_id: &str, service: ServiceTag) -> Option<ChatId> {
    document
        .users
        .iter()
        .find(|(_, record)| record.get(service) == Some(external_id))
        .map(|(chat_id, _)| chat_id.clone())
}

pub fn insert_link(document: &mut Document, chat_id: &str, external_id: &str, service: ServiceTag) {
    let mut record = document
        .users
        .remove(chat_id)
        .map(StoredLink::upgrade)
        .unwrap_or_default();
    record.set(service, external_id);
    document
        .users
        .insert(chat_id.to_string(), StoredLink::Linked(record));
}

/// Remove one service's link, or the whole record when `service` is `None`.
/// A record left with no links is deleted.
pub fn remove_link(
    document: &mut Document,
    chat_id: &str,
    service: Option<ServiceTag>,
) -> Vec<LinkedAccount> {
    let Some(record) = document.users.remove(chat_id) else {
        return Vec::new();
    };
    let mut record = record.upgrade();

    let removed = match service {
        Some(service) => record
            .remove(service)
            .map(|external_id| LinkedAccount {
                service,
                external_id,
            })
            .into_iter()
            .collect(),
        None => {
            let removed = record
                .linked()
                .map(|(service, external_id)| LinkedAccount {
                    service,
                    external_id: external_id.to_string(),
                })
                .collect();
            record = LinkMap::default();
            removed
        }
    };

    if !record.is_empty() {
        document
            .users
            .insert(chat_id.to_string(), StoredLink::Linked(record));
    }
    removed
}

/// Store-backed registry. Absence is `None` or empty, never an error; only a
/// failed save surfaces as [`StoreError`].
#[derive(Clone)]
pub struct LinkRegistry {
    store: Store,
}

impl LinkRegistry {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn get_linked_account(
        &self,
        chat_id: &str,
        service: Option<ServiceTag>,
    ) -> Result<Option<ExternalId>, StoreError> {
        Ok(self
            .linked_account(chat_id, service)?
            .map(|account| account.external_id))
    }

    /// Like [`LinkRegistry::get_linked_account`], also reporting which service
    /// answered.
    pub fn linked_account(
        &self,
        chat_id: &str,
        service: Option<ServiceTag>,
    ) -> Result<Option<LinkedAccount>, StoreError> {
        self.store.update_if(|document| {
            let migrated = migrate_record(document, chat_id);
            (linked_account(document, chat_id, service), migrated)
        })
    }

    pub fn create_link(
        &self,
        chat_id: &str,
        external_id: &str,
        service: ServiceTag,
    ) -> Result<(), StoreError> {
        self.store
            .update(|document| insert_link(document, chat_id, external_id, service))?;
        info!(chat_id, external_id, %service, "account linked");
        Ok(())
    }

    pub fn remove_link(
        &self,
        chat_id: &str,
        service: Option<ServiceTag>,
    ) -> Result<Vec<LinkedAccount>, StoreError> {
        let removed = self.store.update_if(|document| {
            let removed = remove_link(document, chat_id, service);
            let changed = !removed.is_empty();
            (removed, changed)
        })?;
        if !removed.is_empty() {
            info!(chat_id, removed = removed.len(), "account unlinked");
        }
        Ok(removed)
    }

    pub fn find_chat_id_by_external_id(
        &self,
        external_id: &str,
        service: ServiceTag,
    ) -> Option<ChatId> {
        self.store
            .read(|document| owner_of(document, external_id, service))
    }

    /// Every link, one row per linked service.
    pub fn linked_users(&self) -> Vec<LinkedUser> {
        self.store.read(|document| {
            document
                .users
                .iter()
                .flat_map(|(chat_id, record)| {
                    ALL_SERVICES.into_iter().filter_map(move |service| {
                        record.get(service).map(|external_id| LinkedUser {
                            chat_id: chat_id.clone(),
                            service,
                            external_id: external_id.to_string(),
                        })
                    })
                })
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::store::{DocumentStore, MemoryStore};

    fn legacy_store(chat_id: &str, external_id: &str) -> (Arc<MemoryStore>, LinkRegistry) {
        let mut document = Document::default();
        document.users.insert(
            chat_id.to_string(),
            StoredLink::Legacy(external_id.to_string()),
        );
        let backend = Arc::new(MemoryStore::with_document(document));
        let registry = LinkRegistry::new(Store::new(backend.clone()));
        (backend, registry)
    }

    #[test]
    fn upgrade_is_idempotent() {
        let legacy = StoredLink::Legacy("42".to_string());
        let once = legacy.upgrade();
        let twice = StoredLink::Linked(once.clone()).upgrade();

        assert_eq!(once, twice);
        assert_eq!(once.service_a.as_deref(), Some("42"));
        assert_eq!(once.service_b, None);
        assert_eq!(once.primary_service, ServiceTag::ServiceA);
    }

    #[test]
    fn legacy_record_is_upgraded_and_persisted_on_read() {
        let (backend, registry) = legacy_store("U1", "42");

        let linked = registry.get_linked_account("U1", None).unwrap();
        assert_eq!(linked.as_deref(), Some("42"));
        assert_eq!(backend.save_count(), 1);
        assert_eq!(
            backend.load().users.get("U1"),
            Some(&StoredLink::Linked(LinkMap::single(ServiceTag::ServiceA, "42")))
        );

        let again = registry
            .get_linked_account("U1", Some(ServiceTag::ServiceA))
            .unwrap();
        assert_eq!(again.as_deref(), Some("42"));
        assert_eq!(backend.save_count(), 1, "second read must not save again");
    }

    #[test]
    fn legacy_record_has_no_service_b_link() {
        let (_, registry) = legacy_store("U1", "42");
        assert_eq!(
            registry
                .get_linked_account("U1", Some(ServiceTag::ServiceB))
                .unwrap(),
            None
        );
    }

    #[test]
    fn map_form_with_older_field_names_decodes() {
        let record: StoredLink =
            serde_json::from_value(serde_json::json!({"ecsr": "5", "korone": "9", "type": "korone"}))
                .unwrap();
        let map = record.upgrade();
        assert_eq!(map.service_a.as_deref(), Some("5"));
        assert_eq!(map.service_b.as_deref(), Some("9"));
        assert_eq!(map.primary_service, ServiceTag::ServiceB);
    }

    #[test]
    fn map_form_serialises_with_primary_service() {
        let map = LinkMap::single(ServiceTag::ServiceB, "9");
        let value = serde_json::to_value(StoredLink::Linked(map)).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"serviceB": "9", "primaryService": "serviceB"})
        );
    }

    #[test]
    fn create_link_updates_primary_service() {
        let registry = LinkRegistry::new(Store::in_memory());
        registry
            .create_link("U1", "100", ServiceTag::ServiceA)
            .unwrap();
        registry
            .create_link("U1", "200", ServiceTag::ServiceB)
            .unwrap();

        assert_eq!(
            registry.get_linked_account("U1", None).unwrap().as_deref(),
            Some("200")
        );
        assert_eq!(
            registry
                .get_linked_account("U1", Some(ServiceTag::ServiceA))
                .unwrap()
                .as_deref(),
            Some("100")
        );
    }

    #[test]
    fn remove_single_service_keeps_the_other() {
        let registry = LinkRegistry::new(Store::in_memory());
        registry
            .create_link("U1", "100", ServiceTag::ServiceA)
            .unwrap();
        registry
            .create_link("U1", "200", ServiceTag::ServiceB)
            .unwrap();

        let removed = registry
            .remove_link("U1", Some(ServiceTag::ServiceB))
            .unwrap();
        assert_eq!(
            removed,
            vec![LinkedAccount {
                service: ServiceTag::ServiceB,
                external_id: "200".to_string()
            }]
        );
        let primary = registry.linked_account("U1", None).unwrap().unwrap();
        assert_eq!(primary.service, ServiceTag::ServiceA);
        assert_eq!(primary.external_id, "100");
    }

    #[test]
    fn remove_without_service_drops_whole_record() {
        let registry = LinkRegistry::new(Store::in_memory());
        registry
            .create_link("U1", "100", ServiceTag::ServiceA)
            .unwrap();
        registry
            .create_link("U1", "200", ServiceTag::ServiceB)
            .unwrap();

        let removed = registry.remove_link("U1", None).unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(registry.get_linked_account("U1", None).unwrap(), None);
        assert!(registry.linked_users().is_empty());
    }

    #[test]
    fn removing_last_service_deletes_record() {
        let registry = LinkRegistry::new(Store::in_memory());
        registry
            .create_link("U1", "100", ServiceTag::ServiceA)
            .unwrap();
        registry
            .remove_link("U1", Some(ServiceTag::ServiceA))
            .unwrap();

        assert!(registry.linked_users().is_empty());
        assert!(registry.remove_link("U1", None).unwrap().is_empty());
    }

    #[test]
    fn find_chat_id_scans_legacy_and_map_records() {
        let (_, registry) = legacy_store("U1", "42");
        registry
            .create_link("U2", "43", ServiceTag::ServiceB)
            .unwrap();

        assert_eq!(
            registry
                .find_chat_id_by_external_id("42", ServiceTag::ServiceA)
                .as_deref(),
            Some("U1")
        );
        assert_eq!(
            registry
                .find_chat_id_by_external_id("43", ServiceTag::ServiceB)
                .as_deref(),
            Some("U2")
        );
        assert_eq!(
            registry.find_chat_id_by_external_id("43", ServiceTag::ServiceA),
            None
        );
    }

    #[test]
    fn linked_users_lists_one_row_per_service() {
        let registry = LinkRegistry::new(Store::in_memory());
        registry
            .create_link("U1", "100", ServiceTag::ServiceA)
            .unwrap();
        registry
            .create_link("U1", "200", ServiceTag::ServiceB)
            .unwrap();
        registry
            .create_link("U2", "300", ServiceTag::ServiceA)
            .unwrap();

        let users = registry.linked_users();
        assert_eq!(users.len(), 3);
        assert!(users.contains(&LinkedUser {
            chat_id: "U2".to_string(),
            service: ServiceTag::ServiceA,
            external_id: "300".to_string(),
        }));
    }
}
