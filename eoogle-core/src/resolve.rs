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

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::{
    ChatId, ExternalId, ServiceTag, cache::UsernameCache, registry::LinkRegistry,
    store::StoreError,
};

static MENTION_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^<@!?(\d+)>$").expect("mention pattern is valid"));

/// What a free-form "whose profile?" argument points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Target {
    Account {
        external_id: ExternalId,
        service: ServiceTag,
    },
    /// A chat identity with no link on the requested service.
    Unlinked { chat_id: ChatId },
    /// A name the username cache has never seen.
    UnknownName { name: String },
}

/// Resolve `input` to an external account on `service`.
///
/// Empty input means the author. A chat mention means that identity's link.
/// All-digit input is a chat id if someone with that id is linked, otherwise an
/// external id. Anything else is looked up in the username cache.
pub fn resolve_target(
    registry: &LinkRegistry,
    cache: &UsernameCache,
    input: &str,
    author: &str,
    service: ServiceTag,
) -> Result<Target, StoreError> {
    let input = strip_quotes(input.trim());

    if input.is_empty() {
        return linked_or_unlinked(registry, author, service);
    }
    if let Some(captures) = MENTION_PATTERN.captures(input) {
        return linked_or_unlinked(registry, &captures[1], service);
    }
    if input.bytes().all(|byte| byte.is_ascii_digit()) {
        let external_id = registry
            .get_linked_account(input, Some(service))?
            .unwrap_or_else(|| input.to_string());
        return Ok(Target::Account {
            external_id,
            service,
        });
    }

    Ok(match cache.find_id_by_name(input) {
        Some(external_id) => Target::Account {
            external_id,
            service,
        },
        None => Target::UnknownName {
            name: input.to_string(),
        },
    })
}

fn linked_or_unlinked(
    registry: &LinkRegistry,
    chat_id: &str,
    service: ServiceTag,
) -> Result<Target, StoreError> {
    Ok(match registry.get_linked_account(chat_id, Some(service))? {
        Some(external_id) => Target::Account {
            external_id,
            service,
        },
        None => Target::Unlinked {
            chat_id: chat_id.to_string(),
        },
    })
}

fn strip_quotes(input: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = input
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return inner.trim();
        }
    }
    input
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    fn setup() -> (LinkRegistry, UsernameCache) {
        let store = Store::in_memory();
        (LinkRegistry::new(store.clone()), UsernameCache::new(store))
    }

    fn account(external_id: &str, service: ServiceTag) -> Target {
        Target::Account {
            external_id: external_id.to_string(),
            service,
        }
    }

    #[test]
    fn empty_input_means_author() {
        let (registry, cache) = setup();
        registry
            .create_link("100", "555", ServiceTag::ServiceA)
            .unwrap();

        let target = resolve_target(&registry, &cache, "  ", "100", ServiceTag::ServiceA).unwrap();
        assert_eq!(target, account("555", ServiceTag::ServiceA));

        let other = resolve_target(&registry, &cache, "", "100", ServiceTag::ServiceB).unwrap();
        assert_eq!(
            other,
            Target::Unlinked {
                chat_id: "100".to_string()
            }
        );
    }

    #[test]
    fn mentions_resolve_through_links() {
        let (registry, cache) = setup();
        registry
            .create_link("200", "777", ServiceTag::ServiceB)
            .unwrap();

        for mention in ["<@200>", "<@!200>"] {
            let target =
                resolve_target(&registry, &cache, mention, "1", ServiceTag::ServiceB).unwrap();
            assert_eq!(target, account("777", ServiceTag::ServiceB));
        }
        let unlinked =
            resolve_target(&registry, &cache, "<@300>", "1", ServiceTag::ServiceB).unwrap();
        assert_eq!(
            unlinked,
            Target::Unlinked {
                chat_id: "300".to_string()
            }
        );
    }

    #[test]
    fn digits_prefer_linked_chat_identity() {
        let (registry, cache) = setup();
        registry
            .create_link("200", "777", ServiceTag::ServiceA)
            .unwrap();

        assert_eq!(
            resolve_target(&registry, &cache, "200", "1", ServiceTag::ServiceA).unwrap(),
            account("777", ServiceTag::ServiceA)
        );
        assert_eq!(
            resolve_target(&registry, &cache, "12345", "1", ServiceTag::ServiceA).unwrap(),
            account("12345", ServiceTag::ServiceA)
        );
    }

    #[test]
    fn names_resolve_through_cache_with_quotes_stripped() {
        let (registry, cache) = setup();
        cache.put("42", "Builder Man").unwrap();

        assert_eq!(
            resolve_target(&registry, &cache, "\"builder man\"", "1", ServiceTag::ServiceA)
                .unwrap(),
            account("42", ServiceTag::ServiceA)
        );
        assert_eq!(
            resolve_target(&registry, &cache, "'nobody'", "1", ServiceTag::ServiceA).unwrap(),
            Target::UnknownName {
                name: "nobody".to_string()
            }
        );
    }
}
