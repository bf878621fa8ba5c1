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

use std::{fmt, sync::LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

pub mod cache;
pub mod ingest;
pub mod profile;
pub mod registry;
pub mod resolve;
pub mod retry;
pub mod store;
pub mod verification;

pub const CHALLENGE_TTL_HOURS: i64 = 24;
pub const VERIFICATION_CODE_PREFIX: &str = "eoogle";
pub const VERIFICATION_CODE_WORDS: usize = 4;
pub const MAX_INGEST_SPAN: u64 = 10_000;
pub const DEFAULT_INGEST_BATCH_SIZE: usize = 100;
pub const DEFAULT_INGEST_BATCH_DELAY_SECONDS: u64 = 5;
pub const MAX_REPORTED_FAILED_IDS: usize = 100;
pub const DEFAULT_CACHE_PAGE_SIZE: usize = 50;

/// All external services a chat identity can link to.
pub const ALL_SERVICES: [ServiceTag; 2] = [ServiceTag::ServiceA, ServiceTag::ServiceB];

/// Identifier the chat platform assigns to an end user.
pub type ChatId = String;
/// Account identifier on one of the external services.
pub type ExternalId = String;

/// External revival service an account lives on.
///
/// The aliases accept documents written before the services were renamed.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[serde(rename_all = "camelCase")]
pub enum ServiceTag {
    #[default]
    #[serde(alias = "ecsr")]
    ServiceA,
    #[serde(alias = "korone")]
    ServiceB,
}

impl ServiceTag {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ServiceA => "serviceA",
            Self::ServiceB => "serviceB",
        }
    }

    /// Parse a user-supplied service name. Accepts the wire names and their
    /// short forms, case-insensitively.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "servicea" | "a" | "ecsr" => Some(Self::ServiceA),
            "serviceb" | "b" | "korone" => Some(Self::ServiceB),
            _ => None,
        }
    }
}

impl fmt::Display for ServiceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("env var pattern is valid")
});

/// Replace `${VAR_NAME}` patterns in a string with values from environment variables.
/// Unknown or unset variables are replaced with an empty string.
pub fn expand_env_vars(input: &str) -> String {
    ENV_VAR_PATTERN
        .replace_all(input, |caps: &regex::Captures| {
            let var_name = &caps[1];
            std::env::var(var_name).unwrap_or_default()
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_tag_uses_camel_case_wire_names() {
        assert_eq!(
            serde_json::to_string(&ServiceTag::ServiceA).unwrap(),
            "\"serviceA\""
        );
        assert_eq!(
            serde_json::to_string(&ServiceTag::ServiceB).unwrap(),
            "\"serviceB\""
        );
    }

    #[test]
    fn service_tag_accepts_former_service_names() {
        let a: ServiceTag = serde_json::from_str("\"ecsr\"").unwrap();
        let b: ServiceTag = serde_json::from_str("\"korone\"").unwrap();
        assert_eq!(a, ServiceTag::ServiceA);
        assert_eq!(b, ServiceTag::ServiceB);
    }

    #[test]
    fn service_tag_parse_is_case_insensitive() {
        assert_eq!(ServiceTag::parse(" ServiceB "), Some(ServiceTag::ServiceB));
        assert_eq!(ServiceTag::parse("A"), Some(ServiceTag::ServiceA));
        assert_eq!(ServiceTag::parse("serviceC"), None);
    }

    #[test]
    fn expand_env_vars_replaces_unset_with_empty() {
        let expanded = expand_env_vars("url=${EOOGLE_CORE_TEST_SURELY_UNSET_VAR}/x");
        assert_eq!(expanded, "url=/x");
    }

    #[test]
    fn expand_env_vars_leaves_plain_text_alone() {
        assert_eq!(expand_env_vars("no vars here $HOME"), "no vars here $HOME");
    }
}
