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

//! Ownership proof before a link is trusted.
//!
//! A chat identity asks to link an external account and receives a code. The
//! user pastes the code into the account's "about" text, then confirms. The
//! confirmation re-reads the profile and links the account if the code is
//! there and the challenge has not expired. Each chat identity has at most one
//! outstanding challenge; issuing again replaces it.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, de::Error as _};
use serde_json::Value;
use tracing::{info, warn};

use crate::{
    CHALLENGE_TTL_HOURS, ChatId, ExternalId, ServiceTag, VERIFICATION_CODE_PREFIX,
    VERIFICATION_CODE_WORDS,
    profile::{FetchError, ProfileLookup},
    registry,
    store::{Document, Store, StoreError},
};

const CODE_WORDS: &[&str] = &[
    "cat", "dog", "apple", "banana", "ocean", "mountain", "computer", "keyboard", "sunshine",
    "moonlight", "coffee", "pizza", "guitar", "piano", "garden", "whisper", "thunder",
    "lightning", "rainbow", "butterfly", "dragon", "wizard", "unicorn", "castle", "forest",
    "river", "desert", "star", "planet", "comet", "rocket", "alien", "robot", "diamond",
    "emerald", "fire", "ice", "storm", "cloud", "sand", "leaf", "flower", "shadow", "mirror",
    "music", "dance", "magic", "adventure", "treasure", "island", "volcano", "cave", "night",
    "day", "elephant", "penguin", "dolphin", "eagle", "lion", "tiger", "bear", "wolf", "fox",
    "rabbit", "squirrel", "owl", "peacock", "flamingo", "whale", "shark", "turtle", "frog",
    "bee", "spider", "coral", "seaweed", "pebble", "crystal", "amber", "pearl", "shell",
    "feather", "moss", "vine", "bamboo", "smartphone", "tablet", "headphones", "camera",
    "telescope", "microscope", "calculator", "compass", "watch", "bicycle", "skateboard",
    "helicopter", "submarine", "spaceship", "antenna", "satellite", "engine", "chocolate",
    "vanilla", "strawberry", "mango", "pineapple", "coconut", "sandwich", "pasta", "soup",
    "bread", "cheese", "honey", "cinnamon", "lemonade", "smoothie", "pancake", "waffle",
    "cookie", "cupcake", "crimson", "turquoise", "lavender", "golden", "silver", "bronze",
    "scarlet", "violet", "indigo", "magenta", "canvas", "palette", "sculpture", "painting",
    "sketch", "portrait", "landscape", "mosaic", "origami", "breeze", "blizzard", "drizzle",
    "tornado", "hurricane", "mist", "frost", "snowflake", "icicle", "hailstone", "sunrise",
    "sunset", "twilight", "dawn", "phoenix", "griffin", "centaur", "mermaid", "fairy",
    "goblin", "elf", "dwarf", "knight", "princess", "kingdom", "crown", "sword", "shield",
    "potion", "spell", "wand", "portal", "quest", "courage", "wisdom", "kindness", "laughter",
    "serenity", "mystery", "wonder", "harmony", "freedom", "hope", "dream", "memory", "echo",
    "silence", "rhythm", "melody", "symphony", "journey",
];

/// `eoogle-` followed by four uniformly chosen words, joined by `-`.
pub fn generate_code() -> String {
    let mut rng = rand::rng();
    let mut parts = Vec::with_capacity(VERIFICATION_CODE_WORDS + 1);
    parts.push(VERIFICATION_CODE_PREFIX);
    for _ in 0..VERIFICATION_CODE_WORDS {
        parts.push(CODE_WORDS[rng.random_range(0..CODE_WORDS.len())]);
    }
    parts.join("-")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "StoredChallenge")]
pub struct VerificationChallenge {
    pub external_id: ExternalId,
    pub service: ServiceTag,
    pub code: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// On-disk challenge. Older records carry `accountId`/`type`, store the expiry
/// as epoch milliseconds and have no issue time.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredChallenge {
    #[serde(alias = "accountId")]
    external_id: ExternalId,
    #[serde(default, alias = "type")]
    service: ServiceTag,
    code: String,
    #[serde(default)]
    issued_at: Option<DateTime<Utc>>,
    #[serde(deserialize_with = "timestamp_from_rfc3339_or_millis")]
    expires_at: DateTime<Utc>,
}

impl From<StoredChallenge> for VerificationChallenge {
    fn from(stored: StoredChallenge) -> Self {
        Self {
            issued_at: stored
                .issued_at
                .unwrap_or(stored.expires_at - Duration::hours(CHALLENGE_TTL_HOURS)),
            external_id: stored.external_id,
            service: stored.service,
            code: stored.code,
            expires_at: stored.expires_at,
        }
    }
}

fn timestamp_from_rfc3339_or_millis<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(text) => DateTime::parse_from_rfc3339(&text)
            .map(|timestamp| timestamp.with_timezone(&Utc))
            .map_err(D::Error::custom),
        Value::Number(millis) => millis
            .as_i64()
            .and_then(DateTime::from_timestamp_millis)
            .ok_or_else(|| D::Error::custom(format!("timestamp {millis} is out of range"))),
        other => Err(D::Error::custom(format!("expected a timestamp, found {other}"))),
    }
}

impl VerificationChallenge {
    pub fn new(external_id: &str, service: ServiceTag, code: String, now: DateTime<Utc>) -> Self {
        Self {
            external_id: external_id.to_string(),
            service,
            code,
            issued_at: now,
            expires_at: now + Duration::hours(CHALLENGE_TTL_HOURS),
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("already linked to {service} account {external_id}; unlink it first")]
    AlreadyLinked {
        service: ServiceTag,
        external_id: ExternalId,
    },
    #[error("{service} account is already linked to chat user {chat_id}")]
    LinkedElsewhere { service: ServiceTag, chat_id: ChatId },
    #[error("{service} account {external_id} is banned")]
    Banned {
        service: ServiceTag,
        external_id: ExternalId,
    },
    #[error("{service} account {external_id} does not exist")]
    UnknownAccount {
        service: ServiceTag,
        external_id: ExternalId,
    },
    #[error("could not reach the external service: {0}")]
    Unavailable(FetchError),
    #[error("no active verification; start linking again")]
    NoChallenge,
    #[error("verification expired at {expired_at}; start linking again")]
    Expired { expired_at: DateTime<Utc> },
    #[error("verification code not found in the profile's about text")]
    CodeNotFound,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl VerifyError {
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::AlreadyLinked { .. } | Self::LinkedElsewhere { .. }
        )
    }

    /// Failures the user can simply retry later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::CodeNotFound)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IssuedChallenge {
    pub chat_id: ChatId,
    pub external_id: ExternalId,
    pub service: ServiceTag,
    pub display_name: String,
    pub code: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkConfirmed {
    pub chat_id: ChatId,
    pub external_id: ExternalId,
    pub service: ServiceTag,
}

#[derive(Clone)]
pub struct VerificationEngine {
    store: Store,
    lookup: ProfileLookup,
}

impl VerificationEngine {
    pub fn new(store: Store, lookup: ProfileLookup) -> Self {
        Self { store, lookup }
    }

    pub async fn issue(
        &self,
        chat_id: &str,
        external_id: &str,
        service: ServiceTag,
    ) -> Result<IssuedChallenge, VerifyError> {
        self.issue_at(chat_id, external_id, service, Utc::now())
            .await
    }

    pub async fn issue_at(
        &self,
        chat_id: &str,
        external_id: &str,
        service: ServiceTag,
        now: DateTime<Utc>,
    ) -> Result<IssuedChallenge, VerifyError> {
        self.store
            .read(|document| check_linkable(document, chat_id, external_id, service))?;

        let profile = match self.lookup.profile(service, external_id).await {
            Ok(profile) => profile,
            Err(error) if error.is_definitive_missing() => {
                return Err(VerifyError::UnknownAccount {
                    service,
                    external_id: external_id.to_string(),
                });
            }
            Err(error) => {
                warn!(chat_id, external_id, %service, %error, "ban check fetch failed");
                return Err(VerifyError::Unavailable(error));
            }
        };
        if profile.is_banned {
            return Err(VerifyError::Banned {
                service,
                external_id: external_id.to_string(),
            });
        }

        let challenge = VerificationChallenge::new(external_id, service, generate_code(), now);
        let issued = IssuedChallenge {
            chat_id: chat_id.to_string(),
            external_id: external_id.to_string(),
            service,
            display_name: profile.display_name,
            code: challenge.code.clone(),
            expires_at: challenge.expires_at,
        };

        // The fetch above was a suspension point; check again inside the unit.
        self.store.update_if(|document| {
            if let Err(error) = check_linkable(document, chat_id, external_id, service) {
                return (Err(error), false);
            }
            let replaced = document
                .verifications
                .insert(chat_id.to_string(), challenge)
                .is_some();
            (Ok(replaced), true)
        })??;

        info!(chat_id, external_id, %service, expires_at = %issued.expires_at, "verification issued");
        Ok(issued)
    }

    /// The outstanding, unexpired challenge for `chat_id`.
    pub fn pending(&self, chat_id: &str) -> Option<VerificationChallenge> {
        self.pending_at(chat_id, Utc::now())
    }

    pub fn pending_at(&self, chat_id: &str, now: DateTime<Utc>) -> Option<VerificationChallenge> {
        self.store.read(|document| {
            document
                .verifications
                .get(chat_id)
                .filter(|challenge| !challenge.is_expired_at(now))
                .cloned()
        })
    }

    /// Confirmation step: re-read the profile's about text and check it.
    pub async fn submit(&self, chat_id: &str) -> Result<LinkConfirmed, VerifyError> {
        self.submit_at(chat_id, Utc::now()).await
    }

    pub async fn submit_at(
        &self,
        chat_id: &str,
        now: DateTime<Utc>,
    ) -> Result<LinkConfirmed, VerifyError> {
        let challenge = self.live_challenge(chat_id, now)?;

        let profile = self
            .lookup
            .profile(challenge.service, &challenge.external_id)
            .await
            .map_err(|error| {
                warn!(chat_id, external_id = %challenge.external_id, %error, "proof fetch failed");
                VerifyError::Unavailable(error)
            })?;

        self.check_proof_at(chat_id, profile.about(), now)
    }

    pub fn check_proof(&self, chat_id: &str, proof_text: &str) -> Result<LinkConfirmed, VerifyError> {
        self.check_proof_at(chat_id, proof_text, Utc::now())
    }

    /// Link the account if `proof_text` contains the challenge code verbatim.
    /// Linking and consuming the challenge happen in one store unit.
    pub fn check_proof_at(
        &self,
        chat_id: &str,
        proof_text: &str,
        now: DateTime<Utc>,
    ) -> Result<LinkConfirmed, VerifyError> {
        let confirmed = self.store.update_if(|document| {
            let Some(challenge) = document.verifications.get(chat_id).cloned() else {
                return (Err(VerifyError::NoChallenge), false);
            };
            if challenge.is_expired_at(now) {
                document.verifications.remove(chat_id);
                return (
                    Err(VerifyError::Expired {
                        expired_at: challenge.expires_at,
                    }),
                    true,
                );
            }
            if !proof_text.contains(&challenge.code) {
                return (Err(VerifyError::CodeNotFound), false);
            }
            if let Some(owner) =
                registry::owner_of(document, &challenge.external_id, challenge.service)
                    .filter(|owner| owner != chat_id)
            {
                return (
                    Err(VerifyError::LinkedElsewhere {
                        service: challenge.service,
                        chat_id: owner,
                    }),
                    false,
                );
            }

            registry::insert_link(
                document,
                chat_id,
                &challenge.external_id,
                challenge.service,
            );
            document.verifications.remove(chat_id);
            (
                Ok(LinkConfirmed {
                    chat_id: chat_id.to_string(),
                    external_id: challenge.external_id,
                    service: challenge.service,
                }),
                true,
            )
        })??;

        info!(
            chat_id,
            external_id = %confirmed.external_id,
            service = %confirmed.service,
            "verification succeeded; account linked"
        );
        Ok(confirmed)
    }

    /// Load the challenge, purging it if it has expired.
    fn live_challenge(
        &self,
        chat_id: &str,
        now: DateTime<Utc>,
    ) -> Result<VerificationChallenge, VerifyError> {
        self.store.update_if(|document| {
            let Some(challenge) = document.verifications.get(chat_id).cloned() else {
                return (Err(VerifyError::NoChallenge), false);
            };
            if challenge.is_expired_at(now) {
                document.verifications.remove(chat_id);
                info!(chat_id, expired_at = %challenge.expires_at, "purged expired verification");
                return (
                    Err(VerifyError::Expired {
                        expired_at: challenge.expires_at,
                    }),
                    true,
                );
            }
            (Ok(challenge), false)
        })?
    }
}

/// One link per service per chat identity, and one chat identity per external
/// account. Both checks scan the users section.
fn check_linkable(
    document: &Document,
    chat_id: &str,
    external_id: &str,
    service: ServiceTag,
) -> Result<(), VerifyError> {
    if let Some(current) = registry::linked_account(document, chat_id, Some(service)) {
        return Err(VerifyError::AlreadyLinked {
            service,
            external_id: current.external_id,
        });
    }
    if let Some(owner) = registry::owner_of(document, external_id, service) {
        return Err(VerifyError::LinkedElsewhere {
            service,
            chat_id: owner,
        });
    }
    Ok(())
}
