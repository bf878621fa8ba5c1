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

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize, de::DeserializeOwned};
use serde_json::Value;
use tracing::{debug, warn};

use crate::{ExternalId, ServiceTag, cache::UsernameCache};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("account does not exist (status {0})")]
    NotFound(u16),
    #[error("service returned an HTML page instead of JSON (status {0})")]
    Html(u16),
    #[error("service returned status {0}")]
    Status(u16),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("request failed: {0}")]
    Network(String),
}

impl FetchError {
    /// `true` only for a definitive "this account does not exist" answer.
    pub fn is_definitive_missing(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Public profile as returned by `GET /users/{id}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    #[serde(default, deserialize_with = "id_from_number_or_string")]
    pub id: ExternalId,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_banned: bool,
    #[serde(default)]
    pub is_verified: bool,
    #[serde(default)]
    pub is_staff: bool,
    #[serde(default)]
    pub created: Option<String>,
    #[serde(default)]
    pub place_visits: Option<u64>,
    #[serde(default)]
    pub forum_posts: Option<u64>,
}

impl UserProfile {
    /// The `(id, displayName)` pair worth caching, if both are present.
    pub fn cache_entry(&self) -> Option<(&str, &str)> {
        let id = self.id.trim();
        let name = self.display_name.trim();
        (!id.is_empty() && !name.is_empty()).then_some((id, name))
    }

    pub fn about(&self) -> &str {
        self.description.as_deref().unwrap_or_default()
    }
}

fn id_from_number_or_string<'de, D>(deserializer: D) -> Result<ExternalId, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(id) => id,
        Value::Number(id) => id.to_string(),
        _ => String::new(),
    })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FollowCounts {
    pub followers: u64,
    pub followings: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Badge {
    Banned,
    Verified,
    Staff,
    BuildersClub,
    TurboBuildersClub,
    OutrageousBuildersClub,
}

impl Badge {
    pub fn for_membership(level: u8) -> Option<Self> {
        match level {
            1 => Some(Self::BuildersClub),
            2 => Some(Self::TurboBuildersClub),
            3 => Some(Self::OutrageousBuildersClub),
            _ => None,
        }
    }
}

/// Everything a profile view needs. Auxiliary lookups that failed are left at
/// their neutral defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProfileCard {
    pub service: ServiceTag,
    pub profile: UserProfile,
    pub membership_level: u8,
    pub headshot_url: Option<String>,
    pub follow_counts: FollowCounts,
}

impl ProfileCard {
    pub fn badges(&self) -> Vec<Badge> {
        let mut badges = Vec::new();
        if self.profile.is_banned {
            badges.push(Badge::Banned);
        }
        if self.profile.is_verified {
            badges.push(Badge::Verified);
        }
        if self.profile.is_staff {
            badges.push(Badge::Staff);
        }
        badges.extend(Badge::for_membership(self.membership_level));
        badges
    }
}

/// The external services' HTTP APIs, keyed by service and account id.
#[async_trait]
pub trait ProfileSource: Send + Sync {
    async fn fetch_profile(&self, service: ServiceTag, id: &str)
    -> Result<UserProfile, FetchError>;
    async fn fetch_membership(&self, service: ServiceTag, id: &str) -> Result<u8, FetchError>;
    async fn fetch_headshot(
        &self,
        service: ServiceTag,
        id: &str,
    ) -> Result<Option<String>, FetchError>;
    async fn fetch_follow_counts(
        &self,
        service: ServiceTag,
        id: &str,
    ) -> Result<FollowCounts, FetchError>;
    /// Names newest first; the first entry is the current name.
    async fn fetch_username_history(
        &self,
        service: ServiceTag,
        id: &str,
    ) -> Result<Vec<String>, FetchError>;
}

/// Turn a raw HTTP response into `T`.
///
/// 404 and 400 mean the account does not exist. An HTML body (by content type
/// or by sniffing) is a challenge or error page, reported as
/// [`FetchError::Html`] rather than a parse failure.
pub fn decode_response<T: DeserializeOwned>(
    status: u16,
    html_content_type: bool,
    body: &str,
) -> Result<T, FetchError> {
    if status == 404 || status == 400 {
        return Err(FetchError::NotFound(status));
    }
    if html_content_type || looks_like_html(body) {
        return Err(FetchError::Html(status));
    }
    if !(200..300).contains(&status) {
        return Err(FetchError::Status(status));
    }
    serde_json::from_str(body).map_err(|error| FetchError::Malformed(error.to_string()))
}

pub fn looks_like_html(body: &str) -> bool {
    body.trim_start().starts_with('<')
}

/// Membership endpoints answer with a bare level, a boolean, or an object
/// carrying the level.
pub fn membership_level(value: &Value) -> u8 {
    match value {
        Value::Number(level) => level
            .as_u64()
            .map(|level| level.min(u64::from(u8::MAX)) as u8)
            .unwrap_or(0),
        Value::Bool(true) => 1,
        Value::String(level) => level.trim().parse().unwrap_or(0),
        Value::Object(fields) => fields
            .get("membershipType")
            .or_else(|| fields.get("level"))
            .map(membership_level)
            .unwrap_or(0),
        _ => 0,
    }
}

/// Profile fetches that feed the username cache on the way through.
#[derive(Clone)]
pub struct ProfileLookup {
    source: Arc<dyn ProfileSource>,
    cache: UsernameCache,
}

impl ProfileLookup {
    pub fn new(source: Arc<dyn ProfileSource>, cache: UsernameCache) -> Self {
        Self { source, cache }
    }

    pub fn source(&self) -> Arc<dyn ProfileSource> {
        self.source.clone()
    }

    pub async fn profile(
        &self,
        service: ServiceTag,
        id: &str,
    ) -> Result<UserProfile, FetchError> {
        let profile = self.source.fetch_profile(service, id).await?;
        self.remember(&profile);
        Ok(profile)
    }

    /// Profile plus membership, headshot and follow counts, fetched together.
    /// Only a failed profile fetch fails the card.
    pub async fn card(&self, service: ServiceTag, id: &str) -> Result<ProfileCard, FetchError> {
        let (profile, membership, headshot, follow_counts) = tokio::join!(
            self.source.fetch_profile(service, id),
            self.source.fetch_membership(service, id),
            self.source.fetch_headshot(service, id),
            self.source.fetch_follow_counts(service, id),
        );
        let profile = profile?;
        self.remember(&profile);

        Ok(ProfileCard {
            service,
            profile,
            membership_level: membership
                .inspect_err(|error| debug!(%service, id, %error, "membership lookup failed"))
                .unwrap_or(0),
            headshot_url: headshot
                .inspect_err(|error| debug!(%service, id, %error, "headshot lookup failed"))
                .unwrap_or(None),
            follow_counts: follow_counts
                .inspect_err(|error| debug!(%service, id, %error, "follow count lookup failed"))
                .unwrap_or_default(),
        })
    }

    pub async fn username_history(
        &self,
        service: ServiceTag,
        id: &str,
    ) -> Result<Vec<String>, FetchError> {
        self.source.fetch_username_history(service, id).await
    }

    fn remember(&self, profile: &UserProfile) {
        if let Some((id, name)) = profile.cache_entry() {
            if let Err(error) = self.cache.put(id, name) {
                warn!(id, error = %error, "failed to cache username");
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::{testing::*, *};
    use crate::store::Store;

    #[test]
    fn profile_accepts_numeric_id() {
        let profile: UserProfile = serde_json::from_str(
            r#"{"id": 42, "displayName": "Alice", "isBanned": true, "placeVisits": 3}"#,
        )
        .unwrap();
        assert_eq!(profile.id, "42");
        assert_eq!(profile.display_name, "Alice");
        assert!(profile.is_banned);
        assert_eq!(profile.place_visits, Some(3));
        assert_eq!(profile.about(), "");
    }

    #[test]
    fn cache_entry_requires_id_and_name() {
        assert_eq!(profile("1", "Alice").cache_entry(), Some(("1", "Alice")));
        assert_eq!(profile("1", "").cache_entry(), None);
        assert_eq!(profile("", "Alice").cache_entry(), None);
    }

    #[test]
    fn decode_treats_400_and_404_as_missing() {
        let missing = decode_response::<UserProfile>(404, false, "{}").unwrap_err();
        assert!(missing.is_definitive_missing());
        let bad_request = decode_response::<UserProfile>(400, true, "<html>").unwrap_err();
        assert_eq!(bad_request, FetchError::NotFound(400));
    }

    #[test]
    fn decode_detects_html_pages() {
        let by_sniff =
            decode_response::<UserProfile>(200, false, "  <!DOCTYPE html><html></html>").unwrap_err();
        assert_eq!(by_sniff, FetchError::Html(200));
        let by_header = decode_response::<UserProfile>(503, true, "Just a moment").unwrap_err();
        assert_eq!(by_header, FetchError::Html(503));
        assert!(!by_header.is_definitive_missing());
    }

    #[test]
    fn decode_reports_status_and_malformed_bodies() {
        assert_eq!(
            decode_response::<UserProfile>(500, false, "{}").unwrap_err(),
            FetchError::Status(500)
        );
        assert!(matches!(
            decode_response::<UserProfile>(200, false, "not json").unwrap_err(),
            FetchError::Malformed(_)
        ));
    }

    #[test]
    fn membership_level_accepts_several_shapes() {
        assert_eq!(membership_level(&serde_json::json!(3)), 3);
        assert_eq!(membership_level(&serde_json::json!(true)), 1);
        assert_eq!(membership_level(&serde_json::json!(false)), 0);
        assert_eq!(membership_level(&serde_json::json!("2")), 2);
        assert_eq!(membership_level(&serde_json::json!({"membershipType": 1})), 1);
        assert_eq!(membership_level(&serde_json::Value::Null), 0);
    }

    #[tokio::test]
    async fn card_degrades_auxiliary_failures_and_caches_name() {
        let cache = UsernameCache::new(Store::in_memory());
        let source = ScriptedSource::default().with_profile(UserProfile {
            is_verified: true,
            ..profile("7", "Builder")
        });
        let lookup = ProfileLookup::new(Arc::new(source), cache.clone());

        let card = lookup.card(ServiceTag::ServiceA, "7").await.unwrap();
        assert_eq!(card.membership_level, 2);
        assert_eq!(card.headshot_url, None);
        assert_eq!(card.follow_counts, FollowCounts::default());
        assert_eq!(
            card.badges(),
            vec![Badge::Verified, Badge::TurboBuildersClub]
        );
        assert_eq!(cache.get("7").as_deref(), Some("Builder"));
    }

    #[tokio::test]
    async fn card_fails_when_profile_fails() {
        let lookup = ProfileLookup::new(
            Arc::new(ScriptedSource::default()),
            UsernameCache::new(Store::in_memory()),
        );
        let error = lookup.card(ServiceTag::ServiceB, "404").await.unwrap_err();
        assert_eq!(error, FetchError::NotFound(404));
    }
}
