//! Token model - API tokens owned by a team.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;
use validator::Validate;

/// Edge cache key prefix for token entries.
pub const TOKEN_KEY_PREFIX: &str = "token:";

/// Creator recorded on rows imported from the edge cache.
pub const CACHE_IMPORT_ACTOR: &str = "cache-import";

pub const DEFAULT_EXPIRY_DAYS: i64 = 90;

/// Shown in place of a secret that cannot be revealed.
pub const MASKED_SECRET: &str = "ntk_****************";

pub fn token_cache_key(hash: &str) -> String {
    format!("{}{}", TOKEN_KEY_PREFIX, hash)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Token {
    pub id: Uuid,
    pub hash: String,
    #[serde(skip_serializing)]
    pub encrypted_secret: Option<String>,
    pub name: String,
    pub team_id: String,
    pub created_by: String,
    pub description: String,
    pub scopes: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub active: bool,
}

impl Token {
    /// Value mirrored to the edge cache under `token:{hash}`.
    pub fn cache_value(&self) -> CachedToken {
        CachedToken {
            name: self.name.clone(),
            team_id: Some(self.team_id.clone()),
            scopes: self.scopes.iter().cloned().collect(),
            created_at: Some(self.created_at),
            expires_at: self.expires_at,
            created_by: Some(self.created_by.clone()),
            description: None,
            team_name: None,
            team_color: None,
            team_icon: None,
        }
    }
}

/// Token entry as stored in the edge cache.
///
/// Older writers used `department` or `team` for the owning team; both are accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedToken {
    #[serde(default)]
    pub name: String,
    #[serde(default, alias = "department", alias = "team")]
    pub team_id: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_icon: Option<String>,
}

/// Request to create a token.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct NewToken {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    pub team_id: String,
    #[serde(default)]
    pub description: String,
    #[validate(length(min = 1))]
    pub scopes: Vec<String>,
    #[validate(range(min = 1, max = 3650))]
    pub expires_days: Option<i64>,
}

impl NewToken {
    pub fn expires_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + Duration::days(self.expires_days.unwrap_or(DEFAULT_EXPIRY_DAYS))
    }
}

/// Partial token update.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct TokenUpdate {
    #[validate(length(min = 1, max = 255))]
    pub name: Option<String>,
    pub description: Option<String>,
    #[validate(length(min = 1))]
    pub scopes: Option<Vec<String>>,
    pub active: Option<bool>,
}

impl TokenUpdate {
    pub fn apply(&self, token: &mut Token) {
        if let Some(name) = &self.name {
            token.name = name.clone();
        }
        if let Some(description) = &self.description {
            token.description = description.clone();
        }
        if let Some(scopes) = &self.scopes {
            token.scopes = scopes.iter().cloned().collect();
        }
        if let Some(active) = self.active {
            token.active = active;
        }
    }
}

/// Result of token creation: the only time the raw secret is disclosed.
#[derive(Debug, Clone, Serialize)]
pub struct CreatedToken {
    #[serde(flatten)]
    pub token: Token,
    pub secret: String,
}

/// Result of a reveal request.
#[derive(Debug, Clone, Serialize)]
pub struct RevealedToken {
    pub id: Uuid,
    pub secret: String,
    pub masked: bool,
}
