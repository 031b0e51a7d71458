//! Route model - gateway path to backend mappings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;
use validator::Validate;

/// Edge cache key holding the aggregate `{path: entry}` map.
pub const ROUTES_KEY: &str = "routes";

/// Edge cache key prefix for backend-auth secrets, keyed by route path.
pub const ROUTE_AUTH_KEY_PREFIX: &str = "route-auth:";

pub fn route_auth_key(path: &str) -> String {
    format!("{}{}", ROUTE_AUTH_KEY_PREFIX, path)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendAuthType {
    #[default]
    None,
    Bearer,
    ApiKey,
    Basic,
}

impl BackendAuthType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendAuthType::None => "none",
            BackendAuthType::Bearer => "bearer",
            BackendAuthType::ApiKey => "api-key",
            BackendAuthType::Basic => "basic",
        }
    }
}

impl fmt::Display for BackendAuthType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendAuthType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(BackendAuthType::None),
            "bearer" => Ok(BackendAuthType::Bearer),
            "api-key" => Ok(BackendAuthType::ApiKey),
            "basic" => Ok(BackendAuthType::Basic),
            _ => Err(format!("Invalid backend auth type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Route {
    pub id: Uuid,
    pub name: String,
    pub path: String,
    pub backend_url: String,
    pub description: String,
    pub tags: BTreeSet<String>,
    pub backend_auth_type: BackendAuthType,
    /// Non-secret references only; secret values live in the edge cache.
    pub backend_auth_config: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl Route {
    pub fn cache_entry(&self) -> RouteEntry {
        RouteEntry::Structured {
            url: self.backend_url.clone(),
            tags: self.tags.iter().cloned().collect(),
            auth: Some(RouteAuth {
                kind: self.backend_auth_type,
                config: self.backend_auth_config.clone(),
            }),
        }
    }
}

/// Value of one path in the aggregate route map.
///
/// Early gateways stored a bare backend URL; current ones store an object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RouteEntry {
    Legacy(String),
    Structured {
        url: String,
        #[serde(default)]
        tags: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auth: Option<RouteAuth>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteAuth {
    #[serde(rename = "type", default)]
    pub kind: BackendAuthType,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

/// Secret material for a route's backend, stored only in the edge cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteAuthSecret {
    #[serde(rename = "type")]
    pub kind: BackendAuthType,
    pub secret: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackendAuthInput {
    #[serde(rename = "type", default)]
    pub kind: BackendAuthType,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    /// Written to the edge cache, never persisted relationally.
    #[serde(default)]
    pub secret: Option<String>,
}

/// Request to create a route.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct NewRoute {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    pub path: String,
    #[validate(length(min = 1))]
    pub backend_url: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub backend_auth: Option<BackendAuthInput>,
}

/// Partial route update. The path is immutable.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct RouteUpdate {
    #[validate(length(min = 1, max = 255))]
    pub name: Option<String>,
    #[validate(length(min = 1))]
    pub backend_url: Option<String>,
    pub description: Option<String>,
    pub tags: Option<Vec<String>>,
    pub backend_auth: Option<BackendAuthInput>,
}

impl RouteUpdate {
    pub fn apply(&self, route: &mut Route) {
        if let Some(name) = &self.name {
            route.name = name.clone();
        }
        if let Some(url) = &self.backend_url {
            route.backend_url = url.clone();
        }
        if let Some(description) = &self.description {
            route.description = description.clone();
        }
        if let Some(tags) = &self.tags {
            route.tags = tags.iter().cloned().collect();
        }
        if let Some(auth) = &self.backend_auth {
            route.backend_auth_type = auth.kind;
            route.backend_auth_config = auth.config.clone();
        }
    }
}

/// Route paths are rooted and free of whitespace.
pub fn validate_route_path(path: &str) -> Result<(), String> {
    if !path.starts_with('/') {
        return Err(format!("Route path '{}' must start with '/'", path));
    }
    if path.chars().any(char::is_whitespace) {
        return Err(format!("Route path '{}' must not contain whitespace", path));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_entry_parses_as_bare_url() {
        let entry: RouteEntry = serde_json::from_str(r#""https://img.internal""#).unwrap();
        assert_eq!(entry, RouteEntry::Legacy("https://img.internal".to_string()));
    }

    #[test]
    fn structured_entry_parses_auth() {
        let json = r#"{"url":"https://a","tags":["media"],"auth":{"type":"api-key","config":{"header":"X-Key"}}}"#;
        match serde_json::from_str::<RouteEntry>(json).unwrap() {
            RouteEntry::Structured { url, tags, auth } => {
                assert_eq!(url, "https://a");
                assert_eq!(tags, vec!["media".to_string()]);
                let auth = auth.unwrap();
                assert_eq!(auth.kind, BackendAuthType::ApiKey);
                assert_eq!(auth.config["header"], "X-Key");
            }
            other => panic!("unexpected entry: {:?}", other),
        }
    }

    #[test]
    fn entry_without_url_is_rejected() {
        assert!(serde_json::from_str::<RouteEntry>(r#"{"tags":["x"]}"#).is_err());
        assert!(serde_json::from_str::<RouteEntry>("42").is_err());
    }

    #[test]
    fn path_must_be_rooted() {
        assert!(validate_route_path("/api/image").is_ok());
        assert!(validate_route_path("api/image").is_err());
        assert!(validate_route_path("/api/my image").is_err());
    }
}
