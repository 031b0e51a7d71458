//! Identity directory adapter.
//!
//! Roles live in the provider's public metadata under namespaced keys:
//! `{ns}:role` holds the global role and `{ns}:teamRoles` maps team ids to roles.
//! Updates are merges; a JSON `null` for a team key removes that membership.

use crate::config::DirectoryConfig;
use crate::models::{Principal, Role, RoleUpdate, TeamMember};
use crate::services::ServiceError;
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use reqwest::{Client, StatusCode, Url};
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("{0}")]
    Unauthenticated(String),

    #[error("Principal '{0}' not found")]
    NotFound(String),

    #[error("Identity directory unavailable: {0}")]
    Unavailable(#[from] anyhow::Error),
}

impl From<DirectoryError> for ServiceError {
    fn from(err: DirectoryError) -> Self {
        match err {
            DirectoryError::Unauthenticated(msg) => ServiceError::Unauthenticated(msg),
            DirectoryError::NotFound(id) => ServiceError::NotFound(format!("Principal '{}' not found", id)),
            DirectoryError::Unavailable(e) => ServiceError::UpstreamUnavailable(e.to_string()),
        }
    }
}

pub type DirectoryResult<T> = Result<T, DirectoryError>;

/// One page of principals.
#[derive(Debug, Clone, Default)]
pub struct PrincipalPage {
    pub principals: Vec<Principal>,
    pub next_cursor: Option<String>,
}

#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    /// Resolves a bearer credential to a principal.
    async fn authenticate(&self, credential: &str) -> DirectoryResult<Principal>;
    async fn get_principal(&self, id: &str) -> DirectoryResult<Principal>;
    async fn list_principals(&self, page_size: usize, cursor: Option<&str>) -> DirectoryResult<PrincipalPage>;
    /// Merges `roles` into the principal's team roles. `RoleUpdate::Remove`
    /// deletes the key outright.
    async fn set_team_roles(&self, id: &str, roles: BTreeMap<String, RoleUpdate>) -> DirectoryResult<()>;
}

/// Pages through the whole directory.
pub async fn all_principals(directory: &dyn IdentityDirectory, page_size: usize) -> DirectoryResult<Vec<Principal>> {
    let mut principals = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let page = directory.list_principals(page_size, cursor.as_deref()).await?;
        principals.extend(page.principals);
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => return Ok(principals),
        }
    }
}

/// Members of a team, in directory order.
pub async fn members_of(
    directory: &dyn IdentityDirectory,
    team_id: &str,
    page_size: usize,
) -> DirectoryResult<Vec<TeamMember>> {
    Ok(all_principals(directory, page_size)
        .await?
        .into_iter()
        .filter_map(|p| {
            p.role_in(team_id).map(|role| TeamMember {
                principal_id: p.id.clone(),
                email: p.email.clone(),
                role,
            })
        })
        .collect())
}

/// Parses a role string read from the directory. Unknown values carry no authority.
fn directory_role(raw: &str, principal_id: &str) -> Role {
    raw.parse().unwrap_or_else(|_| {
        tracing::warn!(principal_id = %principal_id, role = %raw, "Unrecognized directory role, treating as VIEWER");
        Role::Viewer
    })
}

#[derive(Debug, Deserialize)]
struct ClerkUser {
    id: String,
    #[serde(default)]
    primary_email_address_id: Option<String>,
    #[serde(default)]
    email_addresses: Vec<ClerkEmail>,
    #[serde(default)]
    public_metadata: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct ClerkEmail {
    id: String,
    email_address: String,
}

#[derive(Debug, Deserialize)]
struct SessionClaims {
    sub: String,
}

/// Clerk backend API client.
pub struct ClerkDirectory {
    client: Client,
    config: DirectoryConfig,
    decoding_key: Option<DecodingKey>,
}

impl ClerkDirectory {
    pub fn new(config: DirectoryConfig) -> anyhow::Result<Self> {
        let decoding_key = match &config.jwt_public_key_path {
            Some(path) => {
                let pem = fs::read_to_string(path)
                    .with_context(|| format!("Failed to read session public key from {}", path))?;
                Some(Self::decoding_key_from_pem(&pem)?)
            }
            None => {
                tracing::warn!("CLERK_JWT_PUBLIC_KEY_PATH not set; all requests will be unauthenticated");
                None
            }
        };
        Self::with_decoding_key(config, decoding_key)
    }

    pub fn with_decoding_key(config: DirectoryConfig, decoding_key: Option<DecodingKey>) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .context("Failed to build identity directory HTTP client")?;
        Ok(Self {
            client,
            config,
            decoding_key,
        })
    }

    pub fn decoding_key_from_pem(pem: &str) -> anyhow::Result<DecodingKey> {
        DecodingKey::from_rsa_pem(pem.as_bytes()).map_err(|e| anyhow!("Failed to parse session public key: {}", e))
    }

    fn role_key(&self) -> String {
        format!("{}:role", self.config.namespace)
    }

    fn team_roles_key(&self) -> String {
        format!("{}:teamRoles", self.config.namespace)
    }

    /// `/v1/users` followed by `tail`, each segment percent-encoded.
    fn users_url(&self, tail: &[&str]) -> DirectoryResult<Url> {
        let mut url = Url::parse(&self.config.api_base_url)
            .with_context(|| format!("Invalid CLERK_API_BASE_URL '{}'", self.config.api_base_url))?;
        url.path_segments_mut()
            .map_err(|_| anyhow!("CLERK_API_BASE_URL cannot be a base URL"))?
            .pop_if_empty()
            .extend(["v1", "users"])
            .extend(tail);
        Ok(url)
    }

    fn user_url(&self, id: &str, tail: &[&str]) -> DirectoryResult<Url> {
        if matches!(id, "" | "." | "..") {
            return Err(DirectoryError::NotFound(id.to_string()));
        }
        let mut segments = vec![id];
        segments.extend_from_slice(tail);
        self.users_url(&segments)
    }

    fn to_principal(&self, user: ClerkUser) -> Principal {
        let email = user
            .primary_email_address_id
            .as_ref()
            .and_then(|primary| user.email_addresses.iter().find(|e| &e.id == primary))
            .or_else(|| user.email_addresses.first())
            .map(|e| e.email_address.clone());

        let global_role = user
            .public_metadata
            .get(&self.role_key())
            .and_then(Value::as_str)
            .map(|raw| directory_role(raw, &user.id));

        let team_roles = user
            .public_metadata
            .get(&self.team_roles_key())
            .and_then(Value::as_object)
            .map(|roles| {
                roles
                    .iter()
                    .filter_map(|(team, role)| {
                        role.as_str()
                            .map(|raw| (team.clone(), directory_role(raw, &user.id)))
                    })
                    .collect()
            })
            .unwrap_or_default();

        Principal {
            id: user.id,
            email,
            global_role,
            team_roles,
        }
    }

    /// Wire form of a role merge: `null` deletes the key.
    fn metadata_patch(&self, roles: &BTreeMap<String, RoleUpdate>) -> Value {
        let team_roles: Map<String, Value> = roles
            .iter()
            .map(|(team, update)| {
                let value = match update {
                    RoleUpdate::Upsert(role) => Value::String(role.as_str().to_string()),
                    RoleUpdate::Remove => Value::Null,
                };
                (team.clone(), value)
            })
            .collect();
        let mut public = Map::new();
        public.insert(self.team_roles_key(), Value::Object(team_roles));
        serde_json::json!({ "public_metadata": public })
    }
}

#[async_trait]
impl IdentityDirectory for ClerkDirectory {
    async fn authenticate(&self, credential: &str) -> DirectoryResult<Principal> {
        let key = self
            .decoding_key
            .as_ref()
            .ok_or_else(|| DirectoryError::Unauthenticated("Session verification is not configured".to_string()))?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_exp = true;
        let claims = decode::<SessionClaims>(credential, key, &validation)
            .map_err(|e| DirectoryError::Unauthenticated(format!("Invalid session token: {}", e)))?
            .claims;

        match self.get_principal(&claims.sub).await {
            Err(DirectoryError::NotFound(id)) => Err(DirectoryError::Unauthenticated(format!(
                "Session subject '{}' no longer exists",
                id
            ))),
            other => other,
        }
    }

    async fn get_principal(&self, id: &str) -> DirectoryResult<Principal> {
        let response = self
            .client
            .get(self.user_url(id, &[])?)
            .bearer_auth(self.config.secret_key.expose_secret())
            .send()
            .await
            .map_err(|e| anyhow!("GET user failed: {}", e))?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(DirectoryError::NotFound(id.to_string())),
            status if status.is_success() => {
                let user: ClerkUser = response
                    .json()
                    .await
                    .map_err(|e| anyhow!("Malformed user payload: {}", e))?;
                Ok(self.to_principal(user))
            }
            status => Err(anyhow!("GET user '{}' returned {}", id, status).into()),
        }
    }

    async fn list_principals(&self, page_size: usize, cursor: Option<&str>) -> DirectoryResult<PrincipalPage> {
        let offset: usize = match cursor {
            Some(c) => c.parse().map_err(|_| anyhow!("Invalid directory cursor '{}'", c))?,
            None => 0,
        };

        let response = self
            .client
            .get(self.users_url(&[])?)
            .bearer_auth(self.config.secret_key.expose_secret())
            .query(&[("limit", page_size.to_string()), ("offset", offset.to_string())])
            .send()
            .await
            .map_err(|e| anyhow!("List users failed: {}", e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("List users returned {}", status).into());
        }
        let users: Vec<ClerkUser> = response
            .json()
            .await
            .map_err(|e| anyhow!("Malformed user list payload: {}", e))?;

        let next_cursor = (users.len() >= page_size && page_size > 0).then(|| (offset + users.len()).to_string());
        Ok(PrincipalPage {
            principals: users.into_iter().map(|u| self.to_principal(u)).collect(),
            next_cursor,
        })
    }

    async fn set_team_roles(&self, id: &str, roles: BTreeMap<String, RoleUpdate>) -> DirectoryResult<()> {
        let response = self
            .client
            .patch(self.user_url(id, &["metadata"])?)
            .bearer_auth(self.config.secret_key.expose_secret())
            .json(&self.metadata_patch(&roles))
            .send()
            .await
            .map_err(|e| anyhow!("Update user metadata failed: {}", e))?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(DirectoryError::NotFound(id.to_string())),
            status if status.is_success() => {
                tracing::info!(principal_id = %id, teams = roles.len(), "Team roles updated");
                Ok(())
            }
            status => Err(anyhow!("Update user metadata '{}' returned {}", id, status).into()),
        }
    }
}

/// In-memory directory. Credentials map directly to principal ids.
#[derive(Default)]
pub struct MemoryDirectory {
    principals: Mutex<BTreeMap<String, Principal>>,
    credentials: Mutex<HashMap<String, String>>,
    unavailable: AtomicBool,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_principal(&self, principal: Principal) {
        if let Ok(mut principals) = self.principals.lock() {
            principals.insert(principal.id.clone(), principal);
        }
    }

    /// Registers `credential` as a valid bearer credential for `principal_id`.
    pub fn add_credential(&self, credential: &str, principal_id: &str) {
        if let Ok(mut credentials) = self.credentials.lock() {
            credentials.insert(credential.to_string(), principal_id.to_string());
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> DirectoryResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(anyhow!("Identity directory unreachable").into())
        } else {
            Ok(())
        }
    }

    fn principals(&self) -> DirectoryResult<std::sync::MutexGuard<'_, BTreeMap<String, Principal>>> {
        self.principals
            .lock()
            .map_err(|e| anyhow!("Directory mutex poisoned: {}", e).into())
    }
}

#[async_trait]
impl IdentityDirectory for MemoryDirectory {
    async fn authenticate(&self, credential: &str) -> DirectoryResult<Principal> {
        self.check_available()?;
        let id = self
            .credentials
            .lock()
            .map_err(|e| anyhow!("Directory mutex poisoned: {}", e))?
            .get(credential)
            .cloned()
            .ok_or_else(|| DirectoryError::Unauthenticated("Invalid credential".to_string()))?;
        self.principals()?
            .get(&id)
            .cloned()
            .ok_or_else(|| DirectoryError::Unauthenticated(format!("Session subject '{}' no longer exists", id)))
    }

    async fn get_principal(&self, id: &str) -> DirectoryResult<Principal> {
        self.check_available()?;
        self.principals()?
            .get(id)
            .cloned()
            .ok_or_else(|| DirectoryError::NotFound(id.to_string()))
    }

    async fn list_principals(&self, page_size: usize, cursor: Option<&str>) -> DirectoryResult<PrincipalPage> {
        self.check_available()?;
        let offset: usize = match cursor {
            Some(c) => c.parse().map_err(|_| anyhow!("Invalid directory cursor '{}'", c))?,
            None => 0,
        };
        let principals = self.principals()?;
        let page: Vec<Principal> = principals.values().skip(offset).take(page_size.max(1)).cloned().collect();
        let end = offset + page.len();
        Ok(PrincipalPage {
            next_cursor: (end < principals.len()).then(|| end.to_string()),
            principals: page,
        })
    }

    async fn set_team_roles(&self, id: &str, roles: BTreeMap<String, RoleUpdate>) -> DirectoryResult<()> {
        self.check_available()?;
        let mut principals = self.principals()?;
        let principal = principals
            .get_mut(id)
            .ok_or_else(|| DirectoryError::NotFound(id.to_string()))?;
        for (team, update) in roles {
            match update {
                RoleUpdate::Upsert(role) => {
                    principal.team_roles.insert(team, role);
                }
                RoleUpdate::Remove => {
                    principal.team_roles.remove(&team);
                }
            }
        }
        Ok(())
    }
}
