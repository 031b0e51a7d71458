//! Reconciliation engine: imports edge-cache entries missing from the
//! relational store.
//!
//! Existing rows are never modified. Every per-entry failure is recorded in
//! the report and the batch continues.

use crate::models::{
    validate_route_path, validate_team_id, AuditAction, AuditLogEntry, CachedToken, EntityType, Principal, Role,
    Route, RouteEntry, Team, Token, CACHE_IMPORT_ACTOR, CORE_TEAM_ID, ROUTES_KEY, SYSTEM_ACTOR, TOKEN_KEY_PREFIX,
};
use crate::services::metrics::record_reconcile_entry;
use crate::services::{all_principals, EdgeCache, IdentityDirectory, RegistryStore, ServiceError};
use anyhow::{anyhow, Context};
use chrono::Utc;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ReconcileSettings {
    pub page_size: usize,
    pub entry_timeout: Duration,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            page_size: 100,
            entry_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileError {
    pub key: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub tokens_imported: usize,
    pub tokens_skipped: usize,
    pub routes_imported: usize,
    pub routes_skipped: usize,
    pub errors: Vec<ReconcileError>,
    /// Set when the whole run was skipped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped_reason: Option<String>,
}

impl ReconcileReport {
    fn fail(&mut self, kind: &str, key: &str, err: impl std::fmt::Display) {
        warn!(kind = %kind, key = %key, error = %err, "Reconciliation entry skipped");
        record_reconcile_entry(kind, "error");
        self.errors.push(ReconcileError {
            key: key.to_string(),
            message: err.to_string(),
        });
    }
}

/// Clears the running flag when a run ends, however it ends.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Per-run memo of team resolution and directory contents.
#[derive(Default)]
struct TeamResolver {
    resolved: HashMap<String, String>,
    principals: Option<Vec<Principal>>,
}

pub struct Reconciler {
    store: Arc<dyn RegistryStore>,
    cache: Arc<dyn EdgeCache>,
    directory: Arc<dyn IdentityDirectory>,
    settings: ReconcileSettings,
    running: AtomicBool,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn RegistryStore>,
        cache: Arc<dyn EdgeCache>,
        directory: Arc<dyn IdentityDirectory>,
        settings: ReconcileSettings,
    ) -> Self {
        Self {
            store,
            cache,
            directory,
            settings,
            running: AtomicBool::new(false),
        }
    }

    /// Runs one reconciliation pass. A second concurrent call is refused.
    #[instrument(skip(self))]
    pub async fn reconcile(&self) -> Result<ReconcileReport, ServiceError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ServiceError::Conflict("Reconciliation is already running".to_string()));
        }
        let _guard = RunGuard(&self.running);

        if self.store.insert_team_if_absent(&Team::core()).await? {
            info!(team_id = CORE_TEAM_ID, "Created core team");
        }

        let mut report = ReconcileReport::default();
        if !self.cache.is_configured() {
            info!("Edge cache not configured, skipping reconciliation");
            report.skipped_reason = Some("edge cache not configured".to_string());
            return Ok(report);
        }

        let keys = match self.list_token_keys(&mut report).await {
            Some(keys) => keys,
            None => return Ok(report),
        };

        self.repair_tokens(keys, &mut report).await?;
        self.repair_routes(&mut report).await?;

        info!(
            tokens_imported = report.tokens_imported,
            tokens_skipped = report.tokens_skipped,
            routes_imported = report.routes_imported,
            routes_skipped = report.routes_skipped,
            errors = report.errors.len(),
            "Reconciliation finished"
        );
        Ok(report)
    }

    async fn bounded<T, F>(&self, fut: F) -> anyhow::Result<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        tokio::time::timeout(self.settings.entry_timeout, fut)
            .await
            .map_err(|_| anyhow!("timed out after {:?}", self.settings.entry_timeout))?
    }

    /// Follows the listing cursor to completion. `None` means the cache could
    /// not be reached at all and the run is skipped.
    async fn list_token_keys(&self, report: &mut ReconcileReport) -> Option<Vec<String>> {
        let mut keys = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let listed = self.bounded(self.cache.list_keys(TOKEN_KEY_PREFIX, cursor.as_deref())).await;
            let page = match listed {
                Ok(page) => page,
                Err(e) if cursor.is_none() => {
                    info!(error = %e, "Edge cache unreachable, skipping reconciliation");
                    report.skipped_reason = Some(format!("edge cache unreachable: {}", e));
                    return None;
                }
                Err(e) => {
                    report.fail("token", TOKEN_KEY_PREFIX, format!("key listing stopped early: {}", e));
                    return Some(keys);
                }
            };
            keys.extend(page.keys);
            match page.next_cursor {
                Some(next) if !page.complete => cursor = Some(next),
                _ => return Some(keys),
            }
        }
    }

    async fn repair_tokens(&self, keys: Vec<String>, report: &mut ReconcileReport) -> Result<(), ServiceError> {
        let existing = self.store.list_token_hashes().await?;
        let mut teams = TeamResolver::default();

        for key in keys {
            let Some(hash) = key.strip_prefix(TOKEN_KEY_PREFIX).filter(|h| !h.is_empty()) else {
                report.fail("token", &key, "key has no hash");
                continue;
            };
            if existing.contains(hash) {
                report.tokens_skipped += 1;
                record_reconcile_entry("token", "skipped");
                continue;
            }

            match self.import_token(&key, hash, &mut teams).await {
                Ok(true) => {
                    report.tokens_imported += 1;
                    record_reconcile_entry("token", "imported");
                }
                Ok(false) => {
                    report.tokens_skipped += 1;
                    record_reconcile_entry("token", "skipped");
                }
                Err(e) => report.fail("token", &key, format!("{:#}", e)),
            }
        }
        Ok(())
    }

    async fn import_token(&self, key: &str, hash: &str, teams: &mut TeamResolver) -> anyhow::Result<bool> {
        let raw = self
            .bounded(self.cache.get(key))
            .await?
            .ok_or_else(|| anyhow!("entry disappeared during reconciliation"))?;
        let cached: CachedToken = serde_json::from_str(&raw).context("malformed token entry")?;

        let team_id = self.resolve_team(&cached, teams).await?;
        let token = Token {
            id: Uuid::new_v4(),
            hash: hash.to_string(),
            encrypted_secret: None,
            name: if cached.name.is_empty() {
                "Imported token".to_string()
            } else {
                cached.name.clone()
            },
            team_id,
            created_by: CACHE_IMPORT_ACTOR.to_string(),
            description: cached.description.clone().unwrap_or_default(),
            scopes: cached.scopes.iter().cloned().collect(),
            created_at: cached.created_at.unwrap_or_else(Utc::now),
            expires_at: cached.expires_at,
            last_used_at: None,
            active: true,
        };

        let inserted = self.store.insert_token_if_absent(&token).await?;
        if inserted {
            info!(token_id = %token.id, team_id = %token.team_id, "Imported token from edge cache");
            self.audit(AuditLogEntry::new(
                AuditAction::Import,
                EntityType::Token,
                token.id.to_string(),
                CACHE_IMPORT_ACTOR,
                serde_json::json!({ "name": token.name, "team_id": token.team_id }),
            ))
            .await;
        }
        Ok(inserted)
    }

    /// Picks the owning team for an imported token, materializing it from the
    /// directory when members exist and falling back to the core team otherwise.
    async fn resolve_team(&self, cached: &CachedToken, teams: &mut TeamResolver) -> anyhow::Result<String> {
        let Some(team_id) = cached.team_id.as_deref().map(str::trim).filter(|t| !t.is_empty()) else {
            return Ok(CORE_TEAM_ID.to_string());
        };
        if let Some(resolved) = teams.resolved.get(team_id) {
            return Ok(resolved.clone());
        }
        if let Err(e) = validate_team_id(team_id) {
            warn!(team_id = %team_id, error = %e, "Unusable team reference, assigning core team");
            teams.resolved.insert(team_id.to_string(), CORE_TEAM_ID.to_string());
            return Ok(CORE_TEAM_ID.to_string());
        }
        if self.store.find_team(team_id).await?.is_some() {
            teams.resolved.insert(team_id.to_string(), team_id.to_string());
            return Ok(team_id.to_string());
        }

        if teams.principals.is_none() {
            let principals = self
                .bounded(async {
                    all_principals(self.directory.as_ref(), self.settings.page_size)
                        .await
                        .map_err(anyhow::Error::from)
                })
                .await
                .context("could not resolve team members")?;
            teams.principals = Some(principals);
        }
        let members: Vec<&Principal> = teams
            .principals
            .iter()
            .flatten()
            .filter(|p| p.is_member_of(team_id))
            .collect();

        let resolved = if members.is_empty() {
            info!(team_id = %team_id, "Referenced team has no members, assigning core team");
            CORE_TEAM_ID.to_string()
        } else {
            let created_by = members
                .iter()
                .find(|p| p.role_in(team_id) == Some(Role::Admin))
                .map(|p| p.id.clone())
                .unwrap_or_else(|| SYSTEM_ACTOR.to_string());
            let mut team = Team::new(team_id, cached.team_name.clone().unwrap_or_else(|| team_id.to_string()), created_by);
            if let Some(color) = cached.team_color.clone().filter(|c| !c.is_empty()) {
                team.color = color;
            }
            if let Some(icon) = cached.team_icon.clone() {
                team.icon = icon;
            }
            if self.store.insert_team_if_absent(&team).await? {
                info!(team_id = %team_id, created_by = %team.created_by, members = members.len(), "Materialized team from directory");
                self.audit(AuditLogEntry::new(
                    AuditAction::Import,
                    EntityType::Team,
                    team_id,
                    CACHE_IMPORT_ACTOR,
                    serde_json::json!({ "name": team.name, "members": members.len() }),
                ))
                .await;
            }
            team_id.to_string()
        };

        teams.resolved.insert(team_id.to_string(), resolved.clone());
        Ok(resolved)
    }

    async fn repair_routes(&self, report: &mut ReconcileReport) -> Result<(), ServiceError> {
        let raw = match self.bounded(self.cache.get(ROUTES_KEY)).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return Ok(()),
            Err(e) => {
                report.fail("route", ROUTES_KEY, e);
                return Ok(());
            }
        };
        let map: serde_json::Map<String, serde_json::Value> = match serde_json::from_str(&raw) {
            Ok(map) => map,
            Err(e) => {
                report.fail("route", ROUTES_KEY, format!("route map is not an object: {}", e));
                return Ok(());
            }
        };

        let existing: HashSet<String> = self.store.list_route_paths().await?;
        for (path, value) in map {
            if existing.contains(&path) {
                report.routes_skipped += 1;
                record_reconcile_entry("route", "skipped");
                continue;
            }
            match self.import_route(&path, value).await {
                Ok(true) => {
                    report.routes_imported += 1;
                    record_reconcile_entry("route", "imported");
                }
                Ok(false) => {
                    report.routes_skipped += 1;
                    record_reconcile_entry("route", "skipped");
                }
                Err(e) => report.fail("route", &path, format!("{:#}", e)),
            }
        }
        Ok(())
    }

    async fn import_route(&self, path: &str, value: serde_json::Value) -> anyhow::Result<bool> {
        validate_route_path(path).map_err(|e| anyhow!(e))?;
        let entry: RouteEntry = serde_json::from_value(value).context("malformed route entry")?;

        let (backend_url, tags, auth) = match entry {
            RouteEntry::Legacy(url) => (url, Vec::new(), None),
            RouteEntry::Structured { url, tags, auth } => (url, tags, auth),
        };
        if backend_url.trim().is_empty() {
            return Err(anyhow!("route entry has an empty url"));
        }
        let auth = auth.unwrap_or_default();

        let route = Route {
            id: Uuid::new_v4(),
            name: path.trim_start_matches('/').to_string(),
            path: path.to_string(),
            backend_url,
            description: String::new(),
            tags: tags.into_iter().collect(),
            backend_auth_type: auth.kind,
            backend_auth_config: auth.config,
            created_at: Utc::now(),
        };

        let inserted = self.store.insert_route_if_absent(&route).await?;
        if inserted {
            info!(path = %route.path, "Imported route from edge cache");
            self.audit(AuditLogEntry::new(
                AuditAction::Import,
                EntityType::Route,
                route.id.to_string(),
                CACHE_IMPORT_ACTOR,
                serde_json::json!({ "path": route.path, "backend_url": route.backend_url }),
            ))
            .await;
        }
        Ok(inserted)
    }

    async fn audit(&self, entry: AuditLogEntry) {
        if let Err(e) = self.store.append_audit(&entry).await {
            warn!(entity_type = %entry.entity_type, error = %e, "Failed to write audit log");
        }
    }
}
