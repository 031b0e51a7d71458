//! Authorization gateway: every registry use case passes through here.
//!
//! Mutations are authorized against the evaluator, executed on the relational
//! store and then mirrored to the edge cache. Only token creation treats a
//! failed mirror as fatal.

use crate::authz::evaluator::{
    check_membership_change, has_global_permission, has_team_permission, Action, Decision, Operation, Resource,
};
use crate::models::{
    route_auth_key, token_cache_key, validate_route_path, validate_team_id, AuditAction, AuditLogEntry,
    CreatedToken, EntityType, NewRoute, NewTeam, NewToken, Principal, RegistryStats, RevealedToken, Role,
    RoleUpdate, Route, RouteAuthSecret, RouteEntry, RouteUpdate, Team, TeamMember, TeamPatch, TeamSummary, Token,
    TokenUpdate, CORE_TEAM_ID, MASKED_SECRET, ROUTES_KEY,
};
use crate::services::metrics::{record_authz_decision, record_mirror_failure};
use crate::services::{
    all_principals, generate_token, hash_token, members_of, EdgeCache, IdentityDirectory, RegistryStore,
    SecretCipher, ServiceError,
};
use chrono::Utc;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

const TOKEN_CREATE: Action = Action::new(Resource::Token, Operation::Create);
const TOKEN_EDIT: Action = Action::new(Resource::Token, Operation::Edit);
const TOKEN_DELETE: Action = Action::new(Resource::Token, Operation::Delete);
const ROUTE_CREATE: Action = Action::new(Resource::Route, Operation::Create);
const ROUTE_EDIT: Action = Action::new(Resource::Route, Operation::Edit);
const ROUTE_DELETE: Action = Action::new(Resource::Route, Operation::Delete);
const MEMBER_ADD: Action = Action::new(Resource::Membership, Operation::Create);
const MEMBER_EDIT: Action = Action::new(Resource::Membership, Operation::Edit);
const MEMBER_REMOVE: Action = Action::new(Resource::Membership, Operation::Delete);

/// Members listed when a team deletion is refused.
const BLOCKING_MEMBERS_SHOWN: usize = 5;
const RECENT_ACTIVITY: i64 = 10;

pub struct Gateway {
    store: Arc<dyn RegistryStore>,
    cache: Arc<dyn EdgeCache>,
    directory: Arc<dyn IdentityDirectory>,
    cipher: Arc<dyn SecretCipher>,
    directory_page_size: usize,
}

impl Gateway {
    pub fn new(
        store: Arc<dyn RegistryStore>,
        cache: Arc<dyn EdgeCache>,
        directory: Arc<dyn IdentityDirectory>,
        cipher: Arc<dyn SecretCipher>,
        directory_page_size: usize,
    ) -> Self {
        Self {
            store,
            cache,
            directory,
            cipher,
            directory_page_size: directory_page_size.max(1),
        }
    }

    // =========================================================================
    // Authentication & authorization
    // =========================================================================

    pub async fn authenticate(&self, credential: Option<&str>) -> Result<Principal, ServiceError> {
        let credential = credential
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| ServiceError::Unauthenticated("Missing bearer credential".to_string()))?;
        Ok(self.directory.authenticate(credential).await?)
    }

    /// Evaluates `action` on `team_id`, surfacing the specific denial.
    pub fn authorize(&self, principal: &Principal, team_id: &str, action: Action) -> Result<(), ServiceError> {
        Self::enforce(principal, action, has_team_permission(principal, team_id, action))
    }

    fn enforce(principal: &Principal, action: Action, decision: Decision) -> Result<(), ServiceError> {
        match decision {
            Decision::Allowed => {
                record_authz_decision(action.label(), "allowed");
                Ok(())
            }
            Decision::Denied(denial) => {
                let err = ServiceError::Forbidden(denial);
                record_authz_decision(action.label(), err.kind());
                info!(principal_id = %principal.id, action = %action, reason = %err, "Authorization denied");
                Err(err)
            }
        }
    }

    /// Authorizes, then runs `op`.
    pub async fn authorize_and_execute<T, F, Fut>(
        &self,
        principal: &Principal,
        action: Action,
        team_id: &str,
        op: F,
    ) -> Result<T, ServiceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        self.authorize(principal, team_id, action)?;
        op().await
    }

    fn require_global_admin(&self, principal: &Principal, scope: &str) -> Result<(), ServiceError> {
        if has_global_permission(principal, Role::Admin) {
            Ok(())
        } else {
            Err(ServiceError::insufficient(
                scope,
                Role::Admin,
                Some(principal.effective_global_role()),
            ))
        }
    }

    /// Global ADMIN check for service-wide operations such as reconciliation.
    pub fn require_admin(&self, principal: &Principal) -> Result<(), ServiceError> {
        self.require_global_admin(principal, "*")
    }

    async fn audit(&self, entry: AuditLogEntry) {
        if let Err(e) = self.store.append_audit(&entry).await {
            warn!(action = %entry.action, entity_type = %entry.entity_type, error = %e, "Failed to write audit log");
        }
    }

    // =========================================================================
    // Tokens
    // =========================================================================

    pub async fn list_tokens(&self, _principal: &Principal) -> Result<Vec<Token>, ServiceError> {
        self.store.list_tokens().await
    }

    pub async fn get_token(&self, _principal: &Principal, id: Uuid) -> Result<Token, ServiceError> {
        self.find_token(id).await
    }

    async fn find_token(&self, id: Uuid) -> Result<Token, ServiceError> {
        self.store
            .find_token(id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Token {} not found", id)))
    }

    /// Creates a token and mirrors it to the edge cache.
    ///
    /// Once the row is inserted the remaining work runs on its own task, so a
    /// dropped request cannot leave a row without its cache entry.
    #[instrument(skip(self, principal, req), fields(principal_id = %principal.id, team_id = %req.team_id))]
    pub async fn create_token(&self, principal: &Principal, req: NewToken) -> Result<CreatedToken, ServiceError> {
        req.validate()?;
        self.authorize(principal, &req.team_id, TOKEN_CREATE)?;
        if self.store.find_team(&req.team_id).await?.is_none() {
            return Err(ServiceError::NotFound(format!("Team '{}' not found", req.team_id)));
        }

        let secret = generate_token();
        let now = Utc::now();
        let token = Token {
            id: Uuid::new_v4(),
            hash: hash_token(&secret),
            encrypted_secret: Some(self.cipher.encrypt(&secret)?),
            name: req.name.clone(),
            team_id: req.team_id.clone(),
            created_by: principal.id.clone(),
            description: req.description.clone(),
            scopes: req.scopes.iter().cloned().collect(),
            created_at: now,
            expires_at: Some(req.expires_at(now)),
            last_used_at: None,
            active: true,
        };
        let cache_value = serde_json::to_string(&token.cache_value())
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!("Failed to encode cache value: {}", e)))?;

        let store = Arc::clone(&self.store);
        let cache = Arc::clone(&self.cache);
        let row = token.clone();
        let commit = tokio::spawn(async move {
            store.insert_token(&row).await?;

            if !cache.is_configured() {
                info!(token_id = %row.id, "Edge cache not configured, token stored without mirror");
                return Ok(());
            }
            if let Err(e) = cache.put(&token_cache_key(&row.hash), &cache_value).await {
                record_mirror_failure("token.create");
                warn!(token_id = %row.id, error = %e, "Edge cache write failed, rolling back token");
                if let Err(rollback) = store.delete_token(row.id).await {
                    tracing::error!(token_id = %row.id, error = %rollback, "Compensating delete failed");
                }
                return Err(ServiceError::UpstreamUnavailable(format!("Edge cache write failed: {}", e)));
            }
            Ok(())
        });
        commit
            .await
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!("Token creation task failed: {}", e)))??;

        info!(token_id = %token.id, "Token created");
        self.audit(AuditLogEntry::new(
            AuditAction::Create,
            EntityType::Token,
            token.id.to_string(),
            &principal.id,
            json!({ "name": token.name, "team_id": token.team_id, "scopes": token.scopes }),
        ))
        .await;

        Ok(CreatedToken { token, secret })
    }

    #[instrument(skip(self, principal, req), fields(principal_id = %principal.id))]
    pub async fn update_token(&self, principal: &Principal, id: Uuid, req: TokenUpdate) -> Result<Token, ServiceError> {
        req.validate()?;
        let mut token = self.find_token(id).await?;
        self.authorize(principal, &token.team_id, TOKEN_EDIT)?;

        req.apply(&mut token);
        if !self.store.update_token(&token).await? {
            return Err(ServiceError::NotFound(format!("Token {} not found", id)));
        }
        let updated = token;

        let key = token_cache_key(&updated.hash);
        if updated.active {
            match serde_json::to_string(&updated.cache_value()) {
                Ok(value) => self.mirror_put("token.update", &key, &value).await,
                Err(e) => warn!(token_id = %id, error = %e, "Failed to encode cache value"),
            }
        } else {
            self.mirror_delete("token.deactivate", &key).await;
        }

        self.audit(AuditLogEntry::new(
            AuditAction::Update,
            EntityType::Token,
            id.to_string(),
            &principal.id,
            json!({ "name": updated.name, "active": updated.active, "scopes": updated.scopes }),
        ))
        .await;
        Ok(updated)
    }

    #[instrument(skip(self, principal), fields(principal_id = %principal.id))]
    pub async fn delete_token(&self, principal: &Principal, id: Uuid) -> Result<(), ServiceError> {
        let token = self.find_token(id).await?;

        self.authorize_and_execute(principal, TOKEN_DELETE, &token.team_id, || async {
            if !self.store.delete_token(id).await? {
                return Err(ServiceError::NotFound(format!("Token {} not found", id)));
            }
            Ok(())
        })
        .await?;

        self.mirror_delete("token.delete", &token_cache_key(&token.hash)).await;
        self.audit(AuditLogEntry::new(
            AuditAction::Delete,
            EntityType::Token,
            id.to_string(),
            &principal.id,
            json!({ "name": token.name, "team_id": token.team_id }),
        ))
        .await;
        Ok(())
    }

    /// Decrypts a token's secret for a principal allowed to create tokens in its team.
    pub async fn reveal_token(&self, principal: &Principal, id: Uuid) -> Result<RevealedToken, ServiceError> {
        let token = self.find_token(id).await?;
        self.authorize(principal, &token.team_id, TOKEN_CREATE)?;

        let Some(encrypted) = token.encrypted_secret.as_deref() else {
            return Ok(RevealedToken {
                id,
                secret: MASKED_SECRET.to_string(),
                masked: true,
            });
        };
        let secret = self.cipher.decrypt(encrypted)?;
        info!(token_id = %id, principal_id = %principal.id, "Token secret revealed");
        Ok(RevealedToken {
            id,
            secret,
            masked: false,
        })
    }

    // =========================================================================
    // Routes
    // =========================================================================

    pub async fn list_routes(&self, _principal: &Principal) -> Result<Vec<Route>, ServiceError> {
        self.store.list_routes().await
    }

    pub async fn get_route(&self, _principal: &Principal, id: Uuid) -> Result<Route, ServiceError> {
        self.find_route(id).await
    }

    /// Distinct tags over all routes, sorted.
    pub async fn list_tags(&self, _principal: &Principal) -> Result<Vec<String>, ServiceError> {
        let tags: BTreeSet<String> = self
            .store
            .list_routes()
            .await?
            .into_iter()
            .flat_map(|r| r.tags)
            .collect();
        Ok(tags.into_iter().collect())
    }

    async fn find_route(&self, id: Uuid) -> Result<Route, ServiceError> {
        self.store
            .find_route(id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Route {} not found", id)))
    }

    #[instrument(skip(self, principal, req), fields(principal_id = %principal.id, path = %req.path))]
    pub async fn create_route(&self, principal: &Principal, req: NewRoute) -> Result<Route, ServiceError> {
        req.validate()?;
        validate_route_path(&req.path).map_err(ServiceError::Validation)?;

        let auth = req.backend_auth.clone().unwrap_or_default();
        let route = Route {
            id: Uuid::new_v4(),
            name: req.name.clone(),
            path: req.path.clone(),
            backend_url: req.backend_url.clone(),
            description: req.description.clone(),
            tags: req.tags.iter().cloned().collect(),
            backend_auth_type: auth.kind,
            backend_auth_config: auth.config.clone(),
            created_at: Utc::now(),
        };

        self.authorize_and_execute(principal, ROUTE_CREATE, CORE_TEAM_ID, || self.store.insert_route(&route))
            .await?;

        self.sync_routes().await;
        if let Some(secret) = auth.secret.filter(|s| !s.is_empty()) {
            self.mirror_route_secret(&route, secret).await;
        }
        self.audit(AuditLogEntry::new(
            AuditAction::Create,
            EntityType::Route,
            route.id.to_string(),
            &principal.id,
            json!({ "name": route.name, "path": route.path, "backend_url": route.backend_url }),
        ))
        .await;
        Ok(route)
    }

    #[instrument(skip(self, principal, req), fields(principal_id = %principal.id))]
    pub async fn update_route(&self, principal: &Principal, id: Uuid, req: RouteUpdate) -> Result<Route, ServiceError> {
        req.validate()?;
        self.authorize(principal, CORE_TEAM_ID, ROUTE_EDIT)?;

        let mut route = self.find_route(id).await?;
        req.apply(&mut route);
        if !self.store.update_route(&route).await? {
            return Err(ServiceError::NotFound(format!("Route {} not found", id)));
        }

        self.sync_routes().await;
        if let Some(secret) = req.backend_auth.and_then(|a| a.secret).filter(|s| !s.is_empty()) {
            self.mirror_route_secret(&route, secret).await;
        }
        self.audit(AuditLogEntry::new(
            AuditAction::Update,
            EntityType::Route,
            id.to_string(),
            &principal.id,
            json!({ "path": route.path, "backend_url": route.backend_url }),
        ))
        .await;
        Ok(route)
    }

    #[instrument(skip(self, principal), fields(principal_id = %principal.id))]
    pub async fn delete_route(&self, principal: &Principal, id: Uuid) -> Result<(), ServiceError> {
        self.authorize(principal, CORE_TEAM_ID, ROUTE_DELETE)?;

        let route = self.find_route(id).await?;
        if !self.store.delete_route(id).await? {
            return Err(ServiceError::NotFound(format!("Route {} not found", id)));
        }

        self.sync_routes().await;
        self.mirror_delete("route.delete", &route_auth_key(&route.path)).await;
        self.audit(AuditLogEntry::new(
            AuditAction::Delete,
            EntityType::Route,
            id.to_string(),
            &principal.id,
            json!({ "path": route.path }),
        ))
        .await;
        Ok(())
    }

    /// Rewrites the aggregate route map from the relational store.
    async fn sync_routes(&self) {
        if !self.cache.is_configured() {
            return;
        }
        let routes = match self.store.list_routes().await {
            Ok(routes) => routes,
            Err(e) => {
                record_mirror_failure("routes.sync");
                warn!(error = %e, "Failed to load routes for edge cache sync");
                return;
            }
        };
        let map: BTreeMap<String, RouteEntry> = routes.iter().map(|r| (r.path.clone(), r.cache_entry())).collect();
        match serde_json::to_string(&map) {
            Ok(value) => {
                self.mirror_put("routes.sync", ROUTES_KEY, &value).await;
                info!(count = map.len(), "Routes synced to edge cache");
            }
            Err(e) => warn!(error = %e, "Failed to encode route map"),
        }
    }

    async fn mirror_route_secret(&self, route: &Route, secret: String) {
        let payload = RouteAuthSecret {
            kind: route.backend_auth_type,
            secret,
        };
        match serde_json::to_string(&payload) {
            Ok(value) => self.mirror_put("route.secret", &route_auth_key(&route.path), &value).await,
            Err(e) => warn!(path = %route.path, error = %e, "Failed to encode route secret"),
        }
    }

    async fn mirror_put(&self, operation: &str, key: &str, value: &str) {
        if !self.cache.is_configured() {
            return;
        }
        if let Err(e) = self.cache.put(key, value).await {
            record_mirror_failure(operation);
            warn!(operation = %operation, key = %key, error = %e, "Edge cache mirror write failed");
        }
    }

    async fn mirror_delete(&self, operation: &str, key: &str) {
        if !self.cache.is_configured() {
            return;
        }
        if let Err(e) = self.cache.delete(key).await {
            record_mirror_failure(operation);
            warn!(operation = %operation, key = %key, error = %e, "Edge cache mirror delete failed");
        }
    }

    // =========================================================================
    // Teams
    // =========================================================================

    /// All teams with member counts. Counting failures degrade to zero.
    pub async fn list_teams(&self, _principal: &Principal) -> Result<Vec<TeamSummary>, ServiceError> {
        let teams = self.store.list_teams().await?;
        let counts: HashMap<String, usize> = match all_principals(self.directory.as_ref(), self.directory_page_size).await {
            Ok(principals) => {
                let mut counts = HashMap::new();
                for principal in &principals {
                    for team_id in principal.team_roles.keys() {
                        *counts.entry(team_id.clone()).or_insert(0) += 1;
                    }
                }
                counts
            }
            Err(e) => {
                warn!(error = %e, "Failed to count team members, reporting zero");
                HashMap::new()
            }
        };
        Ok(teams
            .into_iter()
            .map(|team| {
                let member_count = counts.get(&team.id).copied().unwrap_or(0);
                TeamSummary { team, member_count }
            })
            .collect())
    }

    pub async fn get_team(&self, _principal: &Principal, team_id: &str) -> Result<Team, ServiceError> {
        self.find_team(team_id).await
    }

    async fn find_team(&self, team_id: &str) -> Result<Team, ServiceError> {
        self.store
            .find_team(team_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Team '{}' not found", team_id)))
    }

    async fn team_members(&self, team_id: &str) -> Result<Vec<TeamMember>, ServiceError> {
        Ok(members_of(self.directory.as_ref(), team_id, self.directory_page_size).await?)
    }

    #[instrument(skip(self, principal, req), fields(principal_id = %principal.id, team_id = %req.id))]
    pub async fn create_team(&self, principal: &Principal, req: NewTeam) -> Result<Team, ServiceError> {
        req.validate()?;
        validate_team_id(&req.id).map_err(ServiceError::Validation)?;
        self.require_global_admin(principal, &req.id)?;

        let team = req.into_team(&principal.id);
        self.store.insert_team(&team).await?;

        let roles = BTreeMap::from([(team.id.clone(), RoleUpdate::Upsert(Role::Admin))]);
        if let Err(e) = self.directory.set_team_roles(&principal.id, roles).await {
            warn!(team_id = %team.id, error = %e, "Failed to add creator as team ADMIN");
        }

        info!(team_id = %team.id, "Team created");
        self.audit(AuditLogEntry::new(
            AuditAction::Create,
            EntityType::Team,
            &team.id,
            &principal.id,
            json!({ "name": team.name }),
        ))
        .await;
        Ok(team)
    }

    /// Team ADMINs may edit their team; a global ADMIN may also edit a team
    /// nobody has claimed yet.
    #[instrument(skip(self, principal, patch), fields(principal_id = %principal.id))]
    pub async fn update_team(&self, principal: &Principal, team_id: &str, patch: TeamPatch) -> Result<Team, ServiceError> {
        let mut team = self.find_team(team_id).await?;

        match principal.role_in(team_id) {
            Some(Role::Admin) => {}
            Some(role) => return Err(ServiceError::insufficient(team_id, Role::Admin, Some(role))),
            None => {
                if !(principal.is_global_admin() && self.team_members(team_id).await?.is_empty()) {
                    return Err(ServiceError::not_member(team_id));
                }
                info!(team_id = %team_id, principal_id = %principal.id, "Global ADMIN editing unclaimed team");
            }
        }

        if patch.is_empty() {
            return Ok(team);
        }
        patch.apply(&mut team);
        if !self.store.update_team(&team).await? {
            return Err(ServiceError::NotFound(format!("Team '{}' not found", team_id)));
        }

        self.audit(AuditLogEntry::new(
            AuditAction::Update,
            EntityType::Team,
            team_id,
            &principal.id,
            json!({ "name": team.name, "color": team.color, "icon": team.icon }),
        ))
        .await;
        Ok(team)
    }

    /// Deletes an empty team and, by cascade, its tokens.
    #[instrument(skip(self, principal), fields(principal_id = %principal.id))]
    pub async fn delete_team(&self, principal: &Principal, team_id: &str) -> Result<(), ServiceError> {
        self.require_global_admin(principal, team_id)?;
        if team_id == CORE_TEAM_ID {
            return Err(ServiceError::Validation(format!("Team '{}' cannot be deleted", CORE_TEAM_ID)));
        }
        let team = self.find_team(team_id).await?;

        let members = self.team_members(team_id).await?;
        if !members.is_empty() {
            return Err(ServiceError::TeamNotEmpty {
                team_id: team_id.to_string(),
                members: members
                    .iter()
                    .take(BLOCKING_MEMBERS_SHOWN)
                    .map(|m| m.email.clone().unwrap_or_else(|| m.principal_id.clone()))
                    .collect(),
            });
        }

        let orphaned: Vec<String> = self
            .store
            .list_tokens()
            .await?
            .into_iter()
            .filter(|t| t.team_id == team_id)
            .map(|t| token_cache_key(&t.hash))
            .collect();

        if !self.store.delete_team(team_id).await? {
            return Err(ServiceError::NotFound(format!("Team '{}' not found", team_id)));
        }
        for key in &orphaned {
            self.mirror_delete("team.delete", key).await;
        }

        info!(team_id = %team_id, tokens_removed = orphaned.len(), "Team deleted");
        self.audit(AuditLogEntry::new(
            AuditAction::Delete,
            EntityType::Team,
            team_id,
            &principal.id,
            json!({ "name": team.name, "tokens_removed": orphaned.len() }),
        ))
        .await;
        Ok(())
    }

    pub async fn list_team_members(&self, principal: &Principal, team_id: &str) -> Result<Vec<TeamMember>, ServiceError> {
        self.find_team(team_id).await?;
        if !principal.is_member_of(team_id) && !principal.is_global_admin() {
            return Err(ServiceError::not_member(team_id));
        }
        self.team_members(team_id).await
    }

    // =========================================================================
    // Membership
    // =========================================================================

    /// Team-level gate for membership calls; must run before the target is
    /// looked up. Returns `true` when a global ADMIN claims an unclaimed team.
    async fn admit_membership(
        &self,
        actor: &Principal,
        team_id: &str,
        action: Action,
        target_id: &str,
    ) -> Result<bool, ServiceError> {
        if action == MEMBER_ADD
            && actor.role_in(team_id).is_none()
            && actor.is_global_admin()
            && target_id == actor.id
            && self.team_members(team_id).await?.is_empty()
        {
            info!(team_id = %team_id, principal_id = %actor.id, "Global ADMIN claiming unclaimed team");
            return Ok(true);
        }

        match has_team_permission(actor, team_id, action) {
            Decision::Allowed => Ok(false),
            denied => Self::enforce(actor, action, denied).map(|()| false),
        }
    }

    fn check_peer(
        actor: &Principal,
        team_id: &str,
        action: Action,
        claimed: bool,
        target_current: Option<Role>,
        new_role: Option<Role>,
    ) -> Result<(), ServiceError> {
        if claimed {
            return Self::enforce(actor, action, Decision::Allowed);
        }
        let actor_role = actor.role_in(team_id).unwrap_or(Role::Viewer);
        Self::enforce(
            actor,
            action,
            check_membership_change(actor_role, team_id, target_current, new_role),
        )
    }

    #[instrument(skip(self, principal), fields(principal_id = %principal.id))]
    pub async fn add_member(
        &self,
        principal: &Principal,
        team_id: &str,
        target_id: &str,
        role: Role,
    ) -> Result<TeamMember, ServiceError> {
        let claimed = self.admit_membership(principal, team_id, MEMBER_ADD, target_id).await?;
        self.find_team(team_id).await?;
        let target = self.directory.get_principal(target_id).await?;
        if let Some(existing) = target.role_in(team_id) {
            return Err(ServiceError::Conflict(format!(
                "Principal '{}' is already a {} of team '{}'",
                target_id, existing, team_id
            )));
        }

        Self::check_peer(principal, team_id, MEMBER_ADD, claimed, None, Some(role))?;
        self.directory
            .set_team_roles(target_id, BTreeMap::from([(team_id.to_string(), RoleUpdate::Upsert(role))]))
            .await?;

        self.audit(AuditLogEntry::new(
            AuditAction::Create,
            EntityType::Membership,
            format!("{}:{}", team_id, target_id),
            &principal.id,
            json!({ "team_id": team_id, "principal_id": target_id, "role": role }),
        ))
        .await;
        Ok(TeamMember {
            principal_id: target.id,
            email: target.email,
            role,
        })
    }

    #[instrument(skip(self, principal), fields(principal_id = %principal.id))]
    pub async fn change_member_role(
        &self,
        principal: &Principal,
        team_id: &str,
        target_id: &str,
        role: Role,
    ) -> Result<TeamMember, ServiceError> {
        let claimed = self.admit_membership(principal, team_id, MEMBER_EDIT, target_id).await?;
        self.find_team(team_id).await?;
        let target = self.directory.get_principal(target_id).await?;
        let current = target.role_in(team_id).ok_or_else(|| {
            ServiceError::NotFound(format!("Principal '{}' is not a member of team '{}'", target_id, team_id))
        })?;

        Self::check_peer(principal, team_id, MEMBER_EDIT, claimed, Some(current), Some(role))?;
        self.directory
            .set_team_roles(target_id, BTreeMap::from([(team_id.to_string(), RoleUpdate::Upsert(role))]))
            .await?;

        self.audit(AuditLogEntry::new(
            AuditAction::Update,
            EntityType::Membership,
            format!("{}:{}", team_id, target_id),
            &principal.id,
            json!({ "team_id": team_id, "principal_id": target_id, "from": current, "to": role }),
        ))
        .await;
        Ok(TeamMember {
            principal_id: target.id,
            email: target.email,
            role,
        })
    }

    #[instrument(skip(self, principal), fields(principal_id = %principal.id))]
    pub async fn remove_member(&self, principal: &Principal, team_id: &str, target_id: &str) -> Result<(), ServiceError> {
        let claimed = self.admit_membership(principal, team_id, MEMBER_REMOVE, target_id).await?;
        self.find_team(team_id).await?;
        let target = self.directory.get_principal(target_id).await?;
        let current = target.role_in(team_id).ok_or_else(|| {
            ServiceError::NotFound(format!("Principal '{}' is not a member of team '{}'", target_id, team_id))
        })?;

        Self::check_peer(principal, team_id, MEMBER_REMOVE, claimed, Some(current), None)?;
        self.directory
            .set_team_roles(target_id, BTreeMap::from([(team_id.to_string(), RoleUpdate::Remove)]))
            .await?;

        self.audit(AuditLogEntry::new(
            AuditAction::Delete,
            EntityType::Membership,
            format!("{}:{}", team_id, target_id),
            &principal.id,
            json!({ "team_id": team_id, "principal_id": target_id, "role": current }),
        ))
        .await;
        Ok(())
    }

    // =========================================================================
    // Stats
    // =========================================================================

    pub async fn stats(&self, _principal: &Principal) -> Result<RegistryStats, ServiceError> {
        Ok(RegistryStats {
            total_active_tokens: self.store.count_active_tokens().await?,
            total_routes: self.store.count_routes().await?,
            recent_activity: self.store.recent_audit(RECENT_ACTIVITY).await?,
        })
    }
}
