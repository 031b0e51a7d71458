//! Relational store contract and an in-memory implementation.
//!
//! Uniqueness (team id, token hash, route path) and the team -> token cascade
//! are enforced by the store; callers never lock rows. A losing concurrent
//! writer gets `ServiceError::Conflict`.

use crate::models::{AuditLogEntry, Route, Team, Token};
use crate::services::ServiceError;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

#[async_trait]
pub trait RegistryStore: Send + Sync {
    async fn health_check(&self) -> Result<(), ServiceError>;

    async fn insert_team(&self, team: &Team) -> Result<(), ServiceError>;
    /// Returns `false` when a team with the same id already exists.
    async fn insert_team_if_absent(&self, team: &Team) -> Result<bool, ServiceError>;
    async fn find_team(&self, team_id: &str) -> Result<Option<Team>, ServiceError>;
    async fn list_teams(&self) -> Result<Vec<Team>, ServiceError>;
    async fn update_team(&self, team: &Team) -> Result<bool, ServiceError>;
    /// Deletes the team and, by cascade, its tokens.
    async fn delete_team(&self, team_id: &str) -> Result<bool, ServiceError>;

    async fn insert_token(&self, token: &Token) -> Result<(), ServiceError>;
    /// Returns `false` when a token with the same hash already exists.
    async fn insert_token_if_absent(&self, token: &Token) -> Result<bool, ServiceError>;
    async fn find_token(&self, id: Uuid) -> Result<Option<Token>, ServiceError>;
    async fn find_token_by_hash(&self, hash: &str) -> Result<Option<Token>, ServiceError>;
    async fn list_tokens(&self) -> Result<Vec<Token>, ServiceError>;
    async fn list_token_hashes(&self) -> Result<HashSet<String>, ServiceError>;
    async fn update_token(&self, token: &Token) -> Result<bool, ServiceError>;
    async fn delete_token(&self, id: Uuid) -> Result<bool, ServiceError>;
    async fn count_active_tokens(&self) -> Result<i64, ServiceError>;

    async fn insert_route(&self, route: &Route) -> Result<(), ServiceError>;
    /// Returns `false` when a route with the same path already exists.
    async fn insert_route_if_absent(&self, route: &Route) -> Result<bool, ServiceError>;
    async fn find_route(&self, id: Uuid) -> Result<Option<Route>, ServiceError>;
    async fn list_routes(&self) -> Result<Vec<Route>, ServiceError>;
    async fn list_route_paths(&self) -> Result<HashSet<String>, ServiceError>;
    async fn update_route(&self, route: &Route) -> Result<bool, ServiceError>;
    async fn delete_route(&self, id: Uuid) -> Result<bool, ServiceError>;
    async fn count_routes(&self) -> Result<i64, ServiceError>;

    async fn append_audit(&self, entry: &AuditLogEntry) -> Result<(), ServiceError>;
    async fn recent_audit(&self, limit: i64) -> Result<Vec<AuditLogEntry>, ServiceError>;
}

#[derive(Default)]
struct MemoryTables {
    teams: BTreeMap<String, Team>,
    tokens: HashMap<Uuid, Token>,
    routes: HashMap<Uuid, Route>,
    audit: Vec<AuditLogEntry>,
}

/// In-memory store with the same constraint semantics as the PostgreSQL schema.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<MemoryTables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<MutexGuard<'_, MemoryTables>, ServiceError> {
        self.tables
            .lock()
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!("Memory store mutex poisoned: {}", e)))
    }

    /// Snapshot of the audit trail, oldest first.
    pub fn audit_entries(&self) -> Vec<AuditLogEntry> {
        self.tables().map(|t| t.audit.clone()).unwrap_or_default()
    }

    fn check_token(tables: &MemoryTables, token: &Token) -> Result<(), ServiceError> {
        if !tables.teams.contains_key(&token.team_id) {
            return Err(ServiceError::NotFound(format!("Team '{}' not found", token.team_id)));
        }
        if tables.tokens.values().any(|t| t.hash == token.hash) {
            return Err(ServiceError::Conflict("Token hash already exists".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RegistryStore for MemoryStore {
    async fn health_check(&self) -> Result<(), ServiceError> {
        self.tables().map(|_| ())
    }

    async fn insert_team(&self, team: &Team) -> Result<(), ServiceError> {
        let mut tables = self.tables()?;
        if tables.teams.contains_key(&team.id) {
            return Err(ServiceError::Conflict(format!("Team ID '{}' already exists", team.id)));
        }
        tables.teams.insert(team.id.clone(), team.clone());
        Ok(())
    }

    async fn insert_team_if_absent(&self, team: &Team) -> Result<bool, ServiceError> {
        let mut tables = self.tables()?;
        if tables.teams.contains_key(&team.id) {
            return Ok(false);
        }
        tables.teams.insert(team.id.clone(), team.clone());
        Ok(true)
    }

    async fn find_team(&self, team_id: &str) -> Result<Option<Team>, ServiceError> {
        Ok(self.tables()?.teams.get(team_id).cloned())
    }

    async fn list_teams(&self) -> Result<Vec<Team>, ServiceError> {
        let mut teams: Vec<Team> = self.tables()?.teams.values().cloned().collect();
        teams.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(teams)
    }

    async fn update_team(&self, team: &Team) -> Result<bool, ServiceError> {
        let mut tables = self.tables()?;
        match tables.teams.get_mut(&team.id) {
            Some(existing) => {
                *existing = team.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_team(&self, team_id: &str) -> Result<bool, ServiceError> {
        let mut tables = self.tables()?;
        if tables.teams.remove(team_id).is_none() {
            return Ok(false);
        }
        tables.tokens.retain(|_, t| t.team_id != team_id);
        Ok(true)
    }

    async fn insert_token(&self, token: &Token) -> Result<(), ServiceError> {
        let mut tables = self.tables()?;
        Self::check_token(&tables, token)?;
        tables.tokens.insert(token.id, token.clone());
        Ok(())
    }

    async fn insert_token_if_absent(&self, token: &Token) -> Result<bool, ServiceError> {
        let mut tables = self.tables()?;
        match Self::check_token(&tables, token) {
            Ok(()) => {
                tables.tokens.insert(token.id, token.clone());
                Ok(true)
            }
            Err(ServiceError::Conflict(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn find_token(&self, id: Uuid) -> Result<Option<Token>, ServiceError> {
        Ok(self.tables()?.tokens.get(&id).cloned())
    }

    async fn find_token_by_hash(&self, hash: &str) -> Result<Option<Token>, ServiceError> {
        Ok(self.tables()?.tokens.values().find(|t| t.hash == hash).cloned())
    }

    async fn list_tokens(&self) -> Result<Vec<Token>, ServiceError> {
        let mut tokens: Vec<Token> = self.tables()?.tokens.values().cloned().collect();
        tokens.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(tokens)
    }

    async fn list_token_hashes(&self) -> Result<HashSet<String>, ServiceError> {
        Ok(self.tables()?.tokens.values().map(|t| t.hash.clone()).collect())
    }

    async fn update_token(&self, token: &Token) -> Result<bool, ServiceError> {
        let mut tables = self.tables()?;
        match tables.tokens.get_mut(&token.id) {
            Some(existing) => {
                *existing = token.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_token(&self, id: Uuid) -> Result<bool, ServiceError> {
        Ok(self.tables()?.tokens.remove(&id).is_some())
    }

    async fn count_active_tokens(&self) -> Result<i64, ServiceError> {
        Ok(self.tables()?.tokens.values().filter(|t| t.active).count() as i64)
    }

    async fn insert_route(&self, route: &Route) -> Result<(), ServiceError> {
        let mut tables = self.tables()?;
        if tables.routes.values().any(|r| r.path == route.path) {
            return Err(ServiceError::Conflict(format!("Route path '{}' already exists", route.path)));
        }
        tables.routes.insert(route.id, route.clone());
        Ok(())
    }

    async fn insert_route_if_absent(&self, route: &Route) -> Result<bool, ServiceError> {
        let mut tables = self.tables()?;
        if tables.routes.values().any(|r| r.path == route.path) {
            return Ok(false);
        }
        tables.routes.insert(route.id, route.clone());
        Ok(true)
    }

    async fn find_route(&self, id: Uuid) -> Result<Option<Route>, ServiceError> {
        Ok(self.tables()?.routes.get(&id).cloned())
    }

    async fn list_routes(&self) -> Result<Vec<Route>, ServiceError> {
        let mut routes: Vec<Route> = self.tables()?.routes.values().cloned().collect();
        routes.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(routes)
    }

    async fn list_route_paths(&self) -> Result<HashSet<String>, ServiceError> {
        Ok(self.tables()?.routes.values().map(|r| r.path.clone()).collect())
    }

    async fn update_route(&self, route: &Route) -> Result<bool, ServiceError> {
        let mut tables = self.tables()?;
        match tables.routes.get_mut(&route.id) {
            Some(existing) => {
                *existing = route.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_route(&self, id: Uuid) -> Result<bool, ServiceError> {
        Ok(self.tables()?.routes.remove(&id).is_some())
    }

    async fn count_routes(&self) -> Result<i64, ServiceError> {
        Ok(self.tables()?.routes.len() as i64)
    }

    async fn append_audit(&self, entry: &AuditLogEntry) -> Result<(), ServiceError> {
        self.tables()?.audit.push(entry.clone());
        Ok(())
    }

    async fn recent_audit(&self, limit: i64) -> Result<Vec<AuditLogEntry>, ServiceError> {
        let tables = self.tables()?;
        Ok(tables
            .audit
            .iter()
            .rev()
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}
