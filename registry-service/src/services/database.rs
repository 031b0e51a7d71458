//! PostgreSQL implementation of the registry store.

use crate::models::{AuditLogEntry, BackendAuthType, Route, Team, Token};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::store::RegistryStore;
use crate::services::ServiceError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::FromRow;
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

const TOKEN_COLUMNS: &str = "id, token_hash, encrypted_secret, name, team_id, created_by, description, scopes, created_at, expires_at, last_used_at, is_active";
const ROUTE_COLUMNS: &str = "id, name, path, backend_url, description, tags, backend_auth_type, backend_auth_config, created_at";

#[derive(Debug, FromRow)]
struct TokenRow {
    id: Uuid,
    token_hash: String,
    encrypted_secret: Option<String>,
    name: String,
    team_id: String,
    created_by: String,
    description: String,
    scopes: Vec<String>,
    created_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    last_used_at: Option<DateTime<Utc>>,
    is_active: bool,
}

impl From<TokenRow> for Token {
    fn from(row: TokenRow) -> Self {
        Token {
            id: row.id,
            hash: row.token_hash,
            encrypted_secret: row.encrypted_secret,
            name: row.name,
            team_id: row.team_id,
            created_by: row.created_by,
            description: row.description,
            scopes: row.scopes.into_iter().collect(),
            created_at: row.created_at,
            expires_at: row.expires_at,
            last_used_at: row.last_used_at,
            active: row.is_active,
        }
    }
}

#[derive(Debug, FromRow)]
struct RouteRow {
    id: Uuid,
    name: String,
    path: String,
    backend_url: String,
    description: String,
    tags: Vec<String>,
    backend_auth_type: String,
    backend_auth_config: Json<BTreeMap<String, String>>,
    created_at: DateTime<Utc>,
}

impl From<RouteRow> for Route {
    fn from(row: RouteRow) -> Self {
        let backend_auth_type = row.backend_auth_type.parse::<BackendAuthType>().unwrap_or_else(|e: String| {
            warn!(route_id = %row.id, error = %e, "Unknown backend auth type, treating as none");
            BackendAuthType::None
        });
        Route {
            id: row.id,
            name: row.name,
            path: row.path,
            backend_url: row.backend_url,
            description: row.description,
            tags: row.tags.into_iter().collect(),
            backend_auth_type,
            backend_auth_config: row.backend_auth_config.0,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct AuditRow {
    action: String,
    entity_type: String,
    entity_id: String,
    actor: String,
    details: Json<serde_json::Value>,
    created_at: DateTime<Utc>,
}

impl From<AuditRow> for AuditLogEntry {
    fn from(row: AuditRow) -> Self {
        AuditLogEntry {
            action: row.action,
            entity_type: row.entity_type,
            entity_id: row.entity_id,
            actor: row.actor,
            details: row.details.0,
            created_at: row.created_at,
        }
    }
}

/// Maps constraint violations onto the service taxonomy.
fn map_db_error(context: &str, e: sqlx::Error) -> ServiceError {
    if let sqlx::Error::Database(db) = &e {
        if db.is_unique_violation() {
            return ServiceError::Conflict(format!("{}: already exists", context));
        }
        if db.is_foreign_key_violation() {
            return ServiceError::NotFound(format!("{}: referenced team not found", context));
        }
        if db.is_check_violation() {
            return ServiceError::Validation(format!("{}: {}", context, db.message()));
        }
    }
    ServiceError::Internal(anyhow::anyhow!("{}: {}", context, e))
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    #[instrument(skip(database_url), fields(service = "registry-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    async fn insert_team_inner(&self, team: &Team, if_absent: bool) -> Result<bool, ServiceError> {
        let sql = format!(
            "INSERT INTO teams (id, name, description, color, icon, created_by, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7){}",
            if if_absent { " ON CONFLICT (id) DO NOTHING" } else { "" }
        );
        let result = sqlx::query(&sql)
            .bind(&team.id)
            .bind(&team.name)
            .bind(&team.description)
            .bind(&team.color)
            .bind(&team.icon)
            .bind(&team.created_by)
            .bind(team.created_at)
            .execute(&self.pool)
            .await
            .map_err(|e| map_db_error("insert team", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn insert_token_inner(&self, token: &Token, if_absent: bool) -> Result<bool, ServiceError> {
        let sql = format!(
            "INSERT INTO tokens ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12){}",
            TOKEN_COLUMNS,
            if if_absent { " ON CONFLICT (token_hash) DO NOTHING" } else { "" }
        );
        let scopes: Vec<String> = token.scopes.iter().cloned().collect();
        let result = sqlx::query(&sql)
            .bind(token.id)
            .bind(&token.hash)
            .bind(&token.encrypted_secret)
            .bind(&token.name)
            .bind(&token.team_id)
            .bind(&token.created_by)
            .bind(&token.description)
            .bind(&scopes)
            .bind(token.created_at)
            .bind(token.expires_at)
            .bind(token.last_used_at)
            .bind(token.active)
            .execute(&self.pool)
            .await
            .map_err(|e| map_db_error("insert token", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn insert_route_inner(&self, route: &Route, if_absent: bool) -> Result<bool, ServiceError> {
        let sql = format!(
            "INSERT INTO routes ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9){}",
            ROUTE_COLUMNS,
            if if_absent { " ON CONFLICT (path) DO NOTHING" } else { "" }
        );
        let tags: Vec<String> = route.tags.iter().cloned().collect();
        let result = sqlx::query(&sql)
            .bind(route.id)
            .bind(&route.name)
            .bind(&route.path)
            .bind(&route.backend_url)
            .bind(&route.description)
            .bind(&tags)
            .bind(route.backend_auth_type.as_str())
            .bind(Json(&route.backend_auth_config))
            .bind(route.created_at)
            .execute(&self.pool)
            .await
            .map_err(|e| map_db_error("insert route", e))?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl RegistryStore for Database {
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), ServiceError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!("Health check failed: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    // =========================================================================
    // Team Operations
    // =========================================================================

    #[instrument(skip(self, team), fields(team_id = %team.id))]
    async fn insert_team(&self, team: &Team) -> Result<(), ServiceError> {
        let timer = DB_QUERY_DURATION.with_label_values(&["insert_team"]).start_timer();
        self.insert_team_inner(team, false).await.map_err(|e| match e {
            ServiceError::Conflict(_) => ServiceError::Conflict(format!("Team ID '{}' already exists", team.id)),
            other => other,
        })?;
        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self, team), fields(team_id = %team.id))]
    async fn insert_team_if_absent(&self, team: &Team) -> Result<bool, ServiceError> {
        let timer = DB_QUERY_DURATION.with_label_values(&["insert_team"]).start_timer();
        let inserted = self.insert_team_inner(team, true).await?;
        timer.observe_duration();
        Ok(inserted)
    }

    #[instrument(skip(self))]
    async fn find_team(&self, team_id: &str) -> Result<Option<Team>, ServiceError> {
        let timer = DB_QUERY_DURATION.with_label_values(&["find_team"]).start_timer();
        let team = sqlx::query_as::<_, Team>(
            "SELECT id, name, description, color, icon, created_by, created_at FROM teams WHERE id = $1",
        )
        .bind(team_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_db_error("find team", e))?;
        timer.observe_duration();
        Ok(team)
    }

    #[instrument(skip(self))]
    async fn list_teams(&self) -> Result<Vec<Team>, ServiceError> {
        let timer = DB_QUERY_DURATION.with_label_values(&["list_teams"]).start_timer();
        let teams = sqlx::query_as::<_, Team>(
            "SELECT id, name, description, color, icon, created_by, created_at FROM teams ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_db_error("list teams", e))?;
        timer.observe_duration();
        Ok(teams)
    }

    #[instrument(skip(self, team), fields(team_id = %team.id))]
    async fn update_team(&self, team: &Team) -> Result<bool, ServiceError> {
        let timer = DB_QUERY_DURATION.with_label_values(&["update_team"]).start_timer();
        let result = sqlx::query(
            "UPDATE teams SET name = $2, description = $3, color = $4, icon = $5, updated_at = NOW() WHERE id = $1",
        )
        .bind(&team.id)
        .bind(&team.name)
        .bind(&team.description)
        .bind(&team.color)
        .bind(&team.icon)
        .execute(&self.pool)
        .await
        .map_err(|e| map_db_error("update team", e))?;
        timer.observe_duration();
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn delete_team(&self, team_id: &str) -> Result<bool, ServiceError> {
        let timer = DB_QUERY_DURATION.with_label_values(&["delete_team"]).start_timer();
        let result = sqlx::query("DELETE FROM teams WHERE id = $1")
            .bind(team_id)
            .execute(&self.pool)
            .await
            .map_err(|e| map_db_error("delete team", e))?;
        timer.observe_duration();
        Ok(result.rows_affected() == 1)
    }

    // =========================================================================
    // Token Operations
    // =========================================================================

    #[instrument(skip(self, token), fields(token_id = %token.id, team_id = %token.team_id))]
    async fn insert_token(&self, token: &Token) -> Result<(), ServiceError> {
        let timer = DB_QUERY_DURATION.with_label_values(&["insert_token"]).start_timer();
        self.insert_token_inner(token, false).await.map_err(|e| match e {
            ServiceError::NotFound(_) => ServiceError::NotFound(format!("Team '{}' not found", token.team_id)),
            ServiceError::Conflict(_) => ServiceError::Conflict("Token hash already exists".to_string()),
            other => other,
        })?;
        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self, token), fields(token_id = %token.id, team_id = %token.team_id))]
    async fn insert_token_if_absent(&self, token: &Token) -> Result<bool, ServiceError> {
        let timer = DB_QUERY_DURATION.with_label_values(&["insert_token"]).start_timer();
        let inserted = self.insert_token_inner(token, true).await?;
        timer.observe_duration();
        Ok(inserted)
    }

    #[instrument(skip(self))]
    async fn find_token(&self, id: Uuid) -> Result<Option<Token>, ServiceError> {
        let timer = DB_QUERY_DURATION.with_label_values(&["find_token"]).start_timer();
        let sql = format!("SELECT {} FROM tokens WHERE id = $1", TOKEN_COLUMNS);
        let row = sqlx::query_as::<_, TokenRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_db_error("find token", e))?;
        timer.observe_duration();
        Ok(row.map(Token::from))
    }

    #[instrument(skip(self, hash))]
    async fn find_token_by_hash(&self, hash: &str) -> Result<Option<Token>, ServiceError> {
        let timer = DB_QUERY_DURATION.with_label_values(&["find_token_by_hash"]).start_timer();
        let sql = format!("SELECT {} FROM tokens WHERE token_hash = $1", TOKEN_COLUMNS);
        let row = sqlx::query_as::<_, TokenRow>(&sql)
            .bind(hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_db_error("find token", e))?;
        timer.observe_duration();
        Ok(row.map(Token::from))
    }

    #[instrument(skip(self))]
    async fn list_tokens(&self) -> Result<Vec<Token>, ServiceError> {
        let timer = DB_QUERY_DURATION.with_label_values(&["list_tokens"]).start_timer();
        let sql = format!("SELECT {} FROM tokens ORDER BY created_at DESC", TOKEN_COLUMNS);
        let rows = sqlx::query_as::<_, TokenRow>(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_db_error("list tokens", e))?;
        timer.observe_duration();
        Ok(rows.into_iter().map(Token::from).collect())
    }

    #[instrument(skip(self))]
    async fn list_token_hashes(&self) -> Result<HashSet<String>, ServiceError> {
        let timer = DB_QUERY_DURATION.with_label_values(&["list_token_hashes"]).start_timer();
        let hashes: Vec<String> = sqlx::query_scalar("SELECT token_hash FROM tokens")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_db_error("list token hashes", e))?;
        timer.observe_duration();
        Ok(hashes.into_iter().collect())
    }

    #[instrument(skip(self, token), fields(token_id = %token.id))]
    async fn update_token(&self, token: &Token) -> Result<bool, ServiceError> {
        let timer = DB_QUERY_DURATION.with_label_values(&["update_token"]).start_timer();
        let scopes: Vec<String> = token.scopes.iter().cloned().collect();
        let result = sqlx::query(
            "UPDATE tokens SET name = $2, description = $3, scopes = $4, is_active = $5, last_used_at = $6 WHERE id = $1",
        )
        .bind(token.id)
        .bind(&token.name)
        .bind(&token.description)
        .bind(&scopes)
        .bind(token.active)
        .bind(token.last_used_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_db_error("update token", e))?;
        timer.observe_duration();
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn delete_token(&self, id: Uuid) -> Result<bool, ServiceError> {
        let timer = DB_QUERY_DURATION.with_label_values(&["delete_token"]).start_timer();
        let result = sqlx::query("DELETE FROM tokens WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| map_db_error("delete token", e))?;
        timer.observe_duration();
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn count_active_tokens(&self) -> Result<i64, ServiceError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tokens WHERE is_active = TRUE")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_db_error("count tokens", e))?;
        Ok(count)
    }

    // =========================================================================
    // Route Operations
    // =========================================================================

    #[instrument(skip(self, route), fields(path = %route.path))]
    async fn insert_route(&self, route: &Route) -> Result<(), ServiceError> {
        let timer = DB_QUERY_DURATION.with_label_values(&["insert_route"]).start_timer();
        self.insert_route_inner(route, false).await.map_err(|e| match e {
            ServiceError::Conflict(_) => {
                ServiceError::Conflict(format!("Route path '{}' already exists", route.path))
            }
            other => other,
        })?;
        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self, route), fields(path = %route.path))]
    async fn insert_route_if_absent(&self, route: &Route) -> Result<bool, ServiceError> {
        let timer = DB_QUERY_DURATION.with_label_values(&["insert_route"]).start_timer();
        let inserted = self.insert_route_inner(route, true).await?;
        timer.observe_duration();
        Ok(inserted)
    }

    #[instrument(skip(self))]
    async fn find_route(&self, id: Uuid) -> Result<Option<Route>, ServiceError> {
        let timer = DB_QUERY_DURATION.with_label_values(&["find_route"]).start_timer();
        let sql = format!("SELECT {} FROM routes WHERE id = $1", ROUTE_COLUMNS);
        let row = sqlx::query_as::<_, RouteRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_db_error("find route", e))?;
        timer.observe_duration();
        Ok(row.map(Route::from))
    }

    #[instrument(skip(self))]
    async fn list_routes(&self) -> Result<Vec<Route>, ServiceError> {
        let timer = DB_QUERY_DURATION.with_label_values(&["list_routes"]).start_timer();
        let sql = format!("SELECT {} FROM routes ORDER BY path", ROUTE_COLUMNS);
        let rows = sqlx::query_as::<_, RouteRow>(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_db_error("list routes", e))?;
        timer.observe_duration();
        Ok(rows.into_iter().map(Route::from).collect())
    }

    #[instrument(skip(self))]
    async fn list_route_paths(&self) -> Result<HashSet<String>, ServiceError> {
        let paths: Vec<String> = sqlx::query_scalar("SELECT path FROM routes")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_db_error("list route paths", e))?;
        Ok(paths.into_iter().collect())
    }

    #[instrument(skip(self, route), fields(route_id = %route.id))]
    async fn update_route(&self, route: &Route) -> Result<bool, ServiceError> {
        let timer = DB_QUERY_DURATION.with_label_values(&["update_route"]).start_timer();
        let tags: Vec<String> = route.tags.iter().cloned().collect();
        let result = sqlx::query(
            "UPDATE routes SET name = $2, backend_url = $3, description = $4, tags = $5, \
             backend_auth_type = $6, backend_auth_config = $7 WHERE id = $1",
        )
        .bind(route.id)
        .bind(&route.name)
        .bind(&route.backend_url)
        .bind(&route.description)
        .bind(&tags)
        .bind(route.backend_auth_type.as_str())
        .bind(Json(&route.backend_auth_config))
        .execute(&self.pool)
        .await
        .map_err(|e| map_db_error("update route", e))?;
        timer.observe_duration();
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn delete_route(&self, id: Uuid) -> Result<bool, ServiceError> {
        let timer = DB_QUERY_DURATION.with_label_values(&["delete_route"]).start_timer();
        let result = sqlx::query("DELETE FROM routes WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| map_db_error("delete route", e))?;
        timer.observe_duration();
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn count_routes(&self) -> Result<i64, ServiceError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM routes")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_db_error("count routes", e))?;
        Ok(count)
    }

    // =========================================================================
    // Audit Operations
    // =========================================================================

    #[instrument(skip(self, entry), fields(action = %entry.action, entity_type = %entry.entity_type))]
    async fn append_audit(&self, entry: &AuditLogEntry) -> Result<(), ServiceError> {
        sqlx::query(
            "INSERT INTO audit_logs (action, entity_type, entity_id, actor, details, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&entry.action)
        .bind(&entry.entity_type)
        .bind(&entry.entity_id)
        .bind(&entry.actor)
        .bind(Json(&entry.details))
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_db_error("append audit", e))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn recent_audit(&self, limit: i64) -> Result<Vec<AuditLogEntry>, ServiceError> {
        let rows = sqlx::query_as::<_, AuditRow>(
            "SELECT action, entity_type, entity_id, actor, details, created_at FROM audit_logs \
             ORDER BY created_at DESC, id DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_db_error("recent audit", e))?;
        Ok(rows.into_iter().map(AuditLogEntry::from).collect())
    }
}
