//! Audit log model - append-only record of mutations.

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    Create,
    Update,
    Delete,
    Import,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Create => "create",
            AuditAction::Update => "update",
            AuditAction::Delete => "delete",
            AuditAction::Import => "import",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityType {
    Token,
    Route,
    Team,
    Membership,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Token => "token",
            EntityType::Route => "route",
            EntityType::Team => "team",
            EntityType::Membership => "membership",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditLogEntry {
    pub action: String,
    pub entity_type: String,
    pub entity_id: String,
    pub actor: String,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AuditLogEntry {
    pub fn new(
        action: AuditAction,
        entity_type: EntityType,
        entity_id: impl Into<String>,
        actor: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            action: action.as_str().to_string(),
            entity_type: entity_type.as_str().to_string(),
            entity_id: entity_id.into(),
            actor: actor.into(),
            details,
            created_at: Utc::now(),
        }
    }
}

/// Dashboard counters.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub total_active_tokens: i64,
    pub total_routes: i64,
    pub recent_activity: Vec<AuditLogEntry>,
}
