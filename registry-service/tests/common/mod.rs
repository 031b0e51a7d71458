//! Common test utilities for registry-service integration tests.
//!
//! Everything runs over the in-memory store, edge cache and directory; no
//! external services are needed.

#![allow(dead_code)]

use registry_service::authz::Gateway;
use registry_service::models::{Principal, Role, Team, Token, CORE_TEAM_ID};
use registry_service::reconcile::{ReconcileSettings, Reconciler};
use registry_service::services::{
    AesGcmCipher, MemoryDirectory, MemoryEdgeCache, MemoryStore, RegistryStore, SecretCipher,
};
use registry_service::startup::{build_router, AppState};
use axum::Router;
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::{Arc, Once};
use std::time::Duration;
use uuid::Uuid;

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,registry_service=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub struct TestRegistry {
    pub store: Arc<MemoryStore>,
    pub cache: Arc<MemoryEdgeCache>,
    pub directory: Arc<MemoryDirectory>,
    pub cipher: Arc<AesGcmCipher>,
    pub state: AppState,
}

impl TestRegistry {
    pub async fn new() -> Self {
        Self::with_cache(MemoryEdgeCache::new()).await
    }

    pub async fn with_cache(cache: MemoryEdgeCache) -> Self {
        init_tracing();

        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(cache);
        let directory = Arc::new(MemoryDirectory::new());
        let cipher = Arc::new(AesGcmCipher::new(&[42u8; 32]));

        store
            .insert_team(&Team::core())
            .await
            .expect("Failed to seed core team");

        let state = AppState::new(
            store.clone(),
            cache.clone(),
            directory.clone(),
            cipher.clone(),
            ReconcileSettings {
                page_size: 2,
                entry_timeout: Duration::from_secs(2),
            },
        );

        Self {
            store,
            cache,
            directory,
            cipher,
            state,
        }
    }

    pub fn gateway(&self) -> &Gateway {
        &self.state.gateway
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.state.reconciler
    }

    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    pub async fn seed_team(&self, id: &str) -> Team {
        let team = Team::new(id, id.to_uppercase(), "seed");
        self.store.insert_team(&team).await.expect("Failed to seed team");
        team
    }

    /// Registers a principal with the directory and returns it.
    pub fn principal(&self, id: &str, teams: &[(&str, Role)]) -> Principal {
        let mut principal = Principal::new(id);
        principal.email = Some(format!("{}@example.com", id));
        for (team, role) in teams {
            principal = principal.with_team_role(*team, *role);
        }
        self.directory.add_principal(principal.clone());
        self.directory.add_credential(&format!("cred-{}", id), id);
        principal
    }

    /// A global ADMIN holding no team membership.
    pub fn global_admin(&self, id: &str) -> Principal {
        let principal = Principal::new(id).with_global_role(Role::Admin);
        self.directory.add_principal(principal.clone());
        self.directory.add_credential(&format!("cred-{}", id), id);
        principal
    }

    pub fn core_admin(&self, id: &str) -> Principal {
        self.principal(id, &[(CORE_TEAM_ID, Role::Admin)])
    }

    /// Inserts a token row directly, bypassing the gateway.
    pub async fn seed_token(&self, team_id: &str, hash: &str) -> Token {
        let token = Token {
            id: Uuid::new_v4(),
            hash: hash.to_string(),
            encrypted_secret: Some(self.cipher.encrypt("ntk_seeded").expect("encrypt")),
            name: format!("seed-{}", hash),
            team_id: team_id.to_string(),
            created_by: "seed".to_string(),
            description: String::new(),
            scopes: BTreeSet::from(["*".to_string()]),
            created_at: Utc::now(),
            expires_at: None,
            last_used_at: None,
            active: true,
        };
        self.store.insert_token(&token).await.expect("Failed to seed token");
        token
    }
}
