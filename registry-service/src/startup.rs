//! Application startup and lifecycle management.

use crate::authz::Gateway;
use crate::config::{decode_encryption_key, RegistryConfig};
use crate::handlers::{self, health_check, metrics_handler, readiness_check};
use crate::reconcile::{ReconcileSettings, Reconciler};
use crate::services::{
    init_metrics, AesGcmCipher, ClerkDirectory, CloudflareKv, Database, EdgeCache, IdentityDirectory,
    RegistryStore, SecretCipher,
};
use axum::{
    middleware,
    routing::{get, post, put},
    Router,
};
use secrecy::ExposeSecret;
use service_core::error::AppError;
use service_core::middleware::request_id_middleware;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Shared application state. Every collaborator is constructed once at
/// startup and injected here.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RegistryStore>,
    pub cache: Arc<dyn EdgeCache>,
    pub gateway: Arc<Gateway>,
    pub reconciler: Arc<Reconciler>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn RegistryStore>,
        cache: Arc<dyn EdgeCache>,
        directory: Arc<dyn IdentityDirectory>,
        cipher: Arc<dyn SecretCipher>,
        settings: ReconcileSettings,
    ) -> Self {
        let gateway = Gateway::new(
            Arc::clone(&store),
            Arc::clone(&cache),
            Arc::clone(&directory),
            cipher,
            settings.page_size,
        );
        let reconciler = Reconciler::new(Arc::clone(&store), Arc::clone(&cache), directory, settings);
        Self {
            store,
            cache,
            gateway: Arc::new(gateway),
            reconciler: Arc::new(reconciler),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/tokens", get(handlers::tokens::list_tokens).post(handlers::tokens::create_token))
        .route(
            "/tokens/:id",
            get(handlers::tokens::get_token)
                .put(handlers::tokens::update_token)
                .delete(handlers::tokens::delete_token),
        )
        .route("/tokens/:id/reveal", get(handlers::tokens::reveal_token))
        .route("/routes", get(handlers::routes::list_routes).post(handlers::routes::create_route))
        .route("/routes/tags", get(handlers::routes::list_tags))
        .route(
            "/routes/:id",
            get(handlers::routes::get_route)
                .put(handlers::routes::update_route)
                .delete(handlers::routes::delete_route),
        )
        .route("/teams", get(handlers::teams::list_teams).post(handlers::teams::create_team))
        .route(
            "/teams/:id",
            get(handlers::teams::get_team)
                .put(handlers::teams::update_team)
                .delete(handlers::teams::delete_team),
        )
        .route(
            "/teams/:id/members",
            get(handlers::teams::list_members).post(handlers::teams::add_member),
        )
        .route(
            "/teams/:id/members/:principal_id",
            put(handlers::teams::change_member_role).delete(handlers::teams::remove_member),
        )
        .route("/stats", get(handlers::stats::get_stats))
        .route("/reconcile", post(handlers::stats::run_reconcile));

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics_handler))
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: RegistryConfig) -> Result<Self, AppError> {
        init_metrics();

        let db = Database::new(
            config.database.url.expose_secret(),
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;
        db.run_migrations().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to run migrations");
            e
        })?;
        let store: Arc<dyn RegistryStore> = Arc::new(db);

        let kv = CloudflareKv::new(config.edge_cache.clone()).map_err(AppError::ConfigError)?;
        if !kv.is_configured() {
            tracing::info!("Edge cache credentials are placeholders - running without edge cache");
        }
        let cache: Arc<dyn EdgeCache> = Arc::new(kv);

        let directory: Arc<dyn IdentityDirectory> =
            Arc::new(ClerkDirectory::new(config.directory.clone()).map_err(AppError::ConfigError)?);

        let key = decode_encryption_key(&config.encryption_key)?;
        let cipher: Arc<dyn SecretCipher> = Arc::new(AesGcmCipher::new(&key));

        let settings = ReconcileSettings {
            page_size: config.reconcile.page_size,
            entry_timeout: config.reconcile.entry_timeout,
        };
        let state = AppState::new(store, cache, directory, cipher, settings);

        if config.reconcile.on_startup {
            match state.reconciler.reconcile().await {
                Ok(report) => tracing::info!(
                    tokens_imported = report.tokens_imported,
                    routes_imported = report.routes_imported,
                    errors = report.errors.len(),
                    "Startup reconciliation complete"
                ),
                Err(e) => tracing::error!(error = %e, "Startup reconciliation failed, continuing"),
            }
        }

        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        Ok(Self { port, listener, state })
    }

    /// Get the port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let router = build_router(self.state);

        tracing::info!(
            service = "registry-service",
            version = env!("CARGO_PKG_VERSION"),
            port = self.port,
            "Service ready to accept connections"
        );

        axum::serve(self.listener, router).await.map_err(|e| {
            tracing::error!(error = %e, "HTTP server error");
            std::io::Error::other(format!("HTTP server error: {}", e))
        })
    }
}
