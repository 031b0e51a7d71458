use axum::extract::{Json, State};
use service_core::error::AppError;

use super::Authenticated;
use crate::models::RegistryStats;
use crate::reconcile::ReconcileReport;
use crate::startup::AppState;

/// GET /api/stats
pub async fn get_stats(
    State(state): State<AppState>,
    Authenticated(principal): Authenticated,
) -> Result<Json<RegistryStats>, AppError> {
    Ok(Json(state.gateway.stats(&principal).await?))
}

/// POST /api/reconcile (global ADMIN)
pub async fn run_reconcile(
    State(state): State<AppState>,
    Authenticated(principal): Authenticated,
) -> Result<Json<ReconcileReport>, AppError> {
    state.gateway.require_admin(&principal)?;
    tracing::info!(principal_id = %principal.id, "Manual reconciliation requested");
    Ok(Json(state.reconciler.reconcile().await?))
}
