//! Token handlers.

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
};
use service_core::error::AppError;
use uuid::Uuid;

use super::Authenticated;
use crate::models::{CreatedToken, NewToken, RevealedToken, Token, TokenUpdate};
use crate::startup::AppState;

/// GET /api/tokens
pub async fn list_tokens(
    State(state): State<AppState>,
    Authenticated(principal): Authenticated,
) -> Result<Json<Vec<Token>>, AppError> {
    Ok(Json(state.gateway.list_tokens(&principal).await?))
}

/// GET /api/tokens/:id
pub async fn get_token(
    State(state): State<AppState>,
    Authenticated(principal): Authenticated,
    Path(id): Path<Uuid>,
) -> Result<Json<Token>, AppError> {
    Ok(Json(state.gateway.get_token(&principal, id).await?))
}

/// POST /api/tokens
///
/// The response is the only place the raw secret appears.
pub async fn create_token(
    State(state): State<AppState>,
    Authenticated(principal): Authenticated,
    Json(req): Json<NewToken>,
) -> Result<(StatusCode, Json<CreatedToken>), AppError> {
    let created = state.gateway.create_token(&principal, req).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// PUT /api/tokens/:id
pub async fn update_token(
    State(state): State<AppState>,
    Authenticated(principal): Authenticated,
    Path(id): Path<Uuid>,
    Json(req): Json<TokenUpdate>,
) -> Result<Json<Token>, AppError> {
    Ok(Json(state.gateway.update_token(&principal, id, req).await?))
}

/// DELETE /api/tokens/:id
pub async fn delete_token(
    State(state): State<AppState>,
    Authenticated(principal): Authenticated,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.gateway.delete_token(&principal, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/tokens/:id/reveal
pub async fn reveal_token(
    State(state): State<AppState>,
    Authenticated(principal): Authenticated,
    Path(id): Path<Uuid>,
) -> Result<Json<RevealedToken>, AppError> {
    Ok(Json(state.gateway.reveal_token(&principal, id).await?))
}
