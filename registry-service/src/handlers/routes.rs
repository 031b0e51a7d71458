//! Route handlers. Route authority always sits with the core team.

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
};
use service_core::error::AppError;
use uuid::Uuid;

use super::Authenticated;
use crate::models::{NewRoute, Route, RouteUpdate};
use crate::startup::AppState;

pub async fn list_routes(
    State(state): State<AppState>,
    Authenticated(principal): Authenticated,
) -> Result<Json<Vec<Route>>, AppError> {
    Ok(Json(state.gateway.list_routes(&principal).await?))
}

pub async fn list_tags(
    State(state): State<AppState>,
    Authenticated(principal): Authenticated,
) -> Result<Json<Vec<String>>, AppError> {
    Ok(Json(state.gateway.list_tags(&principal).await?))
}

pub async fn get_route(
    State(state): State<AppState>,
    Authenticated(principal): Authenticated,
    Path(id): Path<Uuid>,
) -> Result<Json<Route>, AppError> {
    Ok(Json(state.gateway.get_route(&principal, id).await?))
}

pub async fn create_route(
    State(state): State<AppState>,
    Authenticated(principal): Authenticated,
    Json(req): Json<NewRoute>,
) -> Result<(StatusCode, Json<Route>), AppError> {
    let route = state.gateway.create_route(&principal, req).await?;
    Ok((StatusCode::CREATED, Json(route)))
}

pub async fn update_route(
    State(state): State<AppState>,
    Authenticated(principal): Authenticated,
    Path(id): Path<Uuid>,
    Json(req): Json<RouteUpdate>,
) -> Result<Json<Route>, AppError> {
    Ok(Json(state.gateway.update_route(&principal, id, req).await?))
}

pub async fn delete_route(
    State(state): State<AppState>,
    Authenticated(principal): Authenticated,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.gateway.delete_route(&principal, id).await?;
    Ok(StatusCode::NO_CONTENT)
}
