//! Team and membership handlers.

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
};
use serde::Deserialize;
use service_core::error::AppError;

use super::Authenticated;
use crate::models::{NewTeam, Role, Team, TeamMember, TeamPatch, TeamSummary};
use crate::startup::AppState;

// ============================================================================
// Request DTOs
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct AddMemberRequest {
    pub principal_id: String,
    pub role: String,
}

#[derive(Debug, Deserialize)]
pub struct ChangeRoleRequest {
    pub role: String,
}

fn parse_role(raw: &str) -> Result<Role, AppError> {
    raw.parse().map_err(AppError::ValidationError)
}

// ============================================================================
// Handlers
// ============================================================================

pub async fn list_teams(
    State(state): State<AppState>,
    Authenticated(principal): Authenticated,
) -> Result<Json<Vec<TeamSummary>>, AppError> {
    Ok(Json(state.gateway.list_teams(&principal).await?))
}

pub async fn get_team(
    State(state): State<AppState>,
    Authenticated(principal): Authenticated,
    Path(team_id): Path<String>,
) -> Result<Json<Team>, AppError> {
    Ok(Json(state.gateway.get_team(&principal, &team_id).await?))
}

/// POST /api/teams (global ADMIN)
pub async fn create_team(
    State(state): State<AppState>,
    Authenticated(principal): Authenticated,
    Json(req): Json<NewTeam>,
) -> Result<(StatusCode, Json<Team>), AppError> {
    let team = state.gateway.create_team(&principal, req).await?;
    Ok((StatusCode::CREATED, Json(team)))
}

pub async fn update_team(
    State(state): State<AppState>,
    Authenticated(principal): Authenticated,
    Path(team_id): Path<String>,
    Json(patch): Json<TeamPatch>,
) -> Result<Json<Team>, AppError> {
    Ok(Json(state.gateway.update_team(&principal, &team_id, patch).await?))
}

/// DELETE /api/teams/:id
///
/// Refused with 409 and the blocking members while the team has any.
pub async fn delete_team(
    State(state): State<AppState>,
    Authenticated(principal): Authenticated,
    Path(team_id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.gateway.delete_team(&principal, &team_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_members(
    State(state): State<AppState>,
    Authenticated(principal): Authenticated,
    Path(team_id): Path<String>,
) -> Result<Json<Vec<TeamMember>>, AppError> {
    Ok(Json(state.gateway.list_team_members(&principal, &team_id).await?))
}

pub async fn add_member(
    State(state): State<AppState>,
    Authenticated(principal): Authenticated,
    Path(team_id): Path<String>,
    Json(req): Json<AddMemberRequest>,
) -> Result<(StatusCode, Json<TeamMember>), AppError> {
    let role = parse_role(&req.role)?;
    let member = state
        .gateway
        .add_member(&principal, &team_id, &req.principal_id, role)
        .await?;
    Ok((StatusCode::CREATED, Json(member)))
}

pub async fn change_member_role(
    State(state): State<AppState>,
    Authenticated(principal): Authenticated,
    Path((team_id, member_id)): Path<(String, String)>,
    Json(req): Json<ChangeRoleRequest>,
) -> Result<Json<TeamMember>, AppError> {
    let role = parse_role(&req.role)?;
    Ok(Json(
        state
            .gateway
            .change_member_role(&principal, &team_id, &member_id, role)
            .await?,
    ))
}

pub async fn remove_member(
    State(state): State<AppState>,
    Authenticated(principal): Authenticated,
    Path((team_id, member_id)): Path<(String, String)>,
) -> Result<StatusCode, AppError> {
    state
        .gateway
        .remove_member(&principal, &team_id, &member_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
