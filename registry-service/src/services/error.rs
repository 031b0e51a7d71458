use crate::models::Role;
use service_core::error::AppError;
use std::fmt;
use thiserror::Error;

/// Specific reason an authorization check failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Denial {
    /// The principal holds no role in the target team.
    NotATeamMember { team_id: String },
    /// The principal's role is below what the action requires, or the action
    /// touches a peer or role reserved to ADMIN.
    InsufficientRole {
        team_id: String,
        required: Role,
        actual: Option<Role>,
    },
}

impl fmt::Display for Denial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Denial::NotATeamMember { team_id } => {
                write!(f, "not a member of team '{}'", team_id)
            }
            Denial::InsufficientRole {
                team_id,
                required,
                actual,
            } => match actual {
                Some(actual) => write!(
                    f,
                    "insufficient role in team '{}': requires {}, has {}",
                    team_id, required, actual
                ),
                None => write!(
                    f,
                    "insufficient role in team '{}': requires {}",
                    team_id, required
                ),
            },
        }
    }
}

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("Forbidden: {0}")]
    Forbidden(Denial),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Team '{team_id}' still has {} member(s): {}", members.len(), members.join(", "))]
    TeamNotEmpty {
        team_id: String,
        members: Vec<String>,
    },

    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ServiceError {
    pub fn not_member(team_id: &str) -> Self {
        ServiceError::Forbidden(Denial::NotATeamMember {
            team_id: team_id.to_string(),
        })
    }

    pub fn insufficient(team_id: &str, required: Role, actual: Option<Role>) -> Self {
        ServiceError::Forbidden(Denial::InsufficientRole {
            team_id: team_id.to_string(),
            required,
            actual,
        })
    }

    /// Short label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::Unauthenticated(_) => "unauthenticated",
            ServiceError::Forbidden(Denial::NotATeamMember { .. }) => "not_a_team_member",
            ServiceError::Forbidden(Denial::InsufficientRole { .. }) => "insufficient_role",
            ServiceError::Conflict(_) => "conflict",
            ServiceError::NotFound(_) => "not_found",
            ServiceError::Validation(_) => "validation",
            ServiceError::TeamNotEmpty { .. } => "team_not_empty",
            ServiceError::UpstreamUnavailable(_) => "upstream_unavailable",
            ServiceError::Internal(_) => "internal",
        }
    }
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::Validation(err.to_string())
    }
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Unauthenticated(e) => AppError::Unauthorized(anyhow::anyhow!(e)),
            ServiceError::Forbidden(denial) => AppError::Forbidden(anyhow::anyhow!(denial.to_string())),
            ServiceError::Conflict(e) => AppError::Conflict(anyhow::anyhow!(e)),
            ServiceError::NotFound(e) => AppError::NotFound(anyhow::anyhow!(e)),
            ServiceError::Validation(e) => AppError::ValidationError(e),
            e @ ServiceError::TeamNotEmpty { .. } => AppError::Conflict(anyhow::anyhow!(e.to_string())),
            ServiceError::UpstreamUnavailable(e) => AppError::BadGateway(e),
            ServiceError::Internal(e) => AppError::InternalError(e),
        }
    }
}
