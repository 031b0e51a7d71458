//! Domain models for registry-service.

pub mod audit_log;
pub mod principal;
pub mod role;
pub mod route;
pub mod team;
pub mod token;

pub use audit_log::{AuditAction, AuditLogEntry, EntityType, RegistryStats};
pub use principal::Principal;
pub use role::{Role, RoleUpdate};
pub use route::{
    route_auth_key, validate_route_path, BackendAuthInput, BackendAuthType, NewRoute, Route, RouteAuth,
    RouteAuthSecret, RouteEntry, RouteUpdate, ROUTES_KEY, ROUTE_AUTH_KEY_PREFIX,
};
pub use team::{
    validate_team_id, NewTeam, Team, TeamMember, TeamPatch, TeamSummary, CORE_TEAM_ID, DEFAULT_TEAM_COLOR,
    SYSTEM_ACTOR,
};
pub use token::{
    token_cache_key, CachedToken, CreatedToken, NewToken, RevealedToken, Token, TokenUpdate,
    CACHE_IMPORT_ACTOR, DEFAULT_EXPIRY_DAYS, MASKED_SECRET, TOKEN_KEY_PREFIX,
};
