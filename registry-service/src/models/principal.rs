//! Principal model - an authenticated actor as seen by the identity directory.

use super::Role;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Authenticated actor with an optional global role and per-team roles.
///
/// `team_roles` keys may name teams that do not exist in the relational store yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub global_role: Option<Role>,
    #[serde(default)]
    pub team_roles: BTreeMap<String, Role>,
}

impl Principal {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: None,
            global_role: None,
            team_roles: BTreeMap::new(),
        }
    }

    pub fn with_global_role(mut self, role: Role) -> Self {
        self.global_role = Some(role);
        self
    }

    pub fn with_team_role(mut self, team_id: impl Into<String>, role: Role) -> Self {
        self.team_roles.insert(team_id.into(), role);
        self
    }

    /// Highest role held in any team, never below VIEWER.
    pub fn highest_role(&self) -> Role {
        self.team_roles
            .values()
            .copied()
            .max()
            .unwrap_or(Role::Viewer)
    }

    /// Role used for global checks: the better of the explicit global role and
    /// the highest team role.
    pub fn effective_global_role(&self) -> Role {
        self.global_role
            .map_or(self.highest_role(), |g| g.max(self.highest_role()))
    }

    pub fn is_global_admin(&self) -> bool {
        self.effective_global_role() == Role::Admin
    }

    pub fn role_in(&self, team_id: &str) -> Option<Role> {
        self.team_roles.get(team_id).copied()
    }

    pub fn is_member_of(&self, team_id: &str) -> bool {
        self.team_roles.contains_key(team_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn highest_role_defaults_to_viewer() {
        assert_eq!(Principal::new("u1").highest_role(), Role::Viewer);
    }

    #[test]
    fn highest_role_is_max_over_teams() {
        let p = Principal::new("u1")
            .with_team_role("alpha", Role::Developer)
            .with_team_role("beta", Role::Manager);
        assert_eq!(p.highest_role(), Role::Manager);
        assert!(!p.is_global_admin());
    }

    #[test]
    fn admin_in_any_team_is_global_admin() {
        let p = Principal::new("u1").with_team_role("alpha", Role::Admin);
        assert!(p.is_global_admin());
    }

    #[test]
    fn explicit_global_role_counts() {
        let p = Principal::new("u1").with_global_role(Role::Admin);
        assert!(p.is_global_admin());
        assert_eq!(p.highest_role(), Role::Viewer);
        assert_eq!(p.role_in("alpha"), None);
    }
}
