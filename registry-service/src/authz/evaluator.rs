//! Role hierarchy evaluator: pure decisions over (principal, team, action).

use crate::models::{Principal, Role};
use crate::services::Denial;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    Token,
    Route,
    Membership,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Edit,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Action {
    pub resource: Resource,
    pub operation: Operation,
}

impl Action {
    pub const fn new(resource: Resource, operation: Operation) -> Self {
        Self { resource, operation }
    }

    /// Minimum role in the target team.
    pub fn min_role(&self) -> Role {
        match (self.resource, self.operation) {
            (Resource::Token, Operation::Create) => Role::Developer,
            (Resource::Token, Operation::Edit) => Role::Manager,
            (Resource::Token, Operation::Delete) => Role::Manager,
            (Resource::Route, Operation::Create) => Role::Developer,
            (Resource::Route, Operation::Edit) => Role::Manager,
            (Resource::Route, Operation::Delete) => Role::Admin,
            (Resource::Membership, _) => Role::Manager,
        }
    }

    /// Whether a global ADMIN passes without holding a role in the team.
    fn admin_short_circuit(&self) -> bool {
        !matches!(self.resource, Resource::Membership)
    }

    pub fn label(&self) -> &'static str {
        match (self.resource, self.operation) {
            (Resource::Token, Operation::Create) => "token.create",
            (Resource::Token, Operation::Edit) => "token.edit",
            (Resource::Token, Operation::Delete) => "token.delete",
            (Resource::Route, Operation::Create) => "route.create",
            (Resource::Route, Operation::Edit) => "route.edit",
            (Resource::Route, Operation::Delete) => "route.delete",
            (Resource::Membership, Operation::Create) => "membership.add",
            (Resource::Membership, Operation::Edit) => "membership.edit",
            (Resource::Membership, Operation::Delete) => "membership.remove",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Denied(Denial),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }
}

pub fn has_global_permission(principal: &Principal, required: Role) -> bool {
    principal.effective_global_role() >= required
}

pub fn has_team_permission(principal: &Principal, team_id: &str, action: Action) -> Decision {
    if action.admin_short_circuit() && principal.is_global_admin() {
        return Decision::Allowed;
    }
    let required = action.min_role();
    match principal.role_in(team_id) {
        None => Decision::Denied(Denial::NotATeamMember {
            team_id: team_id.to_string(),
        }),
        Some(role) if role >= required => Decision::Allowed,
        Some(role) => Decision::Denied(Denial::InsufficientRole {
            team_id: team_id.to_string(),
            required,
            actual: Some(role),
        }),
    }
}

/// Peer rule for membership changes by an actor already holding MANAGER or above.
///
/// Only ADMIN may grant MANAGER/ADMIN or touch a principal currently holding either.
pub fn check_membership_change(
    actor_role: Role,
    team_id: &str,
    target_current: Option<Role>,
    new_role: Option<Role>,
) -> Decision {
    if actor_role == Role::Admin {
        return Decision::Allowed;
    }
    let touches_privileged = new_role.is_some_and(|r| r.is_privileged())
        || target_current.is_some_and(|r| r.is_privileged());
    if touches_privileged {
        return Decision::Denied(Denial::InsufficientRole {
            team_id: team_id.to_string(),
            required: Role::Admin,
            actual: Some(actor_role),
        });
    }
    Decision::Allowed
}

#[cfg(test)]
mod tests {
    use super::*;

    const DELETE_TOKEN: Action = Action::new(Resource::Token, Operation::Delete);

    #[test]
    fn delete_token_needs_manager_or_global_admin() {
        for role in Role::ALL {
            let p = Principal::new("u").with_team_role("alpha", role);
            let allowed = has_team_permission(&p, "alpha", DELETE_TOKEN).is_allowed();
            assert_eq!(allowed, role >= Role::Manager, "role {}", role);
        }

        let outsider_admin = Principal::new("a").with_global_role(Role::Admin);
        assert!(has_team_permission(&outsider_admin, "alpha", DELETE_TOKEN).is_allowed());

        // ADMIN in another team counts as global ADMIN
        let other_team_admin = Principal::new("b").with_team_role("beta", Role::Admin);
        assert!(has_team_permission(&other_team_admin, "alpha", DELETE_TOKEN).is_allowed());
    }

    #[test]
    fn non_member_is_distinct_from_insufficient_role() {
        let outsider = Principal::new("u").with_team_role("beta", Role::Manager);
        assert_eq!(
            has_team_permission(&outsider, "alpha", DELETE_TOKEN),
            Decision::Denied(Denial::NotATeamMember {
                team_id: "alpha".to_string()
            })
        );

        let viewer = Principal::new("u").with_team_role("alpha", Role::Viewer);
        assert!(matches!(
            has_team_permission(&viewer, "alpha", DELETE_TOKEN),
            Decision::Denied(Denial::InsufficientRole {
                required: Role::Manager,
                actual: Some(Role::Viewer),
                ..
            })
        ));
    }

    #[test]
    fn route_delete_requires_core_team_admin() {
        let action = Action::new(Resource::Route, Operation::Delete);
        let manager = Principal::new("m").with_team_role("core-team", Role::Manager);
        assert!(!has_team_permission(&manager, "core-team", action).is_allowed());

        let developer = Principal::new("d").with_team_role("core-team", Role::Developer);
        let create = Action::new(Resource::Route, Operation::Create);
        assert!(has_team_permission(&developer, "core-team", create).is_allowed());
    }

    #[test]
    fn membership_has_no_global_admin_short_circuit() {
        let admin = Principal::new("a").with_global_role(Role::Admin);
        let add = Action::new(Resource::Membership, Operation::Create);
        assert!(!has_team_permission(&admin, "alpha", add).is_allowed());
    }

    #[test]
    fn manager_never_touches_privileged_peers() {
        for privileged in [Role::Manager, Role::Admin] {
            assert!(!check_membership_change(Role::Manager, "t", None, Some(privileged)).is_allowed());
            assert!(!check_membership_change(Role::Manager, "t", Some(privileged), Some(Role::Viewer)).is_allowed());
            assert!(!check_membership_change(Role::Manager, "t", Some(privileged), None).is_allowed());
            assert!(check_membership_change(Role::Admin, "t", Some(privileged), None).is_allowed());
        }
        assert!(check_membership_change(Role::Manager, "t", Some(Role::Viewer), Some(Role::Developer)).is_allowed());
    }

    #[test]
    fn global_permission_uses_best_role() {
        let p = Principal::new("u")
            .with_global_role(Role::Developer)
            .with_team_role("alpha", Role::Manager);
        assert!(has_global_permission(&p, Role::Manager));
        assert!(!has_global_permission(&p, Role::Admin));
        assert!(!has_global_permission(&Principal::new("v"), Role::Developer));
    }
}
