//! Authorization: the role hierarchy evaluator and the gateway that applies it.

pub mod evaluator;
pub mod gateway;

pub use evaluator::{
    check_membership_change, has_global_permission, has_team_permission, Action, Decision, Operation, Resource,
};
pub use gateway::Gateway;
