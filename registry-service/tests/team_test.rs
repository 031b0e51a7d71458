//! Team lifecycle and membership listing.

mod common;

use common::TestRegistry;
use registry_service::models::{token_cache_key, NewTeam, Role, TeamPatch, CORE_TEAM_ID};
use registry_service::services::{Denial, IdentityDirectory, RegistryStore, ServiceError};

fn new_team(id: &str) -> NewTeam {
    NewTeam {
        id: id.to_string(),
        name: "Platform".to_string(),
        description: String::new(),
        color: Some(String::new()),
        icon: Some("rocket".to_string()),
    }
}

#[tokio::test]
async fn create_team_makes_creator_admin() {
    let app = TestRegistry::new().await;
    let admin = app.global_admin("root");

    let team = app.gateway().create_team(&admin, new_team("platform")).await.unwrap();
    assert_eq!(team.created_by, "root");
    assert_eq!(team.color, "#3b82f6");
    assert_eq!(team.icon, "rocket");

    let root = app.directory.get_principal("root").await.unwrap();
    assert_eq!(root.role_in("platform"), Some(Role::Admin));

    let err = app.gateway().create_team(&admin, new_team("platform")).await.unwrap_err();
    assert!(matches!(err, ServiceError::Conflict(_)));
}

#[tokio::test]
async fn create_team_requires_global_admin() {
    let app = TestRegistry::new().await;
    let manager = app.principal("mgr", &[("alpha", Role::Manager)]);

    let err = app.gateway().create_team(&manager, new_team("platform")).await.unwrap_err();
    assert!(matches!(err, ServiceError::Forbidden(Denial::InsufficientRole { .. })));

    let err = app.gateway().create_team(&app.global_admin("root"), new_team("bad id")).await.unwrap_err();
    assert!(matches!(err, ServiceError::Validation(_)));
}

#[tokio::test]
async fn delete_is_blocked_while_members_remain() {
    let app = TestRegistry::new().await;
    app.seed_team("alpha").await;
    app.principal("ann", &[("alpha", Role::Developer)]);
    app.principal("bob", &[("alpha", Role::Viewer)]);
    let admin = app.global_admin("root");

    let err = app.gateway().delete_team(&admin, "alpha").await.unwrap_err();
    match err {
        ServiceError::TeamNotEmpty { team_id, members } => {
            assert_eq!(team_id, "alpha");
            assert_eq!(members, vec!["ann@example.com".to_string(), "bob@example.com".to_string()]);
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(app.store.find_team("alpha").await.unwrap().is_some());
}

#[tokio::test]
async fn delete_cascades_tokens_and_cache_entries() {
    let app = TestRegistry::new().await;
    app.seed_team("alpha").await;
    let token = app.seed_token("alpha", "h-alpha").await;
    let key = token_cache_key(&token.hash);
    app.cache.insert(&key, "{}");
    let admin = app.global_admin("root");

    app.gateway().delete_team(&admin, "alpha").await.unwrap();

    assert!(app.store.find_team("alpha").await.unwrap().is_none());
    assert!(app.store.find_token(token.id).await.unwrap().is_none());
    assert!(!app.cache.snapshot().contains_key(&key));
}

#[tokio::test]
async fn core_team_cannot_be_deleted() {
    let app = TestRegistry::new().await;
    let admin = app.global_admin("root");

    let err = app.gateway().delete_team(&admin, CORE_TEAM_ID).await.unwrap_err();
    assert!(matches!(err, ServiceError::Validation(_)));
    assert!(app.store.find_team(CORE_TEAM_ID).await.unwrap().is_some());
}

#[tokio::test]
async fn delete_fails_closed_when_directory_is_down() {
    let app = TestRegistry::new().await;
    app.seed_team("alpha").await;
    let admin = app.global_admin("root");
    app.directory.set_unavailable(true);

    let err = app.gateway().delete_team(&admin, "alpha").await.unwrap_err();
    assert!(matches!(err, ServiceError::UpstreamUnavailable(_)));
    assert!(app.store.find_team("alpha").await.unwrap().is_some());
}

#[tokio::test]
async fn list_teams_reports_member_counts() {
    let app = TestRegistry::new().await;
    app.seed_team("alpha").await;
    app.seed_team("beta").await;
    let viewer = app.principal("ann", &[("alpha", Role::Viewer)]);
    app.principal("bob", &[("alpha", Role::Developer), ("beta", Role::Manager)]);

    let teams = app.gateway().list_teams(&viewer).await.unwrap();
    let count = |id: &str| teams.iter().find(|t| t.team.id == id).map(|t| t.member_count);
    assert_eq!(count("alpha"), Some(2));
    assert_eq!(count("beta"), Some(1));
    assert_eq!(count(CORE_TEAM_ID), Some(0));

    app.directory.set_unavailable(true);
    let teams = app.gateway().list_teams(&viewer).await.unwrap();
    assert!(teams.iter().all(|t| t.member_count == 0));
}

#[tokio::test]
async fn members_are_visible_to_members_only() {
    let app = TestRegistry::new().await;
    app.seed_team("alpha").await;
    let member = app.principal("ann", &[("alpha", Role::Viewer)]);
    let outsider = app.principal("eve", &[("beta", Role::Manager)]);

    let members = app.gateway().list_team_members(&member, "alpha").await.unwrap();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].email.as_deref(), Some("ann@example.com"));

    assert!(matches!(
        app.gateway().list_team_members(&outsider, "alpha").await,
        Err(ServiceError::Forbidden(Denial::NotATeamMember { .. }))
    ));
}

#[tokio::test]
async fn update_team_needs_team_admin_unless_unclaimed() {
    let app = TestRegistry::new().await;
    app.seed_team("alpha").await;
    app.seed_team("zeta").await;
    let manager = app.principal("mgr", &[("alpha", Role::Manager)]);
    let admin = app.global_admin("root");
    let patch = TeamPatch {
        name: Some("Renamed".to_string()),
        ..Default::default()
    };

    assert!(matches!(
        app.gateway().update_team(&manager, "alpha", patch.clone()).await,
        Err(ServiceError::Forbidden(Denial::InsufficientRole { .. }))
    ));
    assert!(matches!(
        app.gateway().update_team(&admin, "alpha", patch.clone()).await,
        Err(ServiceError::Forbidden(Denial::NotATeamMember { .. }))
    ));

    let team = app.gateway().update_team(&admin, "zeta", patch).await.unwrap();
    assert_eq!(team.name, "Renamed");
}
