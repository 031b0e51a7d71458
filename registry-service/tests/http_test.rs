//! HTTP surface: routing, credential extraction and error mapping.

mod common;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use common::TestRegistry;
use registry_service::models::Role;
use serde_json::{json, Value};
use tower::ServiceExt;

async fn send(app: &TestRegistry, method: Method, uri: &str, credential: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(credential) = credential {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", credential));
    }
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.router().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

#[tokio::test]
async fn health_reports_ok() {
    let app = TestRegistry::new().await;
    let (status, body) = send(&app, Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["edge_cache"], "configured");
}

#[tokio::test]
async fn api_requires_bearer_credential() {
    let app = TestRegistry::new().await;
    let (status, _) = send(&app, Method::GET, "/api/tokens", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(&app, Method::GET, "/api/tokens", Some("cred-nobody"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn forbidden_body_names_the_denial() {
    let app = TestRegistry::new().await;
    app.seed_team("alpha").await;
    app.principal("eve", &[("beta", Role::Developer)]);

    let body = json!({ "name": "ci", "team_id": "alpha", "scopes": ["image"] });
    let (status, value) = send(&app, Method::POST, "/api/tokens", Some("cred-eve"), Some(body)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(value["error"].as_str().unwrap().contains("not a member of team 'alpha'"));
}

#[tokio::test]
async fn create_token_returns_secret_once() {
    let app = TestRegistry::new().await;
    app.seed_team("alpha").await;
    app.principal("dev", &[("alpha", Role::Developer)]);

    let body = json!({ "name": "ci", "team_id": "alpha", "scopes": ["image"], "expires_days": 7 });
    let (status, created) = send(&app, Method::POST, "/api/tokens", Some("cred-dev"), Some(body)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(created["secret"].as_str().unwrap().starts_with("ntk_"));
    assert!(created.get("encrypted_secret").is_none());

    let (status, listed) = send(&app, Method::GET, "/api/tokens", Some("cred-dev"), None).await;
    assert_eq!(status, StatusCode::OK);
    let listed = listed.as_array().unwrap();
    assert_eq!(listed.len(), 1);
    assert!(listed[0].get("secret").is_none());
}

#[tokio::test]
async fn team_deletion_conflict_maps_to_409() {
    let app = TestRegistry::new().await;
    app.seed_team("alpha").await;
    app.principal("ann", &[("alpha", Role::Viewer)]);
    app.global_admin("root");

    let (status, value) = send(&app, Method::DELETE, "/api/teams/alpha", Some("cred-root"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(value["error"].as_str().unwrap().contains("ann@example.com"));
}

#[tokio::test]
async fn invalid_member_role_is_rejected() {
    let app = TestRegistry::new().await;
    app.seed_team("alpha").await;
    app.principal("boss", &[("alpha", Role::Admin)]);
    app.principal("dev", &[]);

    let body = json!({ "principal_id": "dev", "role": "OWNER" });
    let (status, _) = send(&app, Method::POST, "/api/teams/alpha/members", Some("cred-boss"), Some(body)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let body = json!({ "principal_id": "dev", "role": "DEVELOPER" });
    let (status, member) = send(&app, Method::POST, "/api/teams/alpha/members", Some("cred-boss"), Some(body)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(member["role"], "DEVELOPER");
}

#[tokio::test]
async fn reconcile_endpoint_is_admin_only() {
    let app = TestRegistry::new().await;
    app.principal("dev", &[("alpha", Role::Developer)]);
    app.global_admin("root");
    app.cache.insert("token:h1", r#"{"name":"legacy","scopes":["image"]}"#);

    let (status, _) = send(&app, Method::POST, "/api/reconcile", Some("cred-dev"), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, report) = send(&app, Method::POST, "/api/reconcile", Some("cred-root"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["tokensImported"], 1);
}
