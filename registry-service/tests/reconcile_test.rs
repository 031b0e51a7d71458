//! Edge cache to relational store reconciliation.

mod common;

use common::TestRegistry;
use registry_service::models::{Role, CORE_TEAM_ID, ROUTES_KEY};
use registry_service::reconcile::{ReconcileSettings, Reconciler};
use registry_service::services::{MemoryEdgeCache, RegistryStore};
use serde_json::json;
use std::time::{Duration, Instant};

fn cached_token(name: &str, team: Option<&str>) -> String {
    let mut value = json!({
        "name": name,
        "scopes": ["image"],
        "created_at": "2024-03-01T10:00:00Z",
        "expires_at": null,
    });
    if let Some(team) = team {
        value["team_id"] = json!(team);
    }
    value.to_string()
}

#[tokio::test]
async fn imports_missing_tokens_once() {
    let app = TestRegistry::new().await;
    app.seed_team("alpha").await;
    app.cache.insert("token:h1", &cached_token("one", Some("alpha")));
    app.cache.insert("token:h2", &cached_token("two", None));

    let first = app.reconciler().reconcile().await.unwrap();
    assert_eq!(first.tokens_imported, 2);
    assert_eq!(first.tokens_skipped, 0);
    assert!(first.errors.is_empty());

    let one = app.store.find_token_by_hash("h1").await.unwrap().unwrap();
    assert_eq!(one.team_id, "alpha");
    assert_eq!(one.created_by, "cache-import");
    assert!(one.encrypted_secret.is_none());
    let two = app.store.find_token_by_hash("h2").await.unwrap().unwrap();
    assert_eq!(two.team_id, CORE_TEAM_ID);

    let second = app.reconciler().reconcile().await.unwrap();
    assert_eq!(second.tokens_imported, 0);
    assert_eq!(second.tokens_skipped, 2);
    assert_eq!(app.store.list_tokens().await.unwrap().len(), 2);
}

#[tokio::test]
async fn never_overwrites_existing_rows() {
    let app = TestRegistry::new().await;
    app.seed_team("alpha").await;
    app.seed_team("beta").await;
    let existing = app.seed_token("alpha", "h1").await;
    app.cache.insert("token:h1", &cached_token("hijack", Some("beta")));

    let report = app.reconciler().reconcile().await.unwrap();
    assert_eq!(report.tokens_skipped, 1);

    let stored = app.store.find_token_by_hash("h1").await.unwrap().unwrap();
    assert_eq!(stored.id, existing.id);
    assert_eq!(stored.team_id, "alpha");
    assert_eq!(stored.name, existing.name);
}

#[tokio::test]
async fn materializes_team_known_to_directory() {
    let app = TestRegistry::new().await;
    app.principal("u1", &[("omega", Role::Developer)]);
    app.principal("u2", &[("omega", Role::Admin)]);
    app.principal("u3", &[("omega", Role::Admin)]);
    let mut entry: serde_json::Value = serde_json::from_str(&cached_token("t", Some("omega"))).unwrap();
    entry["team_name"] = json!("Omega Squad");
    entry["team_color"] = json!("#ff0000");
    app.cache.insert("token:h1", &entry.to_string());
    app.cache.insert("token:h2", &cached_token("t2", Some("omega")));

    let report = app.reconciler().reconcile().await.unwrap();
    assert_eq!(report.tokens_imported, 2);

    let team = app.store.find_team("omega").await.unwrap().expect("team materialized");
    assert_eq!(team.name, "Omega Squad");
    assert_eq!(team.color, "#ff0000");
    assert_eq!(team.created_by, "u2");
    let token = app.store.find_token_by_hash("h2").await.unwrap().unwrap();
    assert_eq!(token.team_id, "omega");
}

#[tokio::test]
async fn team_without_members_falls_back_to_core() {
    let app = TestRegistry::new().await;
    app.principal("u1", &[("alpha", Role::Admin)]);
    app.cache.insert("token:h1", &cached_token("orphan", Some("nobody-team")));
    app.cache.insert("token:h2", &cached_token("odd", Some("has space")));

    let report = app.reconciler().reconcile().await.unwrap();
    assert_eq!(report.tokens_imported, 2);

    assert!(app.store.find_team("nobody-team").await.unwrap().is_none());
    for hash in ["h1", "h2"] {
        let token = app.store.find_token_by_hash(hash).await.unwrap().unwrap();
        assert_eq!(token.team_id, CORE_TEAM_ID);
    }
}

#[tokio::test]
async fn unreadable_entry_does_not_stop_the_run() {
    let app = TestRegistry::new().await;
    app.cache.insert("token:h1", &cached_token("one", None));
    app.cache.insert("token:h2", &cached_token("two", None));
    app.cache.insert("token:h3", "{not json");
    app.cache.insert("token:h4", &cached_token("four", None));
    app.cache.fail_key("token:h2");

    let report = app.reconciler().reconcile().await.unwrap();
    assert_eq!(report.tokens_imported, 2);
    let failed: Vec<&str> = report.errors.iter().map(|e| e.key.as_str()).collect();
    assert_eq!(failed, vec!["token:h2", "token:h3"]);

    assert!(app.store.find_token_by_hash("h1").await.unwrap().is_some());
    assert!(app.store.find_token_by_hash("h2").await.unwrap().is_none());
    assert!(app.store.find_token_by_hash("h4").await.unwrap().is_some());
}

#[tokio::test]
async fn slow_entry_times_out_without_stopping_the_run() {
    let app = TestRegistry::new().await;
    app.cache.insert("token:h1", &cached_token("one", None));
    app.cache.insert("token:h2", &cached_token("slow", None));
    app.cache.insert("token:h3", &cached_token("three", None));
    app.cache.delay_key("token:h2", Duration::from_secs(30));

    let reconciler = Reconciler::new(
        app.store.clone(),
        app.cache.clone(),
        app.directory.clone(),
        ReconcileSettings {
            page_size: 2,
            entry_timeout: Duration::from_millis(100),
        },
    );
    let started = Instant::now();
    let report = reconciler.reconcile().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(10));

    assert_eq!(report.tokens_imported, 2);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].key, "token:h2");
    assert!(report.errors[0].message.contains("timed out"), "{}", report.errors[0].message);

    assert!(app.store.find_token_by_hash("h1").await.unwrap().is_some());
    assert!(app.store.find_token_by_hash("h2").await.unwrap().is_none());
    assert!(app.store.find_token_by_hash("h3").await.unwrap().is_some());
}

#[tokio::test]
async fn concurrent_import_loser_counts_as_skipped() {
    let app = TestRegistry::new().await;
    app.cache.insert("token:h1", &cached_token("one", None));
    // both runs snapshot the store before either reaches the insert
    app.cache.delay_key("token:h1", Duration::from_millis(50));

    let reconciler = || {
        Reconciler::new(
            app.store.clone(),
            app.cache.clone(),
            app.directory.clone(),
            ReconcileSettings::default(),
        )
    };
    let (first, second) = (reconciler(), reconciler());
    let (a, b) = tokio::join!(first.reconcile(), second.reconcile());
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.tokens_imported + b.tokens_imported, 1);
    assert_eq!(a.tokens_skipped + b.tokens_skipped, 1);
    assert!(a.errors.is_empty() && b.errors.is_empty());
    let imported: Vec<_> = app
        .store
        .list_tokens()
        .await
        .unwrap()
        .into_iter()
        .filter(|t| t.hash == "h1")
        .collect();
    assert_eq!(imported.len(), 1);
}

#[tokio::test]
async fn directory_outage_leaves_entry_for_next_run() {
    let app = TestRegistry::new().await;
    app.principal("u1", &[("omega", Role::Admin)]);
    app.cache.insert("token:h1", &cached_token("t", Some("omega")));
    app.cache.insert("token:h2", &cached_token("core", None));
    app.directory.set_unavailable(true);

    let report = app.reconciler().reconcile().await.unwrap();
    assert_eq!(report.tokens_imported, 1);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].key, "token:h1");

    app.directory.set_unavailable(false);
    let report = app.reconciler().reconcile().await.unwrap();
    assert_eq!(report.tokens_imported, 1);
    assert_eq!(report.tokens_skipped, 1);
    assert!(report.errors.is_empty());
    assert!(app.store.find_team("omega").await.unwrap().is_some());
}

#[tokio::test]
async fn follows_listing_cursor_across_pages() {
    let app = TestRegistry::with_cache(MemoryEdgeCache::with_page_size(2)).await;
    for i in 0..5 {
        app.cache.insert(&format!("token:h{}", i), &cached_token("paged", None));
    }
    app.cache.insert(ROUTES_KEY, "{}");

    let report = app.reconciler().reconcile().await.unwrap();
    assert_eq!(report.tokens_imported, 5);
    assert_eq!(app.store.list_tokens().await.unwrap().len(), 5);
}

#[tokio::test]
async fn imports_legacy_and_structured_routes() {
    let app = TestRegistry::new().await;
    let routes = json!({
        "/api/images": "https://images.internal",
        "/api/search": {
            "url": "https://search.internal",
            "tags": ["search", "beta"],
            "auth": { "type": "bearer", "config": { "header": "Authorization" } }
        },
        "no-slash": "https://bad.internal",
        "/api/empty": { "url": "" },
        "/api/number": 42
    });
    app.cache.insert(ROUTES_KEY, &routes.to_string());

    let report = app.reconciler().reconcile().await.unwrap();
    assert_eq!(report.routes_imported, 2);
    assert_eq!(report.routes_skipped, 0);
    let mut failed: Vec<&str> = report.errors.iter().map(|e| e.key.as_str()).collect();
    failed.sort_unstable();
    assert_eq!(failed, vec!["/api/empty", "/api/number", "no-slash"]);

    let stored = app.store.list_routes().await.unwrap();
    let paths: Vec<&str> = stored.iter().map(|r| r.path.as_str()).collect();
    assert_eq!(paths, vec!["/api/images", "/api/search"]);
    assert!(stored[1].tags.contains("beta"));
    assert_eq!(stored[1].backend_auth_config.get("header").map(String::as_str), Some("Authorization"));

    let again = app.reconciler().reconcile().await.unwrap();
    assert_eq!(again.routes_imported, 0);
    assert_eq!(again.routes_skipped, 2);
}

#[tokio::test]
async fn unreachable_cache_skips_the_run() {
    let app = TestRegistry::new().await;
    app.cache.insert("token:h1", &cached_token("one", None));
    app.cache.set_unreachable(true);

    let report = app.reconciler().reconcile().await.unwrap();
    assert!(report.skipped_reason.is_some());
    assert_eq!(report.tokens_imported, 0);
    assert!(report.errors.is_empty());
    assert!(app.store.list_tokens().await.unwrap().is_empty());
}

#[tokio::test]
async fn unconfigured_cache_skips_the_run() {
    let cache = MemoryEdgeCache::new();
    cache.set_configured(false);
    let app = TestRegistry::with_cache(cache).await;

    let report = app.reconciler().reconcile().await.unwrap();
    assert_eq!(report.skipped_reason.as_deref(), Some("edge cache not configured"));
    assert!(app.store.find_team(CORE_TEAM_ID).await.unwrap().is_some());
}
