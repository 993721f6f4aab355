//! Incremental updates, cleanup, backups, and deregistration.

#[allow(dead_code)]
mod support;

use axum::http::StatusCode;
use serde_json::json;
use sewerrat::storage::sqlite::{QueryOptions, Store, StoreOptions};
use sewerrat::whitelist::LinkWhitelist;
use support::*;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn incremental_update_tracks_filesystem_churn() {
    let scratch = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    std::fs::create_dir(data.path().join("stuff")).unwrap();
    std::fs::write(data.path().join("stuff/metadata.json"), br#"{"v": "one"}"#).unwrap();
    std::fs::create_dir(data.path().join("doomed")).unwrap();
    std::fs::write(data.path().join("doomed/metadata.json"), br#"{"v": "two"}"#).unwrap();
    // Seeded files sit in the past so the modification below moves mtime.
    backdate(&data.path().join("stuff/metadata.json"), 120);
    backdate(&data.path().join("doomed/metadata.json"), 120);

    let service = test_service(scratch.path(), LinkWhitelist::new());
    register(&service.router, data.path(), None).await;

    let modified = data.path().join("stuff/metadata.json");
    let before = service
        .state
        .store
        .retrieve_path(modified.to_str().unwrap(), false)
        .unwrap()
        .expect("indexed");

    std::fs::write(&modified, br#"{"v": "one-changed"}"#).unwrap();
    std::fs::create_dir(data.path().join("fresh")).unwrap();
    std::fs::write(data.path().join("fresh/metadata.json"), br#"{"v": "three"}"#).unwrap();
    std::fs::remove_dir_all(data.path().join("doomed")).unwrap();

    let comments = service
        .state
        .store
        .update_directories(&CancellationToken::new())
        .await
        .unwrap();
    assert!(comments.is_empty(), "{comments:?}");

    let after = service
        .state
        .store
        .retrieve_path(modified.to_str().unwrap(), true)
        .unwrap()
        .expect("still indexed");
    assert!(after.time > before.time, "{} <= {}", after.time, before.time);
    assert_eq!(after.metadata.unwrap()["v"], "one-changed");

    assert!(service
        .state
        .store
        .retrieve_path(
            data.path().join("fresh/metadata.json").to_str().unwrap(),
            false
        )
        .unwrap()
        .is_some());
    assert!(service
        .state
        .store
        .retrieve_path(
            data.path().join("doomed/metadata.json").to_str().unwrap(),
            false
        )
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn update_purges_files_that_stop_parsing() {
    let scratch = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    let target = data.path().join("metadata.json");
    std::fs::write(&target, br#"{"v": "fine"}"#).unwrap();
    backdate(&target, 120);

    let service = test_service(scratch.path(), LinkWhitelist::new());
    register(&service.router, data.path(), None).await;

    std::fs::write(&target, b"{ no longer json").unwrap();
    let comments = service
        .state
        .store
        .update_directories(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(comments.len(), 1, "{comments:?}");
    assert!(comments[0].contains("metadata.json"));
    assert!(service
        .state
        .store
        .retrieve_path(target.to_str().unwrap(), false)
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn clean_database_drops_orphaned_interned_rows() {
    let scratch = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    std::fs::write(data.path().join("metadata.json"), br#"{"foo": "unique-token"}"#).unwrap();

    let service = test_service(scratch.path(), LinkWhitelist::new());
    register(&service.router, data.path(), None).await;

    let (tokens, _) = service
        .state
        .store
        .list_tokens(None, None, false, None, 100)
        .unwrap();
    assert!(!tokens.is_empty());

    service
        .state
        .store
        .delete_directory(data.path())
        .await
        .unwrap();
    service.state.store.clean_database().await.unwrap();

    let (tokens, _) = service
        .state
        .store
        .list_tokens(None, None, false, None, 100)
        .unwrap();
    assert!(tokens.is_empty(), "{tokens:?}");
    let (fields, _) = service.state.store.list_fields(None, false, None, 100).unwrap();
    assert!(fields.is_empty(), "{fields:?}");
}

#[tokio::test]
async fn backup_snapshots_survive_later_changes() {
    let scratch = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    std::fs::write(data.path().join("metadata.json"), br#"{"foo": "original"}"#).unwrap();

    let service = test_service(scratch.path(), LinkWhitelist::new());
    register(&service.router, data.path(), None).await;

    let backup_path = service.state.config.backup_path();
    service
        .state
        .store
        .backup_database(&backup_path)
        .await
        .unwrap();
    assert!(backup_path.exists());

    // Mutate the live index after the snapshot.
    std::fs::create_dir(data.path().join("later")).unwrap();
    std::fs::write(data.path().join("later/metadata.json"), br#"{"foo": "extra"}"#).unwrap();
    service
        .state
        .store
        .update_directories(&CancellationToken::new())
        .await
        .unwrap();

    // A second backup replaces the first and cleans up its rename-aside.
    service
        .state
        .store
        .backup_database(&backup_path)
        .await
        .unwrap();
    let aside = std::path::PathBuf::from(format!("{}.backup", backup_path.display()));
    assert!(!aside.exists());

    // Restore procedure: copy the snapshot over a fresh primary and open it.
    let restored_path = scratch.path().join("restored.sqlite3");
    std::fs::copy(&backup_path, &restored_path).unwrap();
    let restored = Store::open(&restored_path, StoreOptions::default()).unwrap();
    let page = restored
        .query_tokens(None, &QueryOptions::default())
        .unwrap();
    assert_eq!(page.results.len(), 2);
}

#[tokio::test]
async fn deregistration_requires_ownership_when_directory_exists() {
    let scratch = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    std::fs::write(data.path().join("metadata.json"), br#"{"foo": "bar"}"#).unwrap();

    let service = test_service(scratch.path(), LinkWhitelist::new());
    register(&service.router, data.path(), None).await;

    let (status, body) = post_json(
        &service.router,
        "/deregister/start",
        json!({ "path": data.path() }),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let code = body["code"].as_str().unwrap();
    std::fs::write(data.path().join(code), b"").unwrap();

    let (status, body) = post_json(
        &service.router,
        "/deregister/finish",
        json!({ "path": data.path() }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["status"], "SUCCESS");

    let (status, _) = get_json(
        &service.router,
        &format!(
            "/retrieve/metadata?path={}",
            data.path().join("metadata.json").to_str().unwrap()
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn deregistration_short_circuits_for_vanished_directories() {
    let scratch = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    std::fs::write(data.path().join("metadata.json"), br#"{"foo": "bar"}"#).unwrap();

    let service = test_service(scratch.path(), LinkWhitelist::new());
    register(&service.router, data.path(), None).await;

    let dir = data.path().to_path_buf();
    drop(data);
    assert!(!dir.exists());

    let (status, body) = post_json(&service.router, "/deregister/start", json!({ "path": dir })).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["status"], "SUCCESS");

    let (_, body) = get_json(&service.router, "/registered").await;
    assert!(body["results"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn non_blocking_finish_indexes_in_the_background() {
    let scratch = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    std::fs::write(data.path().join("metadata.json"), br#"{"foo": "deferred"}"#).unwrap();

    let service = test_service(scratch.path(), LinkWhitelist::new());
    let (status, body) = post_json(
        &service.router,
        "/register/start",
        json!({ "path": data.path() }),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let code = body["code"].as_str().unwrap();
    std::fs::write(data.path().join(code), b"").unwrap();

    let (status, body) = post_json(
        &service.router,
        "/register/finish",
        json!({ "path": data.path(), "block": false }),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED, "{body}");
    assert_eq!(body["status"], "PENDING");

    // The indexing transaction runs on a background task; poll for it.
    let target = data.path().join("metadata.json");
    let mut indexed = false;
    for _ in 0..50 {
        if service
            .state
            .store
            .retrieve_path(target.to_str().unwrap(), false)
            .unwrap()
            .is_some()
        {
            indexed = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert!(indexed, "background registration never landed");
}
