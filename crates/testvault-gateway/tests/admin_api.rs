//! Route tests for the administrative API.

use std::sync::Arc;

use axum::body::Bytes;
use axum::http::StatusCode;
use axum_test::TestServer;
use serde_json::{json, Value};
use testvault_core::{catalog, Store};
use testvault_gateway::{create_router, AppState, GatewayConfig};

struct TestContext {
    server: TestServer,
    state: AppState,
    _dir: tempfile::TempDir,
}

impl TestContext {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = GatewayConfig {
            schedule_enabled: false,
            ..GatewayConfig::for_data_dir(dir.path())
        };
        let vault = config.vault().unwrap();
        let store = Arc::new(Store::open(&vault.store_path).unwrap());
        store
            .with_conn(|conn| {
                catalog::install_baseline(conn)?;
                conn.execute_batch(
                    "INSERT INTO subjects (id, name) VALUES (1, 'Maths');
                     INSERT INTO tests (id, title, subject_id) VALUES
                        (1, 'Fractions', 1), (2, 'Angles', 1), (3, 'Ratios', 1);",
                )?;
                Ok::<_, testvault_core::Error>(())
            })
            .unwrap();

        let state = AppState::new(store, catalog::registry(), vault, config);
        let server = TestServer::new(create_router(state.clone())).unwrap();
        Self {
            server,
            state,
            _dir: dir,
        }
    }

    async fn create_backup(&self) -> (String, Bytes) {
        let response = self.server.post("/admin/backups").await;
        response.assert_status_ok();
        let disposition = response.header("content-disposition");
        let disposition = disposition.to_str().unwrap();
        let name = disposition
            .trim_start_matches("attachment; filename=\"")
            .trim_end_matches('"')
            .to_string();
        (name, response.as_bytes().clone())
    }

    fn delete_test(&self, id: i64) {
        self.state
            .store
            .with_conn(|conn| conn.execute("DELETE FROM tests WHERE id = ?1", [id]))
            .unwrap();
    }
}

#[tokio::test]
async fn test_health() {
    let ctx = TestContext::new();
    let response = ctx.server.get("/health").await;
    response.assert_status_ok();

    let body: Value = response.json();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["storeConnected"], true);
    assert_eq!(body["maintenance"], false);
}

#[tokio::test]
async fn test_migrations_apply_then_report_nothing_to_do() {
    let ctx = TestContext::new();

    let response = ctx.server.post("/admin/migrations").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert!(body["failedAt"].is_null());
    assert_eq!(body["completed"].as_array().unwrap().len(), 2);
    assert!(body["alreadyApplied"].as_array().unwrap().is_empty());
    assert_eq!(body["certification"]["passed"], true);

    let body: Value = ctx.server.post("/admin/migrations").await.json();
    assert_eq!(body["alreadyApplied"].as_array().unwrap().len(), 2);

    let ledger: Value = ctx.server.get("/admin/migrations").await.json();
    assert_eq!(ledger.as_array().unwrap().len(), 2);
    assert_eq!(ledger[0]["target"], "tests");
}

#[tokio::test]
async fn test_blocked_migration_is_conflict() {
    let ctx = TestContext::new();
    ctx.state
        .store
        .with_conn(|conn| {
            conn.execute_batch(
                "INSERT INTO tags (id, name) VALUES (1, 'algebra');
                 INSERT INTO test_tags (id, test_id, tag_id) VALUES (1, 1, 1), (2, 1, 1);",
            )
        })
        .unwrap();

    let response = ctx.server.post("/admin/migrations").await;
    response.assert_status(StatusCode::CONFLICT);
    let body: Value = response.json();
    assert_eq!(body["failedAt"], catalog::STEP_TEST_TAGS_UNIQUE);
    assert_eq!(body["cause"]["kind"], "integrityViolation");
}

#[tokio::test]
async fn test_create_list_and_download_backup() {
    let ctx = TestContext::new();
    let (name, bytes) = ctx.create_backup().await;
    assert!(name.starts_with("testvault-") && name.ends_with(".tar.gz"));
    assert!(!bytes.is_empty());

    let listing: Value = ctx.server.get("/admin/backups").await.json();
    let listing = listing.as_array().unwrap();
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0]["name"], name.as_str());
    assert_eq!(listing[0]["sizeBytes"], bytes.len() as u64);

    let download = ctx.server.get(&format!("/admin/backups/{name}")).await;
    download.assert_status_ok();
    assert_eq!(download.header("content-type"), "application/octet-stream");
    assert_eq!(
        download.header("content-length"),
        bytes.len().to_string().as_str()
    );
    assert_eq!(download.as_bytes(), &bytes);
}

#[tokio::test]
async fn test_download_rejects_bad_and_unknown_names() {
    let ctx = TestContext::new();

    let response = ctx.server.get("/admin/backups/passwords.txt").await;
    response.assert_status(StatusCode::BAD_REQUEST);
    let body: Value = response.json();
    assert_eq!(body["error"], true);
    assert_eq!(body["code"], "BAD_REQUEST");

    ctx.server
        .get("/admin/backups/testvault-20200101T000000000Z.tar.gz")
        .await
        .assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_prune_with_explicit_keep() {
    let ctx = TestContext::new();
    for _ in 0..3 {
        ctx.create_backup().await;
    }

    let response = ctx
        .server
        .post("/admin/backups/prune")
        .add_query_param("keep", 1)
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["kept"].as_array().unwrap().len(), 1);
    assert_eq!(body["deleted"].as_array().unwrap().len(), 2);

    ctx.server
        .post("/admin/backups/prune")
        .add_query_param("keep", 0)
        .await
        .assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_restore_from_generation() {
    let ctx = TestContext::new();
    let (name, _) = ctx.create_backup().await;
    ctx.delete_test(2);

    let preview: Value = ctx
        .server
        .get(&format!("/admin/restore/generations/{name}"))
        .await
        .json();
    let candidates = preview["candidates"].as_array().unwrap();
    let two = candidates
        .iter()
        .find(|c| c["table"] == "tests" && c["id"] == 2)
        .unwrap();
    assert_eq!(two["conflict"], false);
    assert_eq!(two["label"], "Angles");
    assert!(preview.get("uploadId").is_none());

    let response = ctx
        .server
        .post("/admin/restore/commit")
        .json(&json!({
            "source": { "generation": name },
            "records": [
                { "table": "tests", "id": 1 },
                { "table": "tests", "id": 2 }
            ]
        }))
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["imported"], json!([{ "table": "tests", "id": 2 }]));
    assert_eq!(body["conflicts"], json!([{ "table": "tests", "id": 1 }]));
}

#[tokio::test]
async fn test_restore_from_upload() {
    let ctx = TestContext::new();
    let (_, bytes) = ctx.create_backup().await;
    ctx.delete_test(3);

    let response = ctx.server.post("/admin/restore/uploads").bytes(bytes).await;
    response.assert_status_ok();
    let body: Value = response.json();
    let upload_id = body["uploadId"].as_str().unwrap().to_string();
    assert!(!body["candidates"].as_array().unwrap().is_empty());

    let body: Value = ctx
        .server
        .post("/admin/restore/commit")
        .json(&json!({
            "source": { "upload": upload_id },
            "records": [{ "table": "tests", "id": 3 }]
        }))
        .await
        .json();
    assert_eq!(body["imported"], json!([{ "table": "tests", "id": 3 }]));

    // The staged upload is gone after the commit.
    ctx.server
        .delete(&format!("/admin/restore/uploads/{upload_id}"))
        .await
        .assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_restore_rejects_garbage_and_empty_selection() {
    let ctx = TestContext::new();

    ctx.server
        .post("/admin/restore/uploads")
        .bytes(Bytes::from_static(b"definitely not a tarball"))
        .await
        .assert_status(StatusCode::BAD_REQUEST);

    let (name, _) = ctx.create_backup().await;
    ctx.server
        .post("/admin/restore/commit")
        .json(&json!({ "source": { "generation": name }, "records": [] }))
        .await
        .assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_scheduler_controls() {
    let ctx = TestContext::new();

    let status: Value = ctx.server.get("/admin/scheduler").await.json();
    assert_eq!(status["enabled"], false);

    let status: Value = ctx.server.post("/admin/scheduler/start").await.json();
    assert_eq!(status["enabled"], true);
    assert!(status["nextRun"].is_string());

    let status: Value = ctx.server.post("/admin/scheduler/stop").await.json();
    assert_eq!(status["enabled"], false);
    assert!(status["nextRun"].is_null());

    let response = ctx.server.post("/admin/scheduler/run").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert!(body["generation"]["name"].is_string());

    let status: Value = ctx.server.get("/admin/scheduler").await.json();
    assert!(status["lastRun"].is_string());
    assert!(status["lastFault"].is_null());
}
