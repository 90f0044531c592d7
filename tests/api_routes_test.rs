use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tokio::sync::watch;
use tower::ServiceExt;

use mediasync::config::Config;
use mediasync::database::Database;
use mediasync::errors::ServerError;
use mediasync::media_server::MediaServerClient;
use mediasync::models::{MediaKind, Section, ServerKind};
use mediasync::service::SyncService;
use mediasync::web::{AppState, WebServer};

// Helper function to send requests to the app
async fn send_request(
    app: &Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let request_builder = Request::builder().method(method).uri(uri);

    let request = if let Some(body) = body {
        request_builder
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_string(&body).unwrap()))
            .unwrap()
    } else {
        request_builder.body(Body::empty()).unwrap()
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();

    let body_bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();

    let json: Value = if body_bytes.is_empty() {
        json!({})
    } else {
        serde_json::from_slice(&body_bytes).unwrap_or(json!({}))
    };

    (status, json)
}

struct FakeServer {
    sections: Vec<Section>,
    refreshes: Mutex<Vec<(String, PathBuf)>>,
}

impl FakeServer {
    fn refreshes(&self) -> Vec<(String, PathBuf)> {
        self.refreshes.lock().unwrap().clone()
    }
}

#[async_trait]
impl MediaServerClient for FakeServer {
    fn kind(&self) -> ServerKind {
        ServerKind::Jellyfin
    }

    async fn check_connection(&self) -> Result<String, ServerError> {
        Ok("fake (v0)".into())
    }

    async fn list_sections(&self) -> Result<Vec<Section>, ServerError> {
        Ok(self.sections.clone())
    }

    async fn enumerate_indexed_paths(
        &self,
        _section: &Section,
    ) -> Result<HashSet<PathBuf>, ServerError> {
        Ok(HashSet::new())
    }

    async fn probe_path(&self, _section: &Section, _path: &Path) -> Result<bool, ServerError> {
        Ok(false)
    }

    async fn request_refresh(&self, section_id: &str, path: &Path) -> Result<(), ServerError> {
        self.refreshes
            .lock()
            .unwrap()
            .push((section_id.to_string(), path.to_path_buf()));
        Ok(())
    }

    async fn wait_for_section_idle(
        &self,
        _section_id: &str,
        _timeout: Duration,
    ) -> Result<(), ServerError> {
        Ok(())
    }
}

struct TestApp {
    _db_dir: tempfile::TempDir,
    _shutdown_tx: watch::Sender<bool>,
    media_dir: tempfile::TempDir,
    app: Router,
    service: Arc<SyncService>,
    server: Arc<FakeServer>,
}

async fn test_app() -> TestApp {
    let db_dir = tempfile::tempdir().unwrap();
    let media_dir = tempfile::tempdir().unwrap();

    let url = format!("sqlite://{}", db_dir.path().join("test.db").display());
    let database = Database::new(&url).await.unwrap();
    database.migrate().await.unwrap();

    let mut config = Config::default();
    config.scan.directories = vec![media_dir.path().to_path_buf()];
    config.compile_ignore_globs();

    let server = Arc::new(FakeServer {
        sections: vec![Section {
            id: "lib1".into(),
            title: "Movies".into(),
            kind: MediaKind::Movie,
            roots: vec![media_dir.path().to_path_buf()],
        }],
        refreshes: Mutex::new(Vec::new()),
    });

    let service = SyncService::new(config, database, server.clone());
    service.load_sections().await.unwrap();

    let (shutdown_tx, shutdown) = watch::channel(false);
    let app = WebServer::create_router(AppState {
        service: service.clone(),
        shutdown,
    });

    TestApp {
        _db_dir: db_dir,
        _shutdown_tx: shutdown_tx,
        media_dir,
        app,
        service,
        server,
    }
}

#[tokio::test]
async fn health_endpoint_reports_ok() {
    let t = test_app().await;
    let (status, response) = send_request(&t.app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["status"], "ok");
}

#[tokio::test]
async fn stats_reports_libraries_and_watch_state() {
    let t = test_app().await;
    let (status, response) = send_request(&t.app, Method::GET, "/api/stats", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["libraries"][0]["title"], "Movies");
    assert_eq!(response["is_scanning"], false);
    assert_eq!(response["watching"]["active"], false);
    assert_eq!(
        response["watching"]["paths"][0],
        t.media_dir.path().to_string_lossy().as_ref()
    );
}

#[tokio::test]
async fn history_records_round_trip() {
    let t = test_app().await;
    t.service
        .events()
        .append("Scan Triggered", "/m/Movie (2020)", "Jellyfin")
        .await;

    let (status, response) =
        send_request(&t.app, Method::GET, "/api/history?search=Movie", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response[0]["event_type"], "Scan Triggered");

    let (status, response) = send_request(&t.app, Method::POST, "/api/history/clear", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["cleared"], 1);
}

#[tokio::test]
async fn scan_library_forces_a_refresh_of_each_root() {
    let t = test_app().await;

    let (status, _) = send_request(
        &t.app,
        Method::POST,
        "/api/scan-library",
        Some(json!({ "library_id": "lib1" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // The forced dispatch runs on a background task.
    for _ in 0..100 {
        if !t.server.refreshes().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let refreshes = t.server.refreshes();
    assert_eq!(refreshes.len(), 1);
    assert_eq!(refreshes[0].0, "lib1");

    let (status, _) = send_request(
        &t.app,
        Method::POST,
        "/api/scan-library",
        Some(json!({ "library_id": "nope" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn webhook_turns_file_paths_into_created_events() {
    let t = test_app().await;
    let folder = t.media_dir.path().join("Movie (2020)");
    std::fs::create_dir_all(&folder).unwrap();
    let file = folder.join("movie.mkv");
    std::fs::write(&file, b"data").unwrap();

    let (status, response) = send_request(
        &t.app,
        Method::POST,
        "/api/webhook",
        Some(json!({ "movieFile": { "path": file.to_string_lossy() } })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["triggered"], 1);

    // The created event lands in the debounce queue.
    for _ in 0..100 {
        if !t.service.scheduler().pending_snapshot().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let pending = t.service.scheduler().pending_snapshot();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].added, 1);
    assert_eq!(pending[0].full_path, folder);
}

#[tokio::test]
async fn webhook_refreshes_directories_immediately() {
    let t = test_app().await;
    let folder = t.media_dir.path().join("Show");
    std::fs::create_dir_all(&folder).unwrap();

    let (status, response) = send_request(
        &t.app,
        Method::POST,
        "/api/webhook",
        Some(json!({ "series": { "path": folder.to_string_lossy() } })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["triggered"], 1);

    for _ in 0..100 {
        if !t.server.refreshes().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let refreshes = t.server.refreshes();
    assert_eq!(refreshes.len(), 1);
    assert_eq!(refreshes[0].1, folder);
}

#[tokio::test]
async fn webhook_without_paths_is_ignored() {
    let t = test_app().await;
    let (status, response) = send_request(
        &t.app,
        Method::POST,
        "/api/webhook",
        Some(json!({ "eventType": "Test" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["status"], "ignored");
}

#[tokio::test]
async fn stuck_listing_and_clearing() {
    let t = test_app().await;
    t.service
        .stuck_files()
        .record_attempt(Path::new("/m/stuck.mkv"))
        .await
        .unwrap();

    let (status, response) = send_request(&t.app, Method::GET, "/api/stuck", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response[0]["path"], "/m/stuck.mkv");

    let (status, response) = send_request(&t.app, Method::POST, "/api/stuck/clear", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["cleared"], 1);
}

#[tokio::test]
async fn health_check_rejects_paths_outside_roots() {
    let t = test_app().await;
    let (status, _) = send_request(
        &t.app,
        Method::POST,
        "/api/health-check",
        Some(json!({ "path": "/etc/passwd" })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}
