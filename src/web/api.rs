use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::models::FileEventKind;
use crate::utils;

use super::AppState;

type ApiError = (StatusCode, Json<Value>);

fn internal_error(e: impl std::fmt::Display) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": e.to_string() })),
    )
}

pub async fn health_check() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn get_stats(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let service = &state.service;

    let libraries: Vec<Value> = service
        .index()
        .counts()
        .await
        .into_iter()
        .map(|(title, kind, count)| json!({ "title": title, "type": kind, "count": count }))
        .collect();

    let health_counts = service
        .events()
        .health_counts()
        .await
        .map_err(internal_error)?;

    Ok(Json(json!({
        "libraries": libraries,
        "pending": service.scheduler().pending_snapshot(),
        "watching": {
            "active": service.watcher_active(),
            "paths": service.config().roots(),
        },
        "health": {
            "recent": service.health().recent(),
            "stats": health_counts,
        },
        "is_scanning": service.is_sweeping(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    #[serde(default = "default_history_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
    pub search: Option<String>,
}

fn default_history_limit() -> i64 {
    50
}

pub async fn get_history(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Value>, ApiError> {
    let rows = state
        .service
        .events()
        .history(params.limit.clamp(1, 500), params.offset.max(0), params.search.as_deref())
        .await
        .map_err(internal_error)?;
    Ok(Json(json!(rows)))
}

pub async fn clear_history(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let cleared = state
        .service
        .events()
        .clear_all()
        .await
        .map_err(internal_error)?;
    Ok(Json(json!({ "status": "success", "cleared": cleared })))
}

pub async fn list_stuck(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let stuck = state
        .service
        .stuck_files()
        .all()
        .await
        .map_err(internal_error)?;
    Ok(Json(json!(stuck)))
}

pub async fn clear_stuck(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let cleared = state
        .service
        .stuck_files()
        .clear_all()
        .await
        .map_err(internal_error)?;
    Ok(Json(json!({ "status": "success", "cleared": cleared })))
}

pub async fn scan_all(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    if !state.service.trigger_full_sweep(state.shutdown.clone()) {
        return Err((
            StatusCode::CONFLICT,
            Json(json!({ "error": "scan already in progress" })),
        ));
    }
    Ok(Json(json!({ "status": "success" })))
}

#[derive(Debug, Deserialize)]
pub struct LibraryScanRequest {
    pub library_id: String,
}

/// Force a refresh of every root of one section.
pub async fn scan_library(
    State(state): State<AppState>,
    Json(request): Json<LibraryScanRequest>,
) -> Result<Json<Value>, ApiError> {
    let service = &state.service;
    let Some(section) = service.index().section_by_id(&request.library_id).await else {
        return Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "library not found" })),
        ));
    };

    for root in &section.roots {
        service.scheduler().force_refresh(&section.id, root);
    }
    Ok(Json(json!({ "status": "success", "message": "scan triggered" })))
}

#[derive(Debug, Deserialize)]
pub struct HealthCheckRequest {
    pub path: PathBuf,
}

/// On-demand health check of one file under the configured roots.
pub async fn run_health_check(
    State(state): State<AppState>,
    Json(request): Json<HealthCheckRequest>,
) -> Result<Json<Value>, ApiError> {
    let allowed = state
        .service
        .config()
        .roots()
        .iter()
        .any(|root| utils::path_has_prefix(&request.path, root));
    if !allowed {
        return Err((
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "path outside configured roots" })),
        ));
    }

    let report = state.service.check_file_health(&request.path).await;
    Ok(Json(json!({ "status": "success", "data": report })))
}

/// How long the webhook waits for a reported path to appear; slow network
/// mounts surface files well after the arr tool announces them.
const WEBHOOK_PATH_WAIT_SECS: u64 = 30;

/// Paths an arr-tool payload may carry, in any combination.
pub(crate) fn extract_paths(payload: &Value) -> BTreeSet<String> {
    let mut paths = BTreeSet::new();
    let mut push = |value: Option<&Value>| {
        if let Some(path) = value.and_then(|v| v.as_str()) {
            if !path.is_empty() {
                paths.insert(path.to_string());
            }
        }
    };

    push(payload.get("path"));
    if let Some(list) = payload.get("paths").and_then(|v| v.as_array()) {
        for item in list {
            push(Some(item));
        }
    }
    push(payload.get("movie").and_then(|m| m.get("folderPath")));
    push(payload.get("movieFile").and_then(|m| m.get("path")));
    push(payload.get("series").and_then(|s| s.get("path")));
    push(payload.get("episodeFile").and_then(|e| e.get("path")));
    push(payload.get("sourcePath"));
    push(payload.get("destPath"));

    paths
}

/// Webhook ingress for upstream arr tools. Accepts arbitrary JSON and
/// turns any recognizable paths into file events or forced refreshes.
pub async fn webhook(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let paths = extract_paths(&payload);
    if paths.is_empty() {
        return Ok(Json(
            json!({ "status": "ignored", "message": "no paths found in payload" }),
        ));
    }

    let service = &state.service;
    let mut triggered = 0usize;

    for raw in paths {
        let path = PathBuf::from(&raw);
        info!("Webhook trigger for: {raw}");

        if wait_for_path(&path).await {
            if path.is_file() {
                service.submit_file_event(FileEventKind::Created, path);
                triggered += 1;
            } else if path.is_dir() {
                if let Some(section) = service.index().resolve(&path).await {
                    service.scheduler().force_refresh(&section.id, &path);
                    triggered += 1;
                } else {
                    warn!("Webhook path not in any library: {raw}");
                }
            }
            continue;
        }

        // The path never appeared; fall back to its parent folder unless
        // that would mean rescanning a whole section root.
        let Some(parent) = path.parent() else {
            warn!("Webhook path does not exist: {raw}");
            continue;
        };
        if let Some(section) = service.index().resolve(&path).await {
            if parent.is_dir() && !section.is_root(parent) {
                info!("Webhook path missing, falling back to parent: {}", parent.display());
                service.scheduler().force_refresh(&section.id, parent);
                triggered += 1;
                continue;
            }
        }
        warn!("Webhook path does not exist: {raw}");
    }

    Ok(Json(json!({ "status": "success", "triggered": triggered })))
}

async fn wait_for_path(path: &Path) -> bool {
    for elapsed in 0..=WEBHOOK_PATH_WAIT_SECS {
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            return true;
        }
        if elapsed == WEBHOOK_PATH_WAIT_SECS {
            break;
        }
        if elapsed > 0 && elapsed % 5 == 0 {
            info!("Waiting for path to appear ({elapsed}s): {}", path.display());
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_paths_from_every_known_field() {
        let payload = json!({
            "path": "/m/one.mkv",
            "paths": ["/m/two.mkv", "/m/three.mkv"],
            "movie": { "folderPath": "/m/Movie (2020)" },
            "movieFile": { "path": "/m/Movie (2020)/movie.mkv" },
            "series": { "path": "/tv/Show" },
            "episodeFile": { "path": "/tv/Show/Season 01/e1.mkv" },
            "sourcePath": "/m/old.mkv",
            "destPath": "/m/new.mkv",
        });
        let paths = extract_paths(&payload);
        assert_eq!(paths.len(), 9);
        assert!(paths.contains("/tv/Show/Season 01/e1.mkv"));
        assert!(paths.contains("/m/Movie (2020)"));
    }

    #[test]
    fn ignores_payloads_without_paths() {
        let payload = json!({ "eventType": "Test", "instanceName": "Radarr" });
        assert!(extract_paths(&payload).is_empty());

        let payload = json!({ "path": "", "paths": [42, null] });
        assert!(extract_paths(&payload).is_empty());
    }
}
