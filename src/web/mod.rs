//! HTTP interface for collaborators: liveness, read-only state, manual
//! scan triggers and the arr-tool webhook ingress. Thin handlers over the
//! service façade; no UI is served here.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::errors::AppError;
use crate::service::SyncService;

pub mod api;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<SyncService>,
    pub shutdown: watch::Receiver<bool>,
}

pub struct WebServer {
    app: Router,
    addr: SocketAddr,
}

impl WebServer {
    pub fn new(
        service: Arc<SyncService>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, AppError> {
        let web = &service.config().web;
        let addr: SocketAddr = format!("{}:{}", web.host, web.port)
            .parse()
            .map_err(|e| AppError::config(format!("invalid web listen address: {e}")))?;

        let app = Self::create_router(AppState { service, shutdown });
        Ok(Self { app, addr })
    }

    pub fn create_router(state: AppState) -> Router {
        Router::new()
            .route("/health", get(api::health_check))
            .route("/api/stats", get(api::get_stats))
            .route("/api/history", get(api::get_history))
            .route("/api/history/clear", post(api::clear_history))
            .route("/api/stuck", get(api::list_stuck))
            .route("/api/stuck/clear", post(api::clear_stuck))
            .route("/api/scan-all", post(api::scan_all))
            .route("/api/scan-library", post(api::scan_library))
            .route("/api/health-check", post(api::run_health_check))
            .route("/api/webhook", post(api::webhook))
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn serve(self) -> Result<(), AppError> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        axum::serve(listener, self.app).await?;
        Ok(())
    }
}
