//! Remote indexing server abstraction.
//!
//! One trait, two implementations: Plex, and the shared Jellyfin/Emby API
//! surface. The concrete client is chosen once at construction from the
//! configured server type.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info};

use crate::config::Config;
use crate::errors::{AppError, ServerError};
use crate::models::{Section, ServerKind};

pub mod jellyfin;
pub mod plex;

pub use jellyfin::JellyfinClient;
pub use plex::PlexClient;

/// Poll cadence while waiting for a section refresh to finish.
pub const IDLE_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Default bound on one wait-for-idle call.
pub const SECTION_IDLE_TIMEOUT: Duration = Duration::from_secs(600);

const RETRY_BASE_DELAY: Duration = Duration::from_secs(5);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(300);

#[async_trait]
pub trait MediaServerClient: Send + Sync {
    fn kind(&self) -> ServerKind;

    /// Cheap reachability probe; returns a human-readable server identity.
    async fn check_connection(&self) -> Result<String, ServerError>;

    /// Sections and their filesystem roots.
    async fn list_sections(&self) -> Result<Vec<Section>, ServerError>;

    /// Every media file the server currently indexes for a section,
    /// normalized to absolute paths.
    async fn enumerate_indexed_paths(
        &self,
        section: &Section,
    ) -> Result<HashSet<PathBuf>, ServerError>;

    /// Ask the server directly whether one file is indexed.
    async fn probe_path(&self, section: &Section, path: &Path) -> Result<bool, ServerError>;

    /// Path-scoped refresh. Returns once the server has accepted the
    /// request, not once indexing is done.
    async fn request_refresh(&self, section_id: &str, path: &Path) -> Result<(), ServerError>;

    /// Block until no refresh for the section is running, or the timeout
    /// elapses. A no-op on backends without an activity feed.
    async fn wait_for_section_idle(
        &self,
        section_id: &str,
        timeout: Duration,
    ) -> Result<(), ServerError>;
}

/// Build the client matching the configured server type. Missing
/// credentials are a startup configuration error.
pub fn build(config: &Config) -> Result<Arc<dyn MediaServerClient>, AppError> {
    match config.server.kind {
        ServerKind::Plex => {
            let url = config
                .plex
                .server
                .as_deref()
                .ok_or_else(|| AppError::config("plex.server is not configured"))?;
            let token = config
                .plex
                .token
                .clone()
                .ok_or_else(|| AppError::config("plex.token is not configured"))?;
            Ok(Arc::new(PlexClient::new(url, token)?))
        }
        kind @ (ServerKind::Jellyfin | ServerKind::Emby) => {
            let url = config
                .server
                .url
                .as_deref()
                .ok_or_else(|| AppError::config("server.url is not configured"))?;
            let api_key = config
                .server
                .api_key
                .clone()
                .ok_or_else(|| AppError::config("server.api_key is not configured"))?;
            Ok(Arc::new(JellyfinClient::new(kind, url, api_key)?))
        }
    }
}

/// Establish the initial connection. With `retry`, transient failures back
/// off exponentially (5 s doubling, capped at 300 s) until the server
/// answers; auth failures always return immediately.
pub async fn connect(client: &dyn MediaServerClient, retry: bool) -> Result<String, AppError> {
    let mut delay = RETRY_BASE_DELAY;
    loop {
        match client.check_connection().await {
            Ok(identity) => {
                info!("Connected to {}: {identity}", client.kind().label());
                return Ok(identity);
            }
            Err(e) if retry && e.is_transient() => {
                error!(
                    "Failed to connect to {}: {e}; retrying in {}s",
                    client.kind().label(),
                    delay.as_secs()
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(RETRY_MAX_DELAY);
            }
            Err(e) => return Err(e.into()),
        }
    }
}
