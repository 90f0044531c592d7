use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info, warn};
use url::Url;

use crate::errors::{AppError, ServerError};
use crate::media_server::{MediaServerClient, IDLE_POLL_INTERVAL};
use crate::models::{MediaKind, Section, ServerKind};
use crate::utils;

const SECTION_REFRESH_ACTIVITY: &str = "library.refresh.section";

/// Plex item types used when enumerating a section.
const ITEM_TYPE_MOVIE: &str = "1";
const ITEM_TYPE_EPISODE: &str = "4";

pub struct PlexClient {
    base: Url,
    token: String,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct PlexResponse<T> {
    #[serde(rename = "MediaContainer")]
    container: T,
}

#[derive(Debug, Deserialize)]
struct ServerInfo {
    #[serde(rename = "friendlyName")]
    friendly_name: Option<String>,
    version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SectionList {
    #[serde(rename = "Directory", default)]
    directories: Vec<SectionDirectory>,
}

#[derive(Debug, Deserialize)]
struct SectionDirectory {
    key: String,
    title: String,
    #[serde(rename = "type")]
    section_type: String,
    #[serde(rename = "Location", default)]
    locations: Vec<SectionLocation>,
}

#[derive(Debug, Deserialize)]
struct SectionLocation {
    path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct ItemList {
    #[serde(rename = "Metadata", default)]
    metadata: Vec<ItemMetadata>,
}

#[derive(Debug, Deserialize)]
struct ItemMetadata {
    #[serde(rename = "Media", default)]
    media: Vec<ItemMedia>,
}

#[derive(Debug, Deserialize)]
struct ItemMedia {
    #[serde(rename = "Part", default)]
    parts: Vec<ItemPart>,
}

#[derive(Debug, Deserialize)]
struct ItemPart {
    file: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct ActivityList {
    #[serde(rename = "Activity", default)]
    activities: Vec<Activity>,
}

#[derive(Debug, Deserialize)]
struct Activity {
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(rename = "Context")]
    context: Option<ActivityContext>,
}

#[derive(Debug, Deserialize)]
struct ActivityContext {
    // Delivered as a string or a number depending on server version.
    #[serde(rename = "librarySectionID")]
    library_section_id: Option<serde_json::Value>,
}

impl PlexClient {
    pub fn new(base: &str, token: String) -> Result<Self, AppError> {
        let base = Url::parse(base)
            .map_err(|e| AppError::config(format!("invalid plex.server URL: {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AppError::config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { base, token, http })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ServerError> {
        self.base
            .join(path)
            .map_err(|e| ServerError::unexpected(format!("bad endpoint {path}: {e}")))
    }

    async fn get<T: DeserializeOwned>(&self, url: Url) -> Result<T, ServerError> {
        let response = self
            .http
            .get(url.clone())
            .header("Accept", "application/json")
            .header("X-Plex-Token", &self.token)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ServerError::Timeout {
                        url: url.to_string(),
                    }
                } else {
                    ServerError::Request(e)
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(ServerError::Unauthorized {
                server: "Plex".to_string(),
            });
        }
        if !status.is_success() {
            return Err(ServerError::Http {
                status: status.as_u16(),
                message: url.path().to_string(),
            });
        }

        Ok(response.json::<T>().await?)
    }
}

fn sections_from(list: SectionList) -> Vec<Section> {
    list.directories
        .into_iter()
        .map(|directory| Section {
            id: directory.key,
            title: directory.title,
            kind: MediaKind::from_plex(&directory.section_type),
            roots: directory
                .locations
                .into_iter()
                .map(|location| utils::normalize_path(&location.path))
                .collect(),
        })
        .collect()
}

fn files_from(list: ItemList) -> HashSet<PathBuf> {
    list.metadata
        .into_iter()
        .flat_map(|item| item.media)
        .flat_map(|media| media.parts)
        .filter_map(|part| part.file)
        .map(|file| utils::normalize_path(&file))
        .collect()
}

fn section_is_refreshing(list: &ActivityList, section_id: &str) -> bool {
    list.activities.iter().any(|activity| {
        activity.kind.as_deref() == Some(SECTION_REFRESH_ACTIVITY)
            && activity
                .context
                .as_ref()
                .and_then(|c| c.library_section_id.as_ref())
                .map(|id| match id {
                    serde_json::Value::String(s) => s == section_id,
                    serde_json::Value::Number(n) => n.to_string() == section_id,
                    _ => false,
                })
                .unwrap_or(false)
    })
}

#[async_trait]
impl MediaServerClient for PlexClient {
    fn kind(&self) -> ServerKind {
        ServerKind::Plex
    }

    async fn check_connection(&self) -> Result<String, ServerError> {
        let info: PlexResponse<ServerInfo> = self.get(self.endpoint("/")?).await?;
        let name = info
            .container
            .friendly_name
            .unwrap_or_else(|| "Plex".to_string());
        let version = info.container.version.unwrap_or_default();
        Ok(format!("{name} (v{version})"))
    }

    async fn list_sections(&self) -> Result<Vec<Section>, ServerError> {
        let response: PlexResponse<SectionList> =
            self.get(self.endpoint("/library/sections")?).await?;
        let sections = sections_from(response.container);
        for section in &sections {
            for root in &section.roots {
                debug!(
                    "Found library '{}' (ID: {}) at path: {}",
                    section.title,
                    section.id,
                    root.display()
                );
            }
        }
        Ok(sections)
    }

    async fn enumerate_indexed_paths(
        &self,
        section: &Section,
    ) -> Result<HashSet<PathBuf>, ServerError> {
        let mut url = self.endpoint(&format!("/library/sections/{}/all", section.id))?;
        match section.kind {
            MediaKind::Show => {
                url.query_pairs_mut().append_pair("type", ITEM_TYPE_EPISODE);
            }
            MediaKind::Movie => {
                url.query_pairs_mut().append_pair("type", ITEM_TYPE_MOVIE);
            }
            MediaKind::Other => {}
        }
        let response: PlexResponse<ItemList> = self.get(url).await?;
        Ok(files_from(response.container))
    }

    async fn probe_path(&self, section: &Section, path: &Path) -> Result<bool, ServerError> {
        let mut url = self.endpoint(&format!("/library/sections/{}/all", section.id))?;
        url.query_pairs_mut()
            .append_pair("part.file", &path.to_string_lossy());
        let response: PlexResponse<ItemList> = self.get(url).await?;
        let target = utils::normalize_path(path);
        Ok(files_from(response.container).contains(&target))
    }

    async fn request_refresh(&self, section_id: &str, path: &Path) -> Result<(), ServerError> {
        let encoded = urlencoding::encode(&path.to_string_lossy()).into_owned();
        let url = self.endpoint(&format!(
            "/library/sections/{section_id}/refresh?path={encoded}"
        ))?;

        let response = self
            .http
            .get(url)
            .header("X-Plex-Token", &self.token)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ServerError::Http {
                status: status.as_u16(),
                message: format!("refresh of {}", path.display()),
            });
        }
        info!("Plex scan triggered for: {}", path.display());
        Ok(())
    }

    async fn wait_for_section_idle(
        &self,
        section_id: &str,
        timeout: Duration,
    ) -> Result<(), ServerError> {
        // Give the server a moment to register the refresh before polling.
        tokio::time::sleep(IDLE_POLL_INTERVAL).await;

        let started = Instant::now();
        loop {
            if started.elapsed() > timeout {
                warn!("Scan wait timed out for section {section_id}");
                return Ok(());
            }

            match self
                .get::<PlexResponse<ActivityList>>(self.endpoint("/activities")?)
                .await
            {
                Ok(response) => {
                    if !section_is_refreshing(&response.container, section_id) {
                        debug!("Section {section_id} is idle");
                        return Ok(());
                    }
                }
                Err(e) => warn!("Error checking scan status: {e}"),
            }
            tokio::time::sleep(IDLE_POLL_INTERVAL).await;
        }
    }
}
