use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};
use url::Url;

use crate::errors::{AppError, ServerError};
use crate::media_server::MediaServerClient;
use crate::models::{MediaKind, Section, ServerKind};
use crate::utils;

/// Jellyfin and Emby expose the same library and refresh endpoints, so one
/// client serves both; only the reported kind differs.
pub struct JellyfinClient {
    kind: ServerKind,
    base: Url,
    api_key: String,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct SystemInfo {
    #[serde(rename = "ServerName")]
    server_name: Option<String>,
    #[serde(rename = "Version")]
    version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VirtualFolder {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "ItemId")]
    item_id: Option<String>,
    #[serde(rename = "CollectionType")]
    collection_type: Option<String>,
    #[serde(rename = "Locations", default)]
    locations: Vec<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct ItemsPage {
    #[serde(rename = "Items", default)]
    items: Vec<Item>,
}

#[derive(Debug, Deserialize)]
struct Item {
    #[serde(rename = "Path")]
    path: Option<PathBuf>,
}

impl JellyfinClient {
    pub fn new(kind: ServerKind, base: &str, api_key: String) -> Result<Self, AppError> {
        let base = Url::parse(base)
            .map_err(|e| AppError::config(format!("invalid server.url: {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AppError::config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            kind,
            base,
            api_key,
            http,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ServerError> {
        self.base
            .join(path)
            .map_err(|e| ServerError::unexpected(format!("bad endpoint {path}: {e}")))
    }

    fn items_endpoint(&self, section_id: &str) -> Result<Url, ServerError> {
        let mut url = self.endpoint("/Items")?;
        url.query_pairs_mut()
            .append_pair("ParentId", section_id)
            .append_pair("Recursive", "true")
            .append_pair("Fields", "Path")
            .append_pair("IncludeItemTypes", "Movie,Episode");
        Ok(url)
    }

    async fn get<T: DeserializeOwned>(&self, url: Url) -> Result<T, ServerError> {
        let response = self
            .http
            .get(url.clone())
            .header("X-Emby-Token", &self.api_key)
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
                server: self.kind.label().to_string(),
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

fn sections_from(folders: Vec<VirtualFolder>) -> Vec<Section> {
    folders
        .into_iter()
        .map(|folder| Section {
            id: folder.item_id.unwrap_or_else(|| folder.name.clone()),
            kind: MediaKind::from_collection_type(folder.collection_type.as_deref().unwrap_or("")),
            title: folder.name,
            roots: folder
                .locations
                .into_iter()
                .map(|location| utils::normalize_path(&location))
                .collect(),
        })
        .collect()
}

#[async_trait]
impl MediaServerClient for JellyfinClient {
    fn kind(&self) -> ServerKind {
        self.kind
    }

    async fn check_connection(&self) -> Result<String, ServerError> {
        let info: SystemInfo = self.get(self.endpoint("/System/Info")?).await?;
        let name = info
            .server_name
            .unwrap_or_else(|| self.kind.label().to_string());
        let version = info.version.unwrap_or_default();
        Ok(format!("{name} (v{version})"))
    }

    async fn list_sections(&self) -> Result<Vec<Section>, ServerError> {
        let folders: Vec<VirtualFolder> =
            self.get(self.endpoint("/Library/VirtualFolders")?).await?;
        let sections = sections_from(folders);
        for section in &sections {
            debug!(
                "Found {} library '{}' at: {:?}",
                self.kind.as_str(),
                section.title,
                section.roots
            );
        }
        Ok(sections)
    }

    async fn enumerate_indexed_paths(
        &self,
        section: &Section,
    ) -> Result<HashSet<PathBuf>, ServerError> {
        let page: ItemsPage = self.get(self.items_endpoint(&section.id)?).await?;
        Ok(page
            .items
            .into_iter()
            .filter_map(|item| item.path)
            .map(|path| utils::normalize_path(&path))
            .collect())
    }

    /// Membership probe via a filename search with an exact-path
    /// post-filter; path filters are not stable across server versions.
    async fn probe_path(&self, section: &Section, path: &Path) -> Result<bool, ServerError> {
        let file_name = utils::file_name(path);
        let mut url = self.items_endpoint(&section.id)?;
        url.query_pairs_mut().append_pair("searchTerm", &file_name);

        let page: ItemsPage = self.get(url).await?;
        let target = utils::normalize_path(path);
        Ok(page
            .items
            .into_iter()
            .filter_map(|item| item.path)
            .any(|p| utils::normalize_path(&p) == target))
    }

    async fn request_refresh(&self, _section_id: &str, path: &Path) -> Result<(), ServerError> {
        let url = self.endpoint("/Library/Media/Updated")?;
        let payload = json!({ "Updates": [{ "Path": path.to_string_lossy() }] });

        let response = self
            .http
            .post(url)
            .header("X-Emby-Token", &self.api_key)
            .json(&payload)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ServerError::Http {
                status: status.as_u16(),
                message: format!("refresh of {}", path.display()),
            });
        }
        info!(
            "{} scan triggered for: {}",
            self.kind.label(),
            path.display()
        );
        Ok(())
    }

    /// No activities feed on these backends, so there is nothing to poll.
    async fn wait_for_section_idle(
        &self,
        section_id: &str,
        _timeout: Duration,
    ) -> Result<(), ServerError> {
        debug!(
            "{} has no activity feed; not waiting on section {section_id}",
            self.kind.label()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sections_parse_from_virtual_folders() {
        let raw = r#"[
            {
                "Name": "Movies",
                "ItemId": "f137a2dd21bbc1b99aa5c0f6bf02a805",
                "CollectionType": "movies",
                "Locations": ["/media/movies"]
            },
            {
                "Name": "Shows",
                "CollectionType": "tvshows",
                "Locations": ["/media/tv", "/media/anime"]
            }
        ]"#;
        let folders: Vec<VirtualFolder> = serde_json::from_str(raw).unwrap();
        let sections = sections_from(folders);
        assert_eq!(sections[0].id, "f137a2dd21bbc1b99aa5c0f6bf02a805");
        assert_eq!(sections[0].kind, MediaKind::Movie);
        // Missing ItemId falls back to the name.
        assert_eq!(sections[1].id, "Shows");
        assert_eq!(sections[1].kind, MediaKind::Show);
        assert_eq!(sections[1].roots.len(), 2);
    }

    #[test]
    fn item_paths_parse_from_items_page() {
        let raw = r#"{
            "Items": [
                {"Name": "Heat", "Path": "/media/movies/Heat (1995)/heat.mkv"},
                {"Name": "Folder"}
            ],
            "TotalRecordCount": 2
        }"#;
        let page: ItemsPage = serde_json::from_str(raw).unwrap();
        let paths: Vec<_> = page.items.into_iter().filter_map(|i| i.path).collect();
        assert_eq!(paths, vec![PathBuf::from("/media/movies/Heat (1995)/heat.mkv")]);
    }
}
