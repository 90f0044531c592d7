use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::AppError;
use crate::models::ServerKind;
use crate::utils;

/// File extensions treated as media. Matched case-insensitively against the
/// path extension, without the leading dot.
pub const MEDIA_EXTENSIONS: &[&str] = &[
    "mp4", "mkv", "avi", "mov", "wmv", "flv", "webm", "m4v", "m4p", "m4b", "m4r", "3gp", "mpg",
    "mpeg", "m2v", "m2ts", "ts", "vob", "iso",
];

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub plex: PlexConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub behaviour: BehaviourConfig,
    #[serde(default)]
    pub ignore: IgnoreConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
    #[serde(default)]
    pub web: WebConfig,

    /// Compiled ignore patterns, built once after loading.
    #[serde(skip)]
    ignore_globs: Vec<glob::Pattern>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerConfig {
    #[serde(rename = "type", default)]
    pub kind: ServerKind,
    /// Jellyfin/Emby base URL.
    pub url: Option<String>,
    /// Jellyfin/Emby API key.
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PlexConfig {
    /// Plex base URL.
    pub server: Option<String>,
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ScanConfig {
    /// Library roots to sweep and watch.
    #[serde(default)]
    pub directories: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehaviourConfig {
    #[serde(default = "default_scan_workers")]
    pub scan_workers: usize,
    /// Debounce window in seconds for folder-keyed refreshes.
    #[serde(default = "default_scan_debounce")]
    pub scan_debounce: u64,
    /// Per-file sleep during sweeps, in seconds.
    #[serde(default)]
    pub scan_delay: f64,
    #[serde(default)]
    pub watch: bool,
    #[serde(default)]
    pub use_polling: bool,
    /// Hours between scheduled sweeps.
    #[serde(default = "default_run_interval")]
    pub run_interval: u32,
    /// `HH:MM` anchor for the sweep schedule.
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default = "default_true")]
    pub run_on_startup: bool,
    #[serde(default)]
    pub incremental_scan: bool,
    #[serde(default = "default_scan_since_days")]
    pub scan_since_days: u64,
    #[serde(default)]
    pub health_check: bool,
    #[serde(default)]
    pub symlink_check: bool,
    #[serde(default)]
    pub ignore_samples: bool,
    /// Minimum duration in seconds before a file counts as a sample.
    #[serde(default = "default_min_duration")]
    pub min_duration: u64,
    #[serde(default = "default_deletion_threshold")]
    pub deletion_threshold: u64,
    #[serde(default = "default_true")]
    pub abort_on_mass_deletion: bool,
    #[serde(default)]
    pub dry_run: bool,
    /// Per-file probe cap in seconds.
    #[serde(default = "default_scan_timeout")]
    pub scan_timeout: u64,
}

impl Default for BehaviourConfig {
    fn default() -> Self {
        Self {
            scan_workers: default_scan_workers(),
            scan_debounce: default_scan_debounce(),
            scan_delay: 0.0,
            watch: false,
            use_polling: false,
            run_interval: default_run_interval(),
            start_time: None,
            run_on_startup: true,
            incremental_scan: false,
            scan_since_days: default_scan_since_days(),
            health_check: false,
            symlink_check: false,
            ignore_samples: false,
            min_duration: default_min_duration(),
            deletion_threshold: default_deletion_threshold(),
            abort_on_mass_deletion: true,
            dry_run: false,
            scan_timeout: default_scan_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IgnoreConfig {
    #[serde(default)]
    pub patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub discord_webhook_url: Option<String>,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            discord_webhook_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    #[serde(default = "default_web_host")]
    pub host: String,
    #[serde(default = "default_web_port")]
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: default_web_host(),
            port: default_web_port(),
        }
    }
}

fn default_scan_workers() -> usize {
    4
}
fn default_scan_debounce() -> u64 {
    10
}
fn default_run_interval() -> u32 {
    24
}
fn default_scan_since_days() -> u64 {
    7
}
fn default_min_duration() -> u64 {
    180
}
fn default_deletion_threshold() -> u64 {
    50
}
fn default_scan_timeout() -> u64 {
    60
}
fn default_true() -> bool {
    true
}
fn default_web_host() -> String {
    "0.0.0.0".to_string()
}
fn default_web_port() -> u16 {
    8000
}

impl Config {
    /// Load configuration from a TOML file, falling back to defaults when the
    /// file is absent, then apply environment-variable overrides.
    pub fn load(path: &Path) -> Result<Self, AppError> {
        let mut config: Config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str(&contents)
                .map_err(|e| AppError::config(format!("invalid config {}: {e}", path.display())))?
        } else {
            warn!("Config file {} not found, using defaults", path.display());
            Config::default()
        };

        config.apply_env_overrides();
        config.compile_ignore_globs();
        Ok(config)
    }

    /// Every key in the file can also come from the environment; the
    /// environment wins.
    fn apply_env_overrides(&mut self) {
        if let Some(kind) = env_string("SERVER_TYPE") {
            match kind.to_lowercase().as_str() {
                "plex" => self.server.kind = ServerKind::Plex,
                "jellyfin" => self.server.kind = ServerKind::Jellyfin,
                "emby" => self.server.kind = ServerKind::Emby,
                other => warn!("Invalid value for SERVER_TYPE: {other}"),
            }
        }
        override_opt(&mut self.plex.server, "PLEX_SERVER");
        override_opt(&mut self.plex.token, "PLEX_TOKEN");
        override_opt(&mut self.server.url, "SERVER_URL");
        override_opt(&mut self.server.api_key, "API_KEY");

        if let Some(raw) = env_string("SCAN_DIRECTORIES") {
            self.scan.directories = parse_list(&raw).into_iter().map(PathBuf::from).collect();
        }
        if let Some(raw) = env_string("IGNORE_PATTERNS") {
            self.ignore.patterns = parse_list(&raw);
        }

        override_parse(&mut self.behaviour.scan_workers, "SCAN_WORKERS");
        override_parse(&mut self.behaviour.scan_debounce, "SCAN_DEBOUNCE");
        override_parse(&mut self.behaviour.scan_delay, "SCAN_DELAY");
        override_bool(&mut self.behaviour.watch, "WATCH_MODE");
        override_bool(&mut self.behaviour.use_polling, "USE_POLLING");
        override_parse(&mut self.behaviour.run_interval, "RUN_INTERVAL");
        override_opt(&mut self.behaviour.start_time, "START_TIME");
        override_bool(&mut self.behaviour.run_on_startup, "RUN_ON_STARTUP");
        override_bool(&mut self.behaviour.incremental_scan, "INCREMENTAL_SCAN");
        override_parse(&mut self.behaviour.scan_since_days, "SCAN_SINCE_DAYS");
        override_bool(&mut self.behaviour.health_check, "HEALTH_CHECK");
        override_bool(&mut self.behaviour.symlink_check, "SYMLINK_CHECK");
        override_bool(&mut self.behaviour.ignore_samples, "IGNORE_SAMPLES");
        override_parse(&mut self.behaviour.min_duration, "MIN_DURATION");
        override_parse(&mut self.behaviour.deletion_threshold, "DELETION_THRESHOLD");
        override_bool(
            &mut self.behaviour.abort_on_mass_deletion,
            "ABORT_ON_MASS_DELETION",
        );
        override_bool(&mut self.behaviour.dry_run, "DRY_RUN");
        override_parse(&mut self.behaviour.scan_timeout, "SCAN_TIMEOUT");

        override_bool(&mut self.notifications.enabled, "NOTIFICATIONS_ENABLED");
        override_opt(
            &mut self.notifications.discord_webhook_url,
            "DISCORD_WEBHOOK_URL",
        );

        if let Some(host) = env_string("WEB_HOST") {
            self.web.host = host;
        }
        override_parse(&mut self.web.port, "WEB_PORT");
    }

    pub fn compile_ignore_globs(&mut self) {
        self.ignore_globs = self
            .ignore
            .patterns
            .iter()
            .filter_map(|p| match glob::Pattern::new(p) {
                Ok(pattern) => Some(pattern),
                Err(e) => {
                    warn!("Invalid ignore pattern '{p}': {e}");
                    None
                }
            })
            .collect();
    }

    /// A path is ignored when any pattern matches the full path or the
    /// basename.
    pub fn is_ignored(&self, path: &Path) -> bool {
        let name = utils::file_name(path);
        self.ignore_globs
            .iter()
            .any(|pattern| pattern.matches_path(path) || pattern.matches(&name))
    }

    pub fn is_media_file(&self, path: &Path) -> bool {
        match utils::extension_lowercase(path) {
            Some(ext) => MEDIA_EXTENSIONS.contains(&ext.as_str()),
            None => false,
        }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.scan.directories
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_secs(self.behaviour.scan_debounce)
    }

    pub fn scan_delay(&self) -> Option<Duration> {
        if self.behaviour.scan_delay > 0.0 {
            Some(Duration::from_secs_f64(self.behaviour.scan_delay))
        } else {
            None
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn override_opt(slot: &mut Option<String>, key: &str) {
    if let Some(value) = env_string(key) {
        *slot = Some(value);
    }
}

fn override_parse<T: FromStr>(slot: &mut T, key: &str) {
    if let Some(raw) = env_string(key) {
        match raw.parse::<T>() {
            Ok(value) => *slot = value,
            Err(_) => warn!("Invalid value for {key}: {raw}"),
        }
    }
}

fn override_bool(slot: &mut bool, key: &str) {
    if let Some(raw) = env_string(key) {
        *slot = raw.eq_ignore_ascii_case("true") || raw == "1";
    }
}

/// Comma- or newline-separated list.
fn parse_list(raw: &str) -> Vec<String> {
    raw.replace('\n', ",")
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.behaviour.scan_workers, 4);
        assert_eq!(config.behaviour.scan_debounce, 10);
        assert_eq!(config.behaviour.run_interval, 24);
        assert_eq!(config.behaviour.deletion_threshold, 50);
        assert!(config.behaviour.abort_on_mass_deletion);
        assert!(config.behaviour.run_on_startup);
        assert!(!config.behaviour.watch);
        assert_eq!(config.behaviour.min_duration, 180);
        assert_eq!(config.behaviour.scan_timeout, 60);
        assert_eq!(config.web.port, 8000);
    }

    #[test]
    fn toml_sections_deserialize() {
        let raw = r#"
            [server]
            type = "jellyfin"
            url = "http://jf:8096"
            api_key = "key"

            [scan]
            directories = ["/mnt/tv", "/mnt/movies"]

            [behaviour]
            scan_debounce = 30
            health_check = true

            [ignore]
            patterns = ["*.tmp", "sample*"]
        "#;
        let mut config: Config = toml::from_str(raw).unwrap();
        config.compile_ignore_globs();
        assert_eq!(config.server.kind, ServerKind::Jellyfin);
        assert_eq!(config.roots().len(), 2);
        assert_eq!(config.behaviour.scan_debounce, 30);
        assert!(config.behaviour.health_check);
        assert!(config.behaviour.run_on_startup);
    }

    #[test]
    fn ignore_patterns_match_basename_and_full_path() {
        let mut config = Config::default();
        config.ignore.patterns = vec!["*.tmp".into(), "sample*".into(), "*/extras/*".into()];
        config.compile_ignore_globs();
        assert!(config.is_ignored(Path::new("/m/show/episode.tmp")));
        assert!(config.is_ignored(Path::new("/m/show/sample_episode.mkv")));
        assert!(config.is_ignored(Path::new("/m/extras/clip.mkv")));
        assert!(!config.is_ignored(Path::new("/m/show/episode.mkv")));
    }

    #[test]
    fn media_extension_filter_is_case_insensitive() {
        let config = Config::default();
        assert!(config.is_media_file(Path::new("/m/a.MKV")));
        assert!(config.is_media_file(Path::new("/m/a.mp4")));
        assert!(!config.is_media_file(Path::new("/m/a.srt")));
        assert!(!config.is_media_file(Path::new("/m/noext")));
    }

    #[test]
    fn list_parsing_accepts_commas_and_newlines() {
        assert_eq!(
            parse_list("/mnt/tv, /mnt/movies\n/mnt/music"),
            vec!["/mnt/tv", "/mnt/movies", "/mnt/music"]
        );
    }
}
