//! File-integrity verification for newly seen media.
//!
//! Cheap structural checks first (size, tail read, sampled reads) to catch
//! truncated or sparse files on network mounts, then an ffprobe duration
//! probe for bitstream-level corruption.

use std::collections::VecDeque;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::Config;
use crate::database::EventRepository;
use crate::models::{HealthReport, HealthVerdict};
use crate::utils;

/// How many results the in-memory ring keeps.
pub const RECENT_RESULTS: usize = 20;

const TAIL_WINDOW: u64 = 1024 * 1024;
const READ_CHUNK: usize = 1024;
const SAMPLE_THRESHOLD: u64 = 5 * 1024 * 1024;
const SAMPLE_COUNT: usize = 3;
const FFPROBE_TIMEOUT: Duration = Duration::from_secs(30);

enum ProbeOutcome {
    Duration(f64),
    Corrupt(String),
    Timeout,
    Error(String),
}

pub struct HealthVerifier {
    config: Arc<Config>,
    events: EventRepository,
    ffprobe_command: String,
    recent: Mutex<VecDeque<HealthReport>>,
}

impl HealthVerifier {
    pub fn new(config: Arc<Config>, events: EventRepository) -> Self {
        Self {
            config,
            events,
            ffprobe_command: "ffprobe".to_string(),
            recent: Mutex::new(VecDeque::with_capacity(RECENT_RESULTS)),
        }
    }

    /// Run the full check pipeline and record the outcome in the recent
    /// ring and the event log.
    pub async fn check(&self, path: &Path) -> HealthReport {
        let cap = Duration::from_secs(self.config.behaviour.scan_timeout.max(1));
        let (verdict, detail) = match tokio::time::timeout(cap, self.inspect(path)).await {
            Ok(outcome) => outcome,
            Err(_) => (HealthVerdict::Timeout, Some("Scan Timed Out".to_string())),
        };

        let report = HealthReport {
            file: utils::file_name(path),
            verdict,
            detail,
            checked_at: Utc::now(),
        };
        self.record(&report).await;
        report
    }

    async fn inspect(&self, path: &Path) -> (HealthVerdict, Option<String>) {
        let size = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata.len(),
            Err(e) => return (HealthVerdict::Error, Some(e.to_string())),
        };

        if size == 0 {
            warn!("File corruption detected (0 bytes): {}", path.display());
            return (HealthVerdict::Corrupt, Some("0 Bytes".to_string()));
        }

        if let Err(e) = read_checks(path.to_path_buf(), size).await {
            warn!(
                "Data verification failed (read error): {} - {e}",
                path.display()
            );
            return (
                HealthVerdict::Corrupt,
                Some("Incomplete/Read Error".to_string()),
            );
        }

        match self.probe_duration(path).await {
            ProbeOutcome::Duration(duration) => {
                if self.config.behaviour.ignore_samples
                    && duration < self.config.behaviour.min_duration as f64
                {
                    info!(
                        "Ignoring sample/short file ({duration:.0}s): {}",
                        path.display()
                    );
                    return (
                        HealthVerdict::Ignored,
                        Some(format!("Sample ({}s)", duration as u64)),
                    );
                }
                (HealthVerdict::Healthy, None)
            }
            ProbeOutcome::Corrupt(reason) => {
                warn!(
                    "File corruption detected ({reason}): {}",
                    path.display()
                );
                (HealthVerdict::Corrupt, Some(reason))
            }
            ProbeOutcome::Timeout => {
                warn!("File health check timed out: {}", path.display());
                (HealthVerdict::Timeout, Some("Timeout".to_string()))
            }
            ProbeOutcome::Error(message) => (HealthVerdict::Error, Some(message)),
        }
    }

    async fn probe_duration(&self, path: &Path) -> ProbeOutcome {
        let mut cmd = Command::new(&self.ffprobe_command);
        cmd.args([
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
        ])
        .arg(path)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

        let output = match tokio::time::timeout(FFPROBE_TIMEOUT, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return ProbeOutcome::Error(format!("failed to run ffprobe: {e}")),
            Err(_) => return ProbeOutcome::Timeout,
        };

        if !output.status.success() {
            return ProbeOutcome::Corrupt("Bitstream Error".to_string());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let duration_str = stdout.trim();
        if duration_str.is_empty() {
            return ProbeOutcome::Corrupt("No Duration".to_string());
        }

        match duration_str.parse::<f64>() {
            Ok(duration) => ProbeOutcome::Duration(duration),
            // Unparseable duration still proves a readable container.
            Err(_) => ProbeOutcome::Duration(f64::MAX),
        }
    }

    async fn record(&self, report: &HealthReport) {
        {
            let mut recent = self.recent.lock().unwrap();
            recent.push_front(report.clone());
            recent.truncate(RECENT_RESULTS);
        }

        let detail = report.detail.clone().unwrap_or_default();
        match report.verdict {
            HealthVerdict::Healthy => {
                self.events
                    .append("Health Check Passed", &report.file, "Healthy")
                    .await
            }
            HealthVerdict::Corrupt => {
                self.events
                    .append("Health Check Failed", &report.file, &detail)
                    .await
            }
            HealthVerdict::Timeout => {
                self.events
                    .append("Health Check Timeout", &report.file, "Timeout")
                    .await
            }
            HealthVerdict::Ignored => {
                self.events
                    .append("Sample Ignored", &report.file, &detail)
                    .await
            }
            HealthVerdict::Error => {
                self.events
                    .append("Health Check Error", &report.file, &detail)
                    .await
            }
        }
    }

    /// Newest-first copies of the last checks.
    pub fn recent(&self) -> Vec<HealthReport> {
        self.recent.lock().unwrap().iter().cloned().collect()
    }
}

/// Tail read plus random sampled reads, on the blocking pool. An empty
/// read at a sampled offset means a sparse or still-downloading file.
async fn read_checks(path: PathBuf, size: u64) -> std::io::Result<()> {
    tokio::task::spawn_blocking(move || {
        let mut file = std::fs::File::open(&path)?;
        let mut buf = [0u8; READ_CHUNK];

        file.seek(SeekFrom::Start(size.saturating_sub(TAIL_WINDOW)))?;
        file.read(&mut buf)?;

        if size > SAMPLE_THRESHOLD {
            for _ in 0..SAMPLE_COUNT {
                let offset = fastrand::u64(TAIL_WINDOW..size - TAIL_WINDOW);
                file.seek(SeekFrom::Start(offset))?;
                let n = file.read(&mut buf)?;
                if n == 0 {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "empty read at sampled position",
                    ));
                }
            }
        }
        Ok(())
    })
    .await
    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_database;
    use std::io::Write;

    async fn verifier(config: Config) -> (tempfile::TempDir, HealthVerifier) {
        let (dir, database) = test_database().await;
        (dir, HealthVerifier::new(Arc::new(config), database.events()))
    }

    #[tokio::test]
    async fn zero_byte_files_are_corrupt() {
        let (dir, verifier) = verifier(Config::default()).await;
        let path = dir.path().join("empty.mkv");
        std::fs::File::create(&path).unwrap();

        let report = verifier.check(&path).await;
        assert_eq!(report.verdict, HealthVerdict::Corrupt);
        assert_eq!(report.detail.as_deref(), Some("0 Bytes"));
        assert!(!report.is_healthy());
    }

    #[tokio::test]
    async fn missing_files_report_an_error() {
        let (dir, verifier) = verifier(Config::default()).await;
        let report = verifier.check(&dir.path().join("gone.mkv")).await;
        assert_eq!(report.verdict, HealthVerdict::Error);
    }

    #[tokio::test]
    async fn read_checks_pass_on_a_dense_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.bin");
        let mut file = std::fs::File::create(&path).unwrap();
        // Larger than the sampling threshold so all branches run.
        let chunk = vec![0xAAu8; 1024 * 1024];
        for _ in 0..6 {
            file.write_all(&chunk).unwrap();
        }
        drop(file);

        let size = std::fs::metadata(&path).unwrap().len();
        assert!(read_checks(path, size).await.is_ok());
    }

    #[tokio::test]
    async fn recent_ring_keeps_the_newest_twenty() {
        let (dir, verifier) = verifier(Config::default()).await;
        for i in 0..25 {
            let path = dir.path().join(format!("f{i}.mkv"));
            std::fs::File::create(&path).unwrap();
            verifier.check(&path).await;
        }
        let recent = verifier.recent();
        assert_eq!(recent.len(), RECENT_RESULTS);
        assert_eq!(recent[0].file, "f24.mkv");
    }
}
