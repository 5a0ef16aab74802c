//! Local spool for failed uploads.
//!
//! A batch the manager would not take is written verbatim to
//! `<spool_dir>/upload_failure_<ts>_<rand>.json` and re-uploaded by a
//! background reaper until the manager accepts it. Filenames are
//! unique so concurrent category tasks never coordinate. Ordering
//! across files is not guaranteed; upload ingestion is idempotent, so
//! that is safe.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use ctsieve_core::api::UploadRecord;

use crate::manager_api::ManagerClient;

const SPOOL_PREFIX: &str = "upload_failure_";

#[derive(Debug, Clone, Copy, Default)]
pub struct DrainReport {
    pub uploaded: usize,
    pub failed: usize,
    pub skipped: usize,
}

pub struct Spool {
    dir: PathBuf,
}

impl Spool {
    pub fn open<P: AsRef<Path>>(dir: P) -> anyhow::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn write_batch(&self, records: &[UploadRecord]) -> anyhow::Result<PathBuf> {
        let suffix = Uuid::new_v4().simple().to_string();
        let name = format!(
            "{SPOOL_PREFIX}{}_{}.json",
            Utc::now().format("%Y%m%d%H%M%S%3f"),
            &suffix[..8]
        );
        let path = self.dir.join(name);
        let json = serde_json::to_string(records)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        Ok(path)
    }

    /// Spool files, oldest first by filename timestamp.
    pub fn files(&self) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension().is_some_and(|ext| ext == "json")
                    && path
                        .file_name()
                        .and_then(|name| name.to_str())
                        .is_some_and(|name| name.starts_with(SPOOL_PREFIX))
            })
            .collect();
        files.sort();
        files
    }

    pub fn is_empty(&self) -> bool {
        self.files().is_empty()
    }

    /// Re-upload every spooled batch; files the manager accepted are
    /// removed, failures stay for the next pass, unreadable files are
    /// kept but skipped.
    pub async fn drain(&self, manager: &ManagerClient) -> DrainReport {
        let mut report = DrainReport::default();
        for path in self.files() {
            let records: Vec<UploadRecord> = match std::fs::read_to_string(&path)
                .map_err(anyhow::Error::from)
                .and_then(|raw| serde_json::from_str(&raw).map_err(anyhow::Error::from))
            {
                Ok(records) => records,
                Err(err) => {
                    warn!("skipping unreadable spool file {}: {err:#}", path.display());
                    report.skipped += 1;
                    continue;
                }
            };

            match manager.upload(&records).await {
                Ok(res) => {
                    debug!(
                        inserted = res.inserted,
                        duplicates = res.duplicates,
                        failures = res.failures,
                        "re-uploaded spool file {}",
                        path.display()
                    );
                    if let Err(err) = std::fs::remove_file(&path) {
                        warn!("failed to remove drained spool file {}: {err}", path.display());
                    }
                    report.uploaded += 1;
                }
                Err(err) => {
                    debug!("spool re-upload failed for {}: {err:#}", path.display());
                    report.failed += 1;
                }
            }
        }
        report
    }
}

/// Drain the spool at startup and every `interval` until cancelled.
pub async fn run_spool_reaper(
    spool: Arc<Spool>,
    manager: Arc<ManagerClient>,
    interval: Duration,
    mut cancel: watch::Receiver<bool>,
) {
    loop {
        let report = spool.drain(&manager).await;
        if report.uploaded > 0 || report.failed > 0 {
            info!(
                uploaded = report.uploaded,
                failed = report.failed,
                skipped = report.skipped,
                "spool drain pass finished"
            );
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = cancel.changed() => {
                if *cancel.borrow() {
                    return;
                }
            }
        }
    }
}
