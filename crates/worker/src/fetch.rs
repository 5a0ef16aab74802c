//! Per-category fetch loop.
//!
//! Each configured log category runs one task through the range
//! lifecycle: acquire a range from the manager, stream entries from
//! the CT log in index order, keep the suffix matches, upload in
//! bounded batches, heartbeat the cursor, and either complete the
//! range or hand it back.
//!
//! When an upload fails the batch goes to the spool and the heartbeat
//! cursor freezes at the failed batch's lowest index until the spool
//! drains again, so the manager's cursor of record never runs ahead of
//! data that only exists on this worker's disk.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng as _;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use ctsieve_core::api::{JobGrant, UploadRecord};
use ctsieve_core::entry::parse_leaf_b64;
use ctsieve_core::filter::SuffixFilter;

use crate::ctlog::{CtFetchError, CtLogClient};
use crate::manager_api::{ManagerClient, ManagerError};
use crate::spool::Spool;

/// Sleep bounds while a category has no work to hand out.
const ACQUIRE_BACKOFF_MS: (u64, u64) = (1_000, 10_000);
/// Pause before re-checking an empty fetch or a blocked completion.
const STALL_PAUSE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub category: String,
    pub suffix: SuffixFilter,
    /// Upload batch size; the manager rejects anything over 32.
    pub upload_batch: usize,
    /// `get-entries` window hint.
    pub fetch_batch: u64,
    pub heartbeat_interval: Duration,
    pub flush_interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RangeEnd {
    Complete,
    Resumed,
    Failed,
    /// The manager no longer considers us the owner (reaped and
    /// reassigned); drop the range without resuming it.
    Lost,
}

pub async fn run_category_loop(
    cfg: FetchConfig,
    manager: Arc<ManagerClient>,
    ctlog: Arc<CtLogClient>,
    spool: Arc<Spool>,
    mut cancel: watch::Receiver<bool>,
) {
    info!(category = %cfg.category, "category worker started");

    while !*cancel.borrow() {
        let grant = match manager.acquire(&cfg.category).await {
            Ok(Some(grant)) => grant,
            Ok(None) => {
                sleep_with_cancel(&mut cancel, acquire_backoff()).await;
                continue;
            }
            Err(err) => {
                warn!(category = %cfg.category, "acquire failed: {err:#}");
                sleep_with_cancel(&mut cancel, acquire_backoff()).await;
                continue;
            }
        };

        info!(
            category = %cfg.category,
            log = %grant.log_name,
            start = grant.start,
            end = grant.end,
            current = grant.current,
            "acquired range"
        );

        match run_range(&cfg, &manager, &ctlog, &spool, &grant, &mut cancel).await {
            RangeEnd::Complete => {
                info!(log = %grant.log_name, start = grant.start, "range complete");
            }
            RangeEnd::Resumed => {
                info!(log = %grant.log_name, start = grant.start, "range handed back");
            }
            RangeEnd::Failed => {
                warn!(log = %grant.log_name, start = grant.start, "range failed");
            }
            RangeEnd::Lost => {
                warn!(log = %grant.log_name, start = grant.start, "assignment lost to reaper");
            }
        }
    }

    info!(category = %cfg.category, "category worker stopped");
}

async fn run_range(
    cfg: &FetchConfig,
    manager: &ManagerClient,
    ctlog: &CtLogClient,
    spool: &Spool,
    grant: &JobGrant,
    cancel: &mut watch::Receiver<bool>,
) -> RangeEnd {
    let log_url = match normalize_log_url(&grant.log_url) {
        Ok(url) => url,
        Err(message) => {
            warn!(log = %grant.log_name, "{message}");
            let _ = manager
                .report_error(&grant.log_name, grant.start, &message)
                .await;
            return RangeEnd::Failed;
        }
    };

    let mut cursor = grant.current;
    let mut buffer: Vec<UploadRecord> = Vec::new();
    // lowest index of any batch sitting in the spool; caps the
    // heartbeat cursor until the spool drains
    let mut hb_floor: Option<u64> = None;
    let mut last_heartbeat = Instant::now();
    let mut last_flush = Instant::now();

    loop {
        if *cancel.borrow() {
            if !buffer.is_empty() {
                spool_or_die(spool, &buffer);
                buffer.clear();
            }
            let report = effective_cursor(cursor, hb_floor);
            if let Err(err) = manager.resume(&grant.log_name, grant.start, report).await {
                warn!(log = %grant.log_name, "resume failed: {err:#}");
            }
            return RangeEnd::Resumed;
        }

        if cursor >= grant.end {
            if !buffer.is_empty() {
                let chunk: Vec<UploadRecord> = buffer.drain(..).collect();
                upload_or_spool(manager, spool, chunk, &mut hb_floor).await;
            }

            // cannot complete while spooled batches are outstanding
            if hb_floor.is_some() && !spool.is_empty() {
                spool.drain(manager).await;
            }
            if spool.is_empty() {
                hb_floor = None;
            }
            if hb_floor.is_some() {
                let _ = manager
                    .heartbeat(&grant.log_name, grant.start, effective_cursor(cursor, hb_floor))
                    .await;
                sleep_with_cancel(cancel, STALL_PAUSE).await;
                continue;
            }

            match manager.heartbeat(&grant.log_name, grant.start, grant.end).await {
                Ok(()) => {}
                Err(err) if is_not_owner(&err) => return RangeEnd::Lost,
                Err(err) => {
                    warn!(log = %grant.log_name, "final heartbeat failed: {err:#}");
                    sleep_with_cancel(cancel, STALL_PAUSE).await;
                    continue;
                }
            }
            match manager.complete(&grant.log_name, grant.start).await {
                Ok(()) => return RangeEnd::Complete,
                Err(err) if is_not_owner(&err) => return RangeEnd::Lost,
                Err(err) => {
                    warn!(log = %grant.log_name, "complete failed: {err:#}");
                    sleep_with_cancel(cancel, STALL_PAUSE).await;
                    continue;
                }
            }
        }

        let fetch_end = (cursor + cfg.fetch_batch.max(1)).min(grant.end) - 1;
        let entries = tokio::select! {
            _ = cancel.changed() => continue,
            res = ctlog.get_entries(&log_url, cursor, fetch_end) => match res {
                Ok(entries) => entries,
                Err(err @ CtFetchError::Permanent(..)) | Err(err @ CtFetchError::Url(_)) => {
                    let message = format!("{err}");
                    warn!(log = %grant.log_name, "permanent fetch failure: {message}");
                    let _ = manager
                        .report_error(&grant.log_name, grant.start, &message)
                        .await;
                    return RangeEnd::Failed;
                }
                Err(err) => {
                    let message = format!("{err}");
                    warn!(log = %grant.log_name, "sustained fetch failure: {message}");
                    let _ = manager
                        .report_error(&grant.log_name, grant.start, &message)
                        .await;
                    return RangeEnd::Failed;
                }
            }
        };

        if entries.is_empty() {
            // the log answered with nothing for a window it advertises;
            // give it a moment rather than spinning
            debug!(log = %grant.log_name, cursor, "empty get-entries window");
            sleep_with_cancel(cancel, STALL_PAUSE).await;
        } else {
            for (offset, raw) in entries.iter().enumerate() {
                let ct_index = cursor + offset as u64;
                match parse_leaf_b64(&raw.leaf_input) {
                    Ok(parsed) => {
                        if cfg
                            .suffix
                            .matches_any(parsed.dns_names.iter().map(String::as_str))
                        {
                            buffer.push(UploadRecord {
                                ct_entry: raw.leaf_input.clone(),
                                ct_log_url: grant.log_url.clone(),
                                log_name: grant.log_name.clone(),
                                worker_name: manager.worker_name().to_string(),
                                ct_index,
                                ip_address: None,
                            });
                        }
                    }
                    Err(err) => {
                        // a single undecodable entry never fails the range
                        debug!(log = %grant.log_name, ct_index, "skipping entry: {err}");
                    }
                }
            }
            cursor += entries.len() as u64;
        }

        while buffer.len() >= cfg.upload_batch {
            let chunk: Vec<UploadRecord> = buffer.drain(..cfg.upload_batch).collect();
            upload_or_spool(manager, spool, chunk, &mut hb_floor).await;
            last_flush = Instant::now();
        }
        if !buffer.is_empty() && last_flush.elapsed() >= cfg.flush_interval {
            let chunk: Vec<UploadRecord> = buffer.drain(..).collect();
            upload_or_spool(manager, spool, chunk, &mut hb_floor).await;
            last_flush = Instant::now();
        }

        if hb_floor.is_some() && spool.is_empty() {
            hb_floor = None;
        }

        if last_heartbeat.elapsed() >= cfg.heartbeat_interval {
            match manager
                .heartbeat(&grant.log_name, grant.start, effective_cursor(cursor, hb_floor))
                .await
            {
                Ok(()) => last_heartbeat = Instant::now(),
                Err(err) if is_not_owner(&err) => {
                    if !buffer.is_empty() {
                        spool_or_die(spool, &buffer);
                    }
                    return RangeEnd::Lost;
                }
                Err(err) => {
                    warn!(log = %grant.log_name, "heartbeat failed: {err:#}");
                    last_heartbeat = Instant::now();
                }
            }
        }
    }
}

async fn upload_or_spool(
    manager: &ManagerClient,
    spool: &Spool,
    chunk: Vec<UploadRecord>,
    hb_floor: &mut Option<u64>,
) {
    if chunk.is_empty() {
        return;
    }
    let lowest = chunk.iter().map(|r| r.ct_index).min().unwrap_or(0);
    match manager.upload(&chunk).await {
        Ok(res) => {
            debug!(
                inserted = res.inserted,
                duplicates = res.duplicates,
                failures = res.failures,
                "uploaded batch of {}",
                chunk.len()
            );
            if res.failures > 0 {
                warn!(failures = res.failures, "manager reported per-record failures");
            }
        }
        Err(err) => {
            warn!("upload failed, spooling batch of {}: {err:#}", chunk.len());
            spool_or_die(spool, &chunk);
            *hb_floor = Some(hb_floor.map_or(lowest, |floor| floor.min(lowest)));
        }
    }
}

/// Losing a batch entirely (cannot upload, cannot spool) would break
/// at-least-once delivery; a dead spool disk is fatal.
fn spool_or_die(spool: &Spool, records: &[UploadRecord]) {
    if let Err(err) = spool.write_batch(records) {
        error!(
            "cannot write to spool directory {}: {err:#}",
            spool.dir().display()
        );
        std::process::exit(1);
    }
}

fn effective_cursor(cursor: u64, hb_floor: Option<u64>) -> u64 {
    hb_floor.map_or(cursor, |floor| floor.min(cursor))
}

fn is_not_owner(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<ManagerError>(), Some(ManagerError::NotOwner))
}

fn acquire_backoff() -> Duration {
    Duration::from_millis(rand::rng().random_range(ACQUIRE_BACKOFF_MS.0..=ACQUIRE_BACKOFF_MS.1))
}

fn normalize_log_url(raw: &str) -> Result<reqwest::Url, String> {
    let raw = if raw.ends_with('/') {
        raw.to_string()
    } else {
        format!("{raw}/")
    };
    reqwest::Url::parse(&raw).map_err(|err| format!("invalid log url {raw:?}: {err}"))
}

async fn sleep_with_cancel(cancel: &mut watch::Receiver<bool>, duration: Duration) {
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = cancel.changed() => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_cursor_freezes_at_the_spool_floor() {
        assert_eq!(effective_cursor(100, None), 100);
        assert_eq!(effective_cursor(100, Some(40)), 40);
        assert_eq!(effective_cursor(30, Some(40)), 30);
    }

    #[test]
    fn acquire_backoff_is_jittered_within_bounds() {
        for _ in 0..100 {
            let delay = acquire_backoff();
            assert!(delay >= Duration::from_millis(ACQUIRE_BACKOFF_MS.0));
            assert!(delay <= Duration::from_millis(ACQUIRE_BACKOFF_MS.1));
        }
    }

    #[test]
    fn log_urls_are_normalized_with_a_trailing_slash() {
        let url = normalize_log_url("https://ct.example.com/argon").unwrap();
        assert_eq!(url.as_str(), "https://ct.example.com/argon/");
        assert!(normalize_log_url("not a url").is_err());
    }
}
