//! Upload ingestion: fingerprint, deduplicate, persist.
//!
//! The happy path is one bulk insert of every cache miss. When the
//! bulk transaction fails (a racing worker already inserted one of the
//! records, or transient I/O), the batch falls back to per-record
//! inserts so partial success is still counted precisely.

use std::collections::HashMap;

use tracing::{debug, warn};

use ctsieve_core::api::{UploadRecord, UploadResponse};
use ctsieve_core::entry::parse_leaf_b64;
use ctsieve_core::fingerprint::CertFingerprint;

use crate::cache::{CacheOutcome, DedupCache};
use crate::store::{InsertOutcome, Store, StoreError};

pub fn ingest_batch(
    store: &Store,
    cache: &DedupCache,
    records: Vec<UploadRecord>,
) -> Result<UploadResponse, StoreError> {
    let mut response = UploadResponse::default();
    // highest successfully processed index per log, for the
    // last_uploaded_index watermark
    let mut watermarks: HashMap<String, u64> = HashMap::new();
    let mut fresh: Vec<(UploadRecord, CertFingerprint)> = Vec::new();

    for record in records {
        let parsed = match parse_leaf_b64(&record.ct_entry) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(
                    log = %record.log_name,
                    ct_index = record.ct_index,
                    "rejecting unparseable upload record: {err}"
                );
                response.failures += 1;
                continue;
            }
        };

        match cache.check_and_add(&parsed.fingerprint) {
            CacheOutcome::Hit => {
                response.duplicates += 1;
                note_watermark(&mut watermarks, &record.log_name, record.ct_index);
            }
            CacheOutcome::Miss => fresh.push((record, parsed.fingerprint)),
        }
    }

    if !fresh.is_empty() {
        match store.insert_certs_bulk(&fresh) {
            Ok(()) => {
                response.inserted += fresh.len() as u64;
                for (record, _) in &fresh {
                    note_watermark(&mut watermarks, &record.log_name, record.ct_index);
                }
            }
            Err(err) => {
                debug!("bulk insert failed, falling back to per-record inserts: {err}");
                for (record, fp) in &fresh {
                    match store.insert_cert(record, fp) {
                        Ok(InsertOutcome::Inserted) => {
                            response.inserted += 1;
                            note_watermark(&mut watermarks, &record.log_name, record.ct_index);
                        }
                        Ok(InsertOutcome::Duplicate) => {
                            // a racing worker won; the cache entry stays
                            response.duplicates += 1;
                            note_watermark(&mut watermarks, &record.log_name, record.ct_index);
                        }
                        Err(err) => {
                            warn!(
                                log = %record.log_name,
                                ct_index = record.ct_index,
                                "insert failed: {err}"
                            );
                            response.failures += 1;
                            cache.remove(fp);
                        }
                    }
                }
            }
        }
    }

    for (log_name, ct_index) in watermarks {
        store.advance_last_uploaded(&log_name, ct_index)?;
    }

    Ok(response)
}

fn note_watermark(watermarks: &mut HashMap<String, u64>, log_name: &str, ct_index: u64) {
    watermarks
        .entry(log_name.to_string())
        .and_modify(|high| *high = (*high).max(ct_index))
        .or_insert(ct_index);
}
