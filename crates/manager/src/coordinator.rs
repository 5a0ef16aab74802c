//! Job range lifecycle: assignment, liveness, recovery.
//!
//! Selection runs under a per-category mutex so racing `acquire`
//! calls are serialized and hand out distinct ranges; everything else
//! is a thin pass-through to the store, which SQLite serializes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;

use ctsieve_core::api::JobGrant;

use crate::store::{CompleteOutcome, HeartbeatOutcome, JobRange, Store, StoreError};

#[derive(Debug, Clone, Copy, Default)]
pub struct ReapSummary {
    pub stalled: usize,
    pub reclaimed: usize,
}

#[derive(Default)]
struct CategoryCursor {
    /// Round-robin position over the category's logs for PENDING
    /// selection.
    next_log: usize,
}

pub struct Coordinator {
    store: Arc<Store>,
    stale_secs: i64,
    abandon_secs: i64,
    categories: Mutex<HashMap<String, Arc<Mutex<CategoryCursor>>>>,
}

impl Coordinator {
    pub fn new(store: Arc<Store>, stale_secs: i64, abandon_secs: i64) -> Self {
        Self {
            store,
            stale_secs,
            abandon_secs,
            categories: Mutex::new(HashMap::new()),
        }
    }

    fn category_slot(&self, category: &str) -> Arc<Mutex<CategoryCursor>> {
        let mut map = self.categories.lock().expect("category map poisoned");
        map.entry(category.to_string()).or_default().clone()
    }

    fn lock_category<'a>(
        slot: &'a Arc<Mutex<CategoryCursor>>,
    ) -> MutexGuard<'a, CategoryCursor> {
        slot.lock().expect("category mutex poisoned")
    }

    pub fn acquire(
        &self,
        worker_name: &str,
        category: &str,
    ) -> Result<Option<JobGrant>, StoreError> {
        self.acquire_at(worker_name, category, Utc::now().timestamp())
    }

    /// Select a range for `worker_name`: stalled ranges first (resume
    /// priority), then the smallest PENDING range per log, round-robin
    /// across the category's logs. Returns `None` when the category is
    /// saturated or unknown. A worker never receives two ranges of the
    /// same log.
    pub fn acquire_at(
        &self,
        worker_name: &str,
        category: &str,
        now: i64,
    ) -> Result<Option<JobGrant>, StoreError> {
        let slot = self.category_slot(category);
        let mut cursor = Self::lock_category(&slot);

        for (range, log_url) in self.store.stalled_candidates(category)? {
            // A restarted worker may reclaim its own stalled range; the
            // per-(worker, log) policy only blocks foreign logs.
            let own = self
                .store
                .assignment(&range.log_name, range.start)?
                .is_some_and(|a| a.worker_name == worker_name);
            if !own && self.store.worker_holds_log(worker_name, &range.log_name)? {
                continue;
            }
            self.store
                .assign(&range.log_name, range.start, worker_name, now)?;
            tracing::info!(
                worker = worker_name,
                log = %range.log_name,
                start = range.start,
                current = range.current,
                "reassigned stalled range"
            );
            return Ok(Some(grant(range, log_url)));
        }

        let logs = self.store.logs_in_category(category)?;
        if logs.is_empty() {
            return Ok(None);
        }
        for step in 0..logs.len() {
            let log = &logs[(cursor.next_log + step) % logs.len()];
            if self.store.worker_holds_log(worker_name, &log.log_name)? {
                continue;
            }
            let Some(range) = self.store.smallest_pending(&log.log_name)? else {
                continue;
            };
            cursor.next_log = (cursor.next_log + step + 1) % logs.len();
            self.store
                .assign(&range.log_name, range.start, worker_name, now)?;
            return Ok(Some(grant(range, log.log_url.clone())));
        }

        Ok(None)
    }

    pub fn heartbeat(
        &self,
        worker_name: &str,
        log_name: &str,
        start: u64,
        current: u64,
    ) -> Result<HeartbeatOutcome, StoreError> {
        self.store
            .heartbeat(worker_name, log_name, start, current, Utc::now().timestamp())
    }

    pub fn complete(
        &self,
        worker_name: &str,
        log_name: &str,
        start: u64,
    ) -> Result<CompleteOutcome, StoreError> {
        self.store.complete(worker_name, log_name, start)
    }

    pub fn resume(
        &self,
        worker_name: &str,
        log_name: &str,
        start: u64,
        current: u64,
    ) -> Result<HeartbeatOutcome, StoreError> {
        self.store.resume(worker_name, log_name, start, current)
    }

    pub fn fail(&self, log_name: &str, start: u64) -> Result<(), StoreError> {
        self.store.fail(log_name, start)
    }

    pub fn reap_stale(&self) -> Result<ReapSummary, StoreError> {
        self.reap_at(Utc::now().timestamp())
    }

    pub fn reap_at(&self, now: i64) -> Result<ReapSummary, StoreError> {
        let mut summary = ReapSummary::default();
        for category in self.store.categories()? {
            let slot = self.category_slot(&category);
            let _guard = Self::lock_category(&slot);
            let (stalled, reclaimed) =
                self.store
                    .reap_category(&category, now, self.stale_secs, self.abandon_secs)?;
            summary.stalled += stalled;
            summary.reclaimed += reclaimed;
        }
        Ok(summary)
    }
}

fn grant(range: JobRange, log_url: String) -> JobGrant {
    JobGrant {
        log_name: range.log_name,
        log_url,
        start: range.start,
        end: range.end,
        current: range.current,
    }
}
