//! SQLite-backed state: the CT log catalog, job ranges, worker
//! assignments, and persisted certificates.
//!
//! All access goes through one connection behind a mutex; SQLite
//! serializes row updates, the per-category locks in the coordinator
//! serialize range selection above this layer.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use ctsieve_core::api::UploadRecord;
use ctsieve_core::fingerprint::CertFingerprint;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
}

/// One catalog entry as loaded from the operator's JSON catalog file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogLog {
    pub log_name: String,
    pub log_url: String,
    pub category: String,
    pub tree_size: u64,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone)]
pub struct CtLog {
    pub log_name: String,
    pub log_url: String,
    pub category: String,
    pub tree_size: u64,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeState {
    Pending,
    Running,
    Stalled,
    Complete,
    Failed,
}

impl RangeState {
    fn as_str(self) -> &'static str {
        match self {
            RangeState::Pending => "PENDING",
            RangeState::Running => "RUNNING",
            RangeState::Stalled => "STALLED",
            RangeState::Complete => "COMPLETE",
            RangeState::Failed => "FAILED",
        }
    }

    fn parse(raw: &str) -> Self {
        match raw {
            "RUNNING" => RangeState::Running,
            "STALLED" => RangeState::Stalled,
            "COMPLETE" => RangeState::Complete,
            "FAILED" => RangeState::Failed,
            _ => RangeState::Pending,
        }
    }
}

/// A half-open `[start, end)` window over one log.
#[derive(Debug, Clone)]
pub struct JobRange {
    pub log_name: String,
    pub start: u64,
    pub end: u64,
    pub current: u64,
    /// Highest index known to be persisted, `start - 1` when none.
    pub last_uploaded_index: i64,
    pub state: RangeState,
}

#[derive(Debug, Clone)]
pub struct Assignment {
    pub worker_name: String,
    pub assigned_at: i64,
    pub last_heartbeat_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Ok,
    NotOwner,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompleteOutcome {
    Ok,
    NotOwner,
    NotFinished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS ct_logs (
    log_name   TEXT PRIMARY KEY,
    log_url    TEXT NOT NULL,
    category   TEXT NOT NULL,
    tree_size  INTEGER NOT NULL,
    active     INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS job_ranges (
    log_name            TEXT NOT NULL,
    start_index         INTEGER NOT NULL,
    end_index           INTEGER NOT NULL,
    current             INTEGER NOT NULL,
    last_uploaded_index INTEGER NOT NULL,
    state               TEXT NOT NULL,
    PRIMARY KEY (log_name, start_index)
);
CREATE INDEX IF NOT EXISTS job_ranges_by_state ON job_ranges (state, log_name, start_index);

CREATE TABLE IF NOT EXISTS worker_assignments (
    log_name          TEXT NOT NULL,
    start_index       INTEGER NOT NULL,
    worker_name       TEXT NOT NULL,
    assigned_at       INTEGER NOT NULL,
    last_heartbeat_at INTEGER NOT NULL,
    PRIMARY KEY (log_name, start_index)
);
CREATE INDEX IF NOT EXISTS worker_assignments_by_worker ON worker_assignments (worker_name, log_name);

CREATE TABLE IF NOT EXISTS certs (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    ct_entry      TEXT NOT NULL,
    log_url       TEXT NOT NULL,
    log_name      TEXT NOT NULL,
    worker_name   TEXT NOT NULL,
    ct_index      INTEGER NOT NULL,
    ip_address    TEXT,
    issuer        TEXT NOT NULL,
    serial_number TEXT NOT NULL,
    not_before    INTEGER NOT NULL,
    not_after     INTEGER NOT NULL,
    common_name   TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS certs_fingerprint ON certs
    (issuer, serial_number, not_before, not_after, common_name);
";

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("store mutex poisoned")
    }

    /// Upsert catalog entries and partition any uncovered tail of each
    /// log into fixed-width PENDING ranges. Returns how many ranges
    /// were created.
    pub fn apply_catalog(
        &self,
        logs: &[CatalogLog],
        chunk_width: u64,
    ) -> Result<usize, StoreError> {
        let chunk_width = chunk_width.max(1);
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut created = 0usize;

        for log in logs {
            tx.execute(
                "INSERT INTO ct_logs (log_name, log_url, category, tree_size, active)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(log_name) DO UPDATE SET
                     log_url = excluded.log_url,
                     category = excluded.category,
                     tree_size = excluded.tree_size,
                     active = excluded.active",
                params![
                    log.log_name,
                    log.log_url,
                    log.category,
                    log.tree_size as i64,
                    log.active as i64
                ],
            )?;

            let covered: i64 = tx.query_row(
                "SELECT COALESCE(MAX(end_index), 0) FROM job_ranges WHERE log_name = ?1",
                params![log.log_name],
                |row| row.get(0),
            )?;
            let mut start = covered.max(0) as u64;
            while start < log.tree_size {
                let end = (start + chunk_width).min(log.tree_size);
                tx.execute(
                    "INSERT INTO job_ranges
                         (log_name, start_index, end_index, current, last_uploaded_index, state)
                     VALUES (?1, ?2, ?3, ?2, ?2 - 1, ?4)",
                    params![
                        log.log_name,
                        start as i64,
                        end as i64,
                        RangeState::Pending.as_str()
                    ],
                )?;
                created += 1;
                start = end;
            }
        }

        tx.commit()?;
        Ok(created)
    }

    pub fn categories(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT DISTINCT category FROM ct_logs WHERE active = 1 ORDER BY category")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn logs_in_category(&self, category: &str) -> Result<Vec<CtLog>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT log_name, log_url, category, tree_size, active
             FROM ct_logs WHERE category = ?1 AND active = 1 ORDER BY log_name",
        )?;
        let rows = stmt.query_map(params![category], |row| {
            Ok(CtLog {
                log_name: row.get(0)?,
                log_url: row.get(1)?,
                category: row.get(2)?,
                tree_size: row.get::<_, i64>(3)? as u64,
                active: row.get::<_, i64>(4)? != 0,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// STALLED ranges in a category, oldest heartbeat first, with the
    /// owning log's URL.
    pub fn stalled_candidates(
        &self,
        category: &str,
    ) -> Result<Vec<(JobRange, String)>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT r.log_name, r.start_index, r.end_index, r.current,
                    r.last_uploaded_index, r.state, l.log_url
             FROM job_ranges r
             JOIN ct_logs l ON l.log_name = r.log_name
             JOIN worker_assignments a
                  ON a.log_name = r.log_name AND a.start_index = r.start_index
             WHERE r.state = 'STALLED' AND l.category = ?1 AND l.active = 1
             ORDER BY a.last_heartbeat_at ASC",
        )?;
        let rows = stmt.query_map(params![category], |row| {
            Ok((range_from_row(row)?, row.get::<_, String>(6)?))
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn smallest_pending(&self, log_name: &str) -> Result<Option<JobRange>, StoreError> {
        let conn = self.conn();
        let range = conn
            .query_row(
                "SELECT log_name, start_index, end_index, current, last_uploaded_index, state
                 FROM job_ranges
                 WHERE log_name = ?1 AND state = 'PENDING'
                 ORDER BY start_index ASC LIMIT 1",
                params![log_name],
                |row| range_from_row(row),
            )
            .optional()?;
        Ok(range)
    }

    pub fn get_range(&self, log_name: &str, start: u64) -> Result<Option<JobRange>, StoreError> {
        let conn = self.conn();
        let range = conn
            .query_row(
                "SELECT log_name, start_index, end_index, current, last_uploaded_index, state
                 FROM job_ranges WHERE log_name = ?1 AND start_index = ?2",
                params![log_name, start as i64],
                |row| range_from_row(row),
            )
            .optional()?;
        Ok(range)
    }

    pub fn assignment(
        &self,
        log_name: &str,
        start: u64,
    ) -> Result<Option<Assignment>, StoreError> {
        let conn = self.conn();
        let assignment = conn
            .query_row(
                "SELECT worker_name, assigned_at, last_heartbeat_at
                 FROM worker_assignments WHERE log_name = ?1 AND start_index = ?2",
                params![log_name, start as i64],
                |row| {
                    Ok(Assignment {
                        worker_name: row.get(0)?,
                        assigned_at: row.get(1)?,
                        last_heartbeat_at: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(assignment)
    }

    pub fn worker_holds_log(&self, worker_name: &str, log_name: &str) -> Result<bool, StoreError> {
        let conn = self.conn();
        let held: i64 = conn.query_row(
            "SELECT COUNT(*) FROM worker_assignments WHERE worker_name = ?1 AND log_name = ?2",
            params![worker_name, log_name],
            |row| row.get(0),
        )?;
        Ok(held > 0)
    }

    /// Bind a range to a worker: range RUNNING, fresh heartbeat. Any
    /// previous assignment row for the range is replaced.
    pub fn assign(
        &self,
        log_name: &str,
        start: u64,
        worker_name: &str,
        now: i64,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE job_ranges SET state = 'RUNNING' WHERE log_name = ?1 AND start_index = ?2",
            params![log_name, start as i64],
        )?;
        tx.execute(
            "INSERT OR REPLACE INTO worker_assignments
                 (log_name, start_index, worker_name, assigned_at, last_heartbeat_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![log_name, start as i64, worker_name, now],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Advance the cursor (forward only, clamped to the range end) and
    /// refresh the heartbeat. A regressing `current` is accepted but
    /// ignored. A heartbeat from the owner revives a STALLED range.
    pub fn heartbeat(
        &self,
        worker_name: &str,
        log_name: &str,
        start: u64,
        current: u64,
        now: i64,
    ) -> Result<HeartbeatOutcome, StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let owner: Option<String> = tx
            .query_row(
                "SELECT worker_name FROM worker_assignments
                 WHERE log_name = ?1 AND start_index = ?2",
                params![log_name, start as i64],
                |row| row.get(0),
            )
            .optional()?;
        if owner.as_deref() != Some(worker_name) {
            return Ok(HeartbeatOutcome::NotOwner);
        }

        tx.execute(
            "UPDATE job_ranges
             SET current = MIN(MAX(current, ?3), end_index),
                 state = CASE WHEN state = 'STALLED' THEN 'RUNNING' ELSE state END
             WHERE log_name = ?1 AND start_index = ?2",
            params![log_name, start as i64, current as i64],
        )?;
        tx.execute(
            "UPDATE worker_assignments SET last_heartbeat_at = ?3
             WHERE log_name = ?1 AND start_index = ?2",
            params![log_name, start as i64, now],
        )?;
        tx.commit()?;
        Ok(HeartbeatOutcome::Ok)
    }

    pub fn complete(
        &self,
        worker_name: &str,
        log_name: &str,
        start: u64,
    ) -> Result<CompleteOutcome, StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let owner: Option<String> = tx
            .query_row(
                "SELECT worker_name FROM worker_assignments
                 WHERE log_name = ?1 AND start_index = ?2",
                params![log_name, start as i64],
                |row| row.get(0),
            )
            .optional()?;
        if owner.as_deref() != Some(worker_name) {
            return Ok(CompleteOutcome::NotOwner);
        }

        let finished: Option<i64> = tx
            .query_row(
                "SELECT current = end_index FROM job_ranges
                 WHERE log_name = ?1 AND start_index = ?2",
                params![log_name, start as i64],
                |row| row.get(0),
            )
            .optional()?;
        if finished != Some(1) {
            return Ok(CompleteOutcome::NotFinished);
        }

        tx.execute(
            "UPDATE job_ranges SET state = 'COMPLETE' WHERE log_name = ?1 AND start_index = ?2",
            params![log_name, start as i64],
        )?;
        tx.execute(
            "DELETE FROM worker_assignments WHERE log_name = ?1 AND start_index = ?2",
            params![log_name, start as i64],
        )?;
        tx.commit()?;
        Ok(CompleteOutcome::Ok)
    }

    /// Worker-initiated release: back to PENDING with the cursor
    /// preserved (forward only), assignment cleared. Idempotent; a
    /// range held by a different worker is left untouched.
    pub fn resume(
        &self,
        worker_name: &str,
        log_name: &str,
        start: u64,
        current: u64,
    ) -> Result<HeartbeatOutcome, StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let owner: Option<String> = tx
            .query_row(
                "SELECT worker_name FROM worker_assignments
                 WHERE log_name = ?1 AND start_index = ?2",
                params![log_name, start as i64],
                |row| row.get(0),
            )
            .optional()?;
        match owner {
            None => return Ok(HeartbeatOutcome::Ok),
            Some(ref name) if name != worker_name => return Ok(HeartbeatOutcome::NotOwner),
            Some(_) => {}
        }

        tx.execute(
            "UPDATE job_ranges
             SET current = MIN(MAX(current, ?3), end_index), state = 'PENDING'
             WHERE log_name = ?1 AND start_index = ?2
               AND state IN ('RUNNING', 'STALLED')",
            params![log_name, start as i64, current as i64],
        )?;
        tx.execute(
            "DELETE FROM worker_assignments WHERE log_name = ?1 AND start_index = ?2",
            params![log_name, start as i64],
        )?;
        tx.commit()?;
        Ok(HeartbeatOutcome::Ok)
    }

    /// Terminal failure reported by a worker; the range is abandoned.
    pub fn fail(&self, log_name: &str, start: u64) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE job_ranges SET state = 'FAILED'
             WHERE log_name = ?1 AND start_index = ?2 AND state != 'COMPLETE'",
            params![log_name, start as i64],
        )?;
        tx.execute(
            "DELETE FROM worker_assignments WHERE log_name = ?1 AND start_index = ?2",
            params![log_name, start as i64],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// One reap pass over a category: heartbeat-stale RUNNING ranges
    /// become STALLED; past the abandonment threshold the assignment
    /// is dropped and the range returns to PENDING at its recorded
    /// cursor.
    pub fn reap_category(
        &self,
        category: &str,
        now: i64,
        stale_secs: i64,
        abandon_secs: i64,
    ) -> Result<(usize, usize), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let stalled = tx.execute(
            "UPDATE job_ranges SET state = 'STALLED'
             WHERE state = 'RUNNING' AND (log_name, start_index) IN (
                 SELECT a.log_name, a.start_index
                 FROM worker_assignments a
                 JOIN ct_logs l ON l.log_name = a.log_name
                 WHERE l.category = ?1 AND a.last_heartbeat_at <= ?2
             )",
            params![category, now - stale_secs],
        )?;

        let abandoned: Vec<(String, i64)> = {
            let mut stmt = tx.prepare(
                "SELECT a.log_name, a.start_index
                 FROM worker_assignments a
                 JOIN ct_logs l ON l.log_name = a.log_name
                 WHERE l.category = ?1 AND a.last_heartbeat_at <= ?2",
            )?;
            let rows = stmt.query_map(params![category, now - abandon_secs], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?;
            rows.collect::<Result<_, _>>()?
        };
        for (log_name, start) in &abandoned {
            tx.execute(
                "UPDATE job_ranges SET state = 'PENDING'
                 WHERE log_name = ?1 AND start_index = ?2 AND state IN ('RUNNING', 'STALLED')",
                params![log_name, start],
            )?;
            tx.execute(
                "DELETE FROM worker_assignments WHERE log_name = ?1 AND start_index = ?2",
                params![log_name, start],
            )?;
        }

        tx.commit()?;
        Ok((stalled, abandoned.len()))
    }

    /// Insert a whole batch in one transaction; any failure (including
    /// a unique-constraint violation from a racing worker) aborts the
    /// transaction so the caller can fall back to per-record inserts.
    pub fn insert_certs_bulk(
        &self,
        items: &[(UploadRecord, CertFingerprint)],
    ) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO certs
                     (ct_entry, log_url, log_name, worker_name, ct_index, ip_address,
                      issuer, serial_number, not_before, not_after, common_name)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            )?;
            for (record, fp) in items {
                stmt.execute(params![
                    record.ct_entry,
                    record.ct_log_url,
                    record.log_name,
                    record.worker_name,
                    record.ct_index as i64,
                    record.ip_address,
                    fp.issuer,
                    fp.serial_number,
                    fp.not_before,
                    fp.not_after,
                    fp.common_name,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn insert_cert(
        &self,
        record: &UploadRecord,
        fp: &CertFingerprint,
    ) -> Result<InsertOutcome, StoreError> {
        let conn = self.conn();
        let res = conn.execute(
            "INSERT INTO certs
                 (ct_entry, log_url, log_name, worker_name, ct_index, ip_address,
                  issuer, serial_number, not_before, not_after, common_name)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                record.ct_entry,
                record.ct_log_url,
                record.log_name,
                record.worker_name,
                record.ct_index as i64,
                record.ip_address,
                fp.issuer,
                fp.serial_number,
                fp.not_before,
                fp.not_after,
                fp.common_name,
            ],
        );
        match res {
            Ok(_) => Ok(InsertOutcome::Inserted),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Ok(InsertOutcome::Duplicate)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Move `last_uploaded_index` forward for the non-terminal range
    /// containing `ct_index`. Never regresses and never runs ahead of
    /// `current - 1`; COMPLETE and FAILED ranges are untouched.
    pub fn advance_last_uploaded(&self, log_name: &str, ct_index: u64) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute(
            "UPDATE job_ranges
             SET last_uploaded_index = MIN(MAX(last_uploaded_index, ?2), current - 1)
             WHERE log_name = ?1 AND start_index <= ?2 AND end_index > ?2
               AND state IN ('PENDING', 'RUNNING', 'STALLED')",
            params![log_name, ct_index as i64],
        )?;
        Ok(())
    }

    pub fn count_certs(&self) -> Result<u64, StoreError> {
        let conn = self.conn();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM certs", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) -> Result<(), StoreError> {
        self.conn().execute_batch(sql)?;
        Ok(())
    }
}

fn range_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRange> {
    Ok(JobRange {
        log_name: row.get(0)?,
        start: row.get::<_, i64>(1)? as u64,
        end: row.get::<_, i64>(2)? as u64,
        current: row.get::<_, i64>(3)? as u64,
        last_uploaded_index: row.get(4)?,
        state: RangeState::parse(&row.get::<_, String>(5)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog(tree_size: u64) -> Vec<CatalogLog> {
        vec![CatalogLog {
            log_name: "argon".into(),
            log_url: "https://ct.example.com/argon/".into(),
            category: "google".into(),
            tree_size,
            active: true,
        }]
    }

    #[test]
    fn partitioning_covers_the_tree_without_gaps() {
        let store = Store::in_memory().unwrap();
        let created = store.apply_catalog(&catalog(40), 16).unwrap();
        assert_eq!(created, 3);

        let mut start = 0;
        for expected_end in [16u64, 32, 40] {
            let range = store.get_range("argon", start).unwrap().unwrap();
            assert_eq!(range.end, expected_end);
            assert_eq!(range.current, range.start);
            assert_eq!(range.last_uploaded_index, range.start as i64 - 1);
            assert_eq!(range.state, RangeState::Pending);
            start = expected_end;
        }
    }

    #[test]
    fn growing_tree_size_extends_partitioning() {
        let store = Store::in_memory().unwrap();
        store.apply_catalog(&catalog(32), 16).unwrap();
        let created = store.apply_catalog(&catalog(64), 16).unwrap();
        assert_eq!(created, 2);
        assert!(store.get_range("argon", 48).unwrap().is_some());
        // existing ranges untouched
        assert_eq!(
            store.get_range("argon", 0).unwrap().unwrap().state,
            RangeState::Pending
        );
    }

    #[test]
    fn heartbeat_advances_forward_only() {
        let store = Store::in_memory().unwrap();
        store.apply_catalog(&catalog(32), 32).unwrap();
        store.assign("argon", 0, "w1", 1_000).unwrap();

        assert_eq!(
            store.heartbeat("w1", "argon", 0, 20, 1_010).unwrap(),
            HeartbeatOutcome::Ok
        );
        assert_eq!(store.get_range("argon", 0).unwrap().unwrap().current, 20);

        // regression accepted but ignored
        assert_eq!(
            store.heartbeat("w1", "argon", 0, 5, 1_020).unwrap(),
            HeartbeatOutcome::Ok
        );
        assert_eq!(store.get_range("argon", 0).unwrap().unwrap().current, 20);

        // clamped to the range end
        store.heartbeat("w1", "argon", 0, 99, 1_030).unwrap();
        assert_eq!(store.get_range("argon", 0).unwrap().unwrap().current, 32);

        assert_eq!(
            store.heartbeat("w2", "argon", 0, 25, 1_040).unwrap(),
            HeartbeatOutcome::NotOwner
        );
    }

    #[test]
    fn complete_requires_a_finished_cursor() {
        let store = Store::in_memory().unwrap();
        store.apply_catalog(&catalog(32), 32).unwrap();
        store.assign("argon", 0, "w1", 1_000).unwrap();

        assert_eq!(
            store.complete("w1", "argon", 0).unwrap(),
            CompleteOutcome::NotFinished
        );
        store.heartbeat("w1", "argon", 0, 32, 1_010).unwrap();
        assert_eq!(store.complete("w1", "argon", 0).unwrap(), CompleteOutcome::Ok);
        assert_eq!(
            store.get_range("argon", 0).unwrap().unwrap().state,
            RangeState::Complete
        );
        assert!(store.assignment("argon", 0).unwrap().is_none());
    }

    #[test]
    fn resume_preserves_the_cursor_and_is_idempotent() {
        let store = Store::in_memory().unwrap();
        store.apply_catalog(&catalog(32), 32).unwrap();
        store.assign("argon", 0, "w1", 1_000).unwrap();
        store.heartbeat("w1", "argon", 0, 12, 1_010).unwrap();

        assert_eq!(
            store.resume("w1", "argon", 0, 12).unwrap(),
            HeartbeatOutcome::Ok
        );
        let range = store.get_range("argon", 0).unwrap().unwrap();
        assert_eq!(range.state, RangeState::Pending);
        assert_eq!(range.current, 12);
        assert!(store.assignment("argon", 0).unwrap().is_none());

        // second resume is a no-op
        assert_eq!(
            store.resume("w1", "argon", 0, 12).unwrap(),
            HeartbeatOutcome::Ok
        );
    }

    #[test]
    fn reap_marks_stalled_then_reclaims() {
        let store = Store::in_memory().unwrap();
        store.apply_catalog(&catalog(32), 32).unwrap();
        store.assign("argon", 0, "w1", 1_000).unwrap();
        store.heartbeat("w1", "argon", 0, 10, 1_000).unwrap();

        // fresh heartbeat: nothing to do
        let (stalled, reclaimed) = store.reap_category("google", 1_100, 300, 900).unwrap();
        assert_eq!((stalled, reclaimed), (0, 0));

        let (stalled, _) = store.reap_category("google", 1_400, 300, 900).unwrap();
        assert_eq!(stalled, 1);
        assert_eq!(
            store.get_range("argon", 0).unwrap().unwrap().state,
            RangeState::Stalled
        );
        assert!(store.assignment("argon", 0).unwrap().is_some());

        let (_, reclaimed) = store.reap_category("google", 2_000, 300, 900).unwrap();
        assert_eq!(reclaimed, 1);
        let range = store.get_range("argon", 0).unwrap().unwrap();
        assert_eq!(range.state, RangeState::Pending);
        assert_eq!(range.current, 10);
        assert!(store.assignment("argon", 0).unwrap().is_none());
    }

    #[test]
    fn last_uploaded_never_passes_the_cursor() {
        let store = Store::in_memory().unwrap();
        store.apply_catalog(&catalog(32), 32).unwrap();
        store.assign("argon", 0, "w1", 1_000).unwrap();
        store.heartbeat("w1", "argon", 0, 10, 1_000).unwrap();

        store.advance_last_uploaded("argon", 5).unwrap();
        assert_eq!(
            store.get_range("argon", 0).unwrap().unwrap().last_uploaded_index,
            5
        );

        // clamped to current - 1
        store.advance_last_uploaded("argon", 25).unwrap();
        assert_eq!(
            store.get_range("argon", 0).unwrap().unwrap().last_uploaded_index,
            9
        );

        // never regresses
        store.advance_last_uploaded("argon", 2).unwrap();
        assert_eq!(
            store.get_range("argon", 0).unwrap().unwrap().last_uploaded_index,
            9
        );
    }
}
