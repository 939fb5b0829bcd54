//! Durable run storage over SQLite.
//!
//! Runs, iterations, the event log and per-issue locks live in one database.
//! The connection sits behind a `Mutex` since `rusqlite::Connection` is not
//! `Sync`; every operation is short and needs exclusive access anyway.

use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::domain::{EventRecord, Iteration, NewIteration, Run};
use crate::error::{EngineError, Result};
use crate::id::generate_lock_token;
use crate::state::RunState;

/// Persistence boundary used by the engine
pub trait RunStore: Send + Sync {
    fn create_run(&self, run: &Run) -> Result<()>;

    fn get_run(&self, run_id: &str) -> Result<Option<Run>>;

    /// All runs, oldest first
    fn list_runs(&self) -> Result<Vec<Run>>;

    fn latest_run_for_issue(&self, repo_url: &str, issue_number: i64) -> Result<Option<Run>>;

    /// Compare-and-set: moves `run_id` from `from` to `to` only if the
    /// transition is allowed and the stored state is still `from`.
    fn transition_state(&self, run_id: &str, from: RunState, to: RunState) -> Result<()>;

    /// Iterations of a run, by index
    fn list_iterations(&self, run_id: &str) -> Result<Vec<Iteration>>;

    /// Insert the next iteration. Fails once the run's `max_iterations` is
    /// reached.
    fn add_iteration(&self, iteration: NewIteration) -> Result<Iteration>;

    fn add_log(&self, event: &EventRecord) -> Result<()>;

    /// Event log of a run, in append order
    fn list_logs(&self, run_id: &str) -> Result<Vec<EventRecord>>;

    /// Take the (repo, issue) lock under `lock.token`. Returns false while any
    /// other acquisition holds it, including one for the same run.
    fn try_lock_issue(&self, lock: &IssueLock) -> Result<bool>;

    /// Drop the lock if this acquisition still holds it
    fn release_issue_lock(&self, lock: &IssueLock) -> Result<()>;
}

/// Locks older than this are treated as left behind by a dead worker
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(60 * 60);

/// One acquisition of a (repo, issue) lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueLock {
    pub repo_url: String,
    pub issue_number: i64,
    pub run_id: String,
    /// Owner token, fresh for every acquisition
    pub token: String,
}

impl IssueLock {
    pub fn new(repo_url: impl Into<String>, issue_number: i64, run_id: &str) -> Self {
        Self {
            repo_url: repo_url.into(),
            issue_number,
            run_id: run_id.to_string(),
            token: generate_lock_token(run_id),
        }
    }
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
    lock_ttl: Duration,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("lock_ttl", &self.lock_ttl)
            .finish_non_exhaustive()
    }
}

fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| EngineError::Store(format!("bad timestamp {:?}: {}", raw, e)))
}

/// Raw row values; converted outside the rusqlite closure so parse errors
/// surface as `EngineError`.
struct RunRow {
    id: String,
    repo_url: String,
    issue_number: Option<i64>,
    state: String,
    model: String,
    max_iterations: u32,
    created_at: String,
}

impl RunRow {
    const COLUMNS: &'static str = "id, repo_url, issue_number, state, model, max_iterations, created_at";

    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            repo_url: row.get(1)?,
            issue_number: row.get(2)?,
            state: row.get(3)?,
            model: row.get(4)?,
            max_iterations: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    fn into_run(self) -> Result<Run> {
        Ok(Run {
            id: self.id,
            repo_url: self.repo_url,
            issue_number: self.issue_number,
            state: self.state.parse()?,
            model: self.model,
            max_iterations: self.max_iterations,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

/// Raw iteration row, converted like `RunRow`
struct IterationRow {
    id: String,
    run_id: String,
    index: u32,
    plan: String,
    patch_hash: String,
    branch: String,
    pr_url: Option<String>,
    ci_summary: String,
    reviewer_verdict: String,
    created_at: String,
}

impl IterationRow {
    const COLUMNS: &'static str =
        "id, run_id, idx, plan, patch_hash, branch, pr_url, ci_summary, reviewer_verdict, created_at";

    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            run_id: row.get(1)?,
            index: row.get(2)?,
            plan: row.get(3)?,
            patch_hash: row.get(4)?,
            branch: row.get(5)?,
            pr_url: row.get(6)?,
            ci_summary: row.get(7)?,
            reviewer_verdict: row.get(8)?,
            created_at: row.get(9)?,
        })
    }

    fn into_iteration(self) -> Result<Iteration> {
        Ok(Iteration {
            id: self.id,
            run_id: self.run_id,
            index: self.index,
            plan: self.plan,
            patch_hash: self.patch_hash,
            branch: self.branch,
            pr_url: self.pr_url,
            ci_summary: self.ci_summary,
            reviewer_verdict: self.reviewer_verdict,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

impl SqliteStore {
    /// Open or create the database at `path`, creating parent directories
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            lock_ttl: DEFAULT_LOCK_TTL,
        })
    }

    /// Age after which an issue lock may be taken over
    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                repo_url TEXT NOT NULL,
                issue_number INTEGER,
                state TEXT NOT NULL,
                model TEXT NOT NULL,
                max_iterations INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_runs_issue ON runs(repo_url, issue_number);

            CREATE TABLE IF NOT EXISTS iterations (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL REFERENCES runs(id),
                idx INTEGER NOT NULL,
                plan TEXT NOT NULL,
                patch_hash TEXT NOT NULL,
                branch TEXT NOT NULL,
                pr_url TEXT,
                ci_summary TEXT NOT NULL,
                reviewer_verdict TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE(run_id, idx)
            );

            CREATE TABLE IF NOT EXISTS event_logs (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL REFERENCES runs(id),
                kind TEXT NOT NULL,
                message TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_event_logs_run ON event_logs(run_id);

            CREATE TABLE IF NOT EXISTS issue_locks (
                repo_url TEXT NOT NULL,
                issue_number INTEGER NOT NULL,
                run_id TEXT NOT NULL,
                token TEXT NOT NULL,
                locked_at TEXT NOT NULL,
                PRIMARY KEY (repo_url, issue_number)
            );
            "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| EngineError::Store(e.to_string()))
    }

    fn query_runs(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Run>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, RunRow::read)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(RunRow::into_run).collect()
    }
}

impl RunStore for SqliteStore {
    fn create_run(&self, run: &Run) -> Result<()> {
        self.conn()?.execute(
            &format!("INSERT INTO runs ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)", RunRow::COLUMNS),
            params![
                run.id,
                run.repo_url,
                run.issue_number,
                run.state.as_str(),
                run.model,
                run.max_iterations,
                ts(&run.created_at),
            ],
        )?;
        Ok(())
    }

    fn get_run(&self, run_id: &str) -> Result<Option<Run>> {
        let sql = format!("SELECT {} FROM runs WHERE id = ?1", RunRow::COLUMNS);
        Ok(self.query_runs(&sql, [run_id])?.into_iter().next())
    }

    fn list_runs(&self) -> Result<Vec<Run>> {
        let sql = format!("SELECT {} FROM runs ORDER BY created_at, rowid", RunRow::COLUMNS);
        self.query_runs(&sql, [])
    }

    fn latest_run_for_issue(&self, repo_url: &str, issue_number: i64) -> Result<Option<Run>> {
        let sql = format!(
            "SELECT {} FROM runs WHERE repo_url = ?1 AND issue_number = ?2 ORDER BY created_at DESC, rowid DESC LIMIT 1",
            RunRow::COLUMNS
        );
        Ok(self.query_runs(&sql, params![repo_url, issue_number])?.into_iter().next())
    }

    fn transition_state(&self, run_id: &str, from: RunState, to: RunState) -> Result<()> {
        from.transition_to(to)?;
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE runs SET state = ?1 WHERE id = ?2 AND state = ?3",
            params![to.as_str(), run_id, from.as_str()],
        )?;
        if changed == 1 {
            return Ok(());
        }
        let current: Option<String> = conn
            .query_row("SELECT state FROM runs WHERE id = ?1", [run_id], |row| row.get(0))
            .optional()?;
        match current {
            None => Err(EngineError::RunNotFound(run_id.to_string())),
            Some(state) => Err(EngineError::Store(format!(
                "run {} is {}, expected {}",
                run_id, state, from
            ))),
        }
    }

    fn list_iterations(&self, run_id: &str) -> Result<Vec<Iteration>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM iterations WHERE run_id = ?1 ORDER BY idx",
            IterationRow::COLUMNS
        ))?;
        let rows = stmt
            .query_map([run_id], IterationRow::read)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(IterationRow::into_iteration).collect()
    }

    fn add_iteration(&self, iteration: NewIteration) -> Result<Iteration> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let max_iterations: u32 = tx
            .query_row(
                "SELECT max_iterations FROM runs WHERE id = ?1",
                [&iteration.run_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| EngineError::RunNotFound(iteration.run_id.clone()))?;
        let count: u32 = tx.query_row(
            "SELECT COUNT(*) FROM iterations WHERE run_id = ?1",
            [&iteration.run_id],
            |row| row.get(0),
        )?;
        if count >= max_iterations {
            return Err(EngineError::Store(format!(
                "run {} already has {} of {} iterations",
                iteration.run_id, count, max_iterations
            )));
        }

        let record = iteration.into_iteration(count + 1);
        tx.execute(
            &format!(
                "INSERT INTO iterations ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                IterationRow::COLUMNS
            ),
            params![
                record.id,
                record.run_id,
                record.index,
                record.plan,
                record.patch_hash,
                record.branch,
                record.pr_url,
                record.ci_summary,
                record.reviewer_verdict,
                ts(&record.created_at),
            ],
        )?;
        tx.commit()?;
        Ok(record)
    }

    fn add_log(&self, event: &EventRecord) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO event_logs (id, run_id, kind, message, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.id,
                event.run_id,
                event.kind,
                event.message,
                serde_json::to_string(&event.payload)?,
                ts(&event.created_at),
            ],
        )?;
        Ok(())
    }

    fn list_logs(&self, run_id: &str) -> Result<Vec<EventRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, run_id, kind, message, payload, created_at FROM event_logs WHERE run_id = ?1 ORDER BY rowid",
        )?;
        let rows = stmt
            .query_map([run_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(id, run_id, kind, message, payload, created_at)| {
                Ok(EventRecord {
                    id,
                    run_id,
                    kind,
                    message,
                    payload: serde_json::from_str(&payload)?,
                    created_at: parse_ts(&created_at)?,
                })
            })
            .collect()
    }

    fn try_lock_issue(&self, lock: &IssueLock) -> Result<bool> {
        let conn = self.conn()?;
        let now = Utc::now();
        if let Some(cutoff) = chrono::Duration::from_std(self.lock_ttl)
            .ok()
            .and_then(|ttl| now.checked_sub_signed(ttl))
        {
            let reclaimed = conn.execute(
                "DELETE FROM issue_locks WHERE repo_url = ?1 AND issue_number = ?2 AND locked_at < ?3",
                params![lock.repo_url, lock.issue_number, ts(&cutoff)],
            )?;
            if reclaimed > 0 {
                log::warn!(
                    "Reclaimed stale lock on {}#{} (older than {:?})",
                    lock.repo_url,
                    lock.issue_number,
                    self.lock_ttl
                );
            }
        }
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO issue_locks (repo_url, issue_number, run_id, token, locked_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![lock.repo_url, lock.issue_number, lock.run_id, lock.token, ts(&now)],
        )?;
        Ok(inserted == 1)
    }

    fn release_issue_lock(&self, lock: &IssueLock) -> Result<()> {
        self.conn()?.execute(
            "DELETE FROM issue_locks WHERE repo_url = ?1 AND issue_number = ?2 AND token = ?3",
            params![lock.repo_url, lock.issue_number, lock.token],
        )?;
        Ok(())
    }
}
