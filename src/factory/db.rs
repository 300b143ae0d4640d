use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde_json::Value;

use super::models::*;
use crate::decomposition::{BuildSpec, Decomposition, Workstream, WorkstreamStatus};
use crate::drafts::{APPROVED_EVENT, CopilotDraft, CopilotDraftEvent, DraftKind, DraftStatus};
use crate::router::ExecutionEnvelope;
use crate::runs::{Run, RunEvent, RunEventType, RunStatus};

/// Async-safe handle to the factory database.
///
/// Wraps `FactoryDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<FactoryDb>>,
}

impl DbHandle {
    pub fn new(db: FactoryDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&FactoryDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

/// Error recorded on builds still running when the server went down.
pub const INTERRUPTED_ERROR: &str = "interrupted by server restart";

pub struct FactoryDb {
    conn: Connection,
}

impl FactoryDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS projects (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    github_repo TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS adapters (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL UNIQUE,
                    base_url TEXT NOT NULL,
                    healthy INTEGER,
                    last_error TEXT,
                    last_checked_at TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS work_orders (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    title TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    draft_id INTEGER,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS memory_items (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    title TEXT,
                    content TEXT NOT NULL,
                    draft_id INTEGER,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS builds (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id INTEGER REFERENCES projects(id) ON DELETE SET NULL,
                    spec_text TEXT NOT NULL,
                    tech_stack TEXT NOT NULL DEFAULT '[]',
                    status TEXT NOT NULL DEFAULT 'PENDING',
                    total_waves INTEGER NOT NULL DEFAULT 0,
                    notes TEXT NOT NULL DEFAULT '[]',
                    error TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS workstreams (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    build_id INTEGER NOT NULL REFERENCES builds(id) ON DELETE CASCADE,
                    key TEXT NOT NULL,
                    name TEXT NOT NULL,
                    assigned_agent TEXT NOT NULL,
                    wave INTEGER NOT NULL,
                    position INTEGER NOT NULL,
                    status TEXT NOT NULL DEFAULT 'PENDING',
                    owns_files TEXT NOT NULL DEFAULT '[]',
                    produces_files TEXT NOT NULL DEFAULT '[]',
                    blocked_by TEXT NOT NULL DEFAULT '[]',
                    output TEXT,
                    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                    UNIQUE(build_id, key)
                );

                CREATE TABLE IF NOT EXISTS council_decisions (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    subject TEXT NOT NULL,
                    outcome TEXT NOT NULL,
                    decided_by TEXT NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS copilot_drafts (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    kind TEXT NOT NULL,
                    payload_json TEXT NOT NULL,
                    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    sources_json TEXT NOT NULL DEFAULT '[]',
                    status TEXT NOT NULL DEFAULT 'DRAFT',
                    result_ref TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS copilot_draft_events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    draft_id INTEGER NOT NULL REFERENCES copilot_drafts(id) ON DELETE CASCADE,
                    event_type TEXT NOT NULL,
                    actor_user_id TEXT NOT NULL,
                    details_json TEXT NOT NULL DEFAULT '{}',
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS runs (
                    run_id TEXT PRIMARY KEY,
                    status TEXT NOT NULL,
                    prompt TEXT NOT NULL DEFAULT '',
                    thread_id TEXT NOT NULL,
                    root_span_id TEXT NOT NULL,
                    interrupt_json TEXT,
                    error TEXT,
                    created_at_ms INTEGER NOT NULL,
                    updated_at_ms INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS run_events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id TEXT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
                    ts INTEGER NOT NULL,
                    span_id TEXT NOT NULL,
                    parent_span_id TEXT,
                    event_type TEXT NOT NULL,
                    payload_json TEXT NOT NULL DEFAULT '{}'
                );

                CREATE TABLE IF NOT EXISTS executions (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    build_id INTEGER NOT NULL REFERENCES builds(id) ON DELETE CASCADE,
                    user_id TEXT NOT NULL,
                    state TEXT NOT NULL,
                    envelope_json TEXT NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE INDEX IF NOT EXISTS idx_workstreams_build ON workstreams(build_id);
                CREATE INDEX IF NOT EXISTS idx_council_project ON council_decisions(project_id, outcome);
                CREATE INDEX IF NOT EXISTS idx_drafts_project ON copilot_drafts(project_id);
                CREATE INDEX IF NOT EXISTS idx_draft_events_draft ON copilot_draft_events(draft_id);
                CREATE INDEX IF NOT EXISTS idx_run_events_run ON run_events(run_id);
                CREATE INDEX IF NOT EXISTS idx_executions_build ON executions(build_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Projects ──────────────────────────────────────────────────────

    pub fn create_project(&self, name: &str, github_repo: Option<&str>) -> Result<Project> {
        self.conn
            .execute(
                "INSERT INTO projects (name, github_repo) VALUES (?1, ?2)",
                params![name, github_repo],
            )
            .context("Failed to insert project")?;
        let id = self.conn.last_insert_rowid();
        self.get_project(id)?.context("Project not found after insert")
    }

    pub fn get_project(&self, id: i64) -> Result<Option<Project>> {
        self.conn
            .query_row(
                "SELECT id, name, github_repo, created_at FROM projects WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Project {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        github_repo: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                },
            )
            .optional()
            .context("Failed to query project")
    }

    // ── Adapters ──────────────────────────────────────────────────────

    pub fn create_adapter(&self, name: &str, base_url: &str) -> Result<Adapter> {
        self.conn
            .execute(
                "INSERT INTO adapters (name, base_url) VALUES (?1, ?2)",
                params![name, base_url],
            )
            .context("Failed to insert adapter")?;
        let id = self.conn.last_insert_rowid();
        self.list_adapters()?
            .into_iter()
            .find(|a| a.id == id)
            .context("Adapter not found after insert")
    }

    pub fn list_adapters(&self) -> Result<Vec<Adapter>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, name, base_url, healthy, last_error, last_checked_at, created_at
                 FROM adapters ORDER BY id",
            )
            .context("Failed to prepare list_adapters")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Adapter {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    base_url: row.get(2)?,
                    healthy: row.get(3)?,
                    last_error: row.get(4)?,
                    last_checked_at: row.get(5)?,
                    created_at: row.get(6)?,
                })
            })
            .context("Failed to query adapters")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read adapter row")
    }

    pub fn record_adapter_health(&self, id: i64, healthy: bool, error: Option<&str>) -> Result<()> {
        self.conn
            .execute(
                "UPDATE adapters SET healthy = ?1, last_error = ?2, last_checked_at = datetime('now')
                 WHERE id = ?3",
                params![healthy, error, id],
            )
            .context("Failed to record adapter health")?;
        Ok(())
    }

    // ── Builds & workstreams ──────────────────────────────────────────

    /// Persist a decomposition: one build row plus one row per workstream,
    /// in a single transaction.
    pub fn create_build(
        &self,
        project_id: Option<i64>,
        spec: &BuildSpec,
        decomposition: &Decomposition,
    ) -> Result<BuildRecord> {
        // Safety: DbHandle's Mutex already guarantees single-threaded access.
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        tx.execute(
            "INSERT INTO builds (project_id, spec_text, tech_stack, total_waves, notes)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                project_id,
                spec.text,
                serde_json::to_string(&spec.tech_stack)?,
                decomposition.waves.len() as i64,
                serde_json::to_string(&decomposition.notes)?,
            ],
        )
        .context("Failed to insert build")?;
        let build_id = tx.last_insert_rowid();

        for (position, ws) in decomposition.workstreams().enumerate() {
            tx.execute(
                "INSERT INTO workstreams
                 (build_id, key, name, assigned_agent, wave, position, status, owns_files, produces_files, blocked_by)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    build_id,
                    ws.key,
                    ws.name,
                    ws.assigned_agent,
                    ws.wave,
                    position as i64,
                    ws.status.as_str(),
                    serde_json::to_string(&ws.owns_files)?,
                    serde_json::to_string(&ws.produces_files)?,
                    serde_json::to_string(&ws.blocked_by)?,
                ],
            )
            .with_context(|| format!("Failed to insert workstream '{}'", ws.key))?;
        }

        tx.commit().context("Failed to commit build")?;
        self.get_build(build_id)?
            .context("Build not found after insert")
    }

    pub fn get_build(&self, id: i64) -> Result<Option<BuildRecord>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, project_id, spec_text, tech_stack, status, total_waves, notes, error, created_at, updated_at
                 FROM builds WHERE id = ?1",
                params![id],
                |row| {
                    Ok(BuildRow {
                        id: row.get(0)?,
                        project_id: row.get(1)?,
                        spec_text: row.get(2)?,
                        tech_stack: row.get(3)?,
                        status: row.get(4)?,
                        total_waves: row.get(5)?,
                        notes: row.get(6)?,
                        error: row.get(7)?,
                        created_at: row.get(8)?,
                        updated_at: row.get(9)?,
                    })
                },
            )
            .optional()
            .context("Failed to query build")?;
        row.map(BuildRow::into_build).transpose()
    }

    pub fn get_build_status(&self, id: i64) -> Result<Option<BuildStatus>> {
        let status: Option<String> = self
            .conn
            .query_row(
                "SELECT status FROM builds WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query build status")?;
        status
            .map(|s| BuildStatus::from_str(&s).map_err(|e| anyhow::anyhow!(e)))
            .transpose()
    }

    pub fn update_build_status(&self, id: i64, status: BuildStatus, error: Option<&str>) -> Result<()> {
        self.conn
            .execute(
                "UPDATE builds SET status = ?1, error = ?2, updated_at = datetime('now') WHERE id = ?3",
                params![status.as_str(), error, id],
            )
            .context("Failed to update build status")?;
        Ok(())
    }

    /// Move a build to `RUNNING` unless it already is. Returns `false` when
    /// another execution holds the build.
    pub fn try_start_build(&self, id: i64) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE builds SET status = 'RUNNING', error = NULL, updated_at = datetime('now')
                 WHERE id = ?1 AND status <> 'RUNNING'",
                params![id],
            )
            .context("Failed to start build")?;
        Ok(changed == 1)
    }

    /// Fail every build and workstream left `RUNNING` by a previous process.
    /// Returns the number of builds touched.
    pub fn fail_interrupted_builds(&self) -> Result<usize> {
        let builds = self
            .conn
            .execute(
                "UPDATE builds SET status = 'FAILED', error = ?1, updated_at = datetime('now')
                 WHERE status = 'RUNNING'",
                params![INTERRUPTED_ERROR],
            )
            .context("Failed to fail interrupted builds")?;
        self.conn
            .execute(
                "UPDATE workstreams SET status = 'FAILED', output = COALESCE(output, ?1),
                 updated_at = datetime('now') WHERE status = 'RUNNING'",
                params![INTERRUPTED_ERROR],
            )
            .context("Failed to fail interrupted workstreams")?;
        Ok(builds)
    }

    /// Rebuild the decomposition (with current workstream statuses) of a build.
    pub fn get_build_decomposition(&self, build_id: i64) -> Result<Option<Decomposition>> {
        let Some(build) = self.get_build(build_id)? else {
            return Ok(None);
        };
        let mut stmt = self
            .conn
            .prepare(
                "SELECT key, name, assigned_agent, wave, status, owns_files, produces_files, blocked_by, output
                 FROM workstreams WHERE build_id = ?1 ORDER BY wave, position",
            )
            .context("Failed to prepare get_build_decomposition")?;
        let rows = stmt
            .query_map(params![build_id], |row| {
                Ok(WorkstreamRow {
                    key: row.get(0)?,
                    name: row.get(1)?,
                    assigned_agent: row.get(2)?,
                    wave: row.get(3)?,
                    status: row.get(4)?,
                    owns_files: row.get(5)?,
                    produces_files: row.get(6)?,
                    blocked_by: row.get(7)?,
                    output: row.get(8)?,
                })
            })
            .context("Failed to query workstreams")?;

        let mut workstreams = Vec::new();
        for row in rows {
            let r = row.context("Failed to read workstream row")?;
            workstreams.push(r.into_workstream()?);
        }

        let mut decomposition = Decomposition::from_workstreams(workstreams);
        decomposition.tech_stack = build.tech_stack;
        decomposition.notes = build.notes;
        Ok(Some(decomposition))
    }

    pub fn update_workstream_status(
        &self,
        build_id: i64,
        key: &str,
        status: WorkstreamStatus,
        output: Option<&str>,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE workstreams SET status = ?1, output = COALESCE(?2, output), updated_at = datetime('now')
                 WHERE build_id = ?3 AND key = ?4",
                params![status.as_str(), output, build_id, key],
            )
            .context("Failed to update workstream status")?;
        Ok(())
    }

    // ── Council ───────────────────────────────────────────────────────

    pub fn create_council_decision(
        &self,
        project_id: i64,
        subject: &str,
        outcome: CouncilOutcome,
        decided_by: &str,
    ) -> Result<CouncilDecision> {
        self.conn
            .execute(
                "INSERT INTO council_decisions (project_id, subject, outcome, decided_by)
                 VALUES (?1, ?2, ?3, ?4)",
                params![project_id, subject, outcome.as_str(), decided_by],
            )
            .context("Failed to insert council decision")?;
        let id = self.conn.last_insert_rowid();
        let (created_at,): (String,) = self
            .conn
            .query_row(
                "SELECT created_at FROM council_decisions WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?,)),
            )
            .context("Council decision not found after insert")?;
        Ok(CouncilDecision {
            id,
            project_id,
            subject: subject.to_string(),
            outcome,
            decided_by: decided_by.to_string(),
            created_at,
        })
    }

    /// A qualifying decision is any `APPROVED` decision for the project.
    pub fn has_approved_council_decision(&self, project_id: i64) -> Result<bool> {
        self.conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM council_decisions WHERE project_id = ?1 AND outcome = 'APPROVED'",
                params![project_id],
                |row| row.get(0),
            )
            .context("Failed to query council decisions")
    }

    // ── Work orders & memory items ────────────────────────────────────

    pub fn create_work_order(
        &self,
        project_id: i64,
        title: &str,
        description: &str,
        draft_id: Option<i64>,
    ) -> Result<WorkOrder> {
        self.conn
            .execute(
                "INSERT INTO work_orders (project_id, title, description, draft_id) VALUES (?1, ?2, ?3, ?4)",
                params![project_id, title, description, draft_id],
            )
            .context("Failed to insert work order")?;
        let id = self.conn.last_insert_rowid();
        self.conn
            .query_row(
                "SELECT id, project_id, title, description, draft_id, created_at FROM work_orders WHERE id = ?1",
                params![id],
                |row| {
                    Ok(WorkOrder {
                        id: row.get(0)?,
                        project_id: row.get(1)?,
                        title: row.get(2)?,
                        description: row.get(3)?,
                        draft_id: row.get(4)?,
                        created_at: row.get(5)?,
                    })
                },
            )
            .context("Work order not found after insert")
    }

    pub fn create_memory_item(
        &self,
        project_id: i64,
        title: Option<&str>,
        content: &str,
        draft_id: Option<i64>,
    ) -> Result<MemoryItem> {
        self.conn
            .execute(
                "INSERT INTO memory_items (project_id, title, content, draft_id) VALUES (?1, ?2, ?3, ?4)",
                params![project_id, title, content, draft_id],
            )
            .context("Failed to insert memory item")?;
        let id = self.conn.last_insert_rowid();
        self.conn
            .query_row(
                "SELECT id, project_id, title, content, draft_id, created_at FROM memory_items WHERE id = ?1",
                params![id],
                |row| {
                    Ok(MemoryItem {
                        id: row.get(0)?,
                        project_id: row.get(1)?,
                        title: row.get(2)?,
                        content: row.get(3)?,
                        draft_id: row.get(4)?,
                        created_at: row.get(5)?,
                    })
                },
            )
            .context("Memory item not found after insert")
    }

    // ── Copilot drafts ────────────────────────────────────────────────

    pub fn create_draft(
        &self,
        kind: DraftKind,
        payload: &Value,
        project_id: i64,
        sources: &Value,
    ) -> Result<CopilotDraft> {
        self.conn
            .execute(
                "INSERT INTO copilot_drafts (kind, payload_json, project_id, sources_json) VALUES (?1, ?2, ?3, ?4)",
                params![
                    kind.as_str(),
                    serde_json::to_string(payload)?,
                    project_id,
                    serde_json::to_string(sources)?,
                ],
            )
            .context("Failed to insert draft")?;
        let id = self.conn.last_insert_rowid();
        self.get_draft(id)?.context("Draft not found after insert")
    }

    pub fn get_draft(&self, id: i64) -> Result<Option<CopilotDraft>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, kind, payload_json, project_id, sources_json, status, result_ref, created_at, updated_at
                 FROM copilot_drafts WHERE id = ?1",
                params![id],
                |row| {
                    Ok(DraftRow {
                        id: row.get(0)?,
                        kind: row.get(1)?,
                        payload_json: row.get(2)?,
                        project_id: row.get(3)?,
                        sources_json: row.get(4)?,
                        status: row.get(5)?,
                        result_ref: row.get(6)?,
                        created_at: row.get(7)?,
                        updated_at: row.get(8)?,
                    })
                },
            )
            .optional()
            .context("Failed to query draft")?;
        row.map(DraftRow::into_draft).transpose()
    }

    /// Transition a draft `DRAFT -> APPROVED` and append its audit event as
    /// one storage operation.
    ///
    /// Returns `None` when the draft was no longer `DRAFT` (another approval
    /// won); nothing is written in that case.
    pub fn approve_draft_if_pending(
        &self,
        id: i64,
        result_ref: &str,
        actor_user_id: &str,
        details: &Value,
    ) -> Result<Option<CopilotDraftEvent>> {
        // Safety: DbHandle's Mutex already guarantees single-threaded access.
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        let updated = tx
            .execute(
                "UPDATE copilot_drafts SET status = 'APPROVED', result_ref = ?1, updated_at = datetime('now')
                 WHERE id = ?2 AND status = 'DRAFT'",
                params![result_ref, id],
            )
            .context("Failed to approve draft")?;
        if updated == 0 {
            tx.rollback().context("Failed to roll back draft approval")?;
            return Ok(None);
        }

        tx.execute(
            "INSERT INTO copilot_draft_events (draft_id, event_type, actor_user_id, details_json)
             VALUES (?1, ?2, ?3, ?4)",
            params![id, APPROVED_EVENT, actor_user_id, serde_json::to_string(details)?],
        )
        .context("Failed to insert draft event")?;
        let event_id = tx.last_insert_rowid();
        tx.commit().context("Failed to commit draft approval")?;

        self.list_draft_events(id)?
            .into_iter()
            .find(|e| e.id == event_id)
            .map(Some)
            .context("Draft event not found after insert")
    }

    pub fn list_draft_events(&self, draft_id: i64) -> Result<Vec<CopilotDraftEvent>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, draft_id, event_type, actor_user_id, details_json, created_at
                 FROM copilot_draft_events WHERE draft_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare list_draft_events")?;
        let rows = stmt
            .query_map(params![draft_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .context("Failed to query draft events")?;
        let mut events = Vec::new();
        for row in rows {
            let (id, draft_id, event_type, actor_user_id, details, created_at) =
                row.context("Failed to read draft event row")?;
            events.push(CopilotDraftEvent {
                id,
                draft_id,
                event_type,
                actor_user_id,
                details_json: serde_json::from_str(&details)
                    .context("Invalid draft event details JSON")?,
                created_at,
            });
        }
        Ok(events)
    }

    // ── Runs ──────────────────────────────────────────────────────────

    pub fn create_run(&self, run: &Run) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO runs (run_id, status, prompt, thread_id, root_span_id, interrupt_json, error, created_at_ms, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    run.run_id,
                    run.status.as_str(),
                    run.prompt,
                    run.thread_id,
                    run.root_span_id,
                    run.interrupt.as_ref().map(Value::to_string),
                    run.error,
                    run.created_at_ms,
                    run.updated_at_ms,
                ],
            )
            .context("Failed to insert run")?;
        Ok(())
    }

    pub fn update_run(&self, run: &Run) -> Result<()> {
        self.conn
            .execute(
                "UPDATE runs SET status = ?1, interrupt_json = ?2, error = ?3, updated_at_ms = ?4 WHERE run_id = ?5",
                params![
                    run.status.as_str(),
                    run.interrupt.as_ref().map(Value::to_string),
                    run.error,
                    run.updated_at_ms,
                    run.run_id,
                ],
            )
            .context("Failed to update run")?;
        Ok(())
    }

    pub fn get_run(&self, run_id: &str) -> Result<Option<Run>> {
        let row = self
            .conn
            .query_row(
                "SELECT run_id, status, prompt, thread_id, root_span_id, interrupt_json, error, created_at_ms, updated_at_ms
                 FROM runs WHERE run_id = ?1",
                params![run_id],
                run_row,
            )
            .optional()
            .context("Failed to query run")?;
        row.map(RunRow::into_run).transpose()
    }

    pub fn append_run_event(&self, event: &RunEvent) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO run_events (run_id, ts, span_id, parent_span_id, event_type, payload_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    event.run_id,
                    event.ts,
                    event.span_id,
                    event.parent_span_id,
                    event.event_type.as_str(),
                    event.payload.to_string(),
                ],
            )
            .context("Failed to insert run event")?;
        Ok(())
    }

    pub fn list_run_events(&self, run_id: &str) -> Result<Vec<RunEvent>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT ts, run_id, span_id, parent_span_id, event_type, payload_json
                 FROM run_events WHERE run_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare list_run_events")?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .context("Failed to query run events")?;
        let mut events = Vec::new();
        for row in rows {
            let (ts, run_id, span_id, parent_span_id, event_type, payload) =
                row.context("Failed to read run event row")?;
            events.push(RunEvent {
                ts,
                run_id,
                span_id,
                parent_span_id,
                event_type: RunEventType::from_str(&event_type).map_err(|e| anyhow::anyhow!(e))?,
                payload: serde_json::from_str(&payload).context("Invalid run event payload")?,
            });
        }
        Ok(events)
    }

    // ── Executions ────────────────────────────────────────────────────

    pub fn insert_execution(
        &self,
        build_id: i64,
        envelope: &ExecutionEnvelope,
    ) -> Result<ExecutionRecord> {
        let envelope_json = serde_json::to_value(envelope)?;
        self.conn
            .execute(
                "INSERT INTO executions (build_id, user_id, state, envelope_json) VALUES (?1, ?2, ?3, ?4)",
                params![
                    build_id,
                    envelope.user_id,
                    envelope.state.as_str(),
                    envelope_json.to_string(),
                ],
            )
            .context("Failed to insert execution")?;
        let id = self.conn.last_insert_rowid();
        let created_at: String = self
            .conn
            .query_row(
                "SELECT created_at FROM executions WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .context("Execution not found after insert")?;
        Ok(ExecutionRecord {
            id,
            build_id,
            user_id: envelope.user_id.clone(),
            state: envelope.state.as_str().to_string(),
            envelope: envelope_json,
            created_at,
        })
    }

    pub fn count_executions(&self, build_id: i64) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM executions WHERE build_id = ?1",
                params![build_id],
                |row| row.get(0),
            )
            .context("Failed to count executions")
    }
}

// ── Row types ─────────────────────────────────────────────────────────

struct BuildRow {
    id: i64,
    project_id: Option<i64>,
    spec_text: String,
    tech_stack: String,
    status: String,
    total_waves: i64,
    notes: String,
    error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl BuildRow {
    fn into_build(self) -> Result<BuildRecord> {
        Ok(BuildRecord {
            id: self.id,
            project_id: self.project_id,
            spec_text: self.spec_text,
            tech_stack: serde_json::from_str(&self.tech_stack).context("Invalid tech_stack JSON")?,
            status: BuildStatus::from_str(&self.status).map_err(|e| anyhow::anyhow!(e))?,
            total_waves: self.total_waves,
            notes: serde_json::from_str(&self.notes).context("Invalid notes JSON")?,
            error: self.error,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

struct WorkstreamRow {
    key: String,
    name: String,
    assigned_agent: String,
    wave: u32,
    status: String,
    owns_files: String,
    produces_files: String,
    blocked_by: String,
    output: Option<String>,
}

impl WorkstreamRow {
    fn into_workstream(self) -> Result<Workstream> {
        let mut ws = Workstream::new(&self.key, &self.name, &self.assigned_agent).with_wave(self.wave);
        ws.status = WorkstreamStatus::from_str(&self.status).map_err(|e| anyhow::anyhow!(e))?;
        ws.owns_files = serde_json::from_str(&self.owns_files).context("Invalid owns_files JSON")?;
        ws.produces_files =
            serde_json::from_str(&self.produces_files).context("Invalid produces_files JSON")?;
        ws.blocked_by = serde_json::from_str(&self.blocked_by).context("Invalid blocked_by JSON")?;
        ws.output = self.output;
        Ok(ws)
    }
}

struct DraftRow {
    id: i64,
    kind: String,
    payload_json: String,
    project_id: i64,
    sources_json: String,
    status: String,
    result_ref: Option<String>,
    created_at: String,
    updated_at: String,
}

impl DraftRow {
    fn into_draft(self) -> Result<CopilotDraft> {
        Ok(CopilotDraft {
            id: self.id,
            kind: DraftKind::from_str(&self.kind).map_err(|e| anyhow::anyhow!(e))?,
            payload_json: serde_json::from_str(&self.payload_json)
                .context("Invalid draft payload JSON")?,
            project_id: self.project_id,
            sources_json: serde_json::from_str(&self.sources_json)
                .context("Invalid draft sources JSON")?,
            status: DraftStatus::from_str(&self.status).map_err(|e| anyhow::anyhow!(e))?,
            result_ref: self.result_ref,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

struct RunRow {
    run_id: String,
    status: String,
    prompt: String,
    thread_id: String,
    root_span_id: String,
    interrupt_json: Option<String>,
    error: Option<String>,
    created_at_ms: i64,
    updated_at_ms: i64,
}

fn run_row(row: &Row<'_>) -> rusqlite::Result<RunRow> {
    Ok(RunRow {
        run_id: row.get(0)?,
        status: row.get(1)?,
        prompt: row.get(2)?,
        thread_id: row.get(3)?,
        root_span_id: row.get(4)?,
        interrupt_json: row.get(5)?,
        error: row.get(6)?,
        created_at_ms: row.get(7)?,
        updated_at_ms: row.get(8)?,
    })
}

impl RunRow {
    fn into_run(self) -> Result<Run> {
        Ok(Run {
            run_id: self.run_id,
            status: RunStatus::from_str(&self.status).map_err(|e| anyhow::anyhow!(e))?,
            prompt: self.prompt,
            thread_id: self.thread_id,
            root_span_id: self.root_span_id,
            interrupt: self
                .interrupt_json
                .map(|s| serde_json::from_str(&s))
                .transpose()
                .context("Invalid run interrupt JSON")?,
            error: self.error,
            created_at_ms: self.created_at_ms,
            updated_at_ms: self.updated_at_ms,
        })
    }
}
