use aimatch_core::{Error, ReprocessPolicy, Result, StatusCounts, Task, TaskId, TaskStatus};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// SQLite-backed local task queue.
///
/// Cloning the store clones the handle, not the database: every clone shares
/// the same connection, and each operation holds the lock only for its own
/// duration.
#[derive(Clone)]
pub struct QueueStore {
    inner: Arc<Mutex<Connection>>,
    db_path: Option<PathBuf>,
}

impl QueueStore {
    /// Open (or create) the queue database at the given path.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::Storage(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(db_path)
            .map_err(|e| Error::Storage(format!("Failed to open queue db: {}", e)))?;

        // Enable WAL mode so CLI readers don't block the running loop
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();

        let store = Self {
            inner: Arc::new(Mutex::new(conn)),
            db_path: Some(db_path.to_path_buf()),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Volatile store, used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Storage(format!("Failed to open in-memory db: {}", e)))?;
        let store = Self {
            inner: Arc::new(Mutex::new(conn)),
            db_path: None,
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.inner
            .lock()
            .map_err(|e| Error::Storage(format!("Lock error: {}", e)))
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.lock()?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS ai_queue (
                id INTEGER PRIMARY KEY,
                url TEXT NOT NULL,
                client_url TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'PENDING'
            );
            ",
        )
        .map_err(|e| Error::Storage(format!("Failed to init queue schema: {}", e)))?;

        migrate_columns(&conn)?;

        conn.execute_batch("CREATE INDEX IF NOT EXISTS idx_queue_status ON ai_queue(status);")
            .map_err(|e| Error::Storage(format!("Failed to create status index: {}", e)))?;

        debug!("Queue store schema initialized");
        Ok(())
    }

    /// Insert a task as `PENDING` unless its id is already known.
    /// Returns whether a row was inserted; existing rows are never touched.
    pub fn insert_if_absent(&self, id: TaskId, competitor_url: &str, client_url: &str) -> Result<bool> {
        let conn = self.lock()?;
        let now = Utc::now().to_rfc3339();
        let affected = conn
            .execute(
                "INSERT OR IGNORE INTO ai_queue (id, url, client_url, status, attempts, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 0, ?5)",
                params![id.0, competitor_url, client_url, TaskStatus::Pending.as_str(), now],
            )
            .map_err(|e| Error::Storage(format!("Insert error: {}", e)))?;
        Ok(affected > 0)
    }

    pub fn get(&self, id: TaskId) -> Result<Option<Task>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, url, client_url, status, attempts, last_error, updated_at
             FROM ai_queue WHERE id = ?1",
            params![id.0],
            task_from_row,
        )
        .optional()
        .map_err(|e| Error::Storage(format!("Get error: {}", e)))
    }

    /// Tasks the next sweep should process, in id order.
    pub fn sweep_candidates(&self, policy: ReprocessPolicy) -> Result<Vec<Task>> {
        let mut tasks = Vec::new();
        for status in policy.statuses() {
            tasks.extend(self.list_by_status(*status)?);
        }
        tasks.sort_by_key(|t| t.id);
        Ok(tasks)
    }

    pub fn list_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        self.query_tasks(
            "SELECT id, url, client_url, status, attempts, last_error, updated_at
             FROM ai_queue WHERE status = ?1 ORDER BY id",
            Some(status.as_str()),
        )
    }

    pub fn list_all(&self) -> Result<Vec<Task>> {
        self.query_tasks(
            "SELECT id, url, client_url, status, attempts, last_error, updated_at
             FROM ai_queue ORDER BY id",
            None,
        )
    }

    /// Every task that carries a verdict (everything except `PENDING`).
    pub fn resolved(&self) -> Result<Vec<Task>> {
        self.query_tasks(
            "SELECT id, url, client_url, status, attempts, last_error, updated_at
             FROM ai_queue WHERE status != ?1 ORDER BY id",
            Some(TaskStatus::Pending.as_str()),
        )
    }

    fn query_tasks(&self, sql: &str, status: Option<&str>) -> Result<Vec<Task>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| Error::Storage(format!("Prepare error: {}", e)))?;
        let rows = match status {
            Some(s) => stmt.query_map(params![s], task_from_row),
            None => stmt.query_map([], task_from_row),
        }
        .map_err(|e| Error::Storage(format!("Query error: {}", e)))?;

        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::Storage(format!("Row error: {}", e)))
    }

    /// Record that a protocol run is starting for the task.
    pub fn mark_attempt(&self, id: TaskId) -> Result<()> {
        let conn = self.lock()?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE ai_queue SET attempts = attempts + 1, updated_at = ?1 WHERE id = ?2",
            params![now, id.0],
        )
        .map_err(|e| Error::Storage(format!("Update error: {}", e)))?;
        Ok(())
    }

    /// Commit a terminal status. Clears any recorded failure.
    pub fn set_status(&self, id: TaskId, status: TaskStatus) -> Result<()> {
        let conn = self.lock()?;
        let now = Utc::now().to_rfc3339();
        let affected = conn
            .execute(
                "UPDATE ai_queue SET status = ?1, last_error = NULL, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), now, id.0],
            )
            .map_err(|e| Error::Storage(format!("Update error: {}", e)))?;
        if affected == 0 {
            return Err(Error::NotFound(format!("task {}", id)));
        }
        debug!(task_id = %id, status = %status, "Queue status updated");
        Ok(())
    }

    /// Remember why the last attempt failed. The status is left unchanged.
    pub fn record_failure(&self, id: TaskId, error: &str) -> Result<()> {
        let conn = self.lock()?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE ai_queue SET last_error = ?1, updated_at = ?2 WHERE id = ?3",
            params![error, now, id.0],
        )
        .map_err(|e| Error::Storage(format!("Update error: {}", e)))?;
        Ok(())
    }

    /// Put a task back to `PENDING` so the next sweep picks it up.
    pub fn requeue(&self, id: TaskId) -> Result<bool> {
        let conn = self.lock()?;
        let now = Utc::now().to_rfc3339();
        let affected = conn
            .execute(
                "UPDATE ai_queue SET status = ?1, last_error = NULL, updated_at = ?2 WHERE id = ?3",
                params![TaskStatus::Pending.as_str(), now, id.0],
            )
            .map_err(|e| Error::Storage(format!("Requeue error: {}", e)))?;
        if affected > 0 {
            info!(task_id = %id, "Task requeued");
        }
        Ok(affected > 0)
    }

    pub fn counts(&self) -> Result<StatusCounts> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM ai_queue GROUP BY status")
            .map_err(|e| Error::Storage(format!("Prepare error: {}", e)))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(|e| Error::Storage(format!("Query error: {}", e)))?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let (status, n) = row.map_err(|e| Error::Storage(format!("Row error: {}", e)))?;
            counts.add(parse_status(&status), n.max(0) as usize);
        }
        Ok(counts)
    }
}

/// Bring a queue file written by older builds up to the current columns.
fn migrate_columns(conn: &Connection) -> Result<()> {
    let mut stmt = conn
        .prepare("PRAGMA table_info(ai_queue)")
        .map_err(|e| Error::Storage(format!("Schema inspect error: {}", e)))?;
    let columns: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>("name"))
        .map_err(|e| Error::Storage(format!("Schema inspect error: {}", e)))?
        .collect::<rusqlite::Result<_>>()
        .map_err(|e| Error::Storage(format!("Schema inspect error: {}", e)))?;

    let has = |name: &str| columns.iter().any(|c| c == name);
    let mut statements = Vec::new();

    if has("tracking") && !has("status") {
        info!("Migrating legacy ai_queue.tracking column to status");
        statements.push("ALTER TABLE ai_queue RENAME COLUMN tracking TO status".to_string());
        statements.push("UPDATE ai_queue SET status = 'PENDING' WHERE status = 'PROCESSING'".to_string());
        statements.push("UPDATE ai_queue SET status = 'IGNORED' WHERE status = 'IGNORE'".to_string());
    }
    if !has("attempts") {
        statements.push("ALTER TABLE ai_queue ADD COLUMN attempts INTEGER NOT NULL DEFAULT 0".to_string());
    }
    if !has("last_error") {
        statements.push("ALTER TABLE ai_queue ADD COLUMN last_error TEXT".to_string());
    }
    if !has("updated_at") {
        statements.push("ALTER TABLE ai_queue ADD COLUMN updated_at TEXT".to_string());
    }

    for sql in statements {
        conn.execute_batch(&sql)
            .map_err(|e| Error::Storage(format!("Migration error ({}): {}", sql, e)))?;
    }
    Ok(())
}

fn parse_status(raw: &str) -> TaskStatus {
    TaskStatus::from_str(raw).unwrap_or_else(|| {
        warn!(status = %raw, "Unknown queue status, treating as UNRESOLVED");
        TaskStatus::Unresolved
    })
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    let status: String = row.get("status")?;
    let attempts: i64 = row.get("attempts")?;
    Ok(Task {
        id: TaskId(row.get("id")?),
        competitor_url: row.get("url")?,
        client_url: row.get("client_url")?,
        status: parse_status(&status),
        attempts: attempts.max(0) as u32,
        last_error: row.get("last_error")?,
        updated_at: row.get("updated_at")?,
    })
}
