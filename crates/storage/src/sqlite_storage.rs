//! SQLite storage backend for Portline.
//!
//! The database file is shared by every coordinating process. It is opened in
//! WAL mode with a busy timeout so concurrent writers queue on SQLite's file
//! lock instead of failing, and every exclusive operation is one statement.

use async_trait::async_trait;
use chrono::SecondsFormat;
use portline_core::{
    DependencyEdge, Escalation, EscalationId, EscalationStatus, FeedbackLoop, LoopId, LoopStatus,
    Pipeline, PipelineMember, PipelineStatus, RelayMessage, ResourceLock, Time, UnitStatus,
    WorkUnit,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use super::trait_::{LockAttempt, Result, Storage, StorageError};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS work_units (
        id TEXT PRIMARY KEY,
        group_order INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS pipelines (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        status TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS pipeline_units (
        pipeline_id TEXT NOT NULL,
        unit_id TEXT NOT NULL,
        group_order INTEGER NOT NULL,
        status TEXT NOT NULL,
        added_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (pipeline_id, unit_id)
    )",
    "CREATE TABLE IF NOT EXISTS dependencies (
        unit_id TEXT NOT NULL,
        depends_on TEXT NOT NULL,
        created_at TEXT NOT NULL,
        UNIQUE (unit_id, depends_on)
    )",
    "CREATE TABLE IF NOT EXISTS resource_locks (
        resource TEXT PRIMARY KEY,
        holder TEXT NOT NULL,
        acquired_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_resource_locks_holder ON resource_locks(holder)",
    "CREATE TABLE IF NOT EXISTS feedback_loops (
        id TEXT PRIMARY KEY,
        channel_id TEXT NOT NULL,
        implementer TEXT NOT NULL,
        verifier TEXT NOT NULL,
        unit_id TEXT,
        max_retries INTEGER NOT NULL,
        current_retry INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL,
        created_at TEXT NOT NULL,
        last_feedback_at TEXT,
        completed_at TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_feedback_loops_channel ON feedback_loops(channel_id)",
    "CREATE INDEX IF NOT EXISTS idx_feedback_loops_unit ON feedback_loops(unit_id, status)",
    "CREATE TABLE IF NOT EXISTS escalations (
        id TEXT PRIMARY KEY,
        origin TEXT,
        unit_id TEXT,
        kind TEXT NOT NULL,
        severity TEXT NOT NULL,
        issue TEXT NOT NULL,
        suggestion TEXT NOT NULL,
        status TEXT NOT NULL,
        created_at TEXT NOT NULL,
        resolved_at TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_escalations_status ON escalations(status)",
    "CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        channel_id TEXT NOT NULL,
        sender TEXT NOT NULL,
        recipient TEXT NOT NULL,
        payload TEXT NOT NULL,
        sent_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_messages_channel ON messages(channel_id)",
];

const UNIT_COLUMNS: &str = "id, group_order, status, created_at, updated_at";
const PIPELINE_COLUMNS: &str = "id, name, status, created_at, updated_at";
const MEMBER_COLUMNS: &str = "pipeline_id, unit_id, group_order, status, added_at, updated_at";
const LOCK_COLUMNS: &str = "resource, holder, acquired_at";
const LOOP_COLUMNS: &str = "id, channel_id, implementer, verifier, unit_id, max_retries, \
     current_retry, status, created_at, last_feedback_at, completed_at";
const ESCALATION_COLUMNS: &str =
    "id, origin, unit_id, kind, severity, issue, suggestion, status, created_at, resolved_at";

/// SQLite storage implementation.
#[derive(Clone)]
pub struct SqliteStorage {
    /// Database connection pool
    pool: sqlx::SqlitePool,
}

impl SqliteStorage {
    /// Open (creating if needed) the database file at `path`.
    ///
    /// Several handles, in one process or many, may open the same file.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| StorageError::Database(sqlx::Error::Io(e)))?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let storage = Self { pool };
        storage.init_schema().await?;
        debug!("Opened coordination database at {}", path.display());

        Ok(storage)
    }

    /// Create an in-memory SQLite storage for testing.
    ///
    /// The pool holds a single connection that never expires, since each
    /// in-memory connection is its own database.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let storage = Self { pool };
        storage.init_schema().await?;

        Ok(storage)
    }

    /// Initialize the database schema.
    async fn init_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

fn fmt_time(t: &Time) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(raw: &str) -> Result<Time> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&chrono::Utc))
        .map_err(|e| StorageError::Corrupt(format!("bad timestamp '{}': {}", raw, e)))
}

fn parse_opt_time(raw: Option<String>) -> Result<Option<Time>> {
    raw.as_deref().map(parse_time).transpose()
}

fn parse_field<T>(raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>()
        .map_err(|e| StorageError::Corrupt(e.to_string()))
}

fn count_to_u32(value: i64, column: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| StorageError::Corrupt(format!("{} out of range: {}", column, value)))
}

fn unit_from_row(row: &SqliteRow) -> Result<WorkUnit> {
    Ok(WorkUnit {
        id: row.try_get("id")?,
        group_order: row.try_get("group_order")?,
        status: parse_field(&row.try_get::<String, _>("status")?)?,
        created_at: parse_time(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_time(&row.try_get::<String, _>("updated_at")?)?,
    })
}

fn pipeline_from_row(row: &SqliteRow) -> Result<Pipeline> {
    Ok(Pipeline {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        status: parse_field(&row.try_get::<String, _>("status")?)?,
        created_at: parse_time(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_time(&row.try_get::<String, _>("updated_at")?)?,
    })
}

fn member_from_row(row: &SqliteRow) -> Result<PipelineMember> {
    Ok(PipelineMember {
        pipeline_id: row.try_get("pipeline_id")?,
        unit_id: row.try_get("unit_id")?,
        group_order: row.try_get("group_order")?,
        status: parse_field(&row.try_get::<String, _>("status")?)?,
        added_at: parse_time(&row.try_get::<String, _>("added_at")?)?,
        updated_at: parse_time(&row.try_get::<String, _>("updated_at")?)?,
    })
}

fn lock_from_row(row: &SqliteRow) -> Result<ResourceLock> {
    Ok(ResourceLock {
        resource: row.try_get("resource")?,
        holder: row.try_get("holder")?,
        acquired_at: parse_time(&row.try_get::<String, _>("acquired_at")?)?,
    })
}

fn loop_from_row(row: &SqliteRow) -> Result<FeedbackLoop> {
    Ok(FeedbackLoop {
        id: parse_field(&row.try_get::<String, _>("id")?)?,
        channel_id: row.try_get("channel_id")?,
        implementer: row.try_get("implementer")?,
        verifier: row.try_get("verifier")?,
        unit_id: row.try_get("unit_id")?,
        max_retries: count_to_u32(row.try_get("max_retries")?, "max_retries")?,
        current_retry: count_to_u32(row.try_get("current_retry")?, "current_retry")?,
        status: parse_field(&row.try_get::<String, _>("status")?)?,
        created_at: parse_time(&row.try_get::<String, _>("created_at")?)?,
        last_feedback_at: parse_opt_time(row.try_get("last_feedback_at")?)?,
        completed_at: parse_opt_time(row.try_get("completed_at")?)?,
    })
}

fn escalation_from_row(row: &SqliteRow) -> Result<Escalation> {
    Ok(Escalation {
        id: parse_field(&row.try_get::<String, _>("id")?)?,
        origin: row.try_get("origin")?,
        unit_id: row.try_get("unit_id")?,
        kind: row.try_get::<String, _>("kind")?.into(),
        severity: parse_field(&row.try_get::<String, _>("severity")?)?,
        issue: row.try_get("issue")?,
        suggestion: row.try_get("suggestion")?,
        status: parse_field(&row.try_get::<String, _>("status")?)?,
        created_at: parse_time(&row.try_get::<String, _>("created_at")?)?,
        resolved_at: parse_opt_time(row.try_get("resolved_at")?)?,
    })
}

fn message_from_row(row: &SqliteRow) -> Result<RelayMessage> {
    Ok(RelayMessage {
        channel_id: row.try_get("channel_id")?,
        from: row.try_get("sender")?,
        to: row.try_get("recipient")?,
        payload: serde_json::from_str(&row.try_get::<String, _>("payload")?)?,
        sent_at: parse_time(&row.try_get::<String, _>("sent_at")?)?,
    })
}

#[async_trait]
impl Storage for SqliteStorage {
    // === Work unit operations ===

    async fn load_unit(&self, id: &str) -> Result<Option<WorkUnit>> {
        let sql = format!("SELECT {UNIT_COLUMNS} FROM work_units WHERE id = ?");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(unit_from_row).transpose()
    }

    async fn list_units(&self) -> Result<Vec<WorkUnit>> {
        let sql = format!("SELECT {UNIT_COLUMNS} FROM work_units ORDER BY group_order, id");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(unit_from_row).collect()
    }

    async fn set_unit_status(&self, id: &str, status: UnitStatus) -> Result<()> {
        let result = sqlx::query("UPDATE work_units SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(fmt_time(&chrono::Utc::now()))
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("unit {}", id)));
        }
        Ok(())
    }

    // === Pipeline operations ===

    async fn create_pipeline(&self, pipeline: &Pipeline) -> Result<()> {
        let result = sqlx::query(
            "INSERT INTO pipelines (id, name, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING",
        )
        .bind(&pipeline.id)
        .bind(&pipeline.name)
        .bind(pipeline.status.as_str())
        .bind(fmt_time(&pipeline.created_at))
        .bind(fmt_time(&pipeline.updated_at))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::Conflict(format!(
                "pipeline {} already exists",
                pipeline.id
            )));
        }
        Ok(())
    }

    async fn load_pipeline(&self, id: &str) -> Result<Option<Pipeline>> {
        let sql = format!("SELECT {PIPELINE_COLUMNS} FROM pipelines WHERE id = ?");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(pipeline_from_row).transpose()
    }

    async fn list_pipelines(&self) -> Result<Vec<Pipeline>> {
        let sql = format!("SELECT {PIPELINE_COLUMNS} FROM pipelines ORDER BY created_at, rowid");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(pipeline_from_row).collect()
    }

    async fn delete_pipeline(&self, id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM pipeline_units WHERE pipeline_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM pipelines WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_pipeline_status(&self, id: &str, status: PipelineStatus) -> Result<()> {
        let result = sqlx::query("UPDATE pipelines SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(fmt_time(&chrono::Utc::now()))
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("pipeline {}", id)));
        }
        Ok(())
    }

    async fn update_derived_status(&self, id: &str, status: PipelineStatus) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE pipelines SET status = ?, updated_at = ?
            WHERE id = ? AND status NOT IN ('cancelled', ?)",
        )
        .bind(status.as_str())
        .bind(fmt_time(&chrono::Utc::now()))
        .bind(id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    // === Membership operations ===

    async fn add_member(&self, member: &PipelineMember) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO work_units (id, group_order, status, created_at, updated_at)
            VALUES (?, ?, 'pending', ?, ?)
            ON CONFLICT(id) DO NOTHING",
        )
        .bind(&member.unit_id)
        .bind(member.group_order)
        .bind(fmt_time(&member.added_at))
        .bind(fmt_time(&member.added_at))
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query(
            "INSERT INTO pipeline_units
                (pipeline_id, unit_id, group_order, status, added_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(pipeline_id, unit_id) DO NOTHING",
        )
        .bind(&member.pipeline_id)
        .bind(&member.unit_id)
        .bind(member.group_order)
        .bind(member.status.as_str())
        .bind(fmt_time(&member.added_at))
        .bind(fmt_time(&member.updated_at))
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(StorageError::Conflict(format!(
                "unit {} is already in pipeline {}",
                member.unit_id, member.pipeline_id
            )));
        }

        tx.commit().await?;
        Ok(())
    }

    async fn remove_member(&self, pipeline_id: &str, unit_id: &str) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM pipeline_units WHERE pipeline_id = ? AND unit_id = ?")
                .bind(pipeline_id)
                .bind(unit_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn load_member(
        &self,
        pipeline_id: &str,
        unit_id: &str,
    ) -> Result<Option<PipelineMember>> {
        let sql = format!(
            "SELECT {MEMBER_COLUMNS} FROM pipeline_units WHERE pipeline_id = ? AND unit_id = ?"
        );
        let row = sqlx::query(&sql)
            .bind(pipeline_id)
            .bind(unit_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(member_from_row).transpose()
    }

    async fn list_members(&self, pipeline_id: &str) -> Result<Vec<PipelineMember>> {
        let sql = format!(
            "SELECT {MEMBER_COLUMNS} FROM pipeline_units WHERE pipeline_id = ?
            ORDER BY group_order, unit_id"
        );
        let rows = sqlx::query(&sql)
            .bind(pipeline_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(member_from_row).collect()
    }

    async fn transition_member(
        &self,
        pipeline_id: &str,
        unit_id: &str,
        from: &[UnitStatus],
        to: UnitStatus,
    ) -> Result<Option<PipelineMember>> {
        if from.is_empty() {
            return Ok(None);
        }

        let placeholders = vec!["?"; from.len()].join(", ");
        let sql = format!(
            "UPDATE pipeline_units SET status = ?, updated_at = ?
            WHERE pipeline_id = ? AND unit_id = ? AND status IN ({placeholders})
            RETURNING {MEMBER_COLUMNS}"
        );

        let mut query = sqlx::query(&sql)
            .bind(to.as_str())
            .bind(fmt_time(&chrono::Utc::now()))
            .bind(pipeline_id)
            .bind(unit_id);
        for status in from {
            query = query.bind(status.as_str());
        }

        let row = query.fetch_optional(&self.pool).await?;
        row.as_ref().map(member_from_row).transpose()
    }

    // === Dependency operations ===

    async fn add_dependency(&self, edge: &DependencyEdge) -> Result<()> {
        if edge.unit_id == edge.depends_on {
            return Err(StorageError::Validation(format!(
                "unit {} cannot depend on itself",
                edge.unit_id
            )));
        }

        // The insert only happens when `unit_id` is not reachable from
        // `depends_on`, so the cycle check and the write are one statement.
        let result = sqlx::query(
            "INSERT INTO dependencies (unit_id, depends_on, created_at)
            SELECT ?1, ?2, ?3
            WHERE NOT EXISTS (
                WITH RECURSIVE reach(id) AS (
                    SELECT ?2
                    UNION
                    SELECT d.depends_on FROM dependencies d JOIN reach r ON d.unit_id = r.id
                )
                SELECT 1 FROM reach WHERE id = ?1
            )
            ON CONFLICT(unit_id, depends_on) DO NOTHING",
        )
        .bind(&edge.unit_id)
        .bind(&edge.depends_on)
        .bind(fmt_time(&chrono::Utc::now()))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(());
        }

        let existing = sqlx::query("SELECT 1 FROM dependencies WHERE unit_id = ? AND depends_on = ?")
            .bind(&edge.unit_id)
            .bind(&edge.depends_on)
            .fetch_optional(&self.pool)
            .await?;

        if existing.is_some() {
            Ok(())
        } else {
            Err(StorageError::Validation(format!(
                "dependency {} -> {} would create a cycle",
                edge.unit_id, edge.depends_on
            )))
        }
    }

    async fn remove_dependency(&self, edge: &DependencyEdge) -> Result<bool> {
        let result = sqlx::query("DELETE FROM dependencies WHERE unit_id = ? AND depends_on = ?")
            .bind(&edge.unit_id)
            .bind(&edge.depends_on)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn dependencies_of(&self, unit_id: &str) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT depends_on FROM dependencies WHERE unit_id = ? ORDER BY rowid")
            .bind(unit_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("depends_on").map_err(Into::into))
            .collect()
    }

    // === Lock operations ===

    async fn try_insert_lock(&self, lock: &ResourceLock) -> Result<LockAttempt> {
        let result = sqlx::query(
            "INSERT INTO resource_locks (resource, holder, acquired_at)
            VALUES (?, ?, ?)
            ON CONFLICT(resource) DO NOTHING",
        )
        .bind(&lock.resource)
        .bind(&lock.holder)
        .bind(fmt_time(&lock.acquired_at))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(LockAttempt::Acquired(lock.clone()));
        }

        match self.load_lock(&lock.resource).await? {
            Some(existing) => Ok(LockAttempt::Held(existing)),
            None => Ok(LockAttempt::Contended),
        }
    }

    async fn load_lock(&self, resource: &str) -> Result<Option<ResourceLock>> {
        let sql = format!("SELECT {LOCK_COLUMNS} FROM resource_locks WHERE resource = ?");
        let row = sqlx::query(&sql)
            .bind(resource)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(lock_from_row).transpose()
    }

    async fn delete_lock(&self, resource: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM resource_locks WHERE resource = ?")
            .bind(resource)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_lock_held_by(
        &self,
        resource: &str,
        holder: &str,
    ) -> Result<Option<ResourceLock>> {
        let sql = format!(
            "DELETE FROM resource_locks WHERE resource = ? AND holder = ? RETURNING {LOCK_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(resource)
            .bind(holder)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(lock_from_row).transpose()
    }

    async fn list_locks(&self) -> Result<Vec<ResourceLock>> {
        let sql = format!("SELECT {LOCK_COLUMNS} FROM resource_locks ORDER BY resource");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(lock_from_row).collect()
    }

    async fn delete_locks_by_holder(&self, holder: &str) -> Result<Vec<ResourceLock>> {
        let sql = format!("DELETE FROM resource_locks WHERE holder = ? RETURNING {LOCK_COLUMNS}");
        let rows = sqlx::query(&sql).bind(holder).fetch_all(&self.pool).await?;
        let mut locks = rows.iter().map(lock_from_row).collect::<Result<Vec<_>>>()?;
        locks.sort_by(|a, b| a.resource.cmp(&b.resource));
        Ok(locks)
    }

    async fn clear_locks(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM resource_locks")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // === Feedback loop operations ===

    async fn insert_feedback_loop(&self, feedback_loop: &FeedbackLoop) -> Result<()> {
        sqlx::query(
            "INSERT INTO feedback_loops
                (id, channel_id, implementer, verifier, unit_id, max_retries, current_retry,
                 status, created_at, last_feedback_at, completed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(feedback_loop.id.to_string())
        .bind(&feedback_loop.channel_id)
        .bind(&feedback_loop.implementer)
        .bind(&feedback_loop.verifier)
        .bind(&feedback_loop.unit_id)
        .bind(i64::from(feedback_loop.max_retries))
        .bind(i64::from(feedback_loop.current_retry))
        .bind(feedback_loop.status.as_str())
        .bind(fmt_time(&feedback_loop.created_at))
        .bind(feedback_loop.last_feedback_at.as_ref().map(fmt_time))
        .bind(feedback_loop.completed_at.as_ref().map(fmt_time))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_feedback_loop(&self, id: LoopId) -> Result<Option<FeedbackLoop>> {
        let sql = format!("SELECT {LOOP_COLUMNS} FROM feedback_loops WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(loop_from_row).transpose()
    }

    async fn load_loop_by_channel(&self, channel_id: &str) -> Result<Option<FeedbackLoop>> {
        let sql = format!(
            "SELECT {LOOP_COLUMNS} FROM feedback_loops WHERE channel_id = ?
            ORDER BY created_at DESC, rowid DESC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(channel_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(loop_from_row).transpose()
    }

    async fn load_active_loop_for_unit(&self, unit_id: &str) -> Result<Option<FeedbackLoop>> {
        let sql = format!(
            "SELECT {LOOP_COLUMNS} FROM feedback_loops WHERE unit_id = ? AND status = 'running'
            ORDER BY created_at DESC, rowid DESC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(unit_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(loop_from_row).transpose()
    }

    async fn list_feedback_loops(&self, status: Option<LoopStatus>) -> Result<Vec<FeedbackLoop>> {
        let rows = match status {
            Some(status) => {
                let sql = format!(
                    "SELECT {LOOP_COLUMNS} FROM feedback_loops WHERE status = ?
                    ORDER BY created_at, rowid"
                );
                sqlx::query(&sql)
                    .bind(status.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let sql = format!("SELECT {LOOP_COLUMNS} FROM feedback_loops ORDER BY created_at, rowid");
                sqlx::query(&sql).fetch_all(&self.pool).await?
            }
        };
        rows.iter().map(loop_from_row).collect()
    }

    async fn record_loop_failure(&self, id: LoopId, at: Time) -> Result<Option<FeedbackLoop>> {
        // SQLite evaluates every SET expression against the pre-update row.
        let sql = format!(
            "UPDATE feedback_loops SET
                current_retry = current_retry + 1,
                last_feedback_at = ?1,
                status = CASE WHEN current_retry + 1 >= max_retries
                    THEN 'escalated' ELSE 'running' END,
                completed_at = CASE WHEN current_retry + 1 >= max_retries
                    THEN ?1 ELSE completed_at END
            WHERE id = ?2 AND status = 'running'
            RETURNING {LOOP_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(fmt_time(&at))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(loop_from_row).transpose()
    }

    async fn close_feedback_loop(
        &self,
        id: LoopId,
        status: LoopStatus,
        at: Time,
    ) -> Result<Option<FeedbackLoop>> {
        if !status.is_terminal() {
            return Err(StorageError::Validation(format!(
                "cannot close loop {} as {}",
                id, status
            )));
        }

        let sql = format!(
            "UPDATE feedback_loops SET status = ?, completed_at = ?
            WHERE id = ? AND status = 'running'
            RETURNING {LOOP_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(status.as_str())
            .bind(fmt_time(&at))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(loop_from_row).transpose()
    }

    // === Escalation operations ===

    async fn insert_escalation(&self, escalation: &Escalation) -> Result<()> {
        sqlx::query(
            "INSERT INTO escalations
                (id, origin, unit_id, kind, severity, issue, suggestion, status,
                 created_at, resolved_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(escalation.id.to_string())
        .bind(&escalation.origin)
        .bind(&escalation.unit_id)
        .bind(escalation.kind.as_str())
        .bind(escalation.severity.as_str())
        .bind(&escalation.issue)
        .bind(&escalation.suggestion)
        .bind(escalation.status.as_str())
        .bind(fmt_time(&escalation.created_at))
        .bind(escalation.resolved_at.as_ref().map(fmt_time))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_escalation(&self, id: EscalationId) -> Result<Option<Escalation>> {
        let sql = format!("SELECT {ESCALATION_COLUMNS} FROM escalations WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(escalation_from_row).transpose()
    }

    async fn list_escalations(&self, status: Option<EscalationStatus>) -> Result<Vec<Escalation>> {
        let rows = match status {
            Some(status) => {
                let sql = format!(
                    "SELECT {ESCALATION_COLUMNS} FROM escalations WHERE status = ?
                    ORDER BY created_at DESC, rowid DESC"
                );
                sqlx::query(&sql)
                    .bind(status.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let sql = format!(
                    "SELECT {ESCALATION_COLUMNS} FROM escalations ORDER BY created_at DESC, rowid DESC"
                );
                sqlx::query(&sql).fetch_all(&self.pool).await?
            }
        };
        rows.iter().map(escalation_from_row).collect()
    }

    async fn close_escalation(
        &self,
        id: EscalationId,
        status: EscalationStatus,
        at: Time,
    ) -> Result<Option<Escalation>> {
        if status == EscalationStatus::Open {
            return Err(StorageError::Validation(format!(
                "escalation {} cannot be reopened",
                id
            )));
        }

        let sql = format!(
            "UPDATE escalations SET status = ?, resolved_at = ?
            WHERE id = ? AND status = 'open'
            RETURNING {ESCALATION_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(status.as_str())
            .bind(fmt_time(&at))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(escalation_from_row).transpose()
    }

    // === Message operations ===

    async fn append_message(&self, message: &RelayMessage) -> Result<()> {
        sqlx::query(
            "INSERT INTO messages (channel_id, sender, recipient, payload, sent_at)
            VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&message.channel_id)
        .bind(&message.from)
        .bind(&message.to)
        .bind(serde_json::to_string(&message.payload)?)
        .bind(fmt_time(&message.sent_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_messages(&self, channel_id: &str) -> Result<Vec<RelayMessage>> {
        let rows = sqlx::query(
            "SELECT channel_id, sender, recipient, payload, sent_at FROM messages
            WHERE channel_id = ? ORDER BY id",
        )
        .bind(channel_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn create_test_member(pipeline: &str, unit: &str, group_order: i64) -> PipelineMember {
        PipelineMember {
            pipeline_id: pipeline.to_string(),
            unit_id: unit.to_string(),
            group_order,
            status: UnitStatus::Pending,
            added_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn create_test_pipeline(id: &str) -> Pipeline {
        Pipeline {
            id: id.to_string(),
            name: format!("Pipeline {}", id),
            status: PipelineStatus::Pending,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn create_test_loop(max_retries: u32) -> FeedbackLoop {
        FeedbackLoop {
            id: LoopId::new(),
            channel_id: "channel-1".to_string(),
            implementer: "impl".to_string(),
            verifier: "verifier".to_string(),
            unit_id: Some("unit-a".to_string()),
            max_retries,
            current_retry: 0,
            status: LoopStatus::Running,
            created_at: Utc::now(),
            last_feedback_at: None,
            completed_at: None,
        }
    }

    fn lock(resource: &str, holder: &str) -> ResourceLock {
        ResourceLock {
            resource: resource.to_string(),
            holder: holder.to_string(),
            acquired_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_pipeline_operations() {
        let storage = SqliteStorage::in_memory().await.unwrap();

        storage.create_pipeline(&create_test_pipeline("p1")).await.unwrap();
        let loaded = storage.load_pipeline("p1").await.unwrap().unwrap();
        assert_eq!(loaded.name, "Pipeline p1");

        let dup = storage.create_pipeline(&create_test_pipeline("p1")).await;
        assert!(matches!(dup, Err(StorageError::Conflict(_))));

        storage.add_member(&create_test_member("p1", "a", 1)).await.unwrap();
        assert!(storage.load_unit("a").await.unwrap().is_some());

        assert!(storage.delete_pipeline("p1").await.unwrap());
        assert!(storage.list_members("p1").await.unwrap().is_empty());
        assert!(!storage.delete_pipeline("p1").await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_member_conflicts() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        storage.create_pipeline(&create_test_pipeline("p1")).await.unwrap();
        storage.add_member(&create_test_member("p1", "a", 1)).await.unwrap();

        let result = storage.add_member(&create_test_member("p1", "a", 2)).await;
        assert!(matches!(result, Err(StorageError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_members_ordered_by_wave() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        storage.create_pipeline(&create_test_pipeline("p1")).await.unwrap();
        storage.add_member(&create_test_member("p1", "z", 2)).await.unwrap();
        storage.add_member(&create_test_member("p1", "y", 2)).await.unwrap();
        storage.add_member(&create_test_member("p1", "x", 1)).await.unwrap();

        let ids: Vec<_> = storage
            .list_members("p1")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.unit_id)
            .collect();
        assert_eq!(ids, vec!["x", "y", "z"]);
    }

    #[tokio::test]
    async fn test_transition_member_is_conditional() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        storage.create_pipeline(&create_test_pipeline("p1")).await.unwrap();
        storage.add_member(&create_test_member("p1", "a", 1)).await.unwrap();

        let claimed = storage
            .transition_member("p1", "a", &[UnitStatus::Pending], UnitStatus::Running)
            .await
            .unwrap();
        assert_eq!(claimed.unwrap().status, UnitStatus::Running);

        let again = storage
            .transition_member("p1", "a", &[UnitStatus::Pending], UnitStatus::Running)
            .await
            .unwrap();
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn test_dependency_cycles_rejected() {
        let storage = SqliteStorage::in_memory().await.unwrap();

        storage.add_dependency(&DependencyEdge::new("b", "a")).await.unwrap();
        storage.add_dependency(&DependencyEdge::new("c", "b")).await.unwrap();
        // Duplicate is a no-op
        storage.add_dependency(&DependencyEdge::new("c", "b")).await.unwrap();

        let cycle = storage.add_dependency(&DependencyEdge::new("a", "c")).await;
        assert!(matches!(cycle, Err(StorageError::Validation(_))));

        let self_edge = storage.add_dependency(&DependencyEdge::new("a", "a")).await;
        assert!(matches!(self_edge, Err(StorageError::Validation(_))));

        assert_eq!(storage.dependencies_of("c").await.unwrap(), vec!["b".to_string()]);
        assert!(storage.dependencies_of("a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dependencies_keep_insertion_order() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        for dep in ["m", "b", "x"] {
            storage.add_dependency(&DependencyEdge::new("u", dep)).await.unwrap();
        }
        assert_eq!(storage.dependencies_of("u").await.unwrap(), vec!["m", "b", "x"]);
    }

    #[tokio::test]
    async fn test_lock_insert_conflict() {
        let storage = SqliteStorage::in_memory().await.unwrap();

        let first = storage.try_insert_lock(&lock("moduleA", "s1")).await.unwrap();
        assert!(matches!(first, LockAttempt::Acquired(_)));

        let second = storage.try_insert_lock(&lock("moduleA", "s2")).await.unwrap();
        match second {
            LockAttempt::Held(existing) => assert_eq!(existing.holder, "s1"),
            other => panic!("expected Held, got {:?}", other),
        }

        assert!(storage.delete_lock("moduleA").await.unwrap());
        assert!(!storage.delete_lock("moduleA").await.unwrap());
    }

    #[tokio::test]
    async fn test_conditional_delete_spares_new_holder() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        storage.try_insert_lock(&lock("moduleA", "gone")).await.unwrap();

        // The resource changes hands before the stale holder's row is removed
        storage.delete_lock("moduleA").await.unwrap();
        storage.try_insert_lock(&lock("moduleA", "s2")).await.unwrap();

        let removed = storage.delete_lock_held_by("moduleA", "gone").await.unwrap();
        assert!(removed.is_none());
        assert_eq!(storage.load_lock("moduleA").await.unwrap().unwrap().holder, "s2");

        let removed = storage.delete_lock_held_by("moduleA", "s2").await.unwrap();
        assert_eq!(removed.unwrap().holder, "s2");
        assert!(storage.load_lock("moduleA").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_derived_status_never_replaces_cancelled() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        storage.create_pipeline(&create_test_pipeline("p1")).await.unwrap();

        assert!(storage.update_derived_status("p1", PipelineStatus::Running).await.unwrap());
        assert!(!storage.update_derived_status("p1", PipelineStatus::Running).await.unwrap());

        storage.set_pipeline_status("p1", PipelineStatus::Cancelled).await.unwrap();
        assert!(!storage.update_derived_status("p1", PipelineStatus::Complete).await.unwrap());
        let stored = storage.load_pipeline("p1").await.unwrap().unwrap();
        assert_eq!(stored.status, PipelineStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_delete_locks_by_holder() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        storage.try_insert_lock(&lock("b", "s1")).await.unwrap();
        storage.try_insert_lock(&lock("a", "s1")).await.unwrap();
        storage.try_insert_lock(&lock("c", "s2")).await.unwrap();

        let released = storage.delete_locks_by_holder("s1").await.unwrap();
        let names: Vec<_> = released.iter().map(|l| l.resource.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);

        let remaining = storage.list_locks().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].holder, "s2");
        assert_eq!(storage.clear_locks().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_two_handles_share_one_lock_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.db");
        let first = SqliteStorage::open(&path).await.unwrap();
        let second = SqliteStorage::open(&path).await.unwrap();

        let a = first.try_insert_lock(&lock("moduleA", "s1")).await.unwrap();
        let b = second.try_insert_lock(&lock("moduleA", "s2")).await.unwrap();

        assert!(matches!(a, LockAttempt::Acquired(_)));
        assert!(matches!(b, LockAttempt::Held(ref l) if l.holder == "s1"));
    }

    #[tokio::test]
    async fn test_record_loop_failure_escalates_at_bound() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let feedback_loop = create_test_loop(2);
        storage.insert_feedback_loop(&feedback_loop).await.unwrap();

        let first = storage
            .record_loop_failure(feedback_loop.id, Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.current_retry, 1);
        assert_eq!(first.status, LoopStatus::Running);
        assert!(first.last_feedback_at.is_some());
        assert!(first.completed_at.is_none());

        let second = storage
            .record_loop_failure(feedback_loop.id, Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.current_retry, 2);
        assert_eq!(second.status, LoopStatus::Escalated);
        assert!(second.completed_at.is_some());

        let third = storage
            .record_loop_failure(feedback_loop.id, Utc::now())
            .await
            .unwrap();
        assert!(third.is_none());

        let stored = storage.load_feedback_loop(feedback_loop.id).await.unwrap().unwrap();
        assert_eq!(stored.current_retry, 2);
    }

    #[tokio::test]
    async fn test_loop_lookups() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let feedback_loop = create_test_loop(3);
        storage.insert_feedback_loop(&feedback_loop).await.unwrap();

        let by_channel = storage.load_loop_by_channel("channel-1").await.unwrap().unwrap();
        assert_eq!(by_channel.id, feedback_loop.id);

        let by_unit = storage.load_active_loop_for_unit("unit-a").await.unwrap().unwrap();
        assert_eq!(by_unit.id, feedback_loop.id);

        storage
            .close_feedback_loop(feedback_loop.id, LoopStatus::Success, Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert!(storage.load_active_loop_for_unit("unit-a").await.unwrap().is_none());
        assert!(storage
            .close_feedback_loop(feedback_loop.id, LoopStatus::Failed, Utc::now())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_escalation_closes_once() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let escalation = Escalation::open(portline_core::NewEscalation {
            origin: Some("s1".to_string()),
            unit_id: None,
            kind: portline_core::EscalationKind::Blocked,
            severity: portline_core::Severity::Medium,
            issue: "stuck".to_string(),
            suggestion: "look".to_string(),
            auto_resolve: false,
        });
        storage.insert_escalation(&escalation).await.unwrap();

        let resolved = storage
            .close_escalation(escalation.id, EscalationStatus::Resolved, Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resolved.status, EscalationStatus::Resolved);
        assert!(resolved.resolved_at.is_some());

        let again = storage
            .close_escalation(escalation.id, EscalationStatus::Dismissed, Utc::now())
            .await
            .unwrap();
        assert!(again.is_none());

        let open = storage.list_escalations(Some(EscalationStatus::Open)).await.unwrap();
        assert!(open.is_empty());
    }

    #[tokio::test]
    async fn test_messages_roundtrip() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let message = RelayMessage {
            channel_id: "ch".to_string(),
            from: "verifier".to_string(),
            to: "impl".to_string(),
            payload: serde_json::json!({"failed": 2}),
            sent_at: Utc::now(),
        };
        storage.append_message(&message).await.unwrap();

        let messages = storage.list_messages("ch").await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].payload["failed"], 2);
        assert!(storage.list_messages("other").await.unwrap().is_empty());
    }
}
