//! State Store (C2): the durable SQLite-backed job queue, agent
//! checkpoints, watermarks, and repository registry.

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::model::{AgentRecord, AgentStatus, EventKind, Phase, PrEvent, Repository};

const MIGRATIONS: &[&str] = &[
    include_str!("../../../migrations/001_repositories.sql"),
    include_str!("../../../migrations/002_agent_executions.sql"),
    include_str!("../../../migrations/003_job_queue.sql"),
    include_str!("../../../migrations/004_agent_state.sql"),
    include_str!("../../../migrations/005_watermarks_and_timeouts.sql"),
];

/// Maximum serialized size of a checkpointed agent state blob: a blob over
/// 1 MiB is rejected, not silently truncated.
pub const MAX_STATE_BLOB_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "reviewbot.db".to_string(),
            max_connections: 10,
        }
    }
}

pub struct Database {
    #[cfg(test)]
    pub(crate) pool: SqlitePool,
    #[cfg(not(test))]
    pool: SqlitePool,
}

/// A claimed job ready for an agent run, deserialized from the queue row.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub queue_id: i64,
    pub event: PrEvent,
    pub attempts: i32,
}

impl Database {
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        Self::with_config(DatabaseConfig {
            path: db_path.as_ref().to_string_lossy().to_string(),
            ..Default::default()
        })
        .await
    }

    pub async fn with_config(config: DatabaseConfig) -> Result<Self> {
        let url = format!("sqlite://{}?mode=rwc", config.path);
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&url)
            .await?;

        sqlx::query("PRAGMA journal_mode=WAL").execute(&pool).await?;
        sqlx::query("PRAGMA foreign_keys=ON").execute(&pool).await?;
        sqlx::query("PRAGMA busy_timeout=5000").execute(&pool).await?;

        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        sqlx::query("PRAGMA foreign_keys=ON").execute(&pool).await?;
        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    async fn run_migrations(&self) -> Result<()> {
        for migration in MIGRATIONS {
            sqlx::query(migration).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn begin(&self) -> Result<sqlx::Transaction<'_, sqlx::Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    // --- Repositories -----------------------------------------------------

    pub async fn register_repository(&self, repo: &Repository) -> Result<Repository> {
        let existing = sqlx::query(
            "SELECT id FROM repositories WHERE organization = ? AND project = ? AND name = ?",
        )
        .bind(&repo.organization)
        .bind(&repo.project)
        .bind(&repo.name)
        .fetch_optional(&self.pool)
        .await?;
        if existing.is_some() {
            return Err(Error::RepositoryAlreadyRegistered(repo.name.clone()));
        }

        let row = sqlx::query(
            "INSERT INTO repositories (organization, project, name, url, hook_id, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(&repo.organization)
        .bind(&repo.project)
        .bind(&repo.name)
        .bind(&repo.url)
        .bind(&repo.hook_id)
        .bind(repo.created_at)
        .bind(repo.updated_at)
        .fetch_one(&self.pool)
        .await?;

        let mut saved = repo.clone();
        saved.id = row.try_get("id")?;
        Ok(saved)
    }

    pub async fn get_repository(&self, id: i64) -> Result<Repository> {
        let row = sqlx::query("SELECT * FROM repositories WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::RepositoryNotFound(id.to_string()))?;
        Ok(row_to_repository(&row))
    }

    pub async fn list_repositories(&self) -> Result<Vec<Repository>> {
        let rows = sqlx::query("SELECT * FROM repositories ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(row_to_repository).collect())
    }

    pub async fn delete_repository(&self, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM repositories WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::RepositoryNotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn set_hook_id(&self, repository_id: i64, hook_id: &str) -> Result<()> {
        sqlx::query("UPDATE repositories SET hook_id = ?, updated_at = ? WHERE id = ?")
            .bind(hook_id)
            .bind(chrono::Utc::now())
            .bind(repository_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- Job queue (C2 enqueue/dequeue/ack) --------------------------------

    /// Enqueues `event`, silently absorbing a duplicate `dedup_key`:
    /// re-delivery of an already-queued event is a no-op.
    pub async fn enqueue(&self, event: &PrEvent) -> Result<()> {
        let payload = serde_json::to_string(event)?;
        let result = sqlx::query(
            "INSERT OR IGNORE INTO job_queue
                (dedup_key, event_kind, pr_id, repository_id, payload, visible_at, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(event.dedup_key())
        .bind(event.event_kind.as_str())
        .bind(event.pr_id)
        .bind(event.repository_id)
        .bind(payload)
        .bind(event.received_at)
        .bind(event.received_at)
        .execute(&self.pool)
        .await?;
        let _ = result.rows_affected();
        Ok(())
    }

    /// Claims the oldest visible, unclaimed job and marks it claimed by
    /// `worker_id`. Returns `None` if the queue is empty.
    pub async fn dequeue(&self, worker_id: &str) -> Result<Option<ClaimedJob>> {
        let mut tx = self.begin().await?;
        let row = sqlx::query(
            "SELECT id, payload, attempts FROM job_queue
             WHERE claimed_by IS NULL AND visible_at <= ?
             ORDER BY visible_at ASC LIMIT 1",
        )
        .bind(chrono::Utc::now())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };

        let queue_id: i64 = row.try_get("id")?;
        let payload: String = row.try_get("payload")?;
        let attempts: i64 = row.try_get("attempts")?;
        let event: PrEvent = serde_json::from_str(&payload)?;

        sqlx::query("UPDATE job_queue SET claimed_by = ?, attempts = attempts + 1 WHERE id = ?")
            .bind(worker_id)
            .bind(queue_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(Some(ClaimedJob {
            queue_id,
            event,
            attempts: attempts as i32 + 1,
        }))
    }

    /// Acknowledges successful processing, removing the job from the queue.
    pub async fn ack(&self, queue_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM job_queue WHERE id = ?")
            .bind(queue_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Releases a claim without deleting the job, making it visible again
    /// after `delay` (used on transient failure retry path).
    pub async fn release(&self, queue_id: i64, delay: Duration) -> Result<()> {
        let visible_at = chrono::Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);
        sqlx::query("UPDATE job_queue SET claimed_by = NULL, visible_at = ? WHERE id = ?")
            .bind(visible_at)
            .bind(queue_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- PR claims (one concurrent agent per PR, invariant 1) --------------

    /// Atomically claims `pr_id` for `agent_id`. Returns `false` if already
    /// claimed, backed by the `pr_claims` primary key and the partial unique
    /// index on `agent_executions`.
    pub async fn claim_pr(&self, pr_id: i64, agent_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO pr_claims (pr_id, agent_id, claimed_at) VALUES (?, ?, ?)",
        )
        .bind(pr_id)
        .bind(agent_id)
        .bind(chrono::Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn release_pr(&self, pr_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM pr_claims WHERE pr_id = ?")
            .bind(pr_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- Agent executions ---------------------------------------------------

    pub async fn start_agent(&self, record: &AgentRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO agent_executions
                (agent_id, pr_id, repository_id, phase, status, started_at, deadline, phase_timings)
             VALUES (?, ?, ?, ?, ?, ?, ?, '{}')",
        )
        .bind(&record.agent_id)
        .bind(record.pr_id)
        .bind(record.repository_id)
        .bind(record.phase.as_str())
        .bind(record.status.as_str())
        .bind(record.started_at)
        .bind(record.deadline)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Error::Other(format!("agent already running for pr {}", record.pr_id))
            }
            other => Error::Database(other),
        })?;
        Ok(())
    }

    pub async fn record_metrics(&self, agent_id: &str, metrics: &crate::model::ExecutionMetrics) -> Result<()> {
        sqlx::query(
            "UPDATE agent_executions SET
                files_analyzed = ?, findings_posted = ?, duplicates_skipped = ?,
                resolutions_marked = ?, api_calls = ?, api_errors = ?
             WHERE agent_id = ?",
        )
        .bind(metrics.files_analyzed)
        .bind(metrics.findings_posted)
        .bind(metrics.duplicates_skipped)
        .bind(metrics.resolutions_marked)
        .bind(metrics.api_calls)
        .bind(metrics.api_errors)
        .bind(agent_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_phase(&self, agent_id: &str, phase: Phase) -> Result<()> {
        sqlx::query("UPDATE agent_executions SET phase = ? WHERE agent_id = ?")
            .bind(phase.as_str())
            .bind(agent_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn finish_agent(
        &self,
        agent_id: &str,
        status: AgentStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        let now = chrono::Utc::now();
        sqlx::query(
            "UPDATE agent_executions
             SET status = ?, phase = ?, ended_at = ?,
                 duration_ms = CAST((julianday(?) - julianday(started_at)) * 86400000 AS INTEGER),
                 error_message = ?
             WHERE agent_id = ?",
        )
        .bind(status.as_str())
        .bind(if status == AgentStatus::Completed { Phase::Done } else { Phase::Error }.as_str())
        .bind(now)
        .bind(now)
        .bind(error_message)
        .bind(agent_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_agent(&self, agent_id: &str) -> Result<AgentRecord> {
        let row = sqlx::query("SELECT * FROM agent_executions WHERE agent_id = ?")
            .bind(agent_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::AgentNotFound(agent_id.to_string()))?;
        row_to_agent_record(&row)
    }

    /// Most recent agent executions, newest first, for the admin surface.
    pub async fn list_agents(&self, limit: i64) -> Result<Vec<AgentRecord>> {
        let rows = sqlx::query("SELECT * FROM agent_executions ORDER BY started_at DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_agent_record).collect()
    }

    pub async fn running_agent_for_pr(&self, pr_id: i64) -> Result<Option<AgentRecord>> {
        let row = sqlx::query(
            "SELECT * FROM agent_executions WHERE pr_id = ? AND status = 'running'",
        )
        .bind(pr_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_agent_record).transpose()
    }

    // --- Agent state blob (checkpoint) -------------------------------------

    pub async fn put_state(&self, agent_id: &str, blob_json: &str, ttl: Duration) -> Result<()> {
        if blob_json.len() > MAX_STATE_BLOB_BYTES {
            return Err(Error::StateBlobTooLarge(blob_json.len()));
        }
        let now = chrono::Utc::now();
        let expires_at = now + chrono::Duration::milliseconds(ttl.as_millis() as i64);
        sqlx::query(
            "INSERT INTO agent_state_blobs (agent_id, blob, updated_at, expires_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(agent_id) DO UPDATE SET blob = excluded.blob, updated_at = excluded.updated_at, expires_at = excluded.expires_at",
        )
        .bind(agent_id)
        .bind(blob_json)
        .bind(now)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_state(&self, agent_id: &str) -> Result<Option<String>> {
        let row = sqlx::query(
            "SELECT blob FROM agent_state_blobs WHERE agent_id = ? AND expires_at > ?",
        )
        .bind(agent_id)
        .bind(chrono::Utc::now())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| r.try_get("blob")).transpose().map_err(Error::from)
    }

    // --- Watermarks ----------------------------------------------------------

    pub async fn set_watermark(&self, repository_id: i64, pr_id: i64, iteration_id: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO iteration_watermarks (repository_id, pr_id, last_reviewed_iteration, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(repository_id, pr_id) DO UPDATE SET
                last_reviewed_iteration = excluded.last_reviewed_iteration,
                updated_at = excluded.updated_at",
        )
        .bind(repository_id)
        .bind(pr_id)
        .bind(iteration_id)
        .bind(chrono::Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_watermark(&self, repository_id: i64, pr_id: i64) -> Result<Option<String>> {
        let row = sqlx::query(
            "SELECT last_reviewed_iteration FROM iteration_watermarks
             WHERE repository_id = ? AND pr_id = ?",
        )
        .bind(repository_id)
        .bind(pr_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| r.try_get("last_reviewed_iteration")).transpose().map_err(Error::from)
    }

    // --- Timeouts --------------------------------------------------------

    pub async fn schedule_timeout(&self, agent_id: &str, deadline: chrono::DateTime<chrono::Utc>) -> Result<()> {
        sqlx::query(
            "INSERT INTO agent_timeouts (agent_id, deadline) VALUES (?, ?)
             ON CONFLICT(agent_id) DO UPDATE SET deadline = excluded.deadline",
        )
        .bind(agent_id)
        .bind(deadline)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn cancel_timeout(&self, agent_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM agent_timeouts WHERE agent_id = ?")
            .bind(agent_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Returns the agent ids whose deadline has passed, for the orchestrator's
    /// timeout sweep.
    pub async fn due_timeouts(&self, now: chrono::DateTime<chrono::Utc>) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT agent_id FROM agent_timeouts WHERE deadline <= ?")
            .bind(now)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|r| r.try_get("agent_id").map_err(Error::from)).collect()
    }

    // --- Observability aggregates (C9) -------------------------------------

    /// Number of unclaimed, visible-or-not jobs waiting in the queue.
    pub async fn queue_depth(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM job_queue WHERE claimed_by IS NULL")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    /// Count of agent executions grouped by status, for the `reviewbot_agents_total` gauge.
    pub async fn count_agents_by_status(&self) -> Result<Vec<(AgentStatus, i64)>> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM agent_executions GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| {
                let status: String = r.try_get("status")?;
                let n: i64 = r.try_get("n")?;
                Ok((parse_status(&status), n))
            })
            .collect()
    }

    /// Sums the per-execution counters across all finished agents, for the
    /// cumulative counters exported alongside the live gauges.
    pub async fn total_execution_metrics(&self) -> Result<crate::model::ExecutionMetrics> {
        let row = sqlx::query(
            "SELECT
                COALESCE(SUM(files_analyzed), 0) AS files_analyzed,
                COALESCE(SUM(findings_posted), 0) AS findings_posted,
                COALESCE(SUM(duplicates_skipped), 0) AS duplicates_skipped,
                COALESCE(SUM(resolutions_marked), 0) AS resolutions_marked,
                COALESCE(SUM(api_calls), 0) AS api_calls,
                COALESCE(SUM(api_errors), 0) AS api_errors
             FROM agent_executions",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(crate::model::ExecutionMetrics {
            files_analyzed: row.try_get("files_analyzed")?,
            findings_posted: row.try_get("findings_posted")?,
            duplicates_skipped: row.try_get("duplicates_skipped")?,
            resolutions_marked: row.try_get("resolutions_marked")?,
            api_calls: row.try_get("api_calls")?,
            api_errors: row.try_get("api_errors")?,
        })
    }

    /// Mean execution duration in seconds across finished agents, for the
    /// `reviewbot_agent_execution_seconds` histogram's sum/count seed.
    pub async fn agent_execution_seconds(&self) -> Result<Vec<f64>> {
        let rows = sqlx::query(
            "SELECT duration_ms FROM agent_executions WHERE duration_ms IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| r.try_get::<i64, _>("duration_ms").map(|ms| ms as f64 / 1000.0).map_err(Error::from))
            .collect()
    }
}

fn row_to_repository(row: &sqlx::sqlite::SqliteRow) -> Repository {
    Repository {
        id: row.try_get("id").unwrap_or_default(),
        organization: row.try_get("organization").unwrap_or_default(),
        project: row.try_get("project").unwrap_or_default(),
        name: row.try_get("name").unwrap_or_default(),
        url: row.try_get("url").unwrap_or_default(),
        hook_id: row.try_get("hook_id").unwrap_or_default(),
        created_at: row.try_get("created_at").unwrap_or_else(|_| chrono::Utc::now()),
        updated_at: row.try_get("updated_at").unwrap_or_else(|_| chrono::Utc::now()),
    }
}

fn row_to_agent_record(row: &sqlx::sqlite::SqliteRow) -> Result<AgentRecord> {
    let phase_str: String = row.try_get("phase")?;
    let status_str: String = row.try_get("status")?;
    Ok(AgentRecord {
        agent_id: row.try_get("agent_id")?,
        pr_id: row.try_get("pr_id")?,
        repository_id: row.try_get("repository_id")?,
        phase: parse_phase(&phase_str),
        started_at: row.try_get("started_at")?,
        deadline: row.try_get("deadline")?,
        ended_at: row.try_get("ended_at")?,
        status: parse_status(&status_str),
    })
}

fn parse_phase(s: &str) -> Phase {
    match s {
        "init" => Phase::Init,
        "fetch_meta" => Phase::FetchMeta,
        "load_watermark" => Phase::LoadWatermark,
        "diff" => Phase::Diff,
        "full_list" => Phase::FullList,
        "parse" => Phase::Parse,
        "line_analysis" => Phase::LineAnalysis,
        "arch_analysis" => Phase::ArchAnalysis,
        "resolution_check" => Phase::ResolutionCheck,
        "publish" => Phase::Publish,
        "done" => Phase::Done,
        _ => Phase::Error,
    }
}

fn parse_status(s: &str) -> AgentStatus {
    match s {
        "completed" => AgentStatus::Completed,
        "failed" => AgentStatus::Failed,
        "timeout" => AgentStatus::Timeout,
        _ => AgentStatus::Running,
    }
}

/// Helper for constructing a [`PrEvent`] from raw webhook fields (used by the
/// ingestor and by tests); kept here so the `EventKind` parsing stays in one
/// place alongside the rest of the store's (de)serialization glue.
pub fn event_kind_from_str(s: &str) -> Option<EventKind> {
    match s {
        "created" => Some(EventKind::Created),
        "updated" => Some(EventKind::Updated),
        _ => None,
    }
}
