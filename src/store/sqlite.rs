//! SQLite-backed repository
//!
//! Tasks, approvals, runs and steps are tables; the task→approval and
//! run→step relationships are foreign keys. Timestamps are stored as unix
//! milliseconds so ordering is numeric.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use super::{RepoResult, TaskRepository, MAX_LIST_LIMIT};
use crate::config::StoreConfig;
use crate::error::RepositoryError;
use crate::models::{
    ApprovalRecord, ApprovalStatus, NewTask, RunRecord, StepRecord, TaskGuard, TaskPatch,
    TaskRecord, TaskStatus,
};

const TASK_COLUMNS: &str = "id, status, task_type, priority, requester, conversation_id, \
    trace_id, payload_hash, reason, retries, next_attempt_epoch, created_at_ms, updated_at_ms, \
    specialty, claimed_by, claimed_at_ms, no_overlap_contract_hash, requested_paths, awaiting_scope";

const APPROVAL_COLUMNS: &str =
    "id, task_id, status, policy_id, scope, requested_at_ms, resolved_at_ms";

fn dt_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn ms_to_dt(ms: i64) -> RepoResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| RepositoryError::Corrupt(format!("Invalid timestamp: {}", ms)))
}

/// `UPDATE tasks SET ... WHERE id = ?` for a patch; callers may append more
/// `AND` conditions.
fn task_update(id: &str, patch: TaskPatch) -> QueryBuilder<'_, Sqlite> {
    let updated_at = patch.updated_at.unwrap_or_else(Utc::now);

    let mut qb = QueryBuilder::<Sqlite>::new("UPDATE tasks SET updated_at_ms = ");
    qb.push_bind(dt_to_ms(updated_at));
    if let Some(status) = patch.status {
        qb.push(", status = ").push_bind(status.as_str());
    }
    if let Some(reason) = patch.reason {
        qb.push(", reason = ").push_bind(reason);
    }
    if let Some(retries) = patch.retries {
        qb.push(", retries = ").push_bind(retries as i64);
    }
    if let Some(epoch) = patch.next_attempt_epoch {
        qb.push(", next_attempt_epoch = ").push_bind(epoch);
    }
    if let Some(claimed_by) = patch.claimed_by {
        qb.push(", claimed_by = ").push_bind(claimed_by);
    }
    if let Some(claimed_at) = patch.claimed_at {
        qb.push(", claimed_at_ms = ").push_bind(claimed_at.map(dt_to_ms));
    }
    if let Some(scope) = patch.awaiting_scope {
        qb.push(", awaiting_scope = ").push_bind(scope);
    }
    qb.push(" WHERE id = ").push_bind(id);
    qb
}

#[derive(Clone)]
pub struct SqliteTaskRepository {
    pool: SqlitePool,
}

impl SqliteTaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open a pool from configuration
    pub async fn connect(config: &StoreConfig) -> RepoResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> RepoResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| RepositoryError::Unavailable(format!("migration failed: {}", e)))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
    async fn create_task(&self, task: NewTask) -> RepoResult<TaskRecord> {
        let record = task.into_record();
        let paths = serde_json::to_string(&record.requested_paths)
            .map_err(|e| RepositoryError::Corrupt(format!("Invalid paths: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO tasks (id, status, task_type, priority, priority_rank, requester,
                conversation_id, trace_id, payload_hash, reason, retries, next_attempt_epoch,
                created_at_ms, updated_at_ms, specialty, claimed_by, claimed_at_ms,
                no_overlap_contract_hash, requested_paths, awaiting_scope)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, NULL, ?, ?, ?, NULL, NULL, ?, ?, NULL)
            "#,
        )
        .bind(&record.id)
        .bind(record.status.as_str())
        .bind(&record.task_type)
        .bind(record.priority.as_str())
        .bind(record.priority.rank())
        .bind(&record.requester)
        .bind(&record.conversation_id)
        .bind(&record.trace_id)
        .bind(&record.payload_hash)
        .bind(&record.reason)
        .bind(dt_to_ms(record.created_at))
        .bind(dt_to_ms(record.updated_at))
        .bind(&record.specialty)
        .bind(&record.no_overlap_contract_hash)
        .bind(paths)
        .execute(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_tasks_for_worker(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        specialty: Option<&str>,
    ) -> RepoResult<Vec<TaskRecord>> {
        let limit = limit.min(MAX_LIST_LIMIT) as i64;
        let sql = format!(
            r#"
            SELECT {TASK_COLUMNS}
            FROM tasks
            WHERE ((status = 'queued' AND (claimed_by IS NULL OR claimed_by = ''))
                   OR status = 'waiting_approval')
              AND (next_attempt_epoch IS NULL OR next_attempt_epoch <= ?)
              AND (? IS NULL OR specialty = ?)
            ORDER BY priority_rank DESC, created_at_ms ASC, id ASC
            LIMIT ?
            "#
        );
        let rows = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(now.timestamp())
            .bind(specialty)
            .bind(specialty)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }

    async fn list_tasks(&self, status: Option<TaskStatus>) -> RepoResult<Vec<TaskRecord>> {
        let sql = format!(
            r#"
            SELECT {TASK_COLUMNS}
            FROM tasks
            WHERE (? IS NULL OR status = ?)
            ORDER BY created_at_ms ASC, id ASC
            "#
        );
        let status = status.map(|s| s.as_str());
        let rows = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(status)
            .bind(status)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }

    async fn get_task(&self, id: &str) -> RepoResult<Option<TaskRecord>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?");
        let row = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| r.try_into()).transpose()
    }

    async fn patch_task(&self, id: &str, patch: TaskPatch) -> RepoResult<TaskRecord> {
        let mut qb = task_update(id, patch);
        let result = qb.build().execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("task {}", id)));
        }

        self.get_task(id)
            .await?
            .ok_or_else(|| RepositoryError::NotFound(format!("task {}", id)))
    }

    async fn patch_task_if(
        &self,
        id: &str,
        guard: &TaskGuard,
        patch: TaskPatch,
    ) -> RepoResult<Option<TaskRecord>> {
        let mut qb = task_update(id, patch);
        if let Some(status) = guard.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        match &guard.claimed_by {
            Some(Some(worker_id)) => {
                qb.push(" AND claimed_by = ").push_bind(worker_id.clone());
            }
            Some(None) => {
                qb.push(" AND (claimed_by IS NULL OR claimed_by = '')");
            }
            None => {}
        }

        // One conditional write; the guard lives in the WHERE clause.
        let result = qb.build().execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_task(id).await
    }

    async fn try_claim_task(&self, task_id: &str, worker_id: &str) -> RepoResult<bool> {
        let now = dt_to_ms(Utc::now());

        // Single conditional write; the WHERE clause is the whole precondition.
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET claimed_by = ?, claimed_at_ms = ?, updated_at_ms = ?
            WHERE id = ?
              AND status = 'queued'
              AND (claimed_by IS NULL OR claimed_by = '')
            "#,
        )
        .bind(worker_id)
        .bind(now)
        .bind(now)
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_latest_approval_for_task(
        &self,
        task_id: &str,
        scope: &str,
    ) -> RepoResult<Option<ApprovalRecord>> {
        let sql = format!(
            r#"
            SELECT {APPROVAL_COLUMNS}
            FROM approvals
            WHERE task_id = ? AND scope = ?
            ORDER BY requested_at_ms DESC, rowid DESC
            LIMIT 1
            "#
        );
        let row = sqlx::query_as::<_, ApprovalRow>(&sql)
            .bind(task_id)
            .bind(scope)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| r.try_into()).transpose()
    }

    async fn request_approval(
        &self,
        task_id: &str,
        scope: &str,
        policy_id: &str,
    ) -> RepoResult<ApprovalRecord> {
        let approval = ApprovalRecord::pending(task_id, scope, policy_id);

        sqlx::query(
            r#"
            INSERT INTO approvals (id, task_id, status, policy_id, scope, requested_at_ms, resolved_at_ms)
            VALUES (?, ?, ?, ?, ?, ?, NULL)
            "#,
        )
        .bind(&approval.id)
        .bind(&approval.task_id)
        .bind(approval.status.as_str())
        .bind(&approval.policy_id)
        .bind(&approval.scope)
        .bind(dt_to_ms(approval.requested_at))
        .execute(&self.pool)
        .await?;

        Ok(approval)
    }

    async fn resolve_approval(
        &self,
        approval_id: &str,
        status: ApprovalStatus,
    ) -> RepoResult<ApprovalRecord> {
        let sql = format!("SELECT {APPROVAL_COLUMNS} FROM approvals WHERE id = ?");
        let mut approval: ApprovalRecord = sqlx::query_as::<_, ApprovalRow>(&sql)
            .bind(approval_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| RepositoryError::NotFound(format!("approval {}", approval_id)))?
            .try_into()?;

        approval
            .resolve(status)
            .map_err(RepositoryError::InvalidTransition)?;

        // Conditional on still being pending so concurrent deciders cannot both win
        let result = sqlx::query(
            r#"
            UPDATE approvals SET status = ?, resolved_at_ms = ?
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(approval.status.as_str())
        .bind(approval.resolved_at.map(dt_to_ms))
        .bind(approval_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::InvalidTransition(format!(
                "approval {} was resolved concurrently",
                approval_id
            )));
        }

        Ok(approval)
    }

    async fn upsert_run(&self, run: &RunRecord) -> RepoResult<()> {
        sqlx::query(
            r#"
            INSERT INTO runs (id, task_id, task_type, conversation_id, trace_id, specialty, status)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET status = excluded.status
            "#,
        )
        .bind(&run.id)
        .bind(&run.task_id)
        .bind(&run.task_type)
        .bind(&run.conversation_id)
        .bind(&run.trace_id)
        .bind(&run.specialty)
        .bind(run.status.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_run(&self, id: &str) -> RepoResult<Option<RunRecord>> {
        let row = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT id, task_id, task_type, conversation_id, trace_id, specialty, status
            FROM runs
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.try_into()).transpose()
    }

    async fn upsert_step(&self, step: &StepRecord) -> RepoResult<()> {
        sqlx::query(
            r#"
            INSERT INTO steps (id, run_id, name, tool, step_order, status)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET status = excluded.status
            "#,
        )
        .bind(&step.id)
        .bind(&step.run_id)
        .bind(&step.name)
        .bind(&step.tool)
        .bind(step.order as i64)
        .bind(step.status.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_step(&self, id: &str) -> RepoResult<Option<StepRecord>> {
        let row = sqlx::query_as::<_, StepRow>(
            r#"
            SELECT id, run_id, name, tool, step_order, status
            FROM steps
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.try_into()).transpose()
    }

    async fn list_steps(&self, run_id: &str) -> RepoResult<Vec<StepRecord>> {
        let rows = sqlx::query_as::<_, StepRow>(
            r#"
            SELECT id, run_id, name, tool, step_order, status
            FROM steps
            WHERE run_id = ?
            ORDER BY step_order ASC
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }
}

// Internal row types for sqlx

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: String,
    status: String,
    task_type: String,
    priority: String,
    requester: String,
    conversation_id: String,
    trace_id: String,
    payload_hash: String,
    reason: Option<String>,
    retries: i64,
    next_attempt_epoch: Option<i64>,
    created_at_ms: i64,
    updated_at_ms: i64,
    specialty: Option<String>,
    claimed_by: Option<String>,
    claimed_at_ms: Option<i64>,
    no_overlap_contract_hash: Option<String>,
    requested_paths: String,
    awaiting_scope: Option<String>,
}

impl TryFrom<TaskRow> for TaskRecord {
    type Error = RepositoryError;

    fn try_from(row: TaskRow) -> RepoResult<Self> {
        let requested_paths: Vec<String> = serde_json::from_str(&row.requested_paths)
            .map_err(|e| RepositoryError::Corrupt(format!("Invalid requested_paths: {}", e)))?;

        Ok(TaskRecord {
            status: row
                .status
                .parse()
                .map_err(|e| RepositoryError::Corrupt(format!("Invalid status: {}", e)))?,
            priority: row
                .priority
                .parse()
                .map_err(|e| RepositoryError::Corrupt(format!("Invalid priority: {}", e)))?,
            retries: u32::try_from(row.retries)
                .map_err(|e| RepositoryError::Corrupt(format!("Invalid retries: {}", e)))?,
            created_at: ms_to_dt(row.created_at_ms)?,
            updated_at: ms_to_dt(row.updated_at_ms)?,
            claimed_at: row.claimed_at_ms.map(ms_to_dt).transpose()?,
            id: row.id,
            task_type: row.task_type,
            requester: row.requester,
            conversation_id: row.conversation_id,
            trace_id: row.trace_id,
            payload_hash: row.payload_hash,
            reason: row.reason,
            next_attempt_epoch: row.next_attempt_epoch,
            specialty: row.specialty,
            claimed_by: row.claimed_by,
            no_overlap_contract_hash: row.no_overlap_contract_hash,
            requested_paths,
            awaiting_scope: row.awaiting_scope,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ApprovalRow {
    id: String,
    task_id: String,
    status: String,
    policy_id: String,
    scope: String,
    requested_at_ms: i64,
    resolved_at_ms: Option<i64>,
}

impl TryFrom<ApprovalRow> for ApprovalRecord {
    type Error = RepositoryError;

    fn try_from(row: ApprovalRow) -> RepoResult<Self> {
        Ok(ApprovalRecord {
            status: row
                .status
                .parse()
                .map_err(|e| RepositoryError::Corrupt(format!("Invalid approval status: {}", e)))?,
            requested_at: ms_to_dt(row.requested_at_ms)?,
            resolved_at: row.resolved_at_ms.map(ms_to_dt).transpose()?,
            id: row.id,
            task_id: row.task_id,
            policy_id: row.policy_id,
            scope: row.scope,
        })
    }
}

#[derive(sqlx::FromRow)]
struct RunRow {
    id: String,
    task_id: String,
    task_type: String,
    conversation_id: String,
    trace_id: String,
    specialty: Option<String>,
    status: String,
}

impl TryFrom<RunRow> for RunRecord {
    type Error = RepositoryError;

    fn try_from(row: RunRow) -> RepoResult<Self> {
        Ok(RunRecord {
            status: row
                .status
                .parse()
                .map_err(|e| RepositoryError::Corrupt(format!("Invalid run status: {}", e)))?,
            id: row.id,
            task_id: row.task_id,
            task_type: row.task_type,
            conversation_id: row.conversation_id,
            trace_id: row.trace_id,
            specialty: row.specialty,
        })
    }
}

#[derive(sqlx::FromRow)]
struct StepRow {
    id: String,
    run_id: String,
    name: String,
    tool: Option<String>,
    step_order: i64,
    status: String,
}

impl TryFrom<StepRow> for StepRecord {
    type Error = RepositoryError;

    fn try_from(row: StepRow) -> RepoResult<Self> {
        Ok(StepRecord {
            status: row
                .status
                .parse()
                .map_err(|e| RepositoryError::Corrupt(format!("Invalid step status: {}", e)))?,
            order: u32::try_from(row.step_order)
                .map_err(|e| RepositoryError::Corrupt(format!("Invalid step order: {}", e)))?,
            id: row.id,
            run_id: row.run_id,
            name: row.name,
            tool: row.tool,
        })
    }
}
