//! Task/approval repository
//!
//! The repository is the only shared mutable resource between workers. All
//! reads are advisory; [`TaskRepository::try_claim_task`] is the
//! mutual-exclusion primitive and must be one conditional write. Every later
//! transition goes through [`TaskRepository::patch_task_if`] so a worker
//! acting on a stale read cannot overwrite another worker's progress.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::RepositoryError;
use crate::models::{
    ApprovalRecord, ApprovalStatus, NewTask, RunRecord, StepRecord, TaskGuard, TaskPatch,
    TaskRecord, TaskStatus,
};

pub use memory::MemoryTaskRepository;
pub use sqlite::SqliteTaskRepository;

/// Hard ceiling on one eligibility listing, whatever the caller asks for
pub const MAX_LIST_LIMIT: usize = 100;

pub type RepoResult<T> = std::result::Result<T, RepositoryError>;

#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn create_task(&self, task: NewTask) -> RepoResult<TaskRecord>;

    /// Tasks a worker may act on at `now`: queued and unclaimed, or waiting for
    /// approval; not scheduled in the future; optionally of one specialty.
    /// Ordered by priority (highest first) then creation time (oldest first),
    /// capped at `min(limit, MAX_LIST_LIMIT)`.
    async fn list_tasks_for_worker(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        specialty: Option<&str>,
    ) -> RepoResult<Vec<TaskRecord>>;

    /// All tasks, optionally filtered by status, oldest first
    async fn list_tasks(&self, status: Option<TaskStatus>) -> RepoResult<Vec<TaskRecord>>;

    async fn get_task(&self, id: &str) -> RepoResult<Option<TaskRecord>>;

    /// Merge `patch` into the task and return the result.
    async fn patch_task(&self, id: &str, patch: TaskPatch) -> RepoResult<TaskRecord>;

    /// Merge `patch` only if the task still satisfies `guard`, as one
    /// conditional write. Returns `None` when the guard fails or the task is
    /// missing.
    async fn patch_task_if(
        &self,
        id: &str,
        guard: &TaskGuard,
        patch: TaskPatch,
    ) -> RepoResult<Option<TaskRecord>>;

    /// Atomically claim a queued, unclaimed task. Returns false with no side
    /// effect when either precondition fails.
    async fn try_claim_task(&self, task_id: &str, worker_id: &str) -> RepoResult<bool>;

    /// Most recently requested approval for the (task, scope) pair
    async fn get_latest_approval_for_task(
        &self,
        task_id: &str,
        scope: &str,
    ) -> RepoResult<Option<ApprovalRecord>>;

    /// Create a pending approval
    async fn request_approval(
        &self,
        task_id: &str,
        scope: &str,
        policy_id: &str,
    ) -> RepoResult<ApprovalRecord>;

    /// Record an external decision on a pending approval
    async fn resolve_approval(
        &self,
        approval_id: &str,
        status: ApprovalStatus,
    ) -> RepoResult<ApprovalRecord>;

    /// Insert or update a run by id
    async fn upsert_run(&self, run: &RunRecord) -> RepoResult<()>;

    async fn get_run(&self, id: &str) -> RepoResult<Option<RunRecord>>;

    /// Insert or update a step by id
    async fn upsert_step(&self, step: &StepRecord) -> RepoResult<()>;

    async fn get_step(&self, id: &str) -> RepoResult<Option<StepRecord>>;

    /// Steps of a run in plan order
    async fn list_steps(&self, run_id: &str) -> RepoResult<Vec<StepRecord>>;
}

/// Shared eligibility predicate, used by the in-memory backend and in tests
pub fn is_eligible(task: &TaskRecord, now: DateTime<Utc>, specialty: Option<&str>) -> bool {
    let status_ok = match task.status {
        TaskStatus::Queued => !task.is_claimed(),
        TaskStatus::WaitingApproval => true,
        _ => false,
    };
    let time_ok = task
        .next_attempt_epoch
        .map_or(true, |epoch| epoch <= now.timestamp());
    let specialty_ok = match specialty {
        Some(s) => task.specialty.as_deref() == Some(s),
        None => true,
    };
    status_ok && time_ok && specialty_ok
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_eligible_status_and_claim() {
        let now = Utc::now();
        let mut task = NewTask::new("query").into_record();
        assert!(is_eligible(&task, now, None));

        task.claimed_by = Some("w-1".to_string());
        assert!(!is_eligible(&task, now, None));

        task.status = TaskStatus::WaitingApproval;
        assert!(is_eligible(&task, now, None));

        task.claimed_by = None;
        task.status = TaskStatus::Running;
        assert!(!is_eligible(&task, now, None));
    }

    #[test]
    fn test_is_eligible_empty_claimant_counts_as_unclaimed() {
        let mut task = NewTask::new("query").into_record();
        task.claimed_by = Some(String::new());
        assert!(is_eligible(&task, Utc::now(), None));
    }

    #[test]
    fn test_is_eligible_respects_backoff() {
        let now = Utc::now();
        let mut task = NewTask::new("query").into_record();
        task.next_attempt_epoch = Some(now.timestamp() + 30);
        assert!(!is_eligible(&task, now, None));
        task.next_attempt_epoch = Some(now.timestamp());
        assert!(is_eligible(&task, now, None));
    }

    #[test]
    fn test_is_eligible_specialty_filter() {
        let now = Utc::now();
        let task = NewTask::new("deploy").with_specialty("infra").into_record();
        assert!(is_eligible(&task, now, Some("infra")));
        assert!(!is_eligible(&task, now, Some("docs")));
        assert!(is_eligible(&task, now, None));

        let unassigned = NewTask::new("deploy").into_record();
        assert!(!is_eligible(&unassigned, now, Some("infra")));
    }
}
