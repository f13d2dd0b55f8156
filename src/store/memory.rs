//! In-memory repository
//!
//! Same contract as the SQLite backend. The claim and every guarded patch run
//! their check-and-set inside a single write-lock critical section, so they
//! are atomic across workers sharing one instance.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{is_eligible, RepoResult, TaskRepository, MAX_LIST_LIMIT};
use crate::error::RepositoryError;
use crate::models::{
    ApprovalRecord, ApprovalStatus, NewTask, RunRecord, StepRecord, TaskGuard, TaskPatch,
    TaskRecord, TaskStatus,
};

pub struct MemoryTaskRepository {
    /// Tasks by ID
    tasks: RwLock<HashMap<String, TaskRecord>>,
    /// Approvals in request order
    approvals: RwLock<Vec<ApprovalRecord>>,
    /// Runs by ID
    runs: RwLock<HashMap<String, RunRecord>>,
    /// Steps by ID
    steps: RwLock<HashMap<String, StepRecord>>,
    available: AtomicBool,
}

impl MemoryTaskRepository {
    pub fn new() -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            approvals: RwLock::new(Vec::new()),
            runs: RwLock::new(HashMap::new()),
            steps: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the backend going away (or coming back)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of approvals recorded for a task, all scopes
    pub async fn approval_count(&self, task_id: &str) -> usize {
        let approvals = self.approvals.read().await;
        approvals.iter().filter(|a| a.task_id == task_id).count()
    }

    fn ensure_available(&self) -> RepoResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RepositoryError::Unavailable(
                "in-memory backend marked unavailable".to_string(),
            ))
        }
    }
}

impl Default for MemoryTaskRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskRepository for MemoryTaskRepository {
    async fn create_task(&self, task: NewTask) -> RepoResult<TaskRecord> {
        self.ensure_available()?;
        let record = task.into_record();
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&record.id) {
            return Err(RepositoryError::InvalidTransition(format!(
                "task {} already exists",
                record.id
            )));
        }
        tasks.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn list_tasks_for_worker(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        specialty: Option<&str>,
    ) -> RepoResult<Vec<TaskRecord>> {
        self.ensure_available()?;
        let tasks = self.tasks.read().await;
        let mut eligible: Vec<TaskRecord> = tasks
            .values()
            .filter(|t| is_eligible(t, now, specialty))
            .cloned()
            .collect();
        eligible.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        eligible.truncate(limit.min(MAX_LIST_LIMIT));
        Ok(eligible)
    }

    async fn list_tasks(&self, status: Option<TaskStatus>) -> RepoResult<Vec<TaskRecord>> {
        self.ensure_available()?;
        let tasks = self.tasks.read().await;
        let mut all: Vec<TaskRecord> = tasks
            .values()
            .filter(|t| status.map_or(true, |s| t.status == s))
            .cloned()
            .collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(all)
    }

    async fn get_task(&self, id: &str) -> RepoResult<Option<TaskRecord>> {
        self.ensure_available()?;
        let tasks = self.tasks.read().await;
        Ok(tasks.get(id).cloned())
    }

    async fn patch_task(&self, id: &str, patch: TaskPatch) -> RepoResult<TaskRecord> {
        self.ensure_available()?;
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| RepositoryError::NotFound(format!("task {}", id)))?;
        patch.apply_to(task);
        Ok(task.clone())
    }

    async fn patch_task_if(
        &self,
        id: &str,
        guard: &TaskGuard,
        patch: TaskPatch,
    ) -> RepoResult<Option<TaskRecord>> {
        self.ensure_available()?;
        let mut tasks = self.tasks.write().await;
        match tasks.get_mut(id) {
            Some(task) if guard.matches(task) => {
                patch.apply_to(task);
                Ok(Some(task.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn try_claim_task(&self, task_id: &str, worker_id: &str) -> RepoResult<bool> {
        self.ensure_available()?;
        let mut tasks = self.tasks.write().await;
        let Some(task) = tasks.get_mut(task_id) else {
            return Ok(false);
        };
        if task.status != TaskStatus::Queued || task.is_claimed() {
            return Ok(false);
        }
        let now = Utc::now();
        task.claimed_by = Some(worker_id.to_string());
        task.claimed_at = Some(now);
        task.updated_at = now;
        Ok(true)
    }

    async fn get_latest_approval_for_task(
        &self,
        task_id: &str,
        scope: &str,
    ) -> RepoResult<Option<ApprovalRecord>> {
        self.ensure_available()?;
        let approvals = self.approvals.read().await;
        // Later entries win ties on requested_at
        Ok(approvals
            .iter()
            .enumerate()
            .filter(|(_, a)| a.task_id == task_id && a.scope == scope)
            .max_by_key(|(i, a)| (a.requested_at, *i))
            .map(|(_, a)| a.clone()))
    }

    async fn request_approval(
        &self,
        task_id: &str,
        scope: &str,
        policy_id: &str,
    ) -> RepoResult<ApprovalRecord> {
        self.ensure_available()?;
        let approval = ApprovalRecord::pending(task_id, scope, policy_id);
        let mut approvals = self.approvals.write().await;
        approvals.push(approval.clone());
        Ok(approval)
    }

    async fn resolve_approval(
        &self,
        approval_id: &str,
        status: ApprovalStatus,
    ) -> RepoResult<ApprovalRecord> {
        self.ensure_available()?;
        let mut approvals = self.approvals.write().await;
        let approval = approvals
            .iter_mut()
            .find(|a| a.id == approval_id)
            .ok_or_else(|| RepositoryError::NotFound(format!("approval {}", approval_id)))?;
        approval
            .resolve(status)
            .map_err(RepositoryError::InvalidTransition)?;
        Ok(approval.clone())
    }

    async fn upsert_run(&self, run: &RunRecord) -> RepoResult<()> {
        self.ensure_available()?;
        let mut runs = self.runs.write().await;
        runs.insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn get_run(&self, id: &str) -> RepoResult<Option<RunRecord>> {
        self.ensure_available()?;
        let runs = self.runs.read().await;
        Ok(runs.get(id).cloned())
    }

    async fn upsert_step(&self, step: &StepRecord) -> RepoResult<()> {
        self.ensure_available()?;
        let mut steps = self.steps.write().await;
        steps.insert(step.id.clone(), step.clone());
        Ok(())
    }

    async fn get_step(&self, id: &str) -> RepoResult<Option<StepRecord>> {
        self.ensure_available()?;
        let steps = self.steps.read().await;
        Ok(steps.get(id).cloned())
    }

    async fn list_steps(&self, run_id: &str) -> RepoResult<Vec<StepRecord>> {
        self.ensure_available()?;
        let steps = self.steps.read().await;
        let mut found: Vec<StepRecord> = steps
            .values()
            .filter(|s| s.run_id == run_id)
            .cloned()
            .collect();
        found.sort_by_key(|s| s.order);
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RunStatus, StepStatus, TaskPriority};
    use chrono::Duration;
    use std::sync::Arc;

    async fn seeded(tasks: Vec<NewTask>) -> MemoryTaskRepository {
        let repo = MemoryTaskRepository::new();
        for t in tasks {
            repo.create_task(t).await.unwrap();
        }
        repo
    }

    #[tokio::test]
    async fn test_create_and_get_task() {
        let repo = MemoryTaskRepository::new();
        let created = repo
            .create_task(NewTask::new("query").with_id("t-1"))
            .await
            .unwrap();
        let fetched = repo.get_task("t-1").await.unwrap().unwrap();
        assert_eq!(created, fetched);
        assert!(repo.get_task("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_duplicate_id_fails() {
        let repo = seeded(vec![NewTask::new("query").with_id("t-1")]).await;
        let result = repo.create_task(NewTask::new("query").with_id("t-1")).await;
        assert!(matches!(result, Err(RepositoryError::InvalidTransition(_))));
    }

    #[tokio::test]
    async fn test_list_orders_by_priority_then_age() {
        let base = Utc::now() - Duration::minutes(10);
        let repo = seeded(vec![
            NewTask::new("query")
                .with_id("low")
                .with_priority(TaskPriority::Low)
                .created_at(base),
            NewTask::new("query")
                .with_id("critical")
                .with_priority(TaskPriority::Critical)
                .created_at(base + Duration::minutes(2)),
            NewTask::new("query")
                .with_id("normal-new")
                .created_at(base + Duration::minutes(3)),
            NewTask::new("query")
                .with_id("normal-old")
                .created_at(base + Duration::minutes(1)),
        ])
        .await;

        let listed = repo.list_tasks_for_worker(Utc::now(), 10, None).await.unwrap();
        let ids: Vec<_> = listed.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["critical", "normal-old", "normal-new", "low"]);
    }

    #[tokio::test]
    async fn test_list_enforces_ceiling() {
        let repo = MemoryTaskRepository::new();
        for i in 0..(MAX_LIST_LIMIT + 5) {
            repo.create_task(NewTask::new("query").with_id(format!("t-{:03}", i)))
                .await
                .unwrap();
        }
        let listed = repo
            .list_tasks_for_worker(Utc::now(), 10_000, None)
            .await
            .unwrap();
        assert_eq!(listed.len(), MAX_LIST_LIMIT);

        let listed = repo.list_tasks_for_worker(Utc::now(), 3, None).await.unwrap();
        assert_eq!(listed.len(), 3);
    }

    #[tokio::test]
    async fn test_list_skips_claimed_and_terminal() {
        let repo = seeded(vec![
            NewTask::new("query").with_id("free"),
            NewTask::new("query").with_id("claimed"),
            NewTask::new("query").with_id("done"),
        ])
        .await;
        assert!(repo.try_claim_task("claimed", "w-1").await.unwrap());
        repo.patch_task("done", TaskPatch::new().status(TaskStatus::Done))
            .await
            .unwrap();

        let listed = repo.list_tasks_for_worker(Utc::now(), 10, None).await.unwrap();
        let ids: Vec<_> = listed.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["free"]);
    }

    #[tokio::test]
    async fn test_claim_sets_fields_once() {
        let repo = seeded(vec![NewTask::new("query").with_id("t-1")]).await;

        assert!(repo.try_claim_task("t-1", "w-1").await.unwrap());
        assert!(!repo.try_claim_task("t-1", "w-2").await.unwrap());

        let task = repo.get_task("t-1").await.unwrap().unwrap();
        assert_eq!(task.claimed_by.as_deref(), Some("w-1"));
        assert!(task.claimed_at.is_some());
        assert_eq!(task.status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn test_claim_requires_queued() {
        let repo = seeded(vec![NewTask::new("deploy").with_id("t-1")]).await;
        repo.patch_task("t-1", TaskPatch::new().status(TaskStatus::WaitingApproval))
            .await
            .unwrap();
        assert!(!repo.try_claim_task("t-1", "w-1").await.unwrap());
        assert!(!repo.try_claim_task("nope", "w-1").await.unwrap());

        let task = repo.get_task("t-1").await.unwrap().unwrap();
        assert!(task.claimed_by.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_have_one_winner() {
        let repo = Arc::new(seeded(vec![NewTask::new("query").with_id("t-1")]).await);

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let repo = repo.clone();
                tokio::spawn(async move {
                    repo.try_claim_task("t-1", &format!("w-{}", i)).await.unwrap()
                })
            })
            .collect();

        let results = futures::future::join_all(handles).await;
        let wins = results.into_iter().filter(|r| *r.as_ref().unwrap()).count();
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn test_patch_missing_task() {
        let repo = MemoryTaskRepository::new();
        let result = repo.patch_task("nope", TaskPatch::new().retries(1)).await;
        assert!(matches!(result, Err(RepositoryError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_guarded_patch_only_applies_when_guard_holds() {
        let repo = seeded(vec![NewTask::new("deploy").with_id("t-1")]).await;
        repo.patch_task("t-1", TaskPatch::new().status(TaskStatus::WaitingApproval))
            .await
            .unwrap();

        let resume = TaskGuard::new().status(TaskStatus::WaitingApproval);
        let patch = TaskPatch::new().status(TaskStatus::Queued);
        let first = repo.patch_task_if("t-1", &resume, patch.clone()).await.unwrap();
        assert_eq!(first.unwrap().status, TaskStatus::Queued);

        // A second resume from the same stale view is refused
        let second = repo.patch_task_if("t-1", &resume, patch.clone()).await.unwrap();
        assert!(second.is_none());
        assert!(repo.patch_task_if("nope", &resume, patch).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_guarded_patch_respects_claimant() {
        let repo = seeded(vec![NewTask::new("query").with_id("t-1")]).await;
        assert!(repo.try_claim_task("t-1", "w-1").await.unwrap());

        let theirs = TaskGuard::new().status(TaskStatus::Queued).claimed_by("w-2");
        let requeue = TaskPatch::new().retries(1).release_claim();
        assert!(repo.patch_task_if("t-1", &theirs, requeue.clone()).await.unwrap().is_none());
        let unclaimed = TaskGuard::new().unclaimed();
        assert!(repo.patch_task_if("t-1", &unclaimed, requeue.clone()).await.unwrap().is_none());

        let task = repo.get_task("t-1").await.unwrap().unwrap();
        assert_eq!(task.claimed_by.as_deref(), Some("w-1"));
        assert_eq!(task.retries, 0);

        let mine = TaskGuard::new().status(TaskStatus::Queued).claimed_by("w-1");
        let patched = repo.patch_task_if("t-1", &mine, requeue).await.unwrap().unwrap();
        assert_eq!(patched.retries, 1);
        assert!(patched.claimed_by.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_guarded_resumes_have_one_winner() {
        let repo = Arc::new(seeded(vec![NewTask::new("deploy").with_id("t-1")]).await);
        repo.patch_task("t-1", TaskPatch::new().status(TaskStatus::WaitingApproval))
            .await
            .unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let repo = repo.clone();
                tokio::spawn(async move {
                    let guard = TaskGuard::new().status(TaskStatus::WaitingApproval);
                    let patch = TaskPatch::new().status(TaskStatus::Queued);
                    repo.patch_task_if("t-1", &guard, patch).await.unwrap().is_some()
                })
            })
            .collect();

        let results = futures::future::join_all(handles).await;
        let wins = results.into_iter().filter(|r| *r.as_ref().unwrap()).count();
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn test_latest_approval_per_scope() {
        let repo = seeded(vec![NewTask::new("deploy").with_id("t-1")]).await;
        let first = repo.request_approval("t-1", "deploy", "p").await.unwrap();
        repo.resolve_approval(&first.id, ApprovalStatus::Expired)
            .await
            .unwrap();
        let second = repo.request_approval("t-1", "deploy", "p").await.unwrap();
        repo.request_approval("t-1", "deploy:push", "p").await.unwrap();

        let latest = repo
            .get_latest_approval_for_task("t-1", "deploy")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.id, second.id);
        assert_eq!(latest.status, ApprovalStatus::Pending);

        assert!(repo
            .get_latest_approval_for_task("t-1", "rollback")
            .await
            .unwrap()
            .is_none());
        assert_eq!(repo.approval_count("t-1").await, 3);
    }

    #[tokio::test]
    async fn test_resolve_approval_only_once() {
        let repo = MemoryTaskRepository::new();
        let approval = repo.request_approval("t-1", "deploy", "p").await.unwrap();
        let resolved = repo
            .resolve_approval(&approval.id, ApprovalStatus::Approved)
            .await
            .unwrap();
        assert_eq!(resolved.status, ApprovalStatus::Approved);

        let again = repo
            .resolve_approval(&approval.id, ApprovalStatus::Rejected)
            .await;
        assert!(matches!(again, Err(RepositoryError::InvalidTransition(_))));

        let missing = repo
            .resolve_approval("approval-x", ApprovalStatus::Approved)
            .await;
        assert!(matches!(missing, Err(RepositoryError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_upsert_step_is_idempotent() {
        let repo = MemoryTaskRepository::new();
        let task = NewTask::new("deploy").with_id("t-1").into_record();
        let mut run = RunRecord::for_task(&task);
        repo.upsert_run(&run).await.unwrap();
        run.status = RunStatus::Done;
        repo.upsert_run(&run).await.unwrap();
        assert_eq!(
            repo.get_run(&run.id).await.unwrap().unwrap().status,
            RunStatus::Done
        );

        let step = StepRecord::new(&run.id, 1, "validate", Some("deploy.validate"));
        repo.upsert_step(&step).await.unwrap();
        repo.upsert_step(&step).await.unwrap();
        repo.upsert_step(&step.clone().with_status(StepStatus::Success))
            .await
            .unwrap();

        let steps = repo.list_steps(&run.id).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].status, StepStatus::Success);
    }

    #[tokio::test]
    async fn test_unavailable_backend_errors() {
        let repo = seeded(vec![NewTask::new("query").with_id("t-1")]).await;
        repo.set_available(false);

        let result = repo.list_tasks_for_worker(Utc::now(), 10, None).await;
        assert!(matches!(result, Err(RepositoryError::Unavailable(_))));
        let result = repo.try_claim_task("t-1", "w-1").await;
        assert!(matches!(result, Err(RepositoryError::Unavailable(_))));
        let result = repo
            .patch_task_if("t-1", &TaskGuard::new(), TaskPatch::new().retries(1))
            .await;
        assert!(matches!(result, Err(RepositoryError::Unavailable(_))));

        repo.set_available(true);
        assert!(repo.try_claim_task("t-1", "w-1").await.unwrap());
    }
}
