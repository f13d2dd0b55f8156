//! The worker tick loop
//!
//! A tick lists eligible tasks, walks them in repository order and drives
//! each through the task state machine. Gates, cancellation and violations
//! are plain return values; only genuine failures travel as errors, and those
//! feed the retry policy.
//!
//! The listing is a snapshot. Every write after it is guarded on the status
//! and claimant the worker expects, so a stale snapshot costs a lost race and
//! never another worker's progress.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::error::{OrchestratorError, RepositoryError, Result};
use crate::events::{EventKind, EventPublisher, OrchestratorEvent, Severity};
use crate::models::{
    run_id_for, ApprovalStatus, RunRecord, RunStatus, StepRecord, StepStatus, TaskGuard, TaskPatch,
    TaskRecord, TaskStatus,
};
use crate::planner::{self, StepDef};
use crate::policy;
use crate::specialty::{SpecialtyRegistry, SpecialtyViolation};
use crate::store::TaskRepository;

use super::retry::{RetryDecision, RetryPolicy};
use super::tool::{NoopToolExecutor, ToolExecutor, ToolInvocation};

/// Summary of one tick
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Tasks handled without error, including ones left waiting
    pub processed: usize,
    pub errors: Vec<String>,
}

impl TickReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// What a tick did with one listed task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Terminal or not actionable by this worker
    Skipped,
    /// Still waiting on an approval decision
    Waiting,
    /// Another worker claimed or moved the task first
    ClaimLost,
    /// Failed closed on the no-overlap contract
    Violation(&'static str),
    Executed(ExecutionOutcome),
}

/// How execution of a claimed task ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed,
    /// Suspended on a gate; the claim has been released
    AwaitingApproval { scope: String },
    /// An approval was rejected or expired
    Denied { scope: String },
    /// The task was canceled or moved by someone else mid-run
    Canceled,
}

enum Gate {
    Open,
    Wait,
    Denied(ApprovalStatus),
}

pub struct Worker {
    worker_id: String,
    config: WorkerConfig,
    retry: RetryPolicy,
    repo: Arc<dyn TaskRepository>,
    events: Arc<dyn EventPublisher>,
    tools: Arc<dyn ToolExecutor>,
    specialties: SpecialtyRegistry,
}

impl Worker {
    /// Build a worker with the no-op tool executor and the built-in specialties.
    pub fn new(
        config: WorkerConfig,
        repo: Arc<dyn TaskRepository>,
        events: Arc<dyn EventPublisher>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            worker_id: config.resolve_worker_id(),
            retry: RetryPolicy::from_config(&config),
            config,
            repo,
            events,
            tools: Arc::new(NoopToolExecutor),
            specialties: SpecialtyRegistry::builtin(),
        })
    }

    pub fn with_tools(mut self, tools: Arc<dyn ToolExecutor>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_specialties(mut self, specialties: SpecialtyRegistry) -> Self {
        self.specialties = specialties;
        self
    }

    pub fn id(&self) -> &str {
        &self.worker_id
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Tick until `shutdown` resolves. A tick in progress is finished first.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut interval = tokio::time::interval(self.config.poll_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(
            worker_id = %self.worker_id,
            specialty = ?self.config.specialty,
            "worker started"
        );
        if let Some(specialty) = self.config.specialty.as_deref() {
            if self.specialties.get(specialty).is_err() {
                warn!(
                    specialty,
                    known = ?self.specialties.ids(),
                    "specialty is not registered; every task will fail closed"
                );
            }
        }
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {
                    let report = self.tick().await;
                    if !report.is_clean() {
                        warn!(errors = ?report.errors, "tick finished with errors");
                    }
                }
            }
        }
        info!(worker_id = %self.worker_id, "worker stopped");
    }

    pub async fn tick(&self) -> TickReport {
        self.tick_at(Utc::now()).await
    }

    /// Run one tick as of `now`, which drives eligibility and backoff.
    #[tracing::instrument(skip(self), fields(worker_id = %self.worker_id))]
    pub async fn tick_at(&self, now: DateTime<Utc>) -> TickReport {
        let tasks = match self
            .repo
            .list_tasks_for_worker(
                now,
                self.config.max_tasks_per_tick,
                self.config.specialty.as_deref(),
            )
            .await
        {
            Ok(tasks) => tasks,
            Err(e) => {
                error!(error = %e, "failed to list eligible tasks");
                return TickReport {
                    processed: 0,
                    errors: vec![e.to_string()],
                };
            }
        };

        let mut report = TickReport::default();
        for task in tasks {
            let task_id = task.id.clone();
            match self.process_task(task, now).await {
                Ok(outcome) => {
                    debug!(task_id = %task_id, ?outcome, "task processed");
                    report.processed += 1;
                }
                Err(e) => {
                    if e.is_backend_unavailable() {
                        error!(task_id = %task_id, error = %e, "store unavailable");
                    } else {
                        warn!(task_id = %task_id, error = %e, "task processing failed");
                    }
                    report.errors.push(format!("{}: {}", task_id, e));
                    self.handle_failure(&task_id, now).await;
                }
            }
        }
        report
    }

    #[tracing::instrument(skip(self, task, now), fields(task_id = %task.id, status = %task.status))]
    async fn process_task(&self, task: TaskRecord, now: DateTime<Utc>) -> Result<TaskOutcome> {
        match task.status {
            TaskStatus::Queued => self.process_queued(task).await,
            TaskStatus::WaitingApproval => {
                let scope = task.approval_scope().to_string();
                let latest = self
                    .repo
                    .get_latest_approval_for_task(&task.id, &scope)
                    .await?;
                match latest.map(|a| a.status) {
                    Some(ApprovalStatus::Approved) => {
                        let patch = TaskPatch::new()
                            .status(TaskStatus::Queued)
                            .release_claim()
                            .reason(format!("approved: {}", scope))
                            .updated_at(now);
                        let Some(resumed) = self
                            .repo
                            .patch_task_if(&task.id, &waiting_guard(), patch)
                            .await?
                        else {
                            debug!(task_id = %task.id, "resume lost to another worker");
                            return Ok(TaskOutcome::ClaimLost);
                        };
                        self.emit_status(
                            &resumed,
                            TaskStatus::WaitingApproval,
                            Severity::Info,
                            Some(format!("approved: {}", scope)),
                        )
                        .await;
                        // Resume in the same tick
                        self.process_queued(resumed).await
                    }
                    Some(status) if status.is_denial() => {
                        let reason = format!("approval {}: {}", status.as_str(), scope);
                        if !self
                            .fail_task(&task, waiting_guard(), reason, Severity::Warning)
                            .await?
                        {
                            return Ok(TaskOutcome::ClaimLost);
                        }
                        self.mark_run_failed(&task.id).await;
                        Ok(TaskOutcome::Executed(ExecutionOutcome::Denied { scope }))
                    }
                    _ => Ok(TaskOutcome::Waiting),
                }
            }
            _ => Ok(TaskOutcome::Skipped),
        }
    }

    async fn process_queued(&self, task: TaskRecord) -> Result<TaskOutcome> {
        if let Some(specialty) = self.config.specialty.as_deref() {
            if let Err(violation) = self.specialties.verify_task(specialty, &task) {
                if !self.reject_violation(&task, &violation).await? {
                    debug!(task_id = %task.id, "task moved before the violation was recorded");
                    return Ok(TaskOutcome::ClaimLost);
                }
                return Ok(TaskOutcome::Violation(violation.reason()));
            }
        }

        if !self.repo.try_claim_task(&task.id, &self.worker_id).await? {
            debug!(task_id = %task.id, "claim lost");
            return Ok(TaskOutcome::ClaimLost);
        }
        self.emit(
            &task,
            Severity::Info,
            EventKind::TaskClaimed {
                task_id: task.id.clone(),
                worker_id: self.worker_id.clone(),
            },
        )
        .await;

        let outcome = self.execute_task(&task).await?;
        Ok(TaskOutcome::Executed(outcome))
    }

    async fn execute_task(&self, task: &TaskRecord) -> Result<ExecutionOutcome> {
        let mut run = RunRecord::for_task(task);
        self.repo.upsert_run(&run).await?;
        self.emit(
            task,
            Severity::Info,
            EventKind::RunSpawned {
                run_id: run.id.clone(),
                task_id: task.id.clone(),
            },
        )
        .await;

        let policy_id = policy::policy_id(&task.task_type);
        let task_gated = policy::requires_approval(&task.task_type);
        if task_gated {
            let scope = task.task_type.clone();
            match self.gate(task, &scope, policy_id).await? {
                Gate::Open => {}
                Gate::Wait => {
                    if !self
                        .suspend(task, &mut run, TaskStatus::Queued, scope.clone())
                        .await?
                    {
                        return self.abandon(task, &mut run, TaskStatus::Queued).await;
                    }
                    return Ok(ExecutionOutcome::AwaitingApproval { scope });
                }
                Gate::Denied(status) => {
                    if !self.deny(task, &mut run, status, &scope).await? {
                        return self.abandon(task, &mut run, TaskStatus::Queued).await;
                    }
                    return Ok(ExecutionOutcome::Denied { scope });
                }
            }
        }

        let patch = TaskPatch::new()
            .status(TaskStatus::Running)
            .awaiting_scope(None);
        let claimed = self.held().status(TaskStatus::Queued);
        let Some(running) = self.repo.patch_task_if(&task.id, &claimed, patch).await? else {
            return self.abandon(task, &mut run, TaskStatus::Queued).await;
        };
        self.emit_status(&running, TaskStatus::Queued, Severity::Info, None)
            .await;

        // A task-level approval under the dangerous-ops policy opens the
        // plan's step gates too.
        let steps_covered = task_gated && policy::approval_covers_steps(&task.task_type);
        let still_running = self.held().status(TaskStatus::Running);

        for step in planner::plan(&task.task_type) {
            let current = self
                .repo
                .get_task(&task.id)
                .await?
                .ok_or_else(|| RepositoryError::NotFound(format!("task {}", task.id)))?;
            if !still_running.matches(&current) {
                return self.abandon(task, &mut run, TaskStatus::Running).await;
            }

            let record = StepRecord::new(&run.id, step.order, &step.name, step.tool.as_deref());
            if let Some(existing) = self.repo.get_step(&record.id).await? {
                if existing.status == StepStatus::Success {
                    debug!(step = %step.name, "step already succeeded, skipping");
                    continue;
                }
            }

            if step.requires_approval && !steps_covered {
                let scope = planner::step_scope(&task.task_type, &step.name);
                match self.gate(task, &scope, policy_id).await? {
                    Gate::Open => {}
                    Gate::Wait => {
                        if !self
                            .suspend(task, &mut run, TaskStatus::Running, scope.clone())
                            .await?
                        {
                            return self.abandon(task, &mut run, TaskStatus::Running).await;
                        }
                        return Ok(ExecutionOutcome::AwaitingApproval { scope });
                    }
                    Gate::Denied(status) => {
                        if !self.deny(task, &mut run, status, &scope).await? {
                            return self.abandon(task, &mut run, TaskStatus::Running).await;
                        }
                        return Ok(ExecutionOutcome::Denied { scope });
                    }
                }
            }

            self.run_step(task, &run, record, &step).await?;
        }

        let patch = TaskPatch::new()
            .status(TaskStatus::Done)
            .next_attempt_epoch(None)
            .release_claim()
            .awaiting_scope(None);
        let Some(done) = self.repo.patch_task_if(&task.id, &still_running, patch).await? else {
            return self.abandon(task, &mut run, TaskStatus::Running).await;
        };
        run.status = RunStatus::Done;
        self.repo.upsert_run(&run).await?;
        self.emit_status(&done, TaskStatus::Running, Severity::Info, None)
            .await;
        info!(task_id = %task.id, run_id = %run.id, "task done");
        Ok(ExecutionOutcome::Completed)
    }

    /// Resolve an approval gate, requesting approval when none is on record.
    async fn gate(&self, task: &TaskRecord, scope: &str, policy_id: &str) -> Result<Gate> {
        let latest = self
            .repo
            .get_latest_approval_for_task(&task.id, scope)
            .await?;
        match latest.map(|a| a.status) {
            Some(ApprovalStatus::Approved) => Ok(Gate::Open),
            Some(status) if status.is_denial() => Ok(Gate::Denied(status)),
            Some(ApprovalStatus::Pending) => Ok(Gate::Wait),
            _ => {
                let approval = self
                    .repo
                    .request_approval(&task.id, scope, policy_id)
                    .await?;
                info!(task_id = %task.id, scope, approval_id = %approval.id, "approval requested");
                self.emit(
                    task,
                    Severity::Warning,
                    EventKind::ApprovalRequested {
                        approval_id: approval.id,
                        task_id: task.id.clone(),
                        scope: scope.to_string(),
                        policy_id: policy_id.to_string(),
                    },
                )
                .await;
                Ok(Gate::Wait)
            }
        }
    }

    /// Park the task on a gate. False when the task is no longer ours in `from`.
    async fn suspend(
        &self,
        task: &TaskRecord,
        run: &mut RunRecord,
        from: TaskStatus,
        scope: String,
    ) -> Result<bool> {
        let reason = format!("awaiting approval: {}", scope);
        let patch = TaskPatch::new()
            .status(TaskStatus::WaitingApproval)
            .release_claim()
            .awaiting_scope(Some(scope))
            .reason(reason.clone());
        let guard = self.held().status(from);
        let Some(waiting) = self.repo.patch_task_if(&task.id, &guard, patch).await? else {
            return Ok(false);
        };
        run.status = RunStatus::Suspended;
        self.repo.upsert_run(run).await?;
        self.emit_status(&waiting, from, Severity::Info, Some(reason))
            .await;
        Ok(true)
    }

    async fn deny(
        &self,
        task: &TaskRecord,
        run: &mut RunRecord,
        status: ApprovalStatus,
        scope: &str,
    ) -> Result<bool> {
        let reason = format!("approval {}: {}", status.as_str(), scope);
        if !self
            .fail_task(task, self.held(), reason, Severity::Warning)
            .await?
        {
            return Ok(false);
        }
        run.status = RunStatus::Failed;
        self.repo.upsert_run(run).await?;
        Ok(true)
    }

    /// Stop a run whose task changed under us, typically an operator cancel.
    /// The claim is released only if this worker still holds it, and the run
    /// is left alone otherwise since the new owner shares its id.
    async fn abandon(
        &self,
        task: &TaskRecord,
        run: &mut RunRecord,
        from: TaskStatus,
    ) -> Result<ExecutionOutcome> {
        let patch = TaskPatch::new()
            .release_claim()
            .awaiting_scope(None)
            .next_attempt_epoch(None);
        let Some(released) = self.repo.patch_task_if(&task.id, &self.held(), patch).await? else {
            info!(task_id = %task.id, "claim taken over, run left to its owner");
            return Ok(ExecutionOutcome::Canceled);
        };
        run.status = RunStatus::Canceled;
        self.repo.upsert_run(run).await?;
        info!(task_id = %task.id, status = %released.status, "run stopped, task changed externally");
        if released.status == TaskStatus::Canceled {
            self.emit_status(
                &released,
                from,
                Severity::Warning,
                Some("canceled".to_string()),
            )
            .await;
        }
        Ok(ExecutionOutcome::Canceled)
    }

    async fn run_step(
        &self,
        task: &TaskRecord,
        run: &RunRecord,
        record: StepRecord,
        step: &StepDef,
    ) -> Result<()> {
        self.repo.upsert_step(&record).await?;
        self.emit(
            task,
            Severity::Info,
            EventKind::StepRunning {
                run_id: run.id.clone(),
                step_id: record.id.clone(),
                name: step.name.clone(),
                tool: step.tool.clone(),
            },
        )
        .await;

        let invocation = ToolInvocation {
            task_id: task.id.clone(),
            task_type: task.task_type.clone(),
            run_id: run.id.clone(),
            step_id: record.id.clone(),
            step_name: step.name.clone(),
            tool: step.tool.clone(),
            conversation_id: task.conversation_id.clone(),
            trace_id: task.trace_id.clone(),
        };

        match self.tools.execute(&invocation).await {
            Ok(()) => {
                let record = record.with_status(StepStatus::Success);
                self.repo.upsert_step(&record).await?;
                self.emit(
                    task,
                    Severity::Info,
                    EventKind::StepSucceeded {
                        run_id: run.id.clone(),
                        step_id: record.id,
                        name: step.name.clone(),
                    },
                )
                .await;
                Ok(())
            }
            Err(tool_error) => {
                let record = record.with_status(StepStatus::Failed);
                self.repo.upsert_step(&record).await?;
                self.emit(
                    task,
                    Severity::Warning,
                    EventKind::StepFailed {
                        run_id: run.id.clone(),
                        step_id: record.id,
                        name: step.name.clone(),
                        error: tool_error.to_string(),
                    },
                )
                .await;
                Err(OrchestratorError::Tool(tool_error))
            }
        }
    }

    /// Fail a queued, unclaimed task on its contract. False when another
    /// worker got to the task first.
    async fn reject_violation(
        &self,
        task: &TaskRecord,
        violation: &SpecialtyViolation,
    ) -> Result<bool> {
        let guard = TaskGuard::new().status(TaskStatus::Queued).unclaimed();
        if !self
            .fail_task(task, guard, violation.reason().to_string(), Severity::Critical)
            .await?
        {
            return Ok(false);
        }
        warn!(task_id = %task.id, %violation, "no-overlap contract violated");
        self.emit(
            task,
            Severity::Critical,
            EventKind::PolicyViolation {
                task_id: task.id.clone(),
                reason: violation.reason().to_string(),
            },
        )
        .await;
        Ok(true)
    }

    /// Terminal failure with no retry, applied only while `guard` holds
    async fn fail_task(
        &self,
        task: &TaskRecord,
        guard: TaskGuard,
        reason: String,
        severity: Severity,
    ) -> Result<bool> {
        let patch = TaskPatch::new()
            .status(TaskStatus::Failed)
            .reason(reason.clone())
            .release_claim()
            .awaiting_scope(None)
            .next_attempt_epoch(None);
        let Some(failed) = self.repo.patch_task_if(&task.id, &guard, patch).await? else {
            return Ok(false);
        };
        self.emit_status(&failed, task.status, severity, Some(reason))
            .await;
        Ok(true)
    }

    /// Apply the retry policy after a processing error. Only a task this worker
    /// still holds is touched; a failure before the claim, or on a task that
    /// has since changed hands, spends no retry. Errors here are only logged;
    /// an unreachable store leaves the task for a later tick.
    async fn handle_failure(&self, task_id: &str, now: DateTime<Utc>) {
        let task = match self.repo.get_task(task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => return,
            Err(e) => {
                warn!(task_id, error = %e, "cannot record failure");
                return;
            }
        };
        let held = task.claimed_by.as_deref() == Some(self.worker_id.as_str());
        if task.status.is_terminal() || !held {
            debug!(task_id, status = %task.status, "failure not ours to record");
            return;
        }
        let guard = self.held().status(task.status);

        match self.retry.decide(task.retries, now.timestamp()) {
            RetryDecision::Retry {
                retries,
                next_attempt_epoch,
            } => {
                let patch = TaskPatch::new()
                    .status(TaskStatus::Queued)
                    .retries(retries)
                    .next_attempt_epoch(Some(next_attempt_epoch))
                    .release_claim()
                    .awaiting_scope(None)
                    .reason(format!("retry {} scheduled", retries));
                match self.repo.patch_task_if(task_id, &guard, patch).await {
                    Ok(Some(requeued)) => {
                        self.emit(
                            &requeued,
                            Severity::Warning,
                            EventKind::RetryScheduled {
                                task_id: task_id.to_string(),
                                retries,
                                next_attempt_epoch,
                            },
                        )
                        .await;
                    }
                    Ok(None) => debug!(task_id, "task changed before the retry was recorded"),
                    Err(e) => warn!(task_id, error = %e, "cannot schedule retry"),
                }
            }
            RetryDecision::Exhausted { retries } => {
                let patch = TaskPatch::new()
                    .status(TaskStatus::Failed)
                    .retries(retries)
                    .next_attempt_epoch(None)
                    .release_claim()
                    .awaiting_scope(None)
                    .reason("max retries exceeded");
                match self.repo.patch_task_if(task_id, &guard, patch).await {
                    Ok(Some(failed)) => {
                        self.mark_run_failed(task_id).await;
                        error!(task_id, retries, "task failed after exhausting retries");
                        self.emit_status(
                            &failed,
                            task.status,
                            Severity::Critical,
                            Some("max retries exceeded".to_string()),
                        )
                        .await;
                    }
                    Ok(None) => debug!(task_id, "task changed before the failure was recorded"),
                    Err(e) => warn!(task_id, error = %e, "cannot mark task failed"),
                }
            }
        }
    }

    /// Guard for writes that require this worker's claim
    fn held(&self) -> TaskGuard {
        TaskGuard::new().claimed_by(self.worker_id.clone())
    }

    async fn mark_run_failed(&self, task_id: &str) {
        let run_id = run_id_for(task_id);
        if let Ok(Some(mut run)) = self.repo.get_run(&run_id).await {
            run.status = RunStatus::Failed;
            if let Err(e) = self.repo.upsert_run(&run).await {
                warn!(run_id = %run.id, error = %e, "cannot mark run failed");
            }
        }
    }

    async fn emit_status(
        &self,
        task: &TaskRecord,
        from: TaskStatus,
        severity: Severity,
        reason: Option<String>,
    ) {
        self.emit(
            task,
            severity,
            EventKind::TaskStatusChanged {
                task_id: task.id.clone(),
                from,
                to: task.status,
                reason,
            },
        )
        .await;
    }

    async fn emit(&self, task: &TaskRecord, severity: Severity, kind: EventKind) {
        let event = OrchestratorEvent::for_task(task, severity, kind);
        if let Err(e) = self.events.publish(event).await {
            warn!(task_id = %task.id, error = %e, "event publish failed");
        }
    }
}

fn waiting_guard() -> TaskGuard {
    TaskGuard::new().status(TaskStatus::WaitingApproval)
}
