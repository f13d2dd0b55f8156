//! Data models for tasks, approvals, runs and steps

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Lifecycle status of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Eligible for claiming (or claimed but not yet running)
    Queued,
    /// Suspended until an approval decision is recorded
    WaitingApproval,
    Running,
    Done,
    Failed,
    /// Set externally; stops further progress
    Canceled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::WaitingApproval => "waiting_approval",
            TaskStatus::Running => "running",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
            TaskStatus::Canceled => "canceled",
        }
    }

    /// Check if this is a terminal status
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Done | TaskStatus::Failed | TaskStatus::Canceled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(TaskStatus::Queued),
            "waiting_approval" => Ok(TaskStatus::WaitingApproval),
            "running" => Ok(TaskStatus::Running),
            "done" => Ok(TaskStatus::Done),
            "failed" => Ok(TaskStatus::Failed),
            "canceled" => Ok(TaskStatus::Canceled),
            _ => Err(format!("Invalid task status: {}", s)),
        }
    }
}

/// Priority level for tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low = 0,
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl Default for TaskPriority {
    fn default() -> Self {
        TaskPriority::Normal
    }
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Low => "low",
            TaskPriority::Normal => "normal",
            TaskPriority::High => "high",
            TaskPriority::Critical => "critical",
        }
    }

    /// Numeric rank, higher runs first
    pub fn rank(&self) -> i64 {
        *self as i64
    }
}

impl std::str::FromStr for TaskPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(TaskPriority::Low),
            "normal" => Ok(TaskPriority::Normal),
            "high" => Ok(TaskPriority::High),
            "critical" => Ok(TaskPriority::Critical),
            _ => Err(format!("Invalid task priority: {}", s)),
        }
    }
}

/// Status of an approval decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    None,
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::None => "none",
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
            ApprovalStatus::Expired => "expired",
        }
    }

    /// Rejected and expired decisions end the task; they are never retried.
    pub fn is_denial(&self) -> bool {
        matches!(self, ApprovalStatus::Rejected | ApprovalStatus::Expired)
    }
}

impl std::str::FromStr for ApprovalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(ApprovalStatus::None),
            "pending" => Ok(ApprovalStatus::Pending),
            "approved" => Ok(ApprovalStatus::Approved),
            "rejected" => Ok(ApprovalStatus::Rejected),
            "expired" => Ok(ApprovalStatus::Expired),
            _ => Err(format!("Invalid approval status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    /// Stopped at an approval gate; resumes under the same run id
    Suspended,
    Done,
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Suspended => "suspended",
            RunStatus::Done => "done",
            RunStatus::Failed => "failed",
            RunStatus::Canceled => "canceled",
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "suspended" => Ok(RunStatus::Suspended),
            "done" => Ok(RunStatus::Done),
            "failed" => Ok(RunStatus::Failed),
            "canceled" => Ok(RunStatus::Canceled),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Success,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Running => "running",
            StepStatus::Success => "success",
            StepStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(StepStatus::Running),
            "success" => Ok(StepStatus::Success),
            "failed" => Ok(StepStatus::Failed),
            _ => Err(format!("Invalid step status: {}", s)),
        }
    }
}

/// A unit of requested work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub status: TaskStatus,
    /// Key into the policy table and step planner
    pub task_type: String,
    pub priority: TaskPriority,
    pub requester: String,
    pub conversation_id: String,
    pub trace_id: String,
    /// Hash of the redacted payload; the raw payload is never stored
    pub payload_hash: String,
    /// Human-safe reason for the current status
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_attempt_epoch: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub specialty: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub no_overlap_contract_hash: Option<String>,
    pub requested_paths: Vec<String>,
    /// Approval scope the task is suspended on, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub awaiting_scope: Option<String>,
}

impl TaskRecord {
    pub fn is_claimed(&self) -> bool {
        self.claimed_by.as_deref().is_some_and(|w| !w.is_empty())
    }

    /// The approval scope to consult while waiting
    pub fn approval_scope(&self) -> &str {
        self.awaiting_scope.as_deref().unwrap_or(&self.task_type)
    }
}

/// Request to create a new task
#[derive(Debug, Clone)]
pub struct NewTask {
    pub id: String,
    pub task_type: String,
    pub priority: TaskPriority,
    pub requester: String,
    pub conversation_id: String,
    pub trace_id: String,
    pub payload_hash: String,
    pub reason: Option<String>,
    pub specialty: Option<String>,
    pub no_overlap_contract_hash: Option<String>,
    pub requested_paths: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl NewTask {
    pub fn new(task_type: impl Into<String>) -> Self {
        Self {
            id: format!("task-{}", Uuid::new_v4()),
            task_type: task_type.into(),
            priority: TaskPriority::Normal,
            requester: "system".to_string(),
            conversation_id: Uuid::new_v4().to_string(),
            trace_id: Uuid::new_v4().to_string(),
            payload_hash: payload_hash(&serde_json::Value::Null),
            reason: None,
            specialty: None,
            no_overlap_contract_hash: None,
            requested_paths: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_requester(mut self, requester: impl Into<String>) -> Self {
        self.requester = requester.into();
        self
    }

    pub fn with_conversation(
        mut self,
        conversation_id: impl Into<String>,
        trace_id: impl Into<String>,
    ) -> Self {
        self.conversation_id = conversation_id.into();
        self.trace_id = trace_id.into();
        self
    }

    /// Record only the hash of the payload
    pub fn with_payload(mut self, payload: &serde_json::Value) -> Self {
        self.payload_hash = payload_hash(payload);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_specialty(mut self, specialty: impl Into<String>) -> Self {
        self.specialty = Some(specialty.into());
        self
    }

    pub fn with_contract_hash(mut self, hash: impl Into<String>) -> Self {
        self.no_overlap_contract_hash = Some(hash.into());
        self
    }

    pub fn with_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requested_paths = paths.into_iter().map(Into::into).collect();
        self
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self
    }

    pub fn into_record(self) -> TaskRecord {
        TaskRecord {
            id: self.id,
            status: TaskStatus::Queued,
            task_type: self.task_type,
            priority: self.priority,
            requester: self.requester,
            conversation_id: self.conversation_id,
            trace_id: self.trace_id,
            payload_hash: self.payload_hash,
            reason: self.reason,
            retries: 0,
            next_attempt_epoch: None,
            created_at: self.created_at,
            updated_at: self.created_at,
            specialty: self.specialty,
            claimed_by: None,
            claimed_at: None,
            no_overlap_contract_hash: self.no_overlap_contract_hash,
            requested_paths: self.requested_paths,
            awaiting_scope: None,
        }
    }
}

/// Partial update for a task. Outer `None` leaves a field untouched;
/// `Some(None)` clears a nullable field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub reason: Option<Option<String>>,
    pub retries: Option<u32>,
    pub next_attempt_epoch: Option<Option<i64>>,
    pub claimed_by: Option<Option<String>>,
    pub claimed_at: Option<Option<DateTime<Utc>>>,
    pub awaiting_scope: Option<Option<String>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl TaskPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(Some(reason.into()));
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn next_attempt_epoch(mut self, epoch: Option<i64>) -> Self {
        self.next_attempt_epoch = Some(epoch);
        self
    }

    /// Clear claimed-by and claimed-at
    pub fn release_claim(mut self) -> Self {
        self.claimed_by = Some(None);
        self.claimed_at = Some(None);
        self
    }

    pub fn awaiting_scope(mut self, scope: Option<String>) -> Self {
        self.awaiting_scope = Some(scope);
        self
    }

    pub fn updated_at(mut self, at: DateTime<Utc>) -> Self {
        self.updated_at = Some(at);
        self
    }

    /// Merge into a record, stamping `updated_at` when the caller did not.
    pub fn apply_to(&self, task: &mut TaskRecord) {
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(reason) = &self.reason {
            task.reason = reason.clone();
        }
        if let Some(retries) = self.retries {
            task.retries = retries;
        }
        if let Some(epoch) = self.next_attempt_epoch {
            task.next_attempt_epoch = epoch;
        }
        if let Some(claimed_by) = &self.claimed_by {
            task.claimed_by = claimed_by.clone();
        }
        if let Some(claimed_at) = self.claimed_at {
            task.claimed_at = claimed_at;
        }
        if let Some(scope) = &self.awaiting_scope {
            task.awaiting_scope = scope.clone();
        }
        task.updated_at = self.updated_at.unwrap_or_else(Utc::now);
    }
}

/// Precondition for a conditional task update. Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskGuard {
    pub status: Option<TaskStatus>,
    /// `Some(None)` requires an unclaimed task
    pub claimed_by: Option<Option<String>>,
}

impl TaskGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn claimed_by(mut self, worker_id: impl Into<String>) -> Self {
        self.claimed_by = Some(Some(worker_id.into()));
        self
    }

    pub fn unclaimed(mut self) -> Self {
        self.claimed_by = Some(None);
        self
    }

    pub fn matches(&self, task: &TaskRecord) -> bool {
        if self.status.is_some_and(|status| status != task.status) {
            return false;
        }
        match &self.claimed_by {
            None => true,
            Some(None) => !task.is_claimed(),
            Some(Some(worker_id)) => task.claimed_by.as_deref() == Some(worker_id.as_str()),
        }
    }
}

/// An authorization decision for a task or a task step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub id: String,
    pub task_id: String,
    pub status: ApprovalStatus,
    pub policy_id: String,
    /// Task type, or `"{type}:{step}"` for step-scoped gates
    pub scope: String,
    pub requested_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ApprovalRecord {
    pub fn pending(
        task_id: impl Into<String>,
        scope: impl Into<String>,
        policy_id: impl Into<String>,
    ) -> Self {
        Self {
            id: format!("approval-{}", Uuid::new_v4()),
            task_id: task_id.into(),
            status: ApprovalStatus::Pending,
            policy_id: policy_id.into(),
            scope: scope.into(),
            requested_at: Utc::now(),
            resolved_at: None,
        }
    }

    /// Record a decision. Only a pending approval can be resolved.
    pub fn resolve(&mut self, status: ApprovalStatus) -> Result<(), String> {
        if self.status != ApprovalStatus::Pending {
            return Err(format!(
                "Cannot resolve approval with status: {}",
                self.status.as_str()
            ));
        }
        if matches!(status, ApprovalStatus::Pending | ApprovalStatus::None) {
            return Err(format!(
                "Cannot resolve approval to status: {}",
                status.as_str()
            ));
        }
        self.status = status;
        self.resolved_at = Some(Utc::now());
        Ok(())
    }
}

/// One execution attempt of a task's step plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub task_id: String,
    pub task_type: String,
    pub conversation_id: String,
    pub trace_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub specialty: Option<String>,
    pub status: RunStatus,
}

impl RunRecord {
    pub fn for_task(task: &TaskRecord) -> Self {
        Self {
            id: run_id_for(&task.id),
            task_id: task.id.clone(),
            task_type: task.task_type.clone(),
            conversation_id: task.conversation_id.clone(),
            trace_id: task.trace_id.clone(),
            specialty: task.specialty.clone(),
            status: RunStatus::Running,
        }
    }
}

/// One planned unit of work inside a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub id: String,
    pub run_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    /// 1-based position in the plan
    pub order: u32,
    pub status: StepStatus,
}

impl StepRecord {
    pub fn new(run_id: &str, order: u32, name: &str, tool: Option<&str>) -> Self {
        Self {
            id: step_id_for(run_id, order, name),
            run_id: run_id.to_string(),
            name: name.to_string(),
            tool: tool.map(str::to_string),
            order,
            status: StepStatus::Running,
        }
    }

    pub fn with_status(mut self, status: StepStatus) -> Self {
        self.status = status;
        self
    }
}

fn short_digest(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(digest)[..24].to_string()
}

/// Content-addressed run id; the same task always yields the same run.
pub fn run_id_for(task_id: &str) -> String {
    format!("run-{}", short_digest(&format!("run:{}", task_id)))
}

pub fn step_id_for(run_id: &str, order: u32, name: &str) -> String {
    format!("step-{}", short_digest(&format!("{}:{}:{}", run_id, order, name)))
}

/// SHA-256 over the serialized payload
pub fn payload_hash(payload: &serde_json::Value) -> String {
    let bytes = serde_json::to_vec(payload).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_task() -> TaskRecord {
        NewTask::new("query").with_id("t-1").into_record()
    }

    #[test]
    fn test_task_status_as_str() {
        assert_eq!(TaskStatus::Queued.as_str(), "queued");
        assert_eq!(TaskStatus::WaitingApproval.as_str(), "waiting_approval");
        assert_eq!(TaskStatus::Running.as_str(), "running");
        assert_eq!(TaskStatus::Done.as_str(), "done");
        assert_eq!(TaskStatus::Failed.as_str(), "failed");
        assert_eq!(TaskStatus::Canceled.as_str(), "canceled");
    }

    #[test]
    fn test_task_status_from_str() {
        assert_eq!("queued".parse::<TaskStatus>().unwrap(), TaskStatus::Queued);
        assert_eq!(
            "waiting_approval".parse::<TaskStatus>().unwrap(),
            TaskStatus::WaitingApproval
        );
        assert!("paused".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_task_status_is_terminal() {
        assert!(!TaskStatus::Queued.is_terminal());
        assert!(!TaskStatus::WaitingApproval.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Done.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Canceled.is_terminal());
    }

    #[test]
    fn test_task_priority_ordering() {
        assert!(TaskPriority::Low < TaskPriority::Normal);
        assert!(TaskPriority::Normal < TaskPriority::High);
        assert!(TaskPriority::High < TaskPriority::Critical);
        assert_eq!(TaskPriority::Critical.rank(), 3);
        assert_eq!(TaskPriority::default(), TaskPriority::Normal);
    }

    #[test]
    fn test_approval_status_round_trip() {
        for status in [
            ApprovalStatus::None,
            ApprovalStatus::Pending,
            ApprovalStatus::Approved,
            ApprovalStatus::Rejected,
            ApprovalStatus::Expired,
        ] {
            assert_eq!(status.as_str().parse::<ApprovalStatus>().unwrap(), status);
        }
        assert!(ApprovalStatus::Rejected.is_denial());
        assert!(ApprovalStatus::Expired.is_denial());
        assert!(!ApprovalStatus::Pending.is_denial());
    }

    #[test]
    fn test_new_task_into_record() {
        let task = NewTask::new("deploy")
            .with_id("t-9")
            .with_priority(TaskPriority::High)
            .with_specialty("infra")
            .with_paths(["deploy/prod.yaml"])
            .into_record();

        assert_eq!(task.id, "t-9");
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.priority, TaskPriority::High);
        assert_eq!(task.specialty.as_deref(), Some("infra"));
        assert_eq!(task.requested_paths, vec!["deploy/prod.yaml".to_string()]);
        assert_eq!(task.retries, 0);
        assert!(!task.is_claimed());
        assert_eq!(task.created_at, task.updated_at);
    }

    #[test]
    fn test_payload_is_hashed_not_stored() {
        let payload = serde_json::json!({"secret": "hunter2"});
        let task = NewTask::new("query").with_payload(&payload).into_record();
        assert_eq!(task.payload_hash.len(), 64);
        let json = serde_json::to_string(&task).unwrap();
        assert!(!json.contains("hunter2"));
        assert_eq!(task.payload_hash, payload_hash(&payload));
    }

    #[test]
    fn test_patch_apply_sets_and_clears() {
        let mut task = make_task();
        task.claimed_by = Some("w-1".to_string());
        task.claimed_at = Some(Utc::now());

        let patch = TaskPatch::new()
            .status(TaskStatus::WaitingApproval)
            .release_claim()
            .awaiting_scope(Some("deploy".to_string()));
        patch.apply_to(&mut task);

        assert_eq!(task.status, TaskStatus::WaitingApproval);
        assert!(task.claimed_by.is_none());
        assert!(task.claimed_at.is_none());
        assert_eq!(task.awaiting_scope.as_deref(), Some("deploy"));
    }

    #[test]
    fn test_patch_leaves_untouched_fields() {
        let mut task = make_task();
        task.next_attempt_epoch = Some(42);
        TaskPatch::new().retries(2).apply_to(&mut task);
        assert_eq!(task.retries, 2);
        assert_eq!(task.next_attempt_epoch, Some(42));
        assert_eq!(task.status, TaskStatus::Queued);
    }

    #[test]
    fn test_guard_matches_status_and_claimant() {
        let mut task = make_task();
        assert!(TaskGuard::new().matches(&task));
        assert!(TaskGuard::new().status(TaskStatus::Queued).unclaimed().matches(&task));
        assert!(!TaskGuard::new().claimed_by("w-1").matches(&task));

        task.claimed_by = Some(String::new());
        assert!(TaskGuard::new().unclaimed().matches(&task));

        task.claimed_by = Some("w-2".to_string());
        task.status = TaskStatus::Running;
        assert!(!TaskGuard::new().unclaimed().matches(&task));
        assert!(!TaskGuard::new().claimed_by("w-1").matches(&task));
        assert!(!TaskGuard::new().status(TaskStatus::Queued).claimed_by("w-2").matches(&task));
        assert!(TaskGuard::new().status(TaskStatus::Running).claimed_by("w-2").matches(&task));
    }

    #[test]
    fn test_patch_stamps_updated_at() {
        let mut task = make_task();
        let before = task.updated_at;
        std::thread::sleep(std::time::Duration::from_millis(2));
        TaskPatch::new().reason("x").apply_to(&mut task);
        assert!(task.updated_at > before);

        let fixed = Utc::now() - chrono::Duration::hours(1);
        TaskPatch::new().updated_at(fixed).apply_to(&mut task);
        assert_eq!(task.updated_at, fixed);
    }

    #[test]
    fn test_approval_scope_defaults_to_type() {
        let mut task = make_task();
        assert_eq!(task.approval_scope(), "query");
        task.awaiting_scope = Some("query:read".to_string());
        assert_eq!(task.approval_scope(), "query:read");
    }

    #[test]
    fn test_approval_resolve() {
        let mut approval = ApprovalRecord::pending("t-1", "deploy", "policy.dangerous_ops.v1");
        assert!(approval.resolve(ApprovalStatus::Approved).is_ok());
        assert_eq!(approval.status, ApprovalStatus::Approved);
        assert!(approval.resolved_at.is_some());

        // A decision is final
        assert!(approval.resolve(ApprovalStatus::Rejected).is_err());
    }

    #[test]
    fn test_approval_resolve_rejects_pending_target() {
        let mut approval = ApprovalRecord::pending("t-1", "deploy", "p");
        assert!(approval.resolve(ApprovalStatus::Pending).is_err());
        assert!(approval.resolve(ApprovalStatus::None).is_err());
    }

    #[test]
    fn test_run_id_is_deterministic() {
        assert_eq!(run_id_for("t-1"), run_id_for("t-1"));
        assert_ne!(run_id_for("t-1"), run_id_for("t-2"));
        assert!(run_id_for("t-1").starts_with("run-"));

        let run = RunRecord::for_task(&make_task());
        assert_eq!(run.id, run_id_for("t-1"));
        assert_eq!(run.status, RunStatus::Running);
    }

    #[test]
    fn test_step_id_depends_on_order_and_name() {
        let run_id = run_id_for("t-1");
        let a = step_id_for(&run_id, 1, "validate");
        assert_eq!(a, step_id_for(&run_id, 1, "validate"));
        assert_ne!(a, step_id_for(&run_id, 2, "validate"));
        assert_ne!(a, step_id_for(&run_id, 1, "push"));

        let step = StepRecord::new(&run_id, 1, "validate", Some("deploy.validate"));
        assert_eq!(step.id, a);
        assert_eq!(step.status, StepStatus::Running);
    }

    #[test]
    fn test_task_serialization() {
        let task = make_task();
        let json = serde_json::to_string(&task).unwrap();
        assert!(json.contains("\"status\":\"queued\""));
        assert!(json.contains("\"priority\":\"normal\""));
        assert!(!json.contains("claimed_by"));
    }
}
