//! Lifecycle events
//!
//! Every transition the worker makes is published as a typed event. Publishing
//! is best-effort: the worker logs and drops any [`EventError`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::EventError;
use crate::models::{TaskRecord, TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

/// Event payloads, one variant per kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// A worker won the claim on a task
    TaskClaimed { task_id: String, worker_id: String },
    TaskStatusChanged {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    RunSpawned { run_id: String, task_id: String },
    ApprovalRequested {
        approval_id: String,
        task_id: String,
        scope: String,
        policy_id: String,
    },
    StepRunning {
        run_id: String,
        step_id: String,
        name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool: Option<String>,
    },
    StepSucceeded {
        run_id: String,
        step_id: String,
        name: String,
    },
    StepFailed {
        run_id: String,
        step_id: String,
        name: String,
        error: String,
    },
    RetryScheduled {
        task_id: String,
        retries: u32,
        next_attempt_epoch: i64,
    },
    /// Specialty or ownership contract violation
    PolicyViolation { task_id: String, reason: String },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::TaskClaimed { .. } => "task_claimed",
            EventKind::TaskStatusChanged { .. } => "task_status_changed",
            EventKind::RunSpawned { .. } => "run_spawned",
            EventKind::ApprovalRequested { .. } => "approval_requested",
            EventKind::StepRunning { .. } => "step_running",
            EventKind::StepSucceeded { .. } => "step_succeeded",
            EventKind::StepFailed { .. } => "step_failed",
            EventKind::RetryScheduled { .. } => "retry_scheduled",
            EventKind::PolicyViolation { .. } => "policy_violation",
        }
    }
}

/// A published lifecycle event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorEvent {
    pub conversation_id: String,
    pub trace_id: String,
    pub severity: Severity,
    #[serde(flatten)]
    pub kind: EventKind,
    pub at: DateTime<Utc>,
}

impl OrchestratorEvent {
    pub fn new(
        conversation_id: impl Into<String>,
        trace_id: impl Into<String>,
        severity: Severity,
        kind: EventKind,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            trace_id: trace_id.into(),
            severity,
            kind,
            at: Utc::now(),
        }
    }

    /// Event correlated to a task's conversation and trace
    pub fn for_task(task: &TaskRecord, severity: Severity, kind: EventKind) -> Self {
        Self::new(&task.conversation_id, &task.trace_id, severity, kind)
    }
}

/// Fire-and-forget event sink
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: OrchestratorEvent) -> Result<(), EventError>;
}

/// Fans events out to in-process subscribers
pub struct BroadcastPublisher {
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(capacity);
        Self { event_tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl EventPublisher for BroadcastPublisher {
    async fn publish(&self, event: OrchestratorEvent) -> Result<(), EventError> {
        // No subscribers is not a failure
        let _ = self.event_tx.send(event);
        Ok(())
    }
}

/// Renders events as structured log lines
#[derive(Debug, Clone, Default)]
pub struct TracingPublisher;

#[async_trait]
impl EventPublisher for TracingPublisher {
    async fn publish(&self, event: OrchestratorEvent) -> Result<(), EventError> {
        let payload =
            serde_json::to_string(&event.kind).map_err(|e| EventError::Publish(e.to_string()))?;
        match event.severity {
            Severity::Critical => tracing::error!(
                event = event.kind.name(),
                conversation_id = %event.conversation_id,
                trace_id = %event.trace_id,
                %payload,
                "orchestrator event"
            ),
            Severity::Warning => tracing::warn!(
                event = event.kind.name(),
                conversation_id = %event.conversation_id,
                trace_id = %event.trace_id,
                %payload,
                "orchestrator event"
            ),
            Severity::Info => tracing::info!(
                event = event.kind.name(),
                conversation_id = %event.conversation_id,
                trace_id = %event.trace_id,
                %payload,
                "orchestrator event"
            ),
        }
        Ok(())
    }
}
