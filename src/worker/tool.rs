//! Delegated tool execution seam

use async_trait::async_trait;
use serde::Serialize;

use crate::error::ToolError;

/// Context handed to the tool executor for one step
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolInvocation {
    pub task_id: String,
    pub task_type: String,
    pub run_id: String,
    pub step_id: String,
    pub step_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    pub conversation_id: String,
    pub trace_id: String,
}

impl ToolInvocation {
    pub fn tool_name(&self) -> &str {
        self.tool.as_deref().unwrap_or("generic")
    }
}

/// Runs a step's side effects. The orchestrator only sees success or failure.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, invocation: &ToolInvocation) -> Result<(), ToolError>;
}

/// Placeholder executor: records the call and succeeds
#[derive(Debug, Clone, Default)]
pub struct NoopToolExecutor;

#[async_trait]
impl ToolExecutor for NoopToolExecutor {
    async fn execute(&self, invocation: &ToolInvocation) -> Result<(), ToolError> {
        tracing::debug!(
            task_id = %invocation.task_id,
            step = %invocation.step_name,
            tool = invocation.tool_name(),
            "noop tool execution"
        );
        Ok(())
    }
}
