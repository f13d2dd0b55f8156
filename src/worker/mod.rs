//! Worker runtime: the tick loop, retry policy and tool seam

mod orchestrator;
pub mod retry;
pub mod tool;

pub use orchestrator::{ExecutionOutcome, TaskOutcome, TickReport, Worker};
pub use retry::{RetryDecision, RetryPolicy};
pub use tool::{NoopToolExecutor, ToolExecutor, ToolInvocation};
