//! Overseer - polling task orchestrator with approval gates

pub mod config;
pub mod error;
pub mod events;
pub mod models;
pub mod planner;
pub mod policy;
pub mod specialty;
pub mod store;
pub mod worker;

pub use error::{OrchestratorError, Result};
pub use worker::{TickReport, Worker};
