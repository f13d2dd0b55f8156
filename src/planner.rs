//! Step planner
//!
//! Maps a task type to its ordered, declarative step plan.

use serde::{Deserialize, Serialize};

/// A declared unit of delegated work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDef {
    pub name: String,
    /// Delegated tool identifier; `None` for the generic fallback step
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    /// Gate this step behind its own `"{type}:{name}"` approval scope
    pub requires_approval: bool,
    /// 1-based position
    pub order: u32,
}

/// (name, tool, step-level approval)
type StaticStep = (&'static str, Option<&'static str>, bool);

const PLANS: &[(&str, &[StaticStep])] = &[
    ("query", &[("read", Some("graph.read"), false)]),
    (
        "summarize",
        &[
            ("read", Some("graph.read"), false),
            ("summarize", Some("llm.summarize"), false),
        ],
    ),
    (
        "report",
        &[
            ("collect", Some("graph.read"), false),
            ("render", Some("report.render"), false),
        ],
    ),
    (
        "index",
        &[
            ("scan", Some("repo.scan"), false),
            ("publish", Some("index.publish"), true),
        ],
    ),
    (
        "deploy",
        &[
            ("validate", Some("deploy.validate"), false),
            ("push", Some("deploy.push"), true),
        ],
    ),
    (
        "rollback",
        &[
            ("snapshot", Some("deploy.snapshot"), false),
            ("revert", Some("deploy.revert"), true),
        ],
    ),
    (
        "canary",
        &[
            ("validate", Some("deploy.validate"), false),
            ("release", Some("deploy.canary"), true),
            ("observe", Some("metrics.observe"), false),
        ],
    ),
    (
        "promote",
        &[
            ("verify", Some("deploy.verify"), false),
            ("promote", Some("deploy.promote"), true),
        ],
    ),
];

const GENERIC_STEP: &str = "execute";

/// Ordered plan for a task type. Unknown types get one generic step with no tool.
pub fn plan(task_type: &str) -> Vec<StepDef> {
    match PLANS.iter().find(|(t, _)| *t == task_type) {
        Some((_, steps)) => steps
            .iter()
            .enumerate()
            .map(|(i, (name, tool, gated))| StepDef {
                name: (*name).to_string(),
                tool: tool.map(str::to_string),
                requires_approval: *gated,
                order: i as u32 + 1,
            })
            .collect(),
        None => vec![StepDef {
            name: GENERIC_STEP.to_string(),
            tool: None,
            requires_approval: false,
            order: 1,
        }],
    }
}

/// Scope string for a step-level approval gate
pub fn step_scope(task_type: &str, step_name: &str) -> String {
    format!("{}:{}", task_type, step_name)
}

pub fn known_types() -> impl Iterator<Item = &'static str> {
    PLANS.iter().map(|(t, _)| *t)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_is_single_read_step() {
        let steps = plan("query");
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].name, "read");
        assert_eq!(steps[0].tool.as_deref(), Some("graph.read"));
        assert!(!steps[0].requires_approval);
        assert_eq!(steps[0].order, 1);
    }

    #[test]
    fn test_deploy_is_validate_then_gated_push() {
        let steps = plan("deploy");
        let names: Vec<_> = steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["validate", "push"]);
        assert!(!steps[0].requires_approval);
        assert!(steps[1].requires_approval);
        assert_eq!(steps[1].order, 2);
    }

    #[test]
    fn test_unknown_type_gets_generic_step() {
        let steps = plan("teleport");
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].name, "execute");
        assert!(steps[0].tool.is_none());
        assert!(!steps[0].requires_approval);
    }

    #[test]
    fn test_plan_is_deterministic_and_owned() {
        let mut first = plan("canary");
        let second = plan("canary");
        assert_eq!(first, second);

        first[0].name = "tampered".to_string();
        assert_eq!(plan("canary"), second);
    }

    #[test]
    fn test_orders_are_contiguous() {
        for t in known_types() {
            let steps = plan(t);
            for (i, step) in steps.iter().enumerate() {
                assert_eq!(step.order, i as u32 + 1, "{}:{}", t, step.name);
            }
        }
    }

    #[test]
    fn test_safe_types_have_no_gated_steps() {
        for t in crate::policy::SAFE_TYPES {
            assert!(
                plan(t).iter().all(|s| !s.requires_approval),
                "{} declares a gated step",
                t
            );
        }
    }

    #[test]
    fn test_index_publish_is_gated() {
        let steps = plan("index");
        assert!(!steps[0].requires_approval);
        assert!(steps[1].requires_approval);
        assert!(!crate::policy::is_safe("index"));
    }

    #[test]
    fn test_step_scope_format() {
        assert_eq!(step_scope("deploy", "push"), "deploy:push");
    }
}
