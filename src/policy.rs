//! Approval policy table
//!
//! Maps a task type to whether it needs a human decision before any step runs.
//! Types missing from both lists are treated as dangerous.

pub const DANGEROUS_OPS_POLICY: &str = "policy.dangerous_ops.v1";
pub const SAFE_OPS_POLICY: &str = "policy.safe_ops.v1";

/// Task types that always require approval
pub const DANGEROUS_TYPES: &[&str] = &["deploy", "rollback", "canary", "promote"];

/// Task types that never require task-level approval
pub const SAFE_TYPES: &[&str] = &["query", "summarize", "report"];

pub fn is_safe(task_type: &str) -> bool {
    SAFE_TYPES.contains(&task_type)
}

pub fn is_dangerous(task_type: &str) -> bool {
    DANGEROUS_TYPES.contains(&task_type)
}

/// Whether a task of this type must be approved before execution.
pub fn requires_approval(task_type: &str) -> bool {
    !is_safe(task_type)
}

/// Whether the task-level approval also opens the type's step-level gates.
/// Only an approval under the dangerous-ops policy for a listed type does;
/// a fail-closed approval for an unlisted type opens the task gate alone.
pub fn approval_covers_steps(task_type: &str) -> bool {
    is_dangerous(task_type)
}

/// The policy governing this task type.
pub fn policy_id(task_type: &str) -> &'static str {
    if is_safe(task_type) {
        SAFE_OPS_POLICY
    } else {
        DANGEROUS_OPS_POLICY
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dangerous_types_require_approval() {
        for t in DANGEROUS_TYPES {
            assert!(requires_approval(t), "{} should require approval", t);
            assert_eq!(policy_id(t), DANGEROUS_OPS_POLICY);
        }
    }

    #[test]
    fn test_safe_types_skip_approval() {
        for t in SAFE_TYPES {
            assert!(!requires_approval(t), "{} should not require approval", t);
            assert_eq!(policy_id(t), SAFE_OPS_POLICY);
        }
    }

    #[test]
    fn test_unknown_type_fails_closed() {
        assert!(requires_approval("format_disk"));
        assert!(requires_approval(""));
        assert_eq!(policy_id("format_disk"), DANGEROUS_OPS_POLICY);
    }

    #[test]
    fn test_only_listed_dangerous_approval_covers_steps() {
        for t in DANGEROUS_TYPES {
            assert!(approval_covers_steps(t));
        }
        assert!(!approval_covers_steps("index"));
        assert!(!approval_covers_steps("query"));
        assert!(requires_approval("index"));
    }

    #[test]
    fn test_sets_are_disjoint() {
        for t in DANGEROUS_TYPES {
            assert!(!is_safe(t));
        }
        for t in SAFE_TYPES {
            assert!(!is_dangerous(t));
        }
    }

    #[test]
    fn test_matching_is_exact() {
        assert!(requires_approval("Query"));
        assert!(requires_approval("query "));
    }
}
