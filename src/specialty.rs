//! Specialty registry
//!
//! A specialty is a named, exclusive ownership domain over a set of path
//! prefixes. Its contract hash fingerprints the prefix set so a task can pin
//! the ownership configuration it was planned against.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::SpecialtyError;
use crate::models::TaskRecord;

/// An ownership domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Specialty {
    pub id: String,
    /// Owned prefixes in declaration order
    prefixes: Vec<String>,
    contract_hash: String,
}

impl Specialty {
    pub fn new<I, S>(id: impl Into<String>, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let prefixes: Vec<String> = prefixes.into_iter().map(Into::into).collect();
        let contract_hash = contract_hash(&prefixes);
        Self {
            id: id.into(),
            prefixes,
            contract_hash,
        }
    }

    pub fn prefixes(&self) -> &[String] {
        &self.prefixes
    }

    pub fn contract_hash(&self) -> &str {
        &self.contract_hash
    }

    /// True iff every non-empty path starts with an owned prefix.
    /// An empty list is vacuously allowed.
    pub fn allows<S: AsRef<str>>(&self, paths: &[S]) -> bool {
        paths
            .iter()
            .map(AsRef::as_ref)
            .filter(|p| !p.is_empty())
            .all(|p| self.prefixes.iter().any(|prefix| p.starts_with(prefix.as_str())))
    }
}

/// SHA-256 over the sorted, de-duplicated prefix set
pub fn contract_hash<S: AsRef<str>>(prefixes: &[S]) -> String {
    let sorted: BTreeSet<&str> = prefixes.iter().map(AsRef::as_ref).collect();
    let mut hasher = Sha256::new();
    for prefix in sorted {
        hasher.update(prefix.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// Why a task may not run under a worker's specialty
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpecialtyViolation {
    /// The worker's configured specialty is not in the registry
    NotFound(String),
    /// The task is assigned to a different specialty
    Mismatch { expected: String, actual: String },
    /// The task pinned a contract hash the live configuration no longer has
    ContractHashMismatch { expected: String, actual: String },
    /// A requested path lies outside the owned prefixes
    PathViolation(Vec<String>),
}

impl SpecialtyViolation {
    /// Safe, stable reason code recorded on the task
    pub fn reason(&self) -> &'static str {
        match self {
            SpecialtyViolation::NotFound(_) => "specialty not found",
            SpecialtyViolation::Mismatch { .. } => "specialty mismatch",
            SpecialtyViolation::ContractHashMismatch { .. } => "contract hash mismatch",
            SpecialtyViolation::PathViolation(_) => "path violation",
        }
    }
}

impl std::fmt::Display for SpecialtyViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpecialtyViolation::NotFound(id) => write!(f, "specialty not found: {}", id),
            SpecialtyViolation::Mismatch { expected, actual } => {
                write!(f, "specialty mismatch: worker {} task {}", expected, actual)
            }
            SpecialtyViolation::ContractHashMismatch { expected, actual } => {
                write!(f, "contract hash mismatch: live {} task {}", expected, actual)
            }
            SpecialtyViolation::PathViolation(paths) => {
                write!(f, "path violation: {} path(s) outside ownership", paths.len())
            }
        }
    }
}

/// Static catalog of specialties
#[derive(Debug, Clone, Default)]
pub struct SpecialtyRegistry {
    specialties: HashMap<String, Specialty>,
}

impl SpecialtyRegistry {
    pub fn new() -> Self {
        Self {
            specialties: HashMap::new(),
        }
    }

    /// The catalog shipped with the orchestrator
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.insert(Specialty::new("backend", ["src/api/", "src/core/", "src/store/"]));
        registry.insert(Specialty::new("frontend", ["web/", "ui/", "assets/"]));
        registry.insert(Specialty::new("infra", ["deploy/", "infra/", ".github/"]));
        registry.insert(Specialty::new("docs", ["docs/", "README.md"]));
        registry
    }

    pub fn insert(&mut self, specialty: Specialty) {
        self.specialties.insert(specialty.id.clone(), specialty);
    }

    pub fn with(mut self, specialty: Specialty) -> Self {
        self.insert(specialty);
        self
    }

    pub fn get(&self, id: &str) -> Result<&Specialty, SpecialtyError> {
        self.specialties
            .get(id)
            .ok_or_else(|| SpecialtyError::NotFound(id.to_string()))
    }

    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.specialties.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Check a task against the no-overlap contract of `worker_specialty`.
    pub fn verify_task(
        &self,
        worker_specialty: &str,
        task: &TaskRecord,
    ) -> Result<(), SpecialtyViolation> {
        let specialty = self
            .get(worker_specialty)
            .map_err(|_| SpecialtyViolation::NotFound(worker_specialty.to_string()))?;

        if let Some(actual) = task.specialty.as_deref() {
            if actual != specialty.id {
                return Err(SpecialtyViolation::Mismatch {
                    expected: specialty.id.clone(),
                    actual: actual.to_string(),
                });
            }
        }

        if let Some(pinned) = task.no_overlap_contract_hash.as_deref() {
            if pinned != specialty.contract_hash() {
                return Err(SpecialtyViolation::ContractHashMismatch {
                    expected: specialty.contract_hash().to_string(),
                    actual: pinned.to_string(),
                });
            }
        }

        if !specialty.allows(&task.requested_paths) {
            let outside = task
                .requested_paths
                .iter()
                .filter(|p| !p.is_empty() && !specialty.allows(&[p.as_str()]))
                .cloned()
                .collect();
            return Err(SpecialtyViolation::PathViolation(outside));
        }

        Ok(())
    }
}
