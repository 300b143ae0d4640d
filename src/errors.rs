//! Typed error hierarchy for the Agent Factory core.
//!
//! Two top-level enums cover the two failure domains:
//! - `DecompositionError`: a build spec that cannot be turned into waves
//! - `FactoryError`: everything surfaced at the request boundary
//!
//! Each `FactoryError` variant carries the HTTP-style status the route layer
//! answers with (see [`FactoryError::status_code`]).

use thiserror::Error;

use crate::drafts::DraftPlan;

/// Errors from turning a free-text spec into a decomposition.
#[derive(Debug, Error, PartialEq)]
pub enum DecompositionError {
    #[error("Spec is empty")]
    EmptySpec,

    #[error("Spec contains no actionable workstreams")]
    NoWorkstreams,

    #[error("Failed to parse workstreams block: {0}")]
    MalformedBlock(String),

    #[error("Duplicate workstream key: {0}")]
    DuplicateKey(String),

    #[error("Workstream '{workstream}' is blocked by unknown workstream '{dependency}'")]
    UnknownDependency {
        workstream: String,
        dependency: String,
    },

    #[error("Dependency cycle detected among workstreams: {}", .0.join(", "))]
    Cycle(Vec<String>),
}

/// Errors surfaced by the core to the request boundary.
#[derive(Debug, Error)]
pub enum FactoryError {
    #[error("{0}")]
    Validation(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("{0}")]
    Precondition(String),

    /// The target is in a state that forbids the transition.
    #[error("{0}")]
    Conflict(String),

    #[error("{message}")]
    Gate {
        message: String,
        plan: Box<DraftPlan>,
    },

    #[error("Budget exceeded: {}", .violations.join("; "))]
    BudgetExceeded { violations: Vec<String> },

    #[error("{message}")]
    Adapter { status: u16, message: String },

    #[error("Missing or invalid user identity")]
    Unauthorized,

    #[error("Stream limit reached: {0}")]
    StreamLimit(String),

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl FactoryError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// HTTP-equivalent status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) | Self::Precondition(_) => 400,
            Self::Unauthorized => 401,
            Self::Gate { .. } => 403,
            Self::NotFound { .. } => 404,
            Self::Conflict(_) => 409,
            Self::BudgetExceeded { .. } => 422,
            Self::StreamLimit(_) => 429,
            Self::Adapter { status, .. } => *status,
            Self::Database(_) | Self::Internal(_) => 500,
        }
    }

    /// Whether the message is safe to show to the caller verbatim.
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Internal(_))
    }
}

impl From<DecompositionError> for FactoryError {
    fn from(err: DecompositionError) -> Self {
        Self::Validation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drafts::{DraftChecks, DraftPlan};

    #[test]
    fn decomposition_cycle_lists_keys() {
        let err = DecompositionError::Cycle(vec!["api".into(), "db".into()]);
        assert_eq!(
            err.to_string(),
            "Dependency cycle detected among workstreams: api, db"
        );
    }

    #[test]
    fn decomposition_error_converts_to_validation() {
        let err: FactoryError = DecompositionError::NoWorkstreams.into();
        assert!(matches!(err, FactoryError::Validation(_)));
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn not_found_carries_entity_and_id() {
        let err = FactoryError::not_found("Draft", 42);
        assert_eq!(err.to_string(), "Draft 42 not found");
        assert_eq!(err.status_code(), 404);
    }

    #[test]
    fn gate_error_is_forbidden_and_keeps_plan() {
        let plan = DraftPlan {
            operations: Vec::new(),
            checks: DraftChecks {
                council_required: true,
                council_satisfied: false,
            },
        };
        let err = FactoryError::Gate {
            message: "Council approval required".into(),
            plan: Box::new(plan),
        };
        assert_eq!(err.status_code(), 403);
        match &err {
            FactoryError::Gate { plan, .. } => assert!(!plan.checks.council_satisfied),
            _ => panic!("Expected Gate"),
        }
    }

    #[test]
    fn adapter_error_passes_status_through() {
        let err = FactoryError::Adapter {
            status: 503,
            message: "adapter offline".into(),
        };
        assert_eq!(err.status_code(), 503);
        assert_eq!(err.to_string(), "adapter offline");
    }

    #[test]
    fn budget_exceeded_joins_violations() {
        let err = FactoryError::BudgetExceeded {
            violations: vec!["cost 15.00 > 10.00".into(), "agents 5 > 4".into()],
        };
        assert!(err.to_string().contains("cost 15.00 > 10.00; agents 5 > 4"));
    }

    #[test]
    fn internal_errors_are_flagged() {
        let err: FactoryError = anyhow::anyhow!("disk on fire").into();
        assert!(err.is_internal());
        assert_eq!(err.status_code(), 500);
        assert!(!FactoryError::Unauthorized.is_internal());
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&DecompositionError::EmptySpec);
        assert_std_error(&FactoryError::StreamLimit("x".into()));
    }
}
