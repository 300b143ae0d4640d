use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Audit event type written once per successful approval.
pub const APPROVED_EVENT: &str = "APPROVED";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DraftKind {
    WorkOrder,
    MemoryItem,
    GithubIssue,
    GithubPullRequest,
}

impl DraftKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorkOrder => "WORK_ORDER",
            Self::MemoryItem => "MEMORY_ITEM",
            Self::GithubIssue => "GITHUB_ISSUE",
            Self::GithubPullRequest => "GITHUB_PULL_REQUEST",
        }
    }
}

impl FromStr for DraftKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "WORK_ORDER" => Ok(Self::WorkOrder),
            "MEMORY_ITEM" => Ok(Self::MemoryItem),
            "GITHUB_ISSUE" => Ok(Self::GithubIssue),
            "GITHUB_PULL_REQUEST" => Ok(Self::GithubPullRequest),
            _ => Err(format!("Invalid draft kind: {}", s)),
        }
    }
}

/// `DRAFT -> APPROVED`; approval is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DraftStatus {
    Draft,
    Approved,
}

impl DraftStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "DRAFT",
            Self::Approved => "APPROVED",
        }
    }
}

impl FromStr for DraftStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DRAFT" => Ok(Self::Draft),
            "APPROVED" => Ok(Self::Approved),
            _ => Err(format!("Invalid draft status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CopilotDraft {
    pub id: i64,
    pub kind: DraftKind,
    pub payload_json: Value,
    pub project_id: i64,
    pub sources_json: Value,
    pub status: DraftStatus,
    pub result_ref: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl CopilotDraft {
    /// String field from the payload, trimmed, if present and non-empty.
    pub fn payload_str(&self, field: &str) -> Option<&str> {
        self.payload_json
            .get(field)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// One side effect an approval would perform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedOperation {
    pub op: String,
    pub model: String,
    pub summary: String,
}

impl PlannedOperation {
    pub fn new(op: &str, model: &str, summary: String) -> Self {
        Self {
            op: op.to_string(),
            model: model.to_string(),
            summary,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftChecks {
    pub council_required: bool,
    pub council_satisfied: bool,
}

/// Ephemeral, recomputed per preview or approval attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftPlan {
    pub operations: Vec<PlannedOperation>,
    pub checks: DraftChecks,
}

impl DraftPlan {
    /// The Council gate refuses this plan.
    pub fn is_gated(&self) -> bool {
        self.checks.council_required && !self.checks.council_satisfied
    }
}

/// Append-only audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CopilotDraftEvent {
    pub id: i64,
    pub draft_id: i64,
    pub event_type: String,
    pub actor_user_id: String,
    pub details_json: Value,
    pub created_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_round_trip() {
        for kind in [
            DraftKind::WorkOrder,
            DraftKind::MemoryItem,
            DraftKind::GithubIssue,
            DraftKind::GithubPullRequest,
        ] {
            assert_eq!(kind.as_str().parse::<DraftKind>(), Ok(kind));
            assert_eq!(serde_json::to_value(kind).unwrap(), kind.as_str());
        }
        assert!("ISSUE".parse::<DraftKind>().is_err());
    }

    #[test]
    fn test_plan_gated() {
        let mut plan = DraftPlan {
            operations: vec![],
            checks: DraftChecks {
                council_required: true,
                council_satisfied: false,
            },
        };
        assert!(plan.is_gated());
        plan.checks.council_satisfied = true;
        assert!(!plan.is_gated());
    }

    #[test]
    fn test_plan_serializes_camel_case_checks() {
        let plan = DraftPlan {
            operations: vec![PlannedOperation::new("create", "WorkOrder", "x".into())],
            checks: DraftChecks {
                council_required: false,
                council_satisfied: false,
            },
        };
        let json = serde_json::to_value(&plan).unwrap();
        assert_eq!(json["checks"]["councilSatisfied"], false);
        assert_eq!(json["operations"][0]["model"], "WorkOrder");
    }

    #[test]
    fn test_payload_str() {
        let draft = CopilotDraft {
            id: 1,
            kind: DraftKind::WorkOrder,
            payload_json: json!({"title": "  Fix login  ", "empty": "", "n": 3}),
            project_id: 1,
            sources_json: json!([]),
            status: DraftStatus::Draft,
            result_ref: None,
            created_at: String::new(),
            updated_at: String::new(),
        };
        assert_eq!(draft.payload_str("title"), Some("Fix login"));
        assert_eq!(draft.payload_str("empty"), None);
        assert_eq!(draft.payload_str("n"), None);
    }
}
