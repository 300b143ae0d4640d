//! Strict-schema execution requests.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::FactoryError;
use crate::router::budget::BudgetCeilings;

/// Fields an execution body may carry. Anything else is rejected.
pub const ALLOWED_FIELDS: &[&str] = &["buildPlanId", "sessionId"];

/// A validated execution body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionBody {
    pub build_plan_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Parse an execution body against the allow-list.
///
/// Extra fields are a hard rejection, never silently dropped.
pub fn parse_execution_body(body: &Value) -> Result<ExecutionBody, FactoryError> {
    let Some(object) = body.as_object() else {
        return Err(FactoryError::Validation(
            "Request body must be a JSON object".to_string(),
        ));
    };

    let mut extra: Vec<&str> = object
        .keys()
        .map(String::as_str)
        .filter(|k| !ALLOWED_FIELDS.contains(k))
        .collect();
    if !extra.is_empty() {
        extra.sort_unstable();
        return Err(FactoryError::Validation(format!(
            "Extra fields not allowed: {}",
            extra.join(", ")
        )));
    }

    let build_plan_id = match object.get("buildPlanId") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.trim().to_string()),
        Some(_) => {
            return Err(FactoryError::Validation(
                "buildPlanId must be a string".to_string(),
            ));
        }
    };
    let build_plan_id = build_plan_id
        .filter(|s| !s.is_empty())
        .ok_or_else(|| FactoryError::Validation("buildPlanId is required".to_string()))?;

    let session_id = match object.get("sessionId") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => {
            return Err(FactoryError::Validation(
                "sessionId must be a string".to_string(),
            ));
        }
    };

    Ok(ExecutionBody {
        build_plan_id,
        session_id,
    })
}

/// A budgeted request to run agent work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    pub build_plan_id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub ceilings: BudgetCeilings,
}

impl ExecutionRequest {
    pub fn new(body: ExecutionBody, user_id: &str, ceilings: BudgetCeilings) -> Self {
        Self {
            build_plan_id: body.build_plan_id,
            user_id: user_id.to_string(),
            session_id: body.session_id,
            ceilings,
        }
    }
}
