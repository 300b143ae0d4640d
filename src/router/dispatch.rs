//! Budget-gated execution router.
//!
//! State machine per request:
//! `RECEIVED -> VALIDATED -> DISPATCHED -> {COMPLETED | FAILED | BUDGET_EXCEEDED}`.
//! The budget check happens before dispatch; a violation never reaches the
//! adapter.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::decomposition::ParallelizationStats;
use crate::errors::FactoryError;
use crate::router::adapter::ExecutionAdapter;
use crate::router::budget::{BudgetCeilings, CostModel, ExecutionEstimate, check_budget};
use crate::router::request::ExecutionRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionState {
    Received,
    Validated,
    Dispatched,
    Completed,
    Failed,
    BudgetExceeded,
}

impl ExecutionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "RECEIVED",
            Self::Validated => "VALIDATED",
            Self::Dispatched => "DISPATCHED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::BudgetExceeded => "BUDGET_EXCEEDED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::BudgetExceeded)
    }
}

impl FromStr for ExecutionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RECEIVED" => Ok(Self::Received),
            "VALIDATED" => Ok(Self::Validated),
            "DISPATCHED" => Ok(Self::Dispatched),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "BUDGET_EXCEEDED" => Ok(Self::BudgetExceeded),
            _ => Err(format!("Invalid execution state: {}", s)),
        }
    }
}

/// Bounded result of routing one request. Always carries the ceilings that
/// applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionEnvelope {
    pub state: ExecutionState,
    /// Every state the request passed through, in order.
    pub history: Vec<ExecutionState>,
    pub build_plan_id: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub ceilings: BudgetCeilings,
    pub estimate: ExecutionEstimate,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adapter_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub execution_envelope_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<String>,
}

impl ExecutionEnvelope {
    fn received(request: &ExecutionRequest, estimate: ExecutionEstimate) -> Self {
        Self {
            state: ExecutionState::Received,
            history: vec![ExecutionState::Received],
            build_plan_id: request.build_plan_id.clone(),
            user_id: request.user_id.clone(),
            session_id: request.session_id.clone(),
            ceilings: request.ceilings,
            estimate,
            adapter_status: None,
            result: None,
            error: None,
            status_code: None,
            execution_envelope_id: uuid::Uuid::new_v4().to_string(),
            execution_run_id: None,
            violations: Vec::new(),
        }
    }

    fn transition(&mut self, state: ExecutionState) {
        self.state = state;
        self.history.push(state);
    }
}

/// Routes validated requests through the budget gate to an adapter.
pub struct ExecutionRouter {
    adapter: Arc<dyn ExecutionAdapter>,
    cost_model: CostModel,
}

impl ExecutionRouter {
    pub fn new(adapter: Arc<dyn ExecutionAdapter>, cost_model: CostModel) -> Self {
        Self {
            adapter,
            cost_model,
        }
    }

    pub fn adapter_name(&self) -> &'static str {
        self.adapter.name()
    }

    /// Route one request. Never retries; adapter failures are returned in
    /// the envelope with the adapter's status and message.
    pub async fn route(
        &self,
        request: &ExecutionRequest,
        stats: &ParallelizationStats,
    ) -> ExecutionEnvelope {
        let estimate = ExecutionEstimate::from_stats(stats, &self.cost_model);
        let mut envelope = ExecutionEnvelope::received(request, estimate);

        if let Some(problem) = invalid_ceilings(&request.ceilings) {
            envelope.transition(ExecutionState::Failed);
            envelope.error = Some(problem);
            envelope.status_code = Some(400);
            return envelope;
        }
        envelope.transition(ExecutionState::Validated);

        let violations = check_budget(&estimate, &request.ceilings);
        if !violations.is_empty() {
            warn!(
                build_plan_id = %request.build_plan_id,
                violations = ?violations,
                "Execution refused: budget exceeded"
            );
            envelope.transition(ExecutionState::BudgetExceeded);
            envelope.error = Some(
                FactoryError::BudgetExceeded {
                    violations: violations.clone(),
                }
                .to_string(),
            );
            envelope.violations = violations;
            return envelope;
        }

        envelope.transition(ExecutionState::Dispatched);
        info!(
            build_plan_id = %request.build_plan_id,
            adapter = self.adapter.name(),
            cost_usd = estimate.cost_usd,
            agents = estimate.agents,
            "Dispatching execution"
        );

        match self.adapter.dispatch(request).await {
            Ok(resp) => {
                envelope.transition(ExecutionState::Completed);
                envelope.adapter_status = Some(resp.status);
                envelope.result = resp.result;
                envelope.execution_envelope_id = resp.execution_envelope_id;
                envelope.execution_run_id = Some(resp.execution_run_id);
            }
            Err(e) => {
                error!(
                    build_plan_id = %request.build_plan_id,
                    error = %e,
                    "Execution adapter failed"
                );
                envelope.transition(ExecutionState::Failed);
                envelope.status_code = Some(e.status_code());
                envelope.error = Some(if e.is_internal() {
                    "Internal server error".to_string()
                } else {
                    e.to_string()
                });
            }
        }
        envelope
    }
}

fn invalid_ceilings(ceilings: &BudgetCeilings) -> Option<String> {
    if !(ceilings.max_cost_usd.is_finite() && ceilings.max_cost_usd > 0.0) {
        return Some("maxCostUSD must be a positive number".to_string());
    }
    if ceilings.max_agents == 0 {
        return Some("maxAgents must be at least 1".to_string());
    }
    if ceilings.max_runtime_sec == 0 {
        return Some("maxRuntimeSec must be at least 1".to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::adapter::AdapterResponse;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockAdapter {
        calls: AtomicUsize,
        fail_with: Option<(u16, String)>,
    }

    impl MockAdapter {
        fn ok() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_with: None,
            }
        }

        fn failing(status: u16, message: &str) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_with: Some((status, message.to_string())),
            }
        }
    }

    #[async_trait]
    impl ExecutionAdapter for MockAdapter {
        fn name(&self) -> &'static str {
            "mock"
        }

        async fn dispatch(
            &self,
            request: &ExecutionRequest,
        ) -> Result<AdapterResponse, FactoryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some((status, message)) = &self.fail_with {
                return Err(FactoryError::Adapter {
                    status: *status,
                    message: message.clone(),
                });
            }
            Ok(AdapterResponse {
                status: "DISPATCHED".into(),
                result: Some(serde_json::json!({"build": request.build_plan_id})),
                execution_envelope_id: "env-1".into(),
                execution_run_id: "run-1".into(),
            })
        }
    }

    fn request(ceilings: BudgetCeilings) -> ExecutionRequest {
        ExecutionRequest {
            build_plan_id: "build-1".into(),
            user_id: "user-1".into(),
            session_id: Some("sess".into()),
            ceilings,
        }
    }

    /// 10 workstreams at $1.50 over 2 waves, widest wave 2 = $15 estimate.
    fn stats() -> ParallelizationStats {
        ParallelizationStats {
            total_waves: 2,
            max_parallel_in_wave: 2,
            total_workstreams: 10,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_budget_exceeded_never_calls_adapter() {
        let adapter = Arc::new(MockAdapter::ok());
        let router = ExecutionRouter::new(adapter.clone(), CostModel::default());
        let envelope = router
            .route(&request(BudgetCeilings::default().with_max_cost_usd(10.0)), &stats())
            .await;

        assert_eq!(envelope.state, ExecutionState::BudgetExceeded);
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 0);
        assert_eq!(envelope.violations.len(), 1);
        assert!((envelope.estimate.cost_usd - 15.0).abs() < 1e-9);
        assert!((envelope.ceilings.max_cost_usd - 10.0).abs() < 1e-9);
        assert_eq!(
            envelope.history,
            vec![
                ExecutionState::Received,
                ExecutionState::Validated,
                ExecutionState::BudgetExceeded
            ]
        );
    }

    #[tokio::test]
    async fn test_within_budget_dispatches() {
        let adapter = Arc::new(MockAdapter::ok());
        let router = ExecutionRouter::new(adapter.clone(), CostModel::default());
        let envelope = router.route(&request(BudgetCeilings::default()), &stats()).await;

        assert_eq!(envelope.state, ExecutionState::Completed);
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);
        assert_eq!(envelope.adapter_status.as_deref(), Some("DISPATCHED"));
        assert_eq!(envelope.execution_envelope_id, "env-1");
        assert_eq!(envelope.execution_run_id.as_deref(), Some("run-1"));
        assert_eq!(envelope.session_id.as_deref(), Some("sess"));
        assert!(envelope.history.contains(&ExecutionState::Dispatched));
    }

    #[tokio::test]
    async fn test_adapter_failure_passed_through() {
        let adapter = Arc::new(MockAdapter::failing(503, "adapter host offline"));
        let router = ExecutionRouter::new(adapter.clone(), CostModel::default());
        let envelope = router.route(&request(BudgetCeilings::default()), &stats()).await;

        assert_eq!(envelope.state, ExecutionState::Failed);
        assert_eq!(envelope.status_code, Some(503));
        assert_eq!(envelope.error.as_deref(), Some("adapter host offline"));
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_ceiling_fails_without_dispatch() {
        let adapter = Arc::new(MockAdapter::ok());
        let router = ExecutionRouter::new(adapter.clone(), CostModel::default());
        let envelope = router
            .route(&request(BudgetCeilings::default().with_max_agents(0)), &stats())
            .await;
        assert_eq!(envelope.state, ExecutionState::Failed);
        assert_eq!(envelope.status_code, Some(400));
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_state_strings() {
        assert_eq!(ExecutionState::BudgetExceeded.as_str(), "BUDGET_EXCEEDED");
        assert_eq!(
            "BUDGET_EXCEEDED".parse::<ExecutionState>(),
            Ok(ExecutionState::BudgetExceeded)
        );
        assert!(ExecutionState::Failed.is_terminal());
        assert!(!ExecutionState::Dispatched.is_terminal());
        // Schema violations are answered with 400 and never become an execution.
        assert!("REJECTED".parse::<ExecutionState>().is_err());
        let json = serde_json::to_value(ExecutionState::BudgetExceeded).unwrap();
        assert_eq!(json, "BUDGET_EXCEEDED");
    }
}
