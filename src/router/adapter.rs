use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::errors::FactoryError;
use crate::router::request::ExecutionRequest;

/// What an execution adapter answers after accepting a dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterResponse {
    pub status: String,
    #[serde(default)]
    pub result: Option<Value>,
    pub execution_envelope_id: String,
    pub execution_run_id: String,
}

/// Downstream executor of budgeted requests.
///
/// Failures come back as `FactoryError::Adapter` with the adapter's status
/// and message; the router passes them through untouched.
#[async_trait]
pub trait ExecutionAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    async fn dispatch(&self, request: &ExecutionRequest) -> Result<AdapterResponse, FactoryError>;
}

/// Dispatches to a remote adapter host over HTTP (`POST <base_url>/executions`).
pub struct HttpExecutionAdapter {
    client: reqwest::Client,
    base_url: String,
}

impl HttpExecutionAdapter {
    pub fn new(base_url: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn executions_url(&self) -> String {
        format!("{}/executions", self.base_url)
    }
}

#[async_trait]
impl ExecutionAdapter for HttpExecutionAdapter {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn dispatch(&self, request: &ExecutionRequest) -> Result<AdapterResponse, FactoryError> {
        let url = self.executions_url();
        debug!(url = %url, build_plan_id = %request.build_plan_id, "Dispatching execution");

        let resp = self
            .client
            .post(&url)
            .header("Accept", "application/json")
            .json(request)
            .send()
            .await
            .map_err(|e| FactoryError::Adapter {
                status: 502,
                message: format!("Execution adapter unreachable: {}", e),
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(FactoryError::Adapter {
                status: status.as_u16(),
                message: adapter_error_message(&body, status.as_u16()),
            });
        }

        resp.json::<AdapterResponse>()
            .await
            .map_err(|e| FactoryError::Adapter {
                status: 502,
                message: format!("Invalid execution adapter response: {}", e),
            })
    }
}

/// Prefer the adapter's own `error`/`detail` field, else the raw body.
fn adapter_error_message(body: &str, status: u16) -> String {
    let from_json = serde_json::from_str::<Value>(body).ok().and_then(|v| {
        ["error", "detail", "message"]
            .iter()
            .find_map(|k| v.get(*k).and_then(Value::as_str).map(str::to_string))
    });
    match from_json {
        Some(message) => message,
        None if body.trim().is_empty() => format!("Execution adapter returned status {}", status),
        None => body.trim().to_string(),
    }
}
