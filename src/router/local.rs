//! In-process execution adapter: runs a stored build's waves with local
//! agent processes.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info};

use crate::decomposition::WorkstreamStatus;
use crate::errors::FactoryError;
use crate::execution::{WaveExecutor, WorkstreamRunner, WorkstreamStatusSink};
use crate::factory::db::DbHandle;
use crate::factory::models::BuildStatus;
use crate::router::adapter::{AdapterResponse, ExecutionAdapter};
use crate::router::request::ExecutionRequest;

/// Persists workstream transitions of one build.
pub struct BuildProgressSink {
    db: DbHandle,
    build_id: i64,
}

impl BuildProgressSink {
    pub fn new(db: DbHandle, build_id: i64) -> Self {
        Self { db, build_id }
    }
}

#[async_trait]
impl WorkstreamStatusSink for BuildProgressSink {
    async fn workstream_updated(
        &self,
        key: &str,
        status: WorkstreamStatus,
        output: Option<String>,
    ) -> Result<()> {
        let build_id = self.build_id;
        let key = key.to_string();
        self.db
            .call(move |db| db.update_workstream_status(build_id, &key, status, output.as_deref()))
            .await
    }
}

/// Accepts a dispatch, marks the build `RUNNING` and executes it in the
/// background. The response only confirms acceptance.
pub struct LocalExecutionAdapter {
    db: DbHandle,
    runner: Arc<dyn WorkstreamRunner>,
}

impl LocalExecutionAdapter {
    pub fn new(db: DbHandle, runner: Arc<dyn WorkstreamRunner>) -> Self {
        Self { db, runner }
    }
}

#[async_trait]
impl ExecutionAdapter for LocalExecutionAdapter {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn dispatch(&self, request: &ExecutionRequest) -> Result<AdapterResponse, FactoryError> {
        let build_id: i64 = request.build_plan_id.parse().map_err(|_| {
            FactoryError::Validation(format!("Invalid build id: {}", request.build_plan_id))
        })?;

        let loaded = self
            .db
            .call(move |db| {
                let Some(decomposition) = db.get_build_decomposition(build_id)? else {
                    return Ok(None);
                };
                Ok(Some((db.try_start_build(build_id)?, decomposition)))
            })
            .await
            .map_err(FactoryError::Database)?;
        let Some((started, decomposition)) = loaded else {
            return Err(FactoryError::not_found("Build", build_id));
        };
        if !started {
            return Err(FactoryError::Conflict(format!(
                "Build {} is already running",
                build_id
            )));
        }

        let executor = WaveExecutor::new(&request.ceilings);
        let runner = self.runner.clone();
        let db = self.db.clone();
        let waves = decomposition.waves.len();
        tokio::spawn(async move {
            let sink = Arc::new(BuildProgressSink::new(db.clone(), build_id));
            let (final_status, error_message) =
                match executor.run(&decomposition, runner, sink).await {
                    Ok(summary) if summary.success() => (BuildStatus::Completed, None),
                    Ok(summary) => (
                        BuildStatus::Failed,
                        Some(format!(
                            "{} failed, {} skipped{}",
                            summary.failed,
                            summary.skipped,
                            if summary.timed_out { " (run deadline exceeded)" } else { "" }
                        )),
                    ),
                    Err(e) => (BuildStatus::Failed, Some(e.to_string())),
                };
            info!(build_id, status = final_status.as_str(), "Build execution finished");
            if let Err(e) = db
                .call(move |db| db.update_build_status(build_id, final_status, error_message.as_deref()))
                .await
            {
                error!(build_id, error = %e, "Failed to record build outcome");
            }
        });

        Ok(AdapterResponse {
            status: "DISPATCHED".to_string(),
            result: Some(json!({ "buildId": build_id, "waves": waves })),
            execution_envelope_id: uuid::Uuid::new_v4().to_string(),
            execution_run_id: format!("build-{}-{}", build_id, uuid::Uuid::new_v4()),
        })
    }
}
