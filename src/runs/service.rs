//! Run lifecycle: a three-step graph (`plan`, `continue`, `complete`) that
//! pauses for human approval between `plan` and `continue`.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::errors::FactoryError;
use crate::factory::db::DbHandle;
use crate::redaction::redact_value;
use crate::runs::models::{Run, RunEvent, RunEventType, RunStatus, now_ms};

const DEFAULT_PROMPT: &str = "demo";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateRunRequest {
    #[serde(default)]
    pub prompt: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResumeRequest {
    #[serde(default = "default_approved")]
    pub approved: bool,
    #[serde(default)]
    pub notes: Option<String>,
}

impl Default for ResumeRequest {
    fn default() -> Self {
        Self {
            approved: true,
            notes: None,
        }
    }
}

fn default_approved() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRunResponse {
    pub run_id: String,
    pub status: RunStatus,
}

pub fn approval_interrupt() -> Value {
    json!({
        "gate_type": "approval",
        "resume_schema": {"approved": "bool", "notes": "str?"},
    })
}

#[derive(Clone)]
pub struct RunService {
    db: DbHandle,
}

impl RunService {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }

    /// Start a run and execute it up to the approval interrupt.
    ///
    /// A failing step leaves the run `FAILED` with an `ERROR` event; the
    /// response still carries the run id.
    pub async fn create(&self, request: CreateRunRequest) -> Result<CreateRunResponse, FactoryError> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let now = now_ms();
        let mut run = Run {
            run_id: run_id.clone(),
            status: RunStatus::Pending,
            prompt: request.prompt.unwrap_or_else(|| DEFAULT_PROMPT.to_string()),
            thread_id: run_id.clone(),
            root_span_id: uuid::Uuid::new_v4().to_string(),
            interrupt: None,
            error: None,
            created_at_ms: now,
            updated_at_ms: now,
        };
        let stored = run.clone();
        self.db
            .call(move |db| db.create_run(&stored))
            .await
            .map_err(FactoryError::Database)?;

        run.status = RunStatus::Running;
        self.save(&run).await?;
        self.emit(&run, RunEventType::Log, json!({"msg": "run created"}))
            .await?;

        match self.plan_step(&run).await {
            Ok(()) => {
                run.status = RunStatus::WaitingApproval;
                run.interrupt = Some(approval_interrupt());
                self.save(&run).await?;
                self.emit(&run, RunEventType::InterruptRequired, approval_interrupt())
                    .await?;
                info!(run_id = %run.run_id, "Run waiting for approval");
            }
            Err(e) => self.fail(&mut run, &e).await?,
        }

        Ok(CreateRunResponse {
            run_id,
            status: run.status,
        })
    }

    pub async fn get(&self, run_id: &str) -> Result<Run, FactoryError> {
        let id = run_id.to_string();
        self.db
            .call(move |db| db.get_run(&id))
            .await
            .map_err(FactoryError::Database)?
            .ok_or_else(|| FactoryError::not_found("Run", run_id))
    }

    pub async fn events(&self, run_id: &str) -> Result<Vec<RunEvent>, FactoryError> {
        self.get(run_id).await?;
        let id = run_id.to_string();
        self.db
            .call(move |db| db.list_run_events(&id))
            .await
            .map_err(FactoryError::Database)
    }

    /// Events as newline-delimited JSON, one event per line.
    pub async fn events_ndjson(&self, run_id: &str) -> Result<String, FactoryError> {
        let mut out = String::new();
        for event in self.events(run_id).await? {
            let line = serde_json::to_string(&event).map_err(|e| FactoryError::Internal(e.into()))?;
            out.push_str(&line);
            out.push('\n');
        }
        Ok(out)
    }

    /// Continue a run past its approval interrupt and finish it.
    /// `approved = false` is recorded but does not stop the run.
    pub async fn resume(&self, run_id: &str, request: ResumeRequest) -> Result<(), FactoryError> {
        let mut run = self.get(run_id).await?;
        if run.status != RunStatus::WaitingApproval {
            return Err(FactoryError::Conflict(format!(
                "run not waiting approval: {}",
                run.status.as_str()
            )));
        }

        self.emit(
            &run,
            RunEventType::Resumed,
            json!({"approved": request.approved, "notes": request.notes}),
        )
        .await?;

        let finished = async {
            self.continue_step(&run, request.approved).await?;
            self.complete_step(&run, request.approved).await
        }
        .await;

        match finished {
            Ok(()) => {
                run.status = RunStatus::Completed;
                run.interrupt = None;
                self.save(&run).await?;
                info!(run_id = %run.run_id, approved = request.approved, "Run completed");
                Ok(())
            }
            Err(e) => {
                self.fail(&mut run, &e).await?;
                Err(e)
            }
        }
    }

    /// Cancel a run. Cancelling a cancelled run succeeds again.
    pub async fn cancel(&self, run_id: &str) -> Result<(), FactoryError> {
        let mut run = self.get(run_id).await?;
        match run.status {
            RunStatus::Completed | RunStatus::Failed => Err(FactoryError::Conflict(format!(
                "cannot cancel terminal run: {}",
                run.status.as_str()
            ))),
            RunStatus::Cancelled => Ok(()),
            _ => {
                run.status = RunStatus::Cancelled;
                self.save(&run).await?;
                self.emit(&run, RunEventType::Cancelled, json!({"msg": "cancelled"}))
                    .await?;
                info!(run_id = %run.run_id, "Run cancelled");
                Ok(())
            }
        }
    }

    async fn plan_step(&self, run: &Run) -> Result<(), FactoryError> {
        self.emit(run, RunEventType::Log, json!({"msg": "plan"})).await?;
        self.emit(run, RunEventType::StateUpdate, json!({"state": {"plan": "planned"}}))
            .await?;
        self.emit(run, RunEventType::CheckpointSaved, json!({"at": "plan"}))
            .await
    }

    async fn continue_step(&self, run: &Run, approved: bool) -> Result<(), FactoryError> {
        self.emit(run, RunEventType::Log, json!({"msg": "continue"})).await?;
        self.emit(
            run,
            RunEventType::StateUpdate,
            json!({"state": {"plan": "planned", "approved": approved}}),
        )
        .await?;
        self.emit(run, RunEventType::CheckpointSaved, json!({"at": "continue"}))
            .await
    }

    async fn complete_step(&self, run: &Run, approved: bool) -> Result<(), FactoryError> {
        self.emit(run, RunEventType::Log, json!({"msg": "complete"})).await?;
        self.emit(
            run,
            RunEventType::Completed,
            json!({"final_state": {"plan": "planned", "approved": approved}}),
        )
        .await
    }

    async fn fail(&self, run: &mut Run, error: &FactoryError) -> Result<(), FactoryError> {
        warn!(run_id = %run.run_id, error = %error, "Run step failed");
        run.status = RunStatus::Failed;
        run.error = Some(error.to_string());
        self.save(run).await?;
        self.emit(run, RunEventType::Error, json!({"error": error.to_string()}))
            .await
    }

    async fn save(&self, run: &Run) -> Result<(), FactoryError> {
        let mut run = run.clone();
        run.updated_at_ms = now_ms();
        self.db
            .call(move |db| db.update_run(&run))
            .await
            .map_err(FactoryError::Database)
    }

    /// Append one event on the run's root span. Payloads are redacted
    /// before they are stored.
    async fn emit(
        &self,
        run: &Run,
        event_type: RunEventType,
        payload: Value,
    ) -> Result<(), FactoryError> {
        let event = RunEvent {
            ts: now_ms(),
            run_id: run.run_id.clone(),
            span_id: run.root_span_id.clone(),
            parent_span_id: None,
            event_type,
            payload: redact_value(&payload),
        };
        self.db
            .call(move |db| db.append_run_event(&event))
            .await
            .map_err(FactoryError::Database)
    }
}
