//! Wave executor: runs a decomposition wave by wave.
//!
//! Waves run strictly in order. Inside a wave at most
//! `min(max_agents, wave size)` workstreams run at once. A failing
//! workstream never cancels its siblings; once the wave has been awaited,
//! everything that transitively depends on a failure is skipped.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::decomposition::{Decomposition, DependencyGraph, Workstream, WorkstreamStatus};
use crate::execution::runner::WorkstreamRunner;
use crate::router::BudgetCeilings;

/// Receives workstream status transitions as they happen.
#[async_trait]
pub trait WorkstreamStatusSink: Send + Sync {
    async fn workstream_updated(
        &self,
        key: &str,
        status: WorkstreamStatus,
        output: Option<String>,
    ) -> Result<()>;
}

/// Sink that drops every update.
pub struct NoopStatusSink;

#[async_trait]
impl WorkstreamStatusSink for NoopStatusSink {
    async fn workstream_updated(
        &self,
        _key: &str,
        _status: WorkstreamStatus,
        _output: Option<String>,
    ) -> Result<()> {
        Ok(())
    }
}

/// Final state of one workstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkstreamResult {
    pub key: String,
    pub wave: u32,
    pub status: WorkstreamStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl WorkstreamResult {
    fn skipped(ws: &Workstream, reason: &str) -> Self {
        Self {
            key: ws.key.clone(),
            wave: ws.wave,
            status: WorkstreamStatus::Skipped,
            output: None,
            error: Some(reason.to_string()),
            duration_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaveRunSummary {
    /// Results in decomposition order.
    pub results: Vec<WorkstreamResult>,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    /// The overall run deadline passed before every wave ran.
    pub timed_out: bool,
    pub duration_ms: u64,
}

impl WaveRunSummary {
    pub fn success(&self) -> bool {
        self.failed == 0 && self.skipped == 0
    }

    pub fn get(&self, key: &str) -> Option<&WorkstreamResult> {
        self.results.iter().find(|r| r.key == key)
    }
}

/// Runs waves of workstreams under budget ceilings.
#[derive(Debug, Clone)]
pub struct WaveExecutor {
    max_agents: usize,
    workstream_timeout: Duration,
    run_timeout: Duration,
}

impl WaveExecutor {
    /// Executor bounded by the given ceilings: `max_agents` caps wave
    /// concurrency, `max_runtime_sec` bounds each workstream and the run.
    pub fn new(ceilings: &BudgetCeilings) -> Self {
        let runtime = Duration::from_secs(ceilings.max_runtime_sec);
        Self {
            max_agents: ceilings.max_agents.max(1) as usize,
            workstream_timeout: runtime,
            run_timeout: runtime,
        }
    }

    pub fn with_workstream_timeout(mut self, timeout: Duration) -> Self {
        self.workstream_timeout = timeout;
        self
    }

    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = timeout;
        self
    }

    /// Run every wave of the decomposition.
    ///
    /// Fails only if the decomposition's dependency graph is invalid; agent
    /// failures are reported in the summary.
    pub async fn run(
        &self,
        decomposition: &Decomposition,
        runner: Arc<dyn WorkstreamRunner>,
        sink: Arc<dyn WorkstreamStatusSink>,
    ) -> Result<WaveRunSummary> {
        let started = Instant::now();
        let deadline = started + self.run_timeout;
        let graph = DependencyGraph::build(
            decomposition
                .workstreams()
                .map(|ws| (ws.key.clone(), ws.blocked_by.clone())),
        )?;

        let mut results: HashMap<String, WorkstreamResult> = HashMap::new();
        let mut blocked: HashSet<String> = HashSet::new();
        let mut timed_out = false;

        for wave in &decomposition.waves {
            let mut to_run = Vec::new();
            for ws in &wave.workstreams {
                if blocked.contains(&ws.key) {
                    let result = WorkstreamResult::skipped(ws, "dependency failed");
                    notify(sink.as_ref(), &result).await;
                    results.insert(ws.key.clone(), result);
                } else if Instant::now() >= deadline {
                    timed_out = true;
                    let result = WorkstreamResult::skipped(ws, "run deadline exceeded");
                    notify(sink.as_ref(), &result).await;
                    results.insert(ws.key.clone(), result);
                } else {
                    to_run.push(ws.clone());
                }
            }
            if to_run.is_empty() {
                continue;
            }

            let concurrency = self.max_agents.min(to_run.len());
            info!(
                wave = wave.index,
                workstreams = to_run.len(),
                concurrency,
                "Starting wave"
            );

            let semaphore = Arc::new(Semaphore::new(concurrency));
            let mut set = JoinSet::new();
            for ws in &to_run {
                let ws = ws.clone();
                let semaphore = semaphore.clone();
                let runner = runner.clone();
                let sink = sink.clone();
                let workstream_timeout = self.workstream_timeout;
                set.spawn(async move {
                    let _permit = semaphore.acquire_owned().await;
                    run_one(&ws, runner.as_ref(), sink.as_ref(), workstream_timeout, deadline)
                        .await
                });
            }

            let mut wave_results = Vec::with_capacity(to_run.len());
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok(result) => wave_results.push(result),
                    Err(e) => warn!(error = %e, "Workstream task panicked"),
                }
            }
            for ws in &to_run {
                if !wave_results.iter().any(|r| r.key == ws.key) {
                    let result = WorkstreamResult {
                        key: ws.key.clone(),
                        wave: ws.wave,
                        status: WorkstreamStatus::Failed,
                        output: None,
                        error: Some("workstream task panicked".to_string()),
                        duration_ms: 0,
                    };
                    notify(sink.as_ref(), &result).await;
                    wave_results.push(result);
                }
            }

            for result in wave_results {
                if result.status == WorkstreamStatus::Failed
                    && let Some(idx) = graph.index_of(&result.key)
                {
                    for dependent in graph.transitive_dependents(idx) {
                        if let Some(key) = graph.key(dependent) {
                            blocked.insert(key.to_string());
                        }
                    }
                }
                results.insert(result.key.clone(), result);
            }
        }

        let mut summary = WaveRunSummary {
            timed_out,
            duration_ms: started.elapsed().as_millis() as u64,
            ..Default::default()
        };
        for ws in decomposition.workstreams() {
            if let Some(result) = results.remove(&ws.key) {
                match result.status {
                    WorkstreamStatus::Completed => summary.completed += 1,
                    WorkstreamStatus::Failed => summary.failed += 1,
                    WorkstreamStatus::Skipped => summary.skipped += 1,
                    _ => {}
                }
                summary.results.push(result);
            }
        }

        info!(
            completed = summary.completed,
            failed = summary.failed,
            skipped = summary.skipped,
            timed_out = summary.timed_out,
            "Wave run finished"
        );
        Ok(summary)
    }
}

async fn run_one(
    ws: &Workstream,
    runner: &dyn WorkstreamRunner,
    sink: &dyn WorkstreamStatusSink,
    workstream_timeout: Duration,
    deadline: Instant,
) -> WorkstreamResult {
    let started = Instant::now();
    if let Err(e) = sink
        .workstream_updated(&ws.key, WorkstreamStatus::Running, None)
        .await
    {
        warn!(workstream = %ws.key, error = %e, "Failed to record workstream status");
    }

    let limit = workstream_timeout.min(deadline.saturating_duration_since(started));
    let (status, output, error) = match tokio::time::timeout(limit, runner.run(ws)).await {
        Ok(Ok(output)) => (WorkstreamStatus::Completed, Some(output), None),
        Ok(Err(e)) => (WorkstreamStatus::Failed, None, Some(format!("{:#}", e))),
        Err(_) => (
            WorkstreamStatus::Failed,
            None,
            Some(format!("timed out after {}ms", limit.as_millis())),
        ),
    };
    if let Some(error) = &error {
        warn!(workstream = %ws.key, error = %error, "Workstream failed");
    }

    let result = WorkstreamResult {
        key: ws.key.clone(),
        wave: ws.wave,
        status,
        output,
        error,
        duration_ms: started.elapsed().as_millis() as u64,
    };
    notify(sink, &result).await;
    result
}

async fn notify(sink: &dyn WorkstreamStatusSink, result: &WorkstreamResult) {
    let output = result.output.clone().or_else(|| result.error.clone());
    if let Err(e) = sink
        .workstream_updated(&result.key, result.status, output)
        .await
    {
        warn!(workstream = %result.key, error = %e, "Failed to record workstream status");
    }
}
