//! Budget ceilings and the pre-dispatch budget check.

use serde::{Deserialize, Serialize};

use crate::decomposition::ParallelizationStats;

/// Hard limits copied into every dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetCeilings {
    #[serde(rename = "maxCostUSD")]
    pub max_cost_usd: f64,
    pub max_agents: u32,
    pub max_runtime_sec: u64,
}

impl Default for BudgetCeilings {
    fn default() -> Self {
        Self {
            max_cost_usd: 25.0,
            max_agents: 4,
            max_runtime_sec: 1800,
        }
    }
}

impl BudgetCeilings {
    pub fn with_max_cost_usd(mut self, max: f64) -> Self {
        self.max_cost_usd = max;
        self
    }

    pub fn with_max_agents(mut self, max: u32) -> Self {
        self.max_agents = max;
        self
    }

    pub fn with_max_runtime_sec(mut self, max: u64) -> Self {
        self.max_runtime_sec = max;
        self
    }
}

/// Linear cost model used to estimate a build before dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostModel {
    pub cost_per_workstream_usd: f64,
    pub runtime_per_wave_sec: u64,
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            cost_per_workstream_usd: 1.5,
            runtime_per_wave_sec: 300,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionEstimate {
    #[serde(rename = "costUSD")]
    pub cost_usd: f64,
    pub agents: u32,
    pub runtime_sec: u64,
}

impl ExecutionEstimate {
    /// Estimate from parallelization stats: cost per workstream, runtime per
    /// wave, one agent per workstream of the widest wave.
    pub fn from_stats(stats: &ParallelizationStats, model: &CostModel) -> Self {
        Self {
            cost_usd: stats.total_workstreams as f64 * model.cost_per_workstream_usd,
            agents: u32::try_from(stats.max_parallel_in_wave).unwrap_or(u32::MAX),
            runtime_sec: stats.total_waves as u64 * model.runtime_per_wave_sec,
        }
    }
}

/// Compare an estimate against the ceilings.
///
/// Returns every violated ceiling; an empty list means the request fits.
pub fn check_budget(estimate: &ExecutionEstimate, ceilings: &BudgetCeilings) -> Vec<String> {
    let mut violations = Vec::new();
    if estimate.cost_usd > ceilings.max_cost_usd {
        violations.push(format!(
            "estimated cost ${:.2} exceeds maxCostUSD ${:.2}",
            estimate.cost_usd, ceilings.max_cost_usd
        ));
    }
    if estimate.agents > ceilings.max_agents {
        violations.push(format!(
            "agent count {} exceeds maxAgents {}",
            estimate.agents, ceilings.max_agents
        ));
    }
    if estimate.runtime_sec > ceilings.max_runtime_sec {
        violations.push(format!(
            "estimated runtime {}s exceeds maxRuntimeSec {}s",
            estimate.runtime_sec, ceilings.max_runtime_sec
        ));
    }
    violations
}
