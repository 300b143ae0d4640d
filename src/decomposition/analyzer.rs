//! Concurrency statistics for a decomposition.

use serde::{Deserialize, Serialize};

use crate::decomposition::types::Decomposition;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParallelizationStats {
    pub total_waves: usize,
    pub max_parallel_in_wave: usize,
    pub total_workstreams: usize,
    pub wave_sizes: Vec<usize>,
    /// Average workstreams per wave; 0.0 when there are no waves.
    pub parallelism_ratio: f64,
}

/// Compute parallelization statistics. Empty waves are not counted.
pub fn analyze(decomposition: &Decomposition) -> ParallelizationStats {
    let wave_sizes: Vec<usize> = decomposition
        .waves
        .iter()
        .map(|w| w.workstreams.len())
        .filter(|&n| n > 0)
        .collect();

    let total_waves = wave_sizes.len();
    let total_workstreams: usize = wave_sizes.iter().sum();
    let parallelism_ratio = if total_waves == 0 {
        0.0
    } else {
        total_workstreams as f64 / total_waves as f64
    };

    ParallelizationStats {
        total_waves,
        max_parallel_in_wave: wave_sizes.iter().copied().max().unwrap_or(0),
        total_workstreams,
        wave_sizes,
        parallelism_ratio,
    }
}
