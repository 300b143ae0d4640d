//! Dry-run decomposition preview: `agent-factory decompose`.

use anyhow::{Context, Result, bail};
use serde_json::json;
use std::path::Path;
use tracing::info;

use agent_factory::decomposition::{
    BuildSpec, Decomposition, ParallelizationStats, analyze, decompose, validate_decomposition,
};

pub fn cmd_decompose(spec_file: &Path, tech_stack: Vec<String>, as_json: bool) -> Result<()> {
    let text = std::fs::read_to_string(spec_file)
        .with_context(|| format!("Failed to read spec file: {}", spec_file.display()))?;
    let spec = BuildSpec::new(&text).with_tech_stack(tech_stack);

    let decomposition = match decompose(&spec) {
        Ok(d) => d,
        Err(e) => bail!("Decomposition failed: {}", e),
    };
    let stats = analyze(&decomposition);
    let errors = validate_decomposition(&decomposition);
    info!(
        waves = stats.total_waves,
        workstreams = stats.total_workstreams,
        "Spec decomposed"
    );

    if as_json {
        let output = json!({
            "decomposition": decomposition,
            "stats": stats,
            "validationErrors": errors,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print_summary(&decomposition, &stats, &errors);
    }

    if !errors.is_empty() {
        bail!("Decomposition has {} validation error(s)", errors.len());
    }
    Ok(())
}

fn print_summary(decomposition: &Decomposition, stats: &ParallelizationStats, errors: &[String]) {
    println!();
    println!(
        "{} workstream(s) in {} wave(s), max {} in parallel (ratio {:.2})",
        stats.total_workstreams,
        stats.total_waves,
        stats.max_parallel_in_wave,
        stats.parallelism_ratio
    );

    for wave in &decomposition.waves {
        println!();
        println!("Wave {}:", wave.index);
        for ws in &wave.workstreams {
            println!("  - {} [{}]", ws.key, ws.assigned_agent);
            if !ws.owns_files.is_empty() {
                let owns: Vec<&str> = ws.owns_files.iter().map(String::as_str).collect();
                println!("      owns: {}", owns.join(", "));
            }
            if !ws.blocked_by.is_empty() {
                let deps: Vec<&str> = ws.blocked_by.iter().map(String::as_str).collect();
                println!("      blocked by: {}", deps.join(", "));
            }
        }
    }

    if !decomposition.notes.is_empty() {
        println!();
        println!("Notes:");
        for note in &decomposition.notes {
            println!("  - {}", note);
        }
    }

    if !errors.is_empty() {
        println!();
        println!("Validation errors:");
        for error in errors {
            println!("  - {}", error);
        }
    }
    println!();
}
