//! Turns a build spec into workstreams layered into dependency waves.

use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use crate::decomposition::graph::DependencyGraph;
use crate::decomposition::parser::{RawWorkstream, parse_workstreams};
use crate::decomposition::types::{BuildSpec, Decomposition, Workstream};
use crate::errors::DecompositionError;

const FRONTEND_FRAMEWORKS: &[&str] = &[
    "react", "next", "vue", "nuxt", "svelte", "angular", "solid",
];
const FRONTEND_EXTENSIONS: &[&str] = &[".tsx", ".jsx", ".vue", ".svelte", ".css"];

/// Decompose a build spec into waves of workstreams.
///
/// Every workstream lands in a wave strictly after all of its dependencies,
/// and workstreams sharing a wave never own the same file. When ownership
/// would collide the later workstream is pushed back one wave at a time and
/// the move is recorded in [`Decomposition::notes`].
pub fn decompose(spec: &BuildSpec) -> Result<Decomposition, DecompositionError> {
    let raw = parse_workstreams(&spec.text)?;
    let graph = DependencyGraph::build(
        raw.iter()
            .map(|ws| (ws.key.clone(), ws.blocked_by.clone())),
    )?;
    let order = graph.topological_order()?;

    let mut waves: Vec<u32> = vec![0; raw.len()];
    let mut owned_in_wave: HashMap<u32, BTreeSet<String>> = HashMap::new();
    let mut notes = Vec::new();

    for idx in order {
        let ws = &raw[idx];
        let base = graph
            .dependencies(idx)
            .iter()
            .map(|&dep| waves[dep] + 1)
            .max()
            .unwrap_or(0);

        let owns: BTreeSet<String> = ws.owns.iter().cloned().collect();
        let mut wave = base;
        while owned_in_wave
            .get(&wave)
            .is_some_and(|taken| !taken.is_disjoint(&owns))
        {
            wave += 1;
        }
        if wave != base {
            notes.push(format!(
                "Workstream '{}' moved from wave {} to wave {} to avoid a file ownership collision",
                ws.key, base, wave
            ));
        }

        owned_in_wave.entry(wave).or_default().extend(owns);
        waves[idx] = wave;
    }

    let workstreams: Vec<Workstream> = raw
        .iter()
        .zip(&waves)
        .map(|(ws, &wave)| build_workstream(ws, wave, &spec.tech_stack))
        .collect();

    let mut decomposition = Decomposition::from_workstreams(workstreams);
    decomposition.tech_stack = spec.tech_stack.clone();
    decomposition.notes = notes;

    debug!(
        workstreams = decomposition.workstream_count(),
        waves = decomposition.waves.len(),
        "Decomposed build spec"
    );
    Ok(decomposition)
}

fn build_workstream(raw: &RawWorkstream, wave: u32, tech_stack: &[String]) -> Workstream {
    let agent = raw
        .agent
        .clone()
        .unwrap_or_else(|| infer_agent(&raw.name, &raw.owns, tech_stack));
    Workstream::new(&raw.key, &raw.name, &agent)
        .with_wave(wave)
        .with_owns(raw.owns.iter().cloned())
        .with_produces(raw.produces.iter().cloned())
        .with_blocked_by(raw.blocked_by.iter().cloned())
}

/// Pick an agent from keywords in the workstream name.
///
/// Falls back to `frontend` when the stack names a frontend framework and
/// the workstream owns frontend sources, otherwise `coder`.
pub fn infer_agent(name: &str, owns: &[String], tech_stack: &[String]) -> String {
    let lower = name.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    let has_word = |w: &str| words.contains(&w);

    let agent = if lower.contains("test") {
        "tester"
    } else if has_word("ui") || lower.contains("frontend") {
        "frontend"
    } else if has_word("api") || has_word("db") || lower.contains("backend") || lower.contains("database") {
        "backend"
    } else if lower.contains("doc") {
        "writer"
    } else if lower.contains("integrat") {
        "integrator"
    } else if has_frontend_stack(tech_stack)
        && owns
            .iter()
            .any(|f| FRONTEND_EXTENSIONS.iter().any(|ext| f.ends_with(ext)))
    {
        "frontend"
    } else {
        "coder"
    };
    agent.to_string()
}

fn has_frontend_stack(tech_stack: &[String]) -> bool {
    tech_stack.iter().any(|t| {
        let t = t.to_lowercase();
        FRONTEND_FRAMEWORKS.iter().any(|f| t.contains(f))
    })
}
