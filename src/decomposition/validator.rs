//! Safety checks for a decomposition before it is executed.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::decomposition::graph::DependencyGraph;
use crate::decomposition::types::Decomposition;
use crate::errors::DecompositionError;

/// Validate a decomposition.
///
/// Returns a list of human-readable problems; an empty list means the
/// decomposition is safe to execute wave by wave.
pub fn validate_decomposition(decomposition: &Decomposition) -> Vec<String> {
    let mut errors = Vec::new();

    // Wave each key is grouped under (first occurrence wins).
    let mut grouped_wave: HashMap<&str, u32> = HashMap::new();
    for wave in &decomposition.waves {
        for ws in &wave.workstreams {
            if grouped_wave.contains_key(ws.key.as_str()) {
                errors.push(DecompositionError::DuplicateKey(ws.key.clone()).to_string());
            } else {
                grouped_wave.insert(ws.key.as_str(), wave.index);
            }
        }
    }

    for ws in decomposition.workstreams() {
        for dep in &ws.blocked_by {
            if !grouped_wave.contains_key(dep.as_str()) {
                errors.push(
                    DecompositionError::UnknownDependency {
                        workstream: ws.key.clone(),
                        dependency: dep.clone(),
                    }
                    .to_string(),
                );
            }
        }
    }

    if let Some(cycle) = find_cycle(decomposition, &grouped_wave) {
        errors.push(cycle.to_string());
    }

    for wave in &decomposition.waves {
        for ws in &wave.workstreams {
            for dep in &ws.blocked_by {
                if let Some(&dep_wave) = grouped_wave.get(dep.as_str())
                    && dep_wave >= wave.index
                {
                    errors.push(format!(
                        "Workstream '{}' in wave {} depends on '{}' in wave {}; dependencies must be in an earlier wave",
                        ws.key, wave.index, dep, dep_wave
                    ));
                }
            }
        }
    }

    for wave in &decomposition.waves {
        let mut owners: BTreeMap<&str, &str> = BTreeMap::new();
        for ws in &wave.workstreams {
            for file in &ws.owns_files {
                match owners.get(file.as_str()) {
                    Some(&owner) if owner != ws.key => errors.push(format!(
                        "File '{}' is owned by both '{}' and '{}' in wave {}",
                        file, owner, ws.key, wave.index
                    )),
                    Some(_) => {}
                    None => {
                        owners.insert(file.as_str(), ws.key.as_str());
                    }
                }
            }
        }
    }

    for wave in &decomposition.waves {
        for ws in &wave.workstreams {
            if ws.wave != wave.index {
                errors.push(format!(
                    "Workstream '{}' records wave {} but is grouped under wave {}",
                    ws.key, ws.wave, wave.index
                ));
            }
        }
    }

    errors
}

/// Cycle check over known keys only; unknown references are reported
/// separately.
fn find_cycle(
    decomposition: &Decomposition,
    known: &HashMap<&str, u32>,
) -> Option<DecompositionError> {
    let mut seen = HashSet::new();
    let nodes: Vec<(String, Vec<String>)> = decomposition
        .workstreams()
        .filter(|ws| seen.insert(ws.key.as_str()))
        .map(|ws| {
            let deps = ws
                .blocked_by
                .iter()
                .filter(|d| known.contains_key(d.as_str()))
                .cloned()
                .collect();
            (ws.key.clone(), deps)
        })
        .collect();

    match DependencyGraph::build(nodes) {
        Err(err @ DecompositionError::Cycle(_)) => Some(err),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decomposition::types::{Wave, Workstream};

    fn ws(key: &str, wave: u32, owns: &[&str], deps: &[&str]) -> Workstream {
        Workstream::new(key, key, "coder")
            .with_wave(wave)
            .with_owns(owns.iter().copied())
            .with_blocked_by(deps.iter().copied())
    }

    #[test]
    fn test_valid_decomposition_has_no_errors() {
        let d = Decomposition::from_workstreams(vec![
            ws("a", 0, &["a.rs"], &[]),
            ws("b", 0, &["b.rs"], &[]),
            ws("c", 1, &["a.rs"], &["a", "b"]),
        ]);
        assert!(validate_decomposition(&d).is_empty());
    }

    #[test]
    fn test_unknown_dependency_reported() {
        let d = Decomposition::from_workstreams(vec![ws("a", 1, &[], &["ghost"])]);
        let errors = validate_decomposition(&d);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("unknown workstream 'ghost'"));
    }

    #[test]
    fn test_same_wave_dependency_reported() {
        let d = Decomposition::from_workstreams(vec![
            ws("a", 0, &[], &[]),
            ws("b", 0, &[], &["a"]),
        ]);
        let errors = validate_decomposition(&d);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("must be in an earlier wave"));
    }

    #[test]
    fn test_ownership_collision_reported() {
        let d = Decomposition::from_workstreams(vec![
            ws("a", 0, &["shared.rs", "a.rs"], &[]),
            ws("b", 0, &["shared.rs"], &[]),
        ]);
        let errors = validate_decomposition(&d);
        assert_eq!(
            errors,
            vec!["File 'shared.rs' is owned by both 'a' and 'b' in wave 0".to_string()]
        );
    }

    #[test]
    fn test_cycle_reported() {
        let d = Decomposition::from_workstreams(vec![
            ws("a", 1, &[], &["b"]),
            ws("b", 2, &[], &["a"]),
        ]);
        let errors = validate_decomposition(&d);
        assert!(errors.iter().any(|e| e.contains("cycle")));
    }

    #[test]
    fn test_duplicate_key_reported() {
        let d = Decomposition::from_workstreams(vec![ws("a", 0, &[], &[]), ws("a", 1, &[], &[])]);
        let errors = validate_decomposition(&d);
        assert_eq!(errors, vec!["Duplicate workstream key: a".to_string()]);
    }

    #[test]
    fn test_wave_mismatch_reported() {
        let mut stray = ws("b", 3, &[], &[]);
        stray.wave = 3;
        let d = Decomposition {
            waves: vec![Wave {
                index: 0,
                workstreams: vec![ws("a", 0, &[], &[]), stray],
            }],
            ..Default::default()
        };
        let errors = validate_decomposition(&d);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("records wave 3"));
    }
}
