//! Parser for free-text build specs.
//!
//! Two formats are understood. A spec may embed an explicit JSON block:
//!
//! ```text
//! <workstreams>
//! {
//!   "workstreams": [
//!     {"key": "schema", "name": "Database schema", "owns": ["db/schema.sql"]},
//!     {"key": "api", "name": "REST API", "agent": "backend",
//!      "owns": ["src/api.rs"], "blocked_by": ["schema"]}
//!   ]
//! }
//! </workstreams>
//! ```
//!
//! Otherwise every level-two markdown heading starts a workstream and
//! `Label: value` lines underneath fill in its fields:
//!
//! ```text
//! ## Workstream: REST API
//! - Agent: backend
//! - Owns: `src/api.rs`, `src/routes.rs`
//! - Depends on: schema
//! ```

use serde::Deserialize;

use crate::errors::DecompositionError;

/// A workstream as written in the spec, before wave assignment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawWorkstream {
    pub key: String,
    pub name: String,
    pub agent: Option<String>,
    pub owns: Vec<String>,
    pub produces: Vec<String>,
    pub blocked_by: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawBlock {
    workstreams: Vec<RawBlockItem>,
}

#[derive(Debug, Deserialize)]
struct RawBlockItem {
    #[serde(default)]
    key: Option<String>,
    name: String,
    #[serde(default)]
    agent: Option<String>,
    #[serde(default)]
    owns: Vec<String>,
    #[serde(default)]
    produces: Vec<String>,
    #[serde(default, alias = "depends_on", alias = "blockedBy")]
    blocked_by: Vec<String>,
}

const BLOCK_START: &str = "<workstreams>";
const BLOCK_END: &str = "</workstreams>";

/// Parse a spec into raw workstreams.
///
/// Returns `EmptySpec` for blank input and `NoWorkstreams` when nothing
/// actionable was found.
pub fn parse_workstreams(text: &str) -> Result<Vec<RawWorkstream>, DecompositionError> {
    if text.trim().is_empty() {
        return Err(DecompositionError::EmptySpec);
    }

    let parsed = match text.find(BLOCK_START) {
        Some(start) => parse_block(&text[start + BLOCK_START.len()..])?,
        None => parse_markdown(text),
    };

    if parsed.is_empty() {
        return Err(DecompositionError::NoWorkstreams);
    }
    Ok(parsed)
}

fn parse_block(after_start: &str) -> Result<Vec<RawWorkstream>, DecompositionError> {
    let end = after_start.find(BLOCK_END).ok_or_else(|| {
        DecompositionError::MalformedBlock(format!("missing {} tag", BLOCK_END))
    })?;
    let json = after_start[..end].trim();
    let block: RawBlock = serde_json::from_str(json)
        .map_err(|e| DecompositionError::MalformedBlock(e.to_string()))?;

    Ok(block
        .workstreams
        .into_iter()
        .enumerate()
        .filter(|(_, item)| !item.name.trim().is_empty())
        .map(|(i, item)| {
            let name = item.name.trim().to_string();
            let key = item
                .key
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
                .unwrap_or_else(|| slugify(&name, i));
            RawWorkstream {
                key,
                name,
                agent: item.agent.filter(|a| !a.trim().is_empty()),
                owns: clean_list(item.owns),
                produces: clean_list(item.produces),
                blocked_by: clean_list(item.blocked_by),
            }
        })
        .collect())
}

fn parse_markdown(text: &str) -> Vec<RawWorkstream> {
    let mut result: Vec<RawWorkstream> = Vec::new();
    let mut current: Option<RawWorkstream> = None;

    for line in text.lines() {
        let trimmed = line.trim();

        if let Some(heading) = trimmed.strip_prefix("## ") {
            if let Some(ws) = current.take() {
                result.push(ws);
            }
            let name = strip_label(heading.trim(), "workstream").trim().to_string();
            if !name.is_empty() {
                current = Some(RawWorkstream {
                    key: slugify(&name, result.len()),
                    name,
                    ..Default::default()
                });
            }
            continue;
        }

        // A higher-level heading closes the current section.
        if trimmed.starts_with("# ") {
            if let Some(ws) = current.take() {
                result.push(ws);
            }
            continue;
        }

        let Some(ws) = current.as_mut() else {
            continue;
        };
        let body = trimmed.trim_start_matches(['-', '*']).trim();
        let Some((label, value)) = body.split_once(':') else {
            continue;
        };

        match label.trim().to_lowercase().as_str() {
            "key" => {
                let key = value.trim().trim_matches('`').to_string();
                if !key.is_empty() {
                    ws.key = key;
                }
            }
            "agent" => {
                let agent = value.trim().trim_matches('`').to_string();
                if !agent.is_empty() {
                    ws.agent = Some(agent);
                }
            }
            "owns" | "files" => ws.owns.extend(split_list(value)),
            "produces" | "outputs" => ws.produces.extend(split_list(value)),
            "depends on" | "blocked by" | "depends" => {
                ws.blocked_by.extend(split_list(value));
            }
            _ => {}
        }
    }

    if let Some(ws) = current.take() {
        result.push(ws);
    }
    result
}

/// Strip a case-insensitive `label:` prefix if present.
fn strip_label<'a>(text: &'a str, label: &str) -> &'a str {
    match text.split_once(':') {
        Some((prefix, rest)) if prefix.trim().eq_ignore_ascii_case(label) => rest,
        _ => text,
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|v| v.trim().trim_matches('`').trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}

fn clean_list(values: Vec<String>) -> Vec<String> {
    values
        .into_iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}

/// Derive a workstream key from its name.
pub fn slugify(name: &str, position: usize) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_dash = true;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    let slug = slug.trim_end_matches('-').to_string();
    if slug.is_empty() {
        format!("workstream-{}", position + 1)
    } else {
        slug
    }
}
