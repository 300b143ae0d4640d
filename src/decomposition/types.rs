//! Core types for the decomposition system.
//!
//! A [`Decomposition`] is an ordered list of [`Wave`]s; each wave holds the
//! [`Workstream`]s that may run concurrently.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;

/// Free-text build spec plus optional tech-stack hints.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BuildSpec {
    pub text: String,
    #[serde(default)]
    pub tech_stack: Vec<String>,
}

impl BuildSpec {
    pub fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
            tech_stack: Vec::new(),
        }
    }

    pub fn with_tech_stack(mut self, tech_stack: Vec<String>) -> Self {
        self.tech_stack = tech_stack;
        self
    }
}

/// Status of a workstream during execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkstreamStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    /// A dependency failed or the run deadline passed.
    Skipped,
}

impl WorkstreamStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

impl FromStr for WorkstreamStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "SKIPPED" => Ok(Self::Skipped),
            _ => Err(format!("Invalid workstream status: {}", s)),
        }
    }
}

/// One independently executable unit of a decomposed build.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Workstream {
    pub key: String,
    pub name: String,
    pub assigned_agent: String,
    pub wave: u32,
    #[serde(default)]
    pub status: WorkstreamStatus,
    #[serde(default)]
    pub owns_files: BTreeSet<String>,
    #[serde(default)]
    pub produces_files: BTreeSet<String>,
    #[serde(default)]
    pub blocked_by: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl Workstream {
    pub fn new(key: &str, name: &str, assigned_agent: &str) -> Self {
        Self {
            key: key.to_string(),
            name: name.to_string(),
            assigned_agent: assigned_agent.to_string(),
            wave: 0,
            status: WorkstreamStatus::Pending,
            owns_files: BTreeSet::new(),
            produces_files: BTreeSet::new(),
            blocked_by: BTreeSet::new(),
            output: None,
        }
    }

    pub fn with_wave(mut self, wave: u32) -> Self {
        self.wave = wave;
        self
    }

    pub fn with_owns<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.owns_files = files.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_produces<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.produces_files = files.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_blocked_by<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.blocked_by = keys.into_iter().map(Into::into).collect();
        self
    }
}

/// A set of workstreams with no dependencies among themselves.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Wave {
    pub index: u32,
    pub workstreams: Vec<Workstream>,
}

/// Result of decomposing a build spec.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Decomposition {
    pub waves: Vec<Wave>,
    #[serde(default)]
    pub tech_stack: Vec<String>,
    /// Adjustments the decomposer made (e.g. ownership serialization).
    #[serde(default)]
    pub notes: Vec<String>,
}

impl Decomposition {
    /// Group workstreams into waves by their `wave` field.
    pub fn from_workstreams(workstreams: Vec<Workstream>) -> Self {
        let max_wave = workstreams.iter().map(|w| w.wave).max();
        let mut waves: Vec<Wave> = match max_wave {
            Some(max) => (0..=max)
                .map(|index| Wave {
                    index,
                    workstreams: Vec::new(),
                })
                .collect(),
            None => Vec::new(),
        };
        for ws in workstreams {
            let idx = ws.wave as usize;
            waves[idx].workstreams.push(ws);
        }
        Self {
            waves,
            tech_stack: Vec::new(),
            notes: Vec::new(),
        }
    }

    pub fn workstreams(&self) -> impl Iterator<Item = &Workstream> {
        self.waves.iter().flat_map(|w| w.workstreams.iter())
    }

    pub fn workstream_count(&self) -> usize {
        self.waves.iter().map(|w| w.workstreams.len()).sum()
    }

    pub fn get(&self, key: &str) -> Option<&Workstream> {
        self.workstreams().find(|w| w.key == key)
    }

    pub fn is_empty(&self) -> bool {
        self.workstream_count() == 0
    }
}
