//! Read-only plan phase of draft approval.
//!
//! [`plan_draft_actions`] is shared by the preview path and the approve path
//! so the two can never disagree about what an approval does.

use std::collections::BTreeSet;

use crate::drafts::types::{CopilotDraft, DraftChecks, DraftKind, DraftPlan, PlannedOperation};
use crate::redaction::redact_str;

const SUMMARY_PREVIEW_CHARS: usize = 80;

/// Which draft kinds need a recorded Council decision before approval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CouncilPolicy {
    gated_kinds: BTreeSet<DraftKind>,
}

impl Default for CouncilPolicy {
    fn default() -> Self {
        Self::new([DraftKind::GithubIssue, DraftKind::GithubPullRequest])
    }
}

impl CouncilPolicy {
    pub fn new(gated_kinds: impl IntoIterator<Item = DraftKind>) -> Self {
        Self {
            gated_kinds: gated_kinds.into_iter().collect(),
        }
    }

    pub fn requires_council(&self, kind: DraftKind) -> bool {
        self.gated_kinds.contains(&kind)
    }
}

/// Compute what approving `draft` would do. Pure: no I/O, no mutation.
///
/// `council_satisfied` is whether a qualifying Council decision exists for
/// the draft's project; the caller looks it up.
pub fn plan_draft_actions(
    draft: &CopilotDraft,
    policy: &CouncilPolicy,
    council_satisfied: bool,
) -> DraftPlan {
    let mut operations = vec![primary_operation(draft)];
    operations.push(PlannedOperation::new(
        "update",
        "CopilotDraft",
        format!("Mark draft {} as APPROVED", draft.id),
    ));

    for op in &mut operations {
        op.summary = redact_str(&op.summary);
    }

    DraftPlan {
        operations,
        checks: DraftChecks {
            council_required: policy.requires_council(draft.kind),
            council_satisfied,
        },
    }
}

fn primary_operation(draft: &CopilotDraft) -> PlannedOperation {
    let title = draft.payload_str("title").unwrap_or("(untitled)");
    match draft.kind {
        DraftKind::WorkOrder => PlannedOperation::new(
            "create",
            "WorkOrder",
            format!("Create work order \"{}\"", preview(title)),
        ),
        DraftKind::MemoryItem => {
            let label = draft
                .payload_str("title")
                .or_else(|| draft.payload_str("content"))
                .unwrap_or("(empty)");
            PlannedOperation::new(
                "create",
                "MemoryItem",
                format!("Store memory item \"{}\"", preview(label)),
            )
        }
        DraftKind::GithubIssue => PlannedOperation::new(
            "create",
            "GitHubIssue",
            format!("Open issue \"{}\" in {}", preview(title), repo_label(draft)),
        ),
        DraftKind::GithubPullRequest => {
            let head = draft.payload_str("head").unwrap_or("?");
            let base = draft.payload_str("base").unwrap_or("main");
            PlannedOperation::new(
                "create",
                "GitHubPullRequest",
                format!(
                    "Open pull request \"{}\" in {} ({} -> {})",
                    preview(title),
                    repo_label(draft),
                    head,
                    base
                ),
            )
        }
    }
}

fn repo_label(draft: &CopilotDraft) -> String {
    match (draft.payload_str("owner"), draft.payload_str("repo")) {
        (Some(owner), Some(repo)) => format!("{}/{}", owner, repo),
        (None, Some(repo)) => repo.to_string(),
        _ => "(unknown repository)".to_string(),
    }
}

fn preview(text: &str) -> String {
    if text.chars().count() <= SUMMARY_PREVIEW_CHARS {
        return text.to_string();
    }
    let mut out: String = text.chars().take(SUMMARY_PREVIEW_CHARS).collect();
    out.push_str("...");
    out
}
