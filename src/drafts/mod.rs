//! Copilot drafts: proposed side effects that require human approval.
//!
//! Approval is two-phase. [`plan_draft_actions`] computes what would happen
//! (shared with the preview endpoint); [`DraftService::approve`] gates on the
//! Council policy, runs the [`DraftEffector`], then flips the status and
//! writes the audit event in one store transaction.

pub mod effector;
pub mod github;
pub mod planner;
pub mod service;
pub mod types;

pub use effector::{DefaultEffector, DraftEffector, EffectOutcome};
pub use github::{GithubClient, is_valid_github_token, parse_owner_repo};
pub use planner::{CouncilPolicy, plan_draft_actions};
pub use service::{ApprovalOutcome, DraftService, payload_digest};
pub use types::{
    APPROVED_EVENT, CopilotDraft, CopilotDraftEvent, DraftChecks, DraftKind, DraftPlan,
    DraftStatus, PlannedOperation,
};
