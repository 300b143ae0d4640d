//! Execute phase of draft approval: the side effects behind each draft kind.

use async_trait::async_trait;
use tracing::info;

use crate::drafts::github::{GithubClient, parse_owner_repo};
use crate::drafts::types::{CopilotDraft, DraftKind};
use crate::errors::FactoryError;
use crate::factory::db::DbHandle;

/// What an effector produced; `result_ref` points at the created artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectOutcome {
    pub result_ref: String,
}

/// Performs the side effects of an approved draft.
///
/// Must not touch the draft's own status; the caller records the approval
/// only after this returns `Ok`.
#[async_trait]
pub trait DraftEffector: Send + Sync {
    async fn apply(&self, draft: &CopilotDraft) -> Result<EffectOutcome, FactoryError>;
}

/// Store-backed effects for work orders and memory items, GitHub REST calls
/// for issues and pull requests.
pub struct DefaultEffector {
    db: DbHandle,
    github: Option<GithubClient>,
}

impl DefaultEffector {
    pub fn new(db: DbHandle, github: Option<GithubClient>) -> Self {
        Self { db, github }
    }

    fn github(&self) -> Result<&GithubClient, FactoryError> {
        self.github.as_ref().ok_or_else(|| FactoryError::Adapter {
            status: 503,
            message: "GitHub integration is not configured (set GITHUB_TOKEN)".to_string(),
        })
    }

    async fn owner_repo(&self, draft: &CopilotDraft) -> Result<String, FactoryError> {
        let from_payload = match (draft.payload_str("owner"), draft.payload_str("repo")) {
            (Some(owner), Some(repo)) => parse_owner_repo(&format!("{}/{}", owner, repo)),
            (None, Some(repo)) => parse_owner_repo(repo),
            _ => None,
        };
        if let Some(slug) = from_payload {
            return Ok(slug);
        }

        let project_id = draft.project_id;
        let project = self
            .db
            .call(move |db| db.get_project(project_id))
            .await
            .map_err(FactoryError::Database)?;
        project
            .and_then(|p| p.github_repo)
            .and_then(|r| parse_owner_repo(&r))
            .ok_or_else(|| {
                FactoryError::Validation(format!(
                    "{} draft needs a repository (payload owner/repo or project githubRepo)",
                    draft.kind.as_str()
                ))
            })
    }
}

fn required<'a>(draft: &'a CopilotDraft, field: &str) -> Result<&'a str, FactoryError> {
    draft.payload_str(field).ok_or_else(|| {
        FactoryError::Validation(format!(
            "{} draft payload requires '{}'",
            draft.kind.as_str(),
            field
        ))
    })
}

#[async_trait]
impl DraftEffector for DefaultEffector {
    async fn apply(&self, draft: &CopilotDraft) -> Result<EffectOutcome, FactoryError> {
        let draft_id = draft.id;
        let project_id = draft.project_id;

        let result_ref = match draft.kind {
            DraftKind::WorkOrder => {
                let title = required(draft, "title")?.to_string();
                let description = draft.payload_str("description").unwrap_or("").to_string();
                let order = self
                    .db
                    .call(move |db| {
                        db.create_work_order(project_id, &title, &description, Some(draft_id))
                    })
                    .await
                    .map_err(FactoryError::Database)?;
                format!("work_order:{}", order.id)
            }
            DraftKind::MemoryItem => {
                let content = required(draft, "content")?.to_string();
                let title = draft.payload_str("title").map(String::from);
                let item = self
                    .db
                    .call(move |db| {
                        db.create_memory_item(project_id, title.as_deref(), &content, Some(draft_id))
                    })
                    .await
                    .map_err(FactoryError::Database)?;
                format!("memory_item:{}", item.id)
            }
            DraftKind::GithubIssue => {
                let title = required(draft, "title")?;
                let github = self.github()?;
                let repo = self.owner_repo(draft).await?;
                github
                    .create_issue(&repo, title, draft.payload_str("body"))
                    .await?
                    .html_url
            }
            DraftKind::GithubPullRequest => {
                let title = required(draft, "title")?;
                let head = required(draft, "head")?;
                let base = draft.payload_str("base").unwrap_or("main");
                let github = self.github()?;
                let repo = self.owner_repo(draft).await?;
                github
                    .create_pull_request(&repo, title, head, base, draft.payload_str("body"))
                    .await?
                    .html_url
            }
        };

        info!(draft_id, kind = draft.kind.as_str(), result_ref = %result_ref, "Draft effect applied");
        Ok(EffectOutcome { result_ref })
    }
}
