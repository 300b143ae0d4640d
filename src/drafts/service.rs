//! Draft approval: plan, gate, execute, record.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::drafts::effector::DraftEffector;
use crate::drafts::planner::{CouncilPolicy, plan_draft_actions};
use crate::drafts::types::{CopilotDraft, CopilotDraftEvent, DraftKind, DraftPlan, DraftStatus};
use crate::errors::FactoryError;
use crate::factory::db::DbHandle;

/// Result of a successful approval.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalOutcome {
    pub draft: CopilotDraft,
    pub plan: DraftPlan,
    pub event: CopilotDraftEvent,
}

pub struct DraftService {
    db: DbHandle,
    effector: Arc<dyn DraftEffector>,
    policy: CouncilPolicy,
    locks: DashMap<i64, Arc<Mutex<()>>>,
}

impl DraftService {
    pub fn new(db: DbHandle, effector: Arc<dyn DraftEffector>, policy: CouncilPolicy) -> Self {
        Self {
            db,
            effector,
            policy,
            locks: DashMap::new(),
        }
    }

    pub async fn create(
        &self,
        kind: DraftKind,
        payload: Value,
        project_id: i64,
        sources: Value,
    ) -> Result<CopilotDraft, FactoryError> {
        if !payload.is_object() {
            return Err(FactoryError::Validation(
                "payload must be a JSON object".to_string(),
            ));
        }
        self.db
            .call(move |db| {
                if db.get_project(project_id)?.is_none() {
                    return Ok(Err(FactoryError::not_found("Project", project_id)));
                }
                Ok(Ok(db.create_draft(kind, &payload, project_id, &sources)?))
            })
            .await
            .map_err(FactoryError::Database)?
    }

    pub async fn get(&self, id: i64) -> Result<CopilotDraft, FactoryError> {
        self.db
            .call(move |db| db.get_draft(id))
            .await
            .map_err(FactoryError::Database)?
            .ok_or_else(|| FactoryError::not_found("Draft", id))
    }

    pub async fn events(&self, id: i64) -> Result<Vec<CopilotDraftEvent>, FactoryError> {
        self.get(id).await?;
        self.db
            .call(move |db| db.list_draft_events(id))
            .await
            .map_err(FactoryError::Database)
    }

    /// Read-only preview; the same computation the approval path gates on.
    pub async fn plan(&self, id: i64) -> Result<(CopilotDraft, DraftPlan), FactoryError> {
        let draft = self.get(id).await?;
        let project_id = draft.project_id;
        let council_satisfied = self
            .db
            .call(move |db| db.has_approved_council_decision(project_id))
            .await
            .map_err(FactoryError::Database)?;
        let plan = plan_draft_actions(&draft, &self.policy, council_satisfied);
        Ok((draft, plan))
    }

    /// Approve a draft on behalf of `actor_user_id`.
    ///
    /// Side effects run before the status change; if they fail the draft
    /// stays `DRAFT` and no audit event is written.
    pub async fn approve(
        &self,
        id: i64,
        actor_user_id: &str,
    ) -> Result<ApprovalOutcome, FactoryError> {
        let lock = self
            .locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let result = {
            let _guard = lock.lock().await;
            self.approve_locked(id, actor_user_id).await
        };
        drop(lock);
        self.locks.remove_if(&id, |_, l| Arc::strong_count(l) == 1);
        result
    }

    async fn approve_locked(
        &self,
        id: i64,
        actor_user_id: &str,
    ) -> Result<ApprovalOutcome, FactoryError> {
        let (draft, plan) = self.plan(id).await?;

        if plan.is_gated() {
            warn!(draft_id = id, kind = draft.kind.as_str(), "Draft approval refused: council decision required");
            return Err(FactoryError::Gate {
                message: format!(
                    "Council approval required before approving {} drafts",
                    draft.kind.as_str()
                ),
                plan: Box::new(plan),
            });
        }

        if draft.status != DraftStatus::Draft {
            return Err(already_decided(draft.status));
        }

        let outcome = self.effector.apply(&draft).await?;

        let details = json!({
            "resultRef": outcome.result_ref,
            "operations": plan.operations,
            "payloadDigest": payload_digest(&draft.payload_json),
        });
        let result_ref = outcome.result_ref.clone();
        let actor = actor_user_id.to_string();
        let recorded = self
            .db
            .call(move |db| {
                let event = db.approve_draft_if_pending(id, &result_ref, &actor, &details)?;
                let draft = db.get_draft(id)?;
                Ok((event, draft))
            })
            .await
            .map_err(FactoryError::Database)?;

        match recorded {
            (Some(event), Some(draft)) => {
                info!(
                    draft_id = id,
                    actor = actor_user_id,
                    result_ref = %outcome.result_ref,
                    "Draft approved"
                );
                Ok(ApprovalOutcome { draft, plan, event })
            }
            (None, Some(current)) => Err(already_decided(current.status)),
            (_, None) => Err(FactoryError::not_found("Draft", id)),
        }
    }
}

fn already_decided(status: DraftStatus) -> FactoryError {
    FactoryError::Precondition(format!(
        "Cannot approve draft with status: {}",
        status.as_str()
    ))
}

/// SHA-256 hex digest of the canonical JSON payload.
pub fn payload_digest(payload: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drafts::effector::EffectOutcome;
    use crate::drafts::types::APPROVED_EVENT;
    use crate::factory::db::FactoryDb;
    use crate::factory::models::CouncilOutcome;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct MockEffector {
        calls: AtomicUsize,
        fail: bool,
    }

    impl MockEffector {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl DraftEffector for MockEffector {
        async fn apply(&self, draft: &CopilotDraft) -> Result<EffectOutcome, FactoryError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(Duration::from_millis(10)).await;
            if self.fail {
                return Err(FactoryError::Adapter {
                    status: 502,
                    message: "upstream down".into(),
                });
            }
            Ok(EffectOutcome {
                result_ref: format!("mock:{}:{}", draft.id, n),
            })
        }
    }

    async fn setup(effector: Arc<MockEffector>) -> (DraftService, DbHandle, i64) {
        let db = FactoryDb::new_in_memory().unwrap();
        let project = db.create_project("P", None).unwrap();
        let handle = DbHandle::new(db);
        let service = DraftService::new(handle.clone(), effector, CouncilPolicy::default());
        (service, handle, project.id)
    }

    #[tokio::test]
    async fn test_double_approval_rejected_with_single_event() {
        let effector = MockEffector::new(false);
        let (service, _, project_id) = setup(effector.clone()).await;
        let draft = service
            .create(DraftKind::WorkOrder, json!({"title": "t"}), project_id, json!([]))
            .await
            .unwrap();

        let first = service.approve(draft.id, "alice").await.unwrap();
        assert_eq!(first.draft.status, DraftStatus::Approved);
        assert_eq!(first.event.event_type, APPROVED_EVENT);
        assert_eq!(first.event.details_json["resultRef"], "mock:1:1");
        assert_eq!(
            first.event.details_json["payloadDigest"],
            payload_digest(&json!({"title": "t"}))
        );
        assert!(first.event.details_json.get("payload").is_none());

        let err = service.approve(draft.id, "bob").await.unwrap_err();
        assert_eq!(err.to_string(), "Cannot approve draft with status: APPROVED");
        assert_eq!(err.status_code(), 400);
        assert_eq!(service.events(draft.id).await.unwrap().len(), 1);
        assert_eq!(effector.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_approvals_serialize() {
        let effector = MockEffector::new(false);
        let (service, _, project_id) = setup(effector.clone()).await;
        let draft = service
            .create(DraftKind::WorkOrder, json!({"title": "t"}), project_id, json!([]))
            .await
            .unwrap();

        let (a, b) = tokio::join!(
            service.approve(draft.id, "alice"),
            service.approve(draft.id, "bob")
        );
        assert_eq!([a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(), 1);
        assert_eq!(effector.calls.load(Ordering::SeqCst), 1);
        assert_eq!(service.events(draft.id).await.unwrap().len(), 1);
        assert!(service.locks.is_empty());
    }

    #[tokio::test]
    async fn test_gated_draft_refused_with_plan() {
        let effector = MockEffector::new(false);
        let (service, _, project_id) = setup(effector.clone()).await;
        let draft = service
            .create(DraftKind::GithubIssue, json!({"title": "Bug", "repo": "a/b"}), project_id, json!([]))
            .await
            .unwrap();

        let err = service.approve(draft.id, "alice").await.unwrap_err();
        assert_eq!(err.status_code(), 403);
        match err {
            FactoryError::Gate { plan, .. } => {
                assert!(plan.checks.council_required);
                assert!(!plan.checks.council_satisfied);
            }
            other => panic!("Expected Gate, got {:?}", other),
        }
        assert_eq!(effector.calls.load(Ordering::SeqCst), 0);
        assert_eq!(service.get(draft.id).await.unwrap().status, DraftStatus::Draft);
    }

    #[tokio::test]
    async fn test_council_decision_opens_gate() {
        let effector = MockEffector::new(false);
        let (service, handle, project_id) = setup(effector.clone()).await;
        let draft = service
            .create(DraftKind::GithubIssue, json!({"title": "Bug"}), project_id, json!([]))
            .await
            .unwrap();
        handle
            .call(move |db| {
                db.create_council_decision(project_id, "issues ok", CouncilOutcome::Approved, "council")
            })
            .await
            .unwrap();

        let (_, plan) = service.plan(draft.id).await.unwrap();
        assert!(plan.checks.council_satisfied);
        assert!(service.approve(draft.id, "alice").await.is_ok());
    }

    #[tokio::test]
    async fn test_effector_failure_leaves_draft_pending() {
        let effector = MockEffector::new(true);
        let (service, _, project_id) = setup(effector.clone()).await;
        let draft = service
            .create(DraftKind::MemoryItem, json!({"content": "c"}), project_id, json!([]))
            .await
            .unwrap();

        let err = service.approve(draft.id, "alice").await.unwrap_err();
        assert_eq!(err.status_code(), 502);
        assert_eq!(service.get(draft.id).await.unwrap().status, DraftStatus::Draft);
        assert!(service.events(draft.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_draft_and_project() {
        let (service, _, _) = setup(MockEffector::new(false)).await;
        assert_eq!(service.approve(99, "a").await.unwrap_err().status_code(), 404);
        let err = service
            .create(DraftKind::WorkOrder, json!({}), 42, json!([]))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Project 42 not found");
        let err = service
            .create(DraftKind::WorkOrder, json!("text"), 42, json!([]))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn test_payload_digest_is_stable_hex() {
        let digest = payload_digest(&json!({"a": 1}));
        assert_eq!(digest.len(), 64);
        assert_eq!(digest, payload_digest(&json!({"a": 1})));
        assert_ne!(digest, payload_digest(&json!({"a": 2})));
    }
}
