//! The transactional approval engine.
//!
//! All mutation of purchase-request and approval state funnels through this
//! engine. Each transition takes the per-request lock, re-reads the aggregate
//! inside a fresh transaction, consults the transition table, and commits.
//! Document generation and receipt validation run after commit, outside the
//! lock, and can never undo a committed transition.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use tracing::warn;
use uuid::Uuid;

use procura_core::documents::DocumentPipeline;
use procura_core::domain::approval::ApprovalLevel;
use procura_core::domain::purchase_request::{
    validate_amount, validate_description, validate_title, NewPurchaseRequest, RequestId,
    RequestWithApprovals, StoredFile,
};
use procura_core::domain::user::{Role, User};
use procura_core::errors::ApprovalError;
use procura_core::workflow::{self, ApprovalAction, ChainState};

use crate::repositories::purchase_request::{
    approval_from_row, request_from_row, APPROVAL_COLUMNS, REQUEST_COLUMNS,
};
use crate::repositories::{
    PurchaseRequestRepository, RepositoryError, SqlPurchaseRequestRepository,
};
use crate::DbPool;

/// Failures surfaced by engine operations.
///
/// `Approval` variants are terminal answers about the request's state.
/// `Store` and `LockTimeout` are transient and safe to retry; the split lets
/// callers distinguish "the workflow said no" from "the store hiccuped".
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Approval(#[from] ApprovalError),
    #[error("operation not permitted: {0}")]
    NotPermitted(String),
    #[error("purchase request not found: {0}")]
    RequestNotFound(String),
    #[error("storage failure: {0}")]
    Store(#[from] RepositoryError),
    #[error("timed out waiting for the lock on request {0}")]
    LockTimeout(String),
}

impl EngineError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::LockTimeout(_) => true,
            Self::Store(RepositoryError::Database(_)) => true,
            Self::Store(RepositoryError::Decode(_)) => false,
            Self::Approval(_) | Self::NotPermitted(_) | Self::RequestNotFound(_) => false,
        }
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(error: sqlx::Error) -> Self {
        Self::Store(RepositoryError::Database(error))
    }
}

/// Per-request async mutexes. The map only grows (one entry per request ever
/// touched by this process), which keeps a guard valid for the whole
/// transition without entry juggling.
#[derive(Default)]
struct RequestLocks {
    inner: StdMutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl RequestLocks {
    fn for_request(&self, id: &RequestId) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        map.entry(id.0.clone()).or_default().clone()
    }
}

/// Fields a creator may change while the request is still editable.
#[derive(Clone, Debug, Default)]
pub struct RequestUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub amount: Option<rust_decimal::Decimal>,
    pub proforma: Option<StoredFile>,
}

pub struct ApprovalEngine {
    pool: DbPool,
    requests: SqlPurchaseRequestRepository,
    documents: Arc<dyn DocumentPipeline>,
    locks: RequestLocks,
    lock_wait: Duration,
}

impl ApprovalEngine {
    pub fn new(pool: DbPool, documents: Arc<dyn DocumentPipeline>) -> Self {
        Self {
            requests: SqlPurchaseRequestRepository::new(pool.clone()),
            pool,
            documents,
            locks: RequestLocks::default(),
            lock_wait: Duration::from_secs(10),
        }
    }

    pub fn with_lock_wait(mut self, lock_wait: Duration) -> Self {
        self.lock_wait = lock_wait;
        self
    }

    /// Create a request together with both Pending approval records as one
    /// atomic unit. No request can exist with fewer than two records.
    pub async fn create_with_approvals(
        &self,
        new_request: NewPurchaseRequest,
        creator: &User,
    ) -> Result<RequestWithApprovals, EngineError> {
        new_request.validate()?;

        let request_id = RequestId(Uuid::new_v4().to_string());
        let now = Utc::now().to_rfc3339();

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO purchase_request (
                id, title, description, amount, status, created_by,
                proforma_path, proforma_metadata, po_metadata, receipt_validation,
                created_at, updated_at
             ) VALUES (?, ?, ?, ?, 'pending', ?, ?, '{}', '{}', '{}', ?, ?)",
        )
        .bind(&request_id.0)
        .bind(new_request.title.trim())
        .bind(&new_request.description)
        .bind(new_request.amount.to_string())
        .bind(&creator.id.0)
        .bind(new_request.proforma.as_ref().map(|file| file.path.as_str()))
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        for level in ApprovalLevel::ALL {
            sqlx::query(
                "INSERT INTO approval (id, purchase_request_id, level, status, created_at)
                 VALUES (?, ?, ?, 'pending', ?)",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(&request_id.0)
            .bind(level.as_i64())
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        if let Some(proforma) = &new_request.proforma {
            self.attach_proforma_metadata(&request_id, proforma).await;
        }

        self.require_aggregate(&request_id).await
    }

    /// Approve at the caller's level. See the transition table for the exact
    /// gating; purchase-order generation fires after commit when the request
    /// becomes fully approved.
    pub async fn approve(
        &self,
        request_id: &RequestId,
        user: &User,
        comments: &str,
    ) -> Result<RequestWithApprovals, EngineError> {
        self.act(request_id, user, comments, ApprovalAction::Approve).await
    }

    /// Reject at the caller's level. Either level may reject independently;
    /// the request finalizes as Rejected and the sibling record is left
    /// untouched (it becomes unreachable through `AlreadyFinalized`).
    pub async fn reject(
        &self,
        request_id: &RequestId,
        user: &User,
        comments: &str,
    ) -> Result<RequestWithApprovals, EngineError> {
        self.act(request_id, user, comments, ApprovalAction::Reject).await
    }

    async fn act(
        &self,
        request_id: &RequestId,
        user: &User,
        comments: &str,
        action: ApprovalAction,
    ) -> Result<RequestWithApprovals, EngineError> {
        let guard = self.lock_request(request_id).await?;

        let mut tx = self.pool.begin().await?;
        let aggregate = load_aggregate(&mut tx, request_id)
            .await?
            .ok_or_else(|| EngineError::RequestNotFound(request_id.0.clone()))?;

        if aggregate.request.status.is_finalized() {
            return Err(ApprovalError::AlreadyFinalized { status: aggregate.request.status }.into());
        }

        let level = user.approval_level().ok_or(ApprovalError::NotAnApprover)?;
        let record = aggregate
            .approval_at(level)
            .ok_or(ApprovalError::NoApprovalSlot { level })?
            .clone();

        let outcome = workflow::evaluate(&ChainState::of(&aggregate), level, action)?;

        let reviewed_at = Utc::now().to_rfc3339();
        sqlx::query(
            "UPDATE approval
             SET status = ?, approver_id = ?, comments = ?, reviewed_at = ?
             WHERE id = ?",
        )
        .bind(outcome.record_status.as_str())
        .bind(&user.id.0)
        .bind(comments)
        .bind(&reviewed_at)
        .bind(&record.id.0)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE purchase_request SET status = ?, updated_at = ? WHERE id = ?")
            .bind(outcome.request_status.as_str())
            .bind(&reviewed_at)
            .bind(&request_id.0)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        drop(guard);

        if outcome.generates_purchase_order {
            self.attach_purchase_order(request_id).await;
        }

        self.require_aggregate(request_id).await
    }

    /// Read-only actionability predicate; no locking, same gating as
    /// `approve`.
    pub fn can_approve(&self, aggregate: &RequestWithApprovals, user: &User) -> bool {
        workflow::can_approve(aggregate, user)
    }

    /// Requests awaiting action at the user's level. Non-approvers see an
    /// empty list.
    pub async fn pending_for(
        &self,
        user: &User,
    ) -> Result<Vec<RequestWithApprovals>, EngineError> {
        let Some(level) = user.approval_level() else {
            return Ok(Vec::new());
        };
        Ok(self.requests.pending_for_level(level).await?)
    }

    /// Edit creator-owned fields while the request is still editable
    /// (Pending with an untouched chain).
    pub async fn update_fields(
        &self,
        request_id: &RequestId,
        user: &User,
        update: RequestUpdate,
    ) -> Result<RequestWithApprovals, EngineError> {
        let _guard = self.lock_request(request_id).await?;

        let mut tx = self.pool.begin().await?;
        let aggregate = load_aggregate(&mut tx, request_id)
            .await?
            .ok_or_else(|| EngineError::RequestNotFound(request_id.0.clone()))?;

        if aggregate.request.created_by != user.id {
            return Err(EngineError::NotPermitted(
                "only the creator may edit a purchase request".to_string(),
            ));
        }
        if !aggregate.can_edit() {
            return Err(EngineError::NotPermitted(
                "request can no longer be edited once an approval has been processed".to_string(),
            ));
        }

        let title = update.title.unwrap_or_else(|| aggregate.request.title.clone());
        let description =
            update.description.unwrap_or_else(|| aggregate.request.description.clone());
        let amount = update.amount.unwrap_or(aggregate.request.amount);
        validate_title(&title)?;
        validate_description(&description)?;
        validate_amount(amount)?;

        let proforma_path = update
            .proforma
            .as_ref()
            .map(|file| file.path.clone())
            .or_else(|| aggregate.request.proforma.as_ref().map(|file| file.path.clone()));

        sqlx::query(
            "UPDATE purchase_request
             SET title = ?, description = ?, amount = ?, proforma_path = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(title.trim())
        .bind(&description)
        .bind(amount.to_string())
        .bind(&proforma_path)
        .bind(Utc::now().to_rfc3339())
        .bind(&request_id.0)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        if let Some(proforma) = &update.proforma {
            self.attach_proforma_metadata(request_id, proforma).await;
        }

        self.require_aggregate(request_id).await
    }

    /// Attach a receipt to an approved request and run best-effort
    /// validation against the purchase order.
    pub async fn submit_receipt(
        &self,
        request_id: &RequestId,
        user: &User,
        receipt: StoredFile,
    ) -> Result<RequestWithApprovals, EngineError> {
        let _guard = self.lock_request(request_id).await?;

        let mut tx = self.pool.begin().await?;
        let aggregate = load_aggregate(&mut tx, request_id)
            .await?
            .ok_or_else(|| EngineError::RequestNotFound(request_id.0.clone()))?;

        if user.role != Role::Staff || aggregate.request.created_by != user.id {
            return Err(EngineError::NotPermitted(
                "only the creating staff member may submit a receipt".to_string(),
            ));
        }
        if !aggregate.request.can_submit_receipt() {
            return Err(EngineError::NotPermitted(
                "receipts attach only to approved requests with a purchase order and no receipt"
                    .to_string(),
            ));
        }

        sqlx::query("UPDATE purchase_request SET receipt_path = ?, updated_at = ? WHERE id = ?")
            .bind(&receipt.path)
            .bind(Utc::now().to_rfc3339())
            .bind(&request_id.0)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        let validation = self.documents.validate_receipt(&aggregate.request, &receipt).await;
        if let Some(error) = &validation.error {
            warn!(
                request_id = %request_id.0,
                error = %error,
                "receipt validation degraded; storing error-flagged result"
            );
        }

        let written = sqlx::query(
            "UPDATE purchase_request SET receipt_validation = ?, updated_at = ? WHERE id = ?",
        )
        .bind(validation.to_json().to_string())
        .bind(Utc::now().to_rfc3339())
        .bind(&request_id.0)
        .execute(&self.pool)
        .await;

        if let Err(error) = written {
            warn!(
                request_id = %request_id.0,
                error = %error,
                "could not record receipt validation result"
            );
        }

        self.require_aggregate(request_id).await
    }

    async fn lock_request(
        &self,
        request_id: &RequestId,
    ) -> Result<OwnedMutexGuard<()>, EngineError> {
        let lock = self.locks.for_request(request_id);
        tokio::time::timeout(self.lock_wait, lock.lock_owned())
            .await
            .map_err(|_| EngineError::LockTimeout(request_id.0.clone()))
    }

    /// Best-effort purchase-order generation. Runs after the approval
    /// committed and after the lock dropped; failures are logged and recorded
    /// as degraded metadata, never returned to the approving caller.
    async fn attach_purchase_order(&self, request_id: &RequestId) {
        let aggregate = match self.require_aggregate(request_id).await {
            Ok(aggregate) => aggregate,
            Err(error) => {
                warn!(
                    request_id = %request_id.0,
                    error = %error,
                    "could not reload request for purchase-order generation"
                );
                return;
            }
        };

        let (path, metadata) = match self.documents.generate_purchase_order(&aggregate.request).await
        {
            Ok(document) => (Some(document.file.path), document.metadata),
            Err(error) => {
                warn!(
                    request_id = %request_id.0,
                    error = %error,
                    "purchase-order generation failed; approval stands"
                );
                (None, serde_json::json!({ "error": error.to_string() }))
            }
        };

        let written = sqlx::query(
            "UPDATE purchase_request
             SET purchase_order_path = COALESCE(?, purchase_order_path),
                 po_metadata = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(&path)
        .bind(metadata.to_string())
        .bind(Utc::now().to_rfc3339())
        .bind(&request_id.0)
        .execute(&self.pool)
        .await;

        if let Err(error) = written {
            warn!(
                request_id = %request_id.0,
                error = %error,
                "could not record purchase-order attachment"
            );
        }
    }

    /// Best-effort proforma metadata extraction; the pipeline is total and
    /// returns an error-flagged blob on failure.
    async fn attach_proforma_metadata(&self, request_id: &RequestId, proforma: &StoredFile) {
        let metadata = self.documents.extract_proforma_metadata(proforma).await;
        let written = sqlx::query(
            "UPDATE purchase_request SET proforma_metadata = ?, updated_at = ? WHERE id = ?",
        )
        .bind(metadata.to_string())
        .bind(Utc::now().to_rfc3339())
        .bind(&request_id.0)
        .execute(&self.pool)
        .await;

        if let Err(error) = written {
            warn!(
                request_id = %request_id.0,
                error = %error,
                "could not record proforma metadata"
            );
        }
    }

    async fn require_aggregate(
        &self,
        request_id: &RequestId,
    ) -> Result<RequestWithApprovals, EngineError> {
        self.requests
            .find_by_id(request_id)
            .await?
            .ok_or_else(|| EngineError::RequestNotFound(request_id.0.clone()))
    }
}

async fn load_aggregate(
    tx: &mut sqlx::SqliteConnection,
    request_id: &RequestId,
) -> Result<Option<RequestWithApprovals>, RepositoryError> {
    let row = sqlx::query(&format!(
        "SELECT {REQUEST_COLUMNS} FROM purchase_request WHERE id = ?"
    ))
    .bind(&request_id.0)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    let request = request_from_row(&row)?;

    let approval_rows = sqlx::query(&format!(
        "SELECT {APPROVAL_COLUMNS} FROM approval
         WHERE purchase_request_id = ? ORDER BY level ASC",
    ))
    .bind(&request_id.0)
    .fetch_all(&mut *tx)
    .await?;

    let approvals =
        approval_rows.iter().map(approval_from_row).collect::<Result<Vec<_>, _>>()?;

    Ok(Some(RequestWithApprovals { request, approvals }))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::Utc;
    use rust_decimal::Decimal;

    use procura_core::documents::{
        DocumentError, DocumentPipeline, GeneratedDocument, ReceiptValidation,
    };
    use procura_core::domain::approval::{ApprovalLevel, ApprovalStatus};
    use procura_core::domain::purchase_request::{
        NewPurchaseRequest, PurchaseRequest, RequestStatus, StoredFile,
    };
    use procura_core::domain::user::{Role, User, UserId};
    use procura_core::errors::ApprovalError;
    use procura_core::workflow::derive_request_status;

    use super::{ApprovalEngine, EngineError, RequestUpdate};
    use crate::repositories::{SqlUserRepository, UserRepository};
    use crate::{connect_with_settings, migrations, DbPool};

    struct FakePipeline {
        po_attempts: AtomicUsize,
        fail_po: bool,
    }

    impl FakePipeline {
        fn new() -> Self {
            Self { po_attempts: AtomicUsize::new(0), fail_po: false }
        }

        fn failing() -> Self {
            Self { po_attempts: AtomicUsize::new(0), fail_po: true }
        }

        fn attempts(&self) -> usize {
            self.po_attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DocumentPipeline for FakePipeline {
        async fn extract_proforma_metadata(&self, file: &StoredFile) -> serde_json::Value {
            serde_json::json!({ "vendor_name": "Acme Supplies", "source": file.path })
        }

        async fn generate_purchase_order(
            &self,
            request: &PurchaseRequest,
        ) -> Result<GeneratedDocument, DocumentError> {
            self.po_attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail_po {
                return Err(DocumentError::Conversion("renderer offline".to_string()));
            }
            Ok(GeneratedDocument {
                file: StoredFile { path: format!("purchase_orders/{}.pdf", request.id.0) },
                metadata: serde_json::json!({ "po_number": "PO-TEST-1" }),
            })
        }

        async fn validate_receipt(
            &self,
            _request: &PurchaseRequest,
            receipt: &StoredFile,
        ) -> ReceiptValidation {
            ReceiptValidation {
                is_valid: true,
                discrepancies: Vec::new(),
                extracted: serde_json::json!({ "source": receipt.path }),
                error: None,
            }
        }
    }

    async fn setup() -> (DbPool, Arc<FakePipeline>, ApprovalEngine) {
        setup_with(FakePipeline::new()).await
    }

    async fn setup_with(pipeline: FakePipeline) -> (DbPool, Arc<FakePipeline>, ApprovalEngine) {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        seed_users(&pool).await;

        let pipeline = Arc::new(pipeline);
        let engine = ApprovalEngine::new(pool.clone(), pipeline.clone());
        (pool, pipeline, engine)
    }

    async fn seed_users(pool: &DbPool) {
        let repo = SqlUserRepository::new(pool.clone());
        for (id, role) in [
            ("u-staff", Role::Staff),
            ("u-l1", Role::ApproverL1),
            ("u-l2", Role::ApproverL2),
            ("u-finance", Role::Finance),
        ] {
            repo.save(user(id, role)).await.expect("seed user");
        }
    }

    fn user(id: &str, role: Role) -> User {
        User {
            id: UserId(id.to_string()),
            username: id.to_string(),
            full_name: id.to_string(),
            role,
            department: "ops".to_string(),
            created_at: Utc::now(),
        }
    }

    fn new_request(amount: Decimal) -> NewPurchaseRequest {
        NewPurchaseRequest {
            title: "Field laptops".to_string(),
            description: "Replacement hardware for the survey team".to_string(),
            amount,
            proforma: None,
        }
    }

    fn assert_status_consistent(aggregate: &procura_core::RequestWithApprovals) {
        assert_eq!(
            aggregate.request.status,
            derive_request_status(aggregate.level_statuses()),
            "stored status must match the derivation from approval records",
        );
    }

    #[tokio::test]
    async fn create_produces_two_pending_records() {
        let (_pool, _pipeline, engine) = setup().await;
        let staff = user("u-staff", Role::Staff);

        let aggregate = engine
            .create_with_approvals(new_request(Decimal::new(10_000, 2)), &staff)
            .await
            .expect("create");

        assert_eq!(aggregate.request.status, RequestStatus::Pending);
        assert_eq!(aggregate.approvals.len(), 2);
        for (approval, level) in aggregate.approvals.iter().zip(ApprovalLevel::ALL) {
            assert_eq!(approval.level, level);
            assert_eq!(approval.status, ApprovalStatus::Pending);
            assert!(approval.approver.is_none());
            assert!(approval.reviewed_at.is_none());
        }
        assert_status_consistent(&aggregate);
    }

    #[tokio::test]
    async fn create_rejects_non_positive_amounts_before_storage() {
        let (_pool, _pipeline, engine) = setup().await;
        let staff = user("u-staff", Role::Staff);

        let error = engine
            .create_with_approvals(new_request(Decimal::ZERO), &staff)
            .await
            .expect_err("zero amount must fail");

        assert!(matches!(
            error,
            EngineError::Approval(ApprovalError::Validation { field: "amount", .. })
        ));
    }

    #[tokio::test]
    async fn create_extracts_proforma_metadata_when_attached() {
        let (_pool, _pipeline, engine) = setup().await;
        let staff = user("u-staff", Role::Staff);

        let mut request = new_request(Decimal::new(42_000, 2));
        request.proforma = Some(StoredFile { path: "proformas/acme.pdf".to_string() });

        let aggregate = engine.create_with_approvals(request, &staff).await.expect("create");

        assert_eq!(aggregate.request.proforma_metadata["vendor_name"], "Acme Supplies");
    }

    #[tokio::test]
    async fn full_approval_walk_generates_the_purchase_order_once() {
        let (_pool, pipeline, engine) = setup().await;
        let staff = user("u-staff", Role::Staff);
        let approver_one = user("u-l1", Role::ApproverL1);
        let approver_two = user("u-l2", Role::ApproverL2);

        let created = engine
            .create_with_approvals(new_request(Decimal::new(10_000, 2)), &staff)
            .await
            .expect("create");

        let after_first =
            engine.approve(&created.request.id, &approver_one, "ok").await.expect("level 1");
        assert_eq!(after_first.request.status, RequestStatus::Pending);
        let first_record =
            after_first.approval_at(ApprovalLevel::First).expect("level 1 record");
        assert_eq!(first_record.status, ApprovalStatus::Approved);
        assert_eq!(first_record.approver, Some(approver_one.id.clone()));
        assert_eq!(first_record.comments, "ok");
        assert!(first_record.reviewed_at.is_some());
        assert_status_consistent(&after_first);
        assert_eq!(pipeline.attempts(), 0);

        let after_second =
            engine.approve(&created.request.id, &approver_two, "approved").await.expect("level 2");
        assert_eq!(after_second.request.status, RequestStatus::Approved);
        assert_status_consistent(&after_second);
        assert_eq!(pipeline.attempts(), 1);

        let po = after_second.request.purchase_order.expect("purchase order attached");
        assert_eq!(po.path, format!("purchase_orders/{}.pdf", created.request.id.0));
        assert_eq!(after_second.request.po_metadata["po_number"], "PO-TEST-1");
    }

    #[tokio::test]
    async fn level_two_cannot_approve_before_level_one() {
        let (_pool, _pipeline, engine) = setup().await;
        let staff = user("u-staff", Role::Staff);
        let approver_one = user("u-l1", Role::ApproverL1);
        let approver_two = user("u-l2", Role::ApproverL2);

        let created = engine
            .create_with_approvals(new_request(Decimal::new(10_000, 2)), &staff)
            .await
            .expect("create");

        let premature = engine
            .approve(&created.request.id, &approver_two, "lgtm")
            .await
            .expect_err("level 2 first must fail");
        assert!(matches!(
            premature,
            EngineError::Approval(ApprovalError::PriorLevelIncomplete)
        ));

        engine.approve(&created.request.id, &approver_one, "ok").await.expect("level 1");

        // The caller retries after level 1 completes and now succeeds.
        let retried =
            engine.approve(&created.request.id, &approver_two, "lgtm").await.expect("retry");
        assert_eq!(retried.request.status, RequestStatus::Approved);
    }

    #[tokio::test]
    async fn rejection_finalizes_and_blocks_further_action() {
        let (_pool, pipeline, engine) = setup().await;
        let staff = user("u-staff", Role::Staff);
        let approver_one = user("u-l1", Role::ApproverL1);
        let approver_two = user("u-l2", Role::ApproverL2);

        let created = engine
            .create_with_approvals(new_request(Decimal::new(10_000, 2)), &staff)
            .await
            .expect("create");

        let rejected = engine
            .reject(&created.request.id, &approver_one, "bad vendor")
            .await
            .expect("level 1 reject");
        assert_eq!(rejected.request.status, RequestStatus::Rejected);
        assert_status_consistent(&rejected);

        // The sibling record stays Pending; it is simply unreachable now.
        let second = rejected.approval_at(ApprovalLevel::Second).expect("level 2 record");
        assert_eq!(second.status, ApprovalStatus::Pending);

        let blocked = engine
            .approve(&created.request.id, &approver_two, "too late")
            .await
            .expect_err("finalized request");
        assert!(matches!(
            blocked,
            EngineError::Approval(ApprovalError::AlreadyFinalized {
                status: RequestStatus::Rejected
            })
        ));

        let blocked_reject = engine
            .reject(&created.request.id, &approver_two, "me too")
            .await
            .expect_err("finalized request");
        assert!(matches!(
            blocked_reject,
            EngineError::Approval(ApprovalError::AlreadyFinalized { .. })
        ));

        assert_eq!(pipeline.attempts(), 0);
    }

    #[tokio::test]
    async fn level_two_may_reject_before_level_one_acts() {
        let (_pool, _pipeline, engine) = setup().await;
        let staff = user("u-staff", Role::Staff);
        let approver_two = user("u-l2", Role::ApproverL2);

        let created = engine
            .create_with_approvals(new_request(Decimal::new(10_000, 2)), &staff)
            .await
            .expect("create");

        let rejected = engine
            .reject(&created.request.id, &approver_two, "over budget")
            .await
            .expect("level 2 reject without ordering");
        assert_eq!(rejected.request.status, RequestStatus::Rejected);
        assert_status_consistent(&rejected);
    }

    #[tokio::test]
    async fn double_approval_at_one_level_fails_with_already_processed() {
        let (_pool, _pipeline, engine) = setup().await;
        let staff = user("u-staff", Role::Staff);
        let approver_one = user("u-l1", Role::ApproverL1);

        let created = engine
            .create_with_approvals(new_request(Decimal::new(10_000, 2)), &staff)
            .await
            .expect("create");

        engine.approve(&created.request.id, &approver_one, "ok").await.expect("first call");

        let second = engine
            .approve(&created.request.id, &approver_one, "ok again")
            .await
            .expect_err("second call");
        assert!(matches!(
            second,
            EngineError::Approval(ApprovalError::AlreadyProcessed {
                level: ApprovalLevel::First,
                status: ApprovalStatus::Approved,
            })
        ));
    }

    #[tokio::test]
    async fn racing_approvals_on_one_level_succeed_exactly_once() {
        let (_pool, _pipeline, engine) = setup().await;
        let engine = Arc::new(engine);
        let staff = user("u-staff", Role::Staff);

        let created = engine
            .create_with_approvals(new_request(Decimal::new(10_000, 2)), &staff)
            .await
            .expect("create");

        let mut handles = Vec::new();
        for caller in 0..8 {
            let engine = engine.clone();
            let request_id = created.request.id.clone();
            handles.push(tokio::spawn(async move {
                let approver = user("u-l1", Role::ApproverL1);
                engine.approve(&request_id, &approver, &format!("caller {caller}")).await
            }));
        }

        let mut successes = 0;
        let mut already_processed = 0;
        for handle in handles {
            match handle.await.expect("task completes") {
                Ok(_) => successes += 1,
                Err(EngineError::Approval(ApprovalError::AlreadyProcessed { .. })) => {
                    already_processed += 1;
                }
                Err(other) => panic!("unexpected race outcome: {other}"),
            }
        }

        assert_eq!(successes, 1);
        assert_eq!(already_processed, 7);
    }

    #[tokio::test]
    async fn non_approvers_cannot_act() {
        let (_pool, _pipeline, engine) = setup().await;
        let staff = user("u-staff", Role::Staff);
        let finance = user("u-finance", Role::Finance);

        let created = engine
            .create_with_approvals(new_request(Decimal::new(10_000, 2)), &staff)
            .await
            .expect("create");

        let error = engine
            .approve(&created.request.id, &finance, "looks fine")
            .await
            .expect_err("finance is not an approver");
        assert!(matches!(error, EngineError::Approval(ApprovalError::NotAnApprover)));
    }

    #[tokio::test]
    async fn can_approve_mirrors_the_approve_gating() {
        let (_pool, _pipeline, engine) = setup().await;
        let staff = user("u-staff", Role::Staff);
        let approver_one = user("u-l1", Role::ApproverL1);
        let approver_two = user("u-l2", Role::ApproverL2);

        let created = engine
            .create_with_approvals(new_request(Decimal::new(10_000, 2)), &staff)
            .await
            .expect("create");

        assert!(engine.can_approve(&created, &approver_one));
        assert!(!engine.can_approve(&created, &approver_two));
        assert!(!engine.can_approve(&created, &staff));

        let after_first =
            engine.approve(&created.request.id, &approver_one, "ok").await.expect("level 1");
        assert!(!engine.can_approve(&after_first, &approver_one));
        assert!(engine.can_approve(&after_first, &approver_two));

        let finalized =
            engine.approve(&created.request.id, &approver_two, "ok").await.expect("level 2");
        assert!(!engine.can_approve(&finalized, &approver_two));
    }

    #[tokio::test]
    async fn pending_lists_follow_the_chain() {
        let (_pool, _pipeline, engine) = setup().await;
        let staff = user("u-staff", Role::Staff);
        let approver_one = user("u-l1", Role::ApproverL1);
        let approver_two = user("u-l2", Role::ApproverL2);
        let finance = user("u-finance", Role::Finance);

        let first = engine
            .create_with_approvals(new_request(Decimal::new(10_000, 2)), &staff)
            .await
            .expect("create first");
        let second = engine
            .create_with_approvals(new_request(Decimal::new(25_000, 2)), &staff)
            .await
            .expect("create second");

        let level_one_queue = engine.pending_for(&approver_one).await.expect("l1 queue");
        assert_eq!(level_one_queue.len(), 2);

        // Nothing reaches level 2 until level 1 approves.
        assert!(engine.pending_for(&approver_two).await.expect("l2 queue").is_empty());
        assert!(engine.pending_for(&finance).await.expect("finance queue").is_empty());

        engine.approve(&first.request.id, &approver_one, "ok").await.expect("approve first");

        let level_one_after = engine.pending_for(&approver_one).await.expect("l1 queue");
        assert_eq!(level_one_after.len(), 1);
        assert_eq!(level_one_after[0].request.id, second.request.id);

        let level_two_after = engine.pending_for(&approver_two).await.expect("l2 queue");
        assert_eq!(level_two_after.len(), 1);
        assert_eq!(level_two_after[0].request.id, first.request.id);
    }

    #[tokio::test]
    async fn failed_generation_leaves_the_approval_committed() {
        let (_pool, pipeline, engine) = setup_with(FakePipeline::failing()).await;
        let staff = user("u-staff", Role::Staff);
        let approver_one = user("u-l1", Role::ApproverL1);
        let approver_two = user("u-l2", Role::ApproverL2);

        let created = engine
            .create_with_approvals(new_request(Decimal::new(10_000, 2)), &staff)
            .await
            .expect("create");

        engine.approve(&created.request.id, &approver_one, "ok").await.expect("level 1");
        let finalized =
            engine.approve(&created.request.id, &approver_two, "ok").await.expect("level 2");

        assert_eq!(finalized.request.status, RequestStatus::Approved);
        assert_eq!(pipeline.attempts(), 1);
        assert!(finalized.request.purchase_order.is_none());
        assert_eq!(
            finalized.request.po_metadata["error"],
            "document conversion failed: renderer offline"
        );
    }

    #[tokio::test]
    async fn edits_are_blocked_once_the_chain_moves() {
        let (_pool, _pipeline, engine) = setup().await;
        let staff = user("u-staff", Role::Staff);
        let approver_one = user("u-l1", Role::ApproverL1);

        let created = engine
            .create_with_approvals(new_request(Decimal::new(10_000, 2)), &staff)
            .await
            .expect("create");

        let updated = engine
            .update_fields(
                &created.request.id,
                &staff,
                RequestUpdate {
                    title: Some("Field laptops (revised)".to_string()),
                    amount: Some(Decimal::new(12_000, 2)),
                    ..RequestUpdate::default()
                },
            )
            .await
            .expect("edit while pending");
        assert_eq!(updated.request.title, "Field laptops (revised)");
        assert_eq!(updated.request.amount, Decimal::new(12_000, 2));

        engine.approve(&created.request.id, &approver_one, "ok").await.expect("level 1");

        let blocked = engine
            .update_fields(
                &created.request.id,
                &staff,
                RequestUpdate { title: Some("too late".to_string()), ..RequestUpdate::default() },
            )
            .await
            .expect_err("edit after processing");
        assert!(matches!(blocked, EngineError::NotPermitted(_)));

        let not_creator = engine
            .update_fields(
                &created.request.id,
                &user("u-finance", Role::Finance),
                RequestUpdate::default(),
            )
            .await
            .expect_err("non-creator edit");
        assert!(matches!(not_creator, EngineError::NotPermitted(_)));
    }

    #[tokio::test]
    async fn receipts_attach_only_after_approval_with_a_purchase_order() {
        let (_pool, _pipeline, engine) = setup().await;
        let staff = user("u-staff", Role::Staff);
        let approver_one = user("u-l1", Role::ApproverL1);
        let approver_two = user("u-l2", Role::ApproverL2);

        let created = engine
            .create_with_approvals(new_request(Decimal::new(10_000, 2)), &staff)
            .await
            .expect("create");

        let premature = engine
            .submit_receipt(
                &created.request.id,
                &staff,
                StoredFile { path: "receipts/early.pdf".to_string() },
            )
            .await
            .expect_err("receipt before approval");
        assert!(matches!(premature, EngineError::NotPermitted(_)));

        engine.approve(&created.request.id, &approver_one, "ok").await.expect("level 1");
        engine.approve(&created.request.id, &approver_two, "ok").await.expect("level 2");

        let with_receipt = engine
            .submit_receipt(
                &created.request.id,
                &staff,
                StoredFile { path: "receipts/final.pdf".to_string() },
            )
            .await
            .expect("receipt after approval");

        assert_eq!(
            with_receipt.request.receipt.as_ref().map(|file| file.path.as_str()),
            Some("receipts/final.pdf"),
        );
        assert_eq!(with_receipt.request.receipt_validation["is_valid"], true);

        let duplicate = engine
            .submit_receipt(
                &created.request.id,
                &staff,
                StoredFile { path: "receipts/second.pdf".to_string() },
            )
            .await
            .expect_err("second receipt");
        assert!(matches!(duplicate, EngineError::NotPermitted(_)));
    }

    #[tokio::test]
    async fn unknown_requests_are_reported_as_not_found() {
        let (_pool, _pipeline, engine) = setup().await;
        let approver_one = user("u-l1", Role::ApproverL1);

        let error = engine
            .approve(&procura_core::RequestId("missing".to_string()), &approver_one, "ok")
            .await
            .expect_err("missing request");
        assert!(matches!(error, EngineError::RequestNotFound(_)));
        assert!(!error.is_transient());
    }
}
