//! JSON API over the approval engine.
//!
//! Authentication is out of scope; callers identify themselves with the
//! `X-User-Id` header and the handlers resolve that against the user store.
//! All workflow legality lives in the engine; handlers only translate
//! payloads and map engine errors onto status codes.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use procura_core::domain::purchase_request::{
    NewPurchaseRequest, RequestId, RequestWithApprovals, StoredFile,
};
use procura_core::domain::user::{Role, User, UserId};
use procura_core::errors::ApprovalError;
use procura_core::workflow;
use procura_db::repositories::{
    PurchaseRequestRepository, SqlPurchaseRequestRepository, SqlUserRepository, UserRepository,
};
use procura_db::{ApprovalEngine, EngineError, RepositoryError, RequestUpdate};

pub struct ApiState {
    pub engine: Arc<ApprovalEngine>,
    pub users: SqlUserRepository,
    pub requests: SqlPurchaseRequestRepository,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/api/requests", post(create_request))
        .route("/api/requests/pending", get(pending_requests))
        .route("/api/requests/mine", get(my_requests))
        .route("/api/requests/{id}", get(get_request).patch(update_request))
        .route("/api/requests/{id}/approve", post(approve_request))
        .route("/api/requests/{id}/reject", post(reject_request))
        .route("/api/requests/{id}/receipt", post(submit_receipt))
        .with_state(state)
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("missing or unknown user identity")]
    Unauthenticated,
    #[error("role does not allow this operation")]
    Forbidden,
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl From<RepositoryError> for ApiError {
    fn from(error: RepositoryError) -> Self {
        Self::Engine(EngineError::Store(error))
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::Engine(engine) => match engine {
                EngineError::Approval(ApprovalError::Validation { .. }) => StatusCode::BAD_REQUEST,
                EngineError::Approval(ApprovalError::NotAnApprover) => StatusCode::FORBIDDEN,
                EngineError::Approval(ApprovalError::AlreadyFinalized { .. })
                | EngineError::Approval(ApprovalError::AlreadyProcessed { .. })
                | EngineError::Approval(ApprovalError::PriorLevelIncomplete) => {
                    StatusCode::CONFLICT
                }
                EngineError::Approval(ApprovalError::NoApprovalSlot { .. }) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
                EngineError::NotPermitted(_) => StatusCode::FORBIDDEN,
                EngineError::RequestNotFound(_) => StatusCode::NOT_FOUND,
                EngineError::LockTimeout(_) => StatusCode::SERVICE_UNAVAILABLE,
                EngineError::Store(RepositoryError::Database(_)) => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                EngineError::Store(RepositoryError::Decode(_)) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Engine(engine) if engine.is_transient())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.to_string(),
            "retryable": self.retryable(),
        });
        (self.status(), Json(body)).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateRequestBody {
    pub title: String,
    pub description: String,
    pub amount: Decimal,
    pub proforma_path: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateRequestBody {
    pub title: Option<String>,
    pub description: Option<String>,
    pub amount: Option<Decimal>,
    pub proforma_path: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ActionBody {
    #[serde(default)]
    pub comments: String,
}

#[derive(Debug, Deserialize)]
pub struct ReceiptBody {
    pub path: String,
}

#[derive(Debug, Serialize)]
pub struct ApprovalPayload {
    pub level: i64,
    pub status: String,
    pub approver: Option<String>,
    pub comments: String,
    pub reviewed_at: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Serialize)]
pub struct RequestPayload {
    pub id: String,
    pub title: String,
    pub description: String,
    pub amount: String,
    pub status: String,
    pub created_by: String,
    pub proforma_path: Option<String>,
    pub proforma_metadata: serde_json::Value,
    pub purchase_order_path: Option<String>,
    pub po_metadata: serde_json::Value,
    pub receipt_path: Option<String>,
    pub receipt_validation: serde_json::Value,
    pub approvals: Vec<ApprovalPayload>,
    pub can_edit: bool,
    pub can_submit_receipt: bool,
    pub can_approve: bool,
    pub current_level: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
}

fn request_payload(aggregate: &RequestWithApprovals, caller: &User) -> RequestPayload {
    let request = &aggregate.request;
    RequestPayload {
        id: request.id.0.clone(),
        title: request.title.clone(),
        description: request.description.clone(),
        amount: request.amount.to_string(),
        status: request.status.to_string(),
        created_by: request.created_by.0.clone(),
        proforma_path: request.proforma.as_ref().map(|file| file.path.clone()),
        proforma_metadata: request.proforma_metadata.clone(),
        purchase_order_path: request.purchase_order.as_ref().map(|file| file.path.clone()),
        po_metadata: request.po_metadata.clone(),
        receipt_path: request.receipt.as_ref().map(|file| file.path.clone()),
        receipt_validation: request.receipt_validation.clone(),
        approvals: aggregate
            .approvals
            .iter()
            .map(|approval| ApprovalPayload {
                level: approval.level.as_i64(),
                status: approval.status.to_string(),
                approver: approval.approver.as_ref().map(|id| id.0.clone()),
                comments: approval.comments.clone(),
                reviewed_at: approval.reviewed_at.map(|at| at.to_rfc3339()),
                created_at: approval.created_at.to_rfc3339(),
            })
            .collect(),
        can_edit: aggregate.can_edit() && request.created_by == caller.id,
        can_submit_receipt: request.can_submit_receipt()
            && caller.role == Role::Staff
            && request.created_by == caller.id,
        can_approve: workflow::can_approve(aggregate, caller),
        current_level: aggregate.current_level().map(|level| level.as_i64()),
        created_at: request.created_at.to_rfc3339(),
        updated_at: request.updated_at.to_rfc3339(),
    }
}

async fn resolve_user(state: &ApiState, headers: &HeaderMap) -> Result<User, ApiError> {
    let user_id = headers
        .get("x-user-id")
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .ok_or(ApiError::Unauthenticated)?;

    state
        .users
        .find_by_id(&UserId(user_id.to_string()))
        .await?
        .ok_or(ApiError::Unauthenticated)
}

pub async fn create_request(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(body): Json<CreateRequestBody>,
) -> Result<(StatusCode, Json<RequestPayload>), ApiError> {
    let user = resolve_user(&state, &headers).await?;
    if user.role != Role::Staff {
        return Err(ApiError::Forbidden);
    }

    let new_request = NewPurchaseRequest {
        title: body.title,
        description: body.description,
        amount: body.amount,
        proforma: body.proforma_path.map(|path| StoredFile { path }),
    };

    let aggregate = state.engine.create_with_approvals(new_request, &user).await?;
    info!(request_id = %aggregate.request.id.0, user = %user.id.0, "purchase request created");

    Ok((StatusCode::CREATED, Json(request_payload(&aggregate, &user))))
}

pub async fn get_request(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<RequestPayload>, ApiError> {
    let user = resolve_user(&state, &headers).await?;
    let aggregate = state
        .requests
        .find_by_id(&RequestId(id.clone()))
        .await?
        .ok_or(EngineError::RequestNotFound(id))?;

    Ok(Json(request_payload(&aggregate, &user)))
}

pub async fn update_request(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<UpdateRequestBody>,
) -> Result<Json<RequestPayload>, ApiError> {
    let user = resolve_user(&state, &headers).await?;

    let update = RequestUpdate {
        title: body.title,
        description: body.description,
        amount: body.amount,
        proforma: body.proforma_path.map(|path| StoredFile { path }),
    };

    let aggregate = state.engine.update_fields(&RequestId(id), &user, update).await?;
    Ok(Json(request_payload(&aggregate, &user)))
}

pub async fn approve_request(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<ActionBody>,
) -> Result<Json<RequestPayload>, ApiError> {
    let user = resolve_user(&state, &headers).await?;
    let aggregate = state.engine.approve(&RequestId(id), &user, &body.comments).await?;
    info!(
        request_id = %aggregate.request.id.0,
        user = %user.id.0,
        status = %aggregate.request.status,
        "approval recorded"
    );
    Ok(Json(request_payload(&aggregate, &user)))
}

pub async fn reject_request(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<ActionBody>,
) -> Result<Json<RequestPayload>, ApiError> {
    let user = resolve_user(&state, &headers).await?;
    let aggregate = state.engine.reject(&RequestId(id), &user, &body.comments).await?;
    info!(
        request_id = %aggregate.request.id.0,
        user = %user.id.0,
        "rejection recorded"
    );
    Ok(Json(request_payload(&aggregate, &user)))
}

pub async fn submit_receipt(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<ReceiptBody>,
) -> Result<Json<RequestPayload>, ApiError> {
    let user = resolve_user(&state, &headers).await?;
    let aggregate = state
        .engine
        .submit_receipt(&RequestId(id), &user, StoredFile { path: body.path })
        .await?;
    Ok(Json(request_payload(&aggregate, &user)))
}

pub async fn pending_requests(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<RequestPayload>>, ApiError> {
    let user = resolve_user(&state, &headers).await?;
    let aggregates = state.engine.pending_for(&user).await?;
    Ok(Json(aggregates.iter().map(|aggregate| request_payload(aggregate, &user)).collect()))
}

pub async fn my_requests(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<RequestPayload>>, ApiError> {
    let user = resolve_user(&state, &headers).await?;
    let aggregates = state.requests.list_for_creator(&user.id).await?;
    Ok(Json(aggregates.iter().map(|aggregate| request_payload(aggregate, &user)).collect()))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::extract::{Path, State};
    use axum::http::{HeaderMap, HeaderValue, StatusCode};
    use axum::Json;
    use chrono::Utc;
    use rust_decimal::Decimal;

    use procura_core::documents::NoopDocumentPipeline;
    use procura_core::domain::user::{Role, User, UserId};
    use procura_db::repositories::{
        SqlPurchaseRequestRepository, SqlUserRepository, UserRepository,
    };
    use procura_db::{connect_with_settings, migrations, ApprovalEngine};

    use super::{
        approve_request, create_request, ActionBody, ApiError, ApiState, CreateRequestBody,
    };

    async fn state() -> Arc<ApiState> {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");

        let users = SqlUserRepository::new(pool.clone());
        for (id, role) in [
            ("u-staff", Role::Staff),
            ("u-l1", Role::ApproverL1),
            ("u-l2", Role::ApproverL2),
        ] {
            users
                .save(User {
                    id: UserId(id.to_string()),
                    username: id.to_string(),
                    full_name: id.to_string(),
                    role,
                    department: "ops".to_string(),
                    created_at: Utc::now(),
                })
                .await
                .expect("seed user");
        }

        Arc::new(ApiState {
            engine: Arc::new(ApprovalEngine::new(pool.clone(), Arc::new(NoopDocumentPipeline))),
            users: SqlUserRepository::new(pool.clone()),
            requests: SqlPurchaseRequestRepository::new(pool),
        })
    }

    fn headers_for(user_id: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-user-id", HeaderValue::from_str(user_id).expect("header value"));
        headers
    }

    fn create_body() -> CreateRequestBody {
        CreateRequestBody {
            title: "Field laptops".to_string(),
            description: "Replacement hardware".to_string(),
            amount: Decimal::new(10_000, 2),
            proforma_path: None,
        }
    }

    #[tokio::test]
    async fn create_and_approve_through_the_api() {
        let state = state().await;

        let (status, Json(created)) =
            create_request(State(state.clone()), headers_for("u-staff"), Json(create_body()))
                .await
                .expect("create");
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created.status, "pending");
        assert_eq!(created.approvals.len(), 2);
        assert_eq!(created.current_level, Some(1));
        assert!(created.can_edit);

        let Json(after_first) = approve_request(
            State(state.clone()),
            headers_for("u-l1"),
            Path(created.id.clone()),
            Json(ActionBody { comments: "ok".to_string() }),
        )
        .await
        .expect("level 1 approve");
        assert_eq!(after_first.status, "pending");
        assert_eq!(after_first.current_level, Some(2));

        let Json(finalized) = approve_request(
            State(state),
            headers_for("u-l2"),
            Path(created.id),
            Json(ActionBody::default()),
        )
        .await
        .expect("level 2 approve");
        assert_eq!(finalized.status, "approved");
        assert_eq!(finalized.current_level, None);
    }

    #[tokio::test]
    async fn premature_level_two_approval_maps_to_conflict() {
        let state = state().await;

        let (_, Json(created)) =
            create_request(State(state.clone()), headers_for("u-staff"), Json(create_body()))
                .await
                .expect("create");

        let error = approve_request(
            State(state),
            headers_for("u-l2"),
            Path(created.id),
            Json(ActionBody::default()),
        )
        .await
        .expect_err("level 2 first");
        assert_eq!(error.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn unknown_callers_are_unauthenticated() {
        let state = state().await;

        let error =
            create_request(State(state.clone()), HeaderMap::new(), Json(create_body()))
                .await
                .expect_err("no header");
        assert_eq!(error.status(), StatusCode::UNAUTHORIZED);

        let error = create_request(State(state), headers_for("u-ghost"), Json(create_body()))
            .await
            .expect_err("unknown user");
        assert_eq!(error.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn only_staff_may_create_requests() {
        let state = state().await;

        let error = create_request(State(state), headers_for("u-l1"), Json(create_body()))
            .await
            .expect_err("approver cannot create");
        assert!(matches!(error, ApiError::Forbidden));
        assert_eq!(error.status(), StatusCode::FORBIDDEN);
    }
}
