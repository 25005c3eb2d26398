use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use procura_core::domain::approval::{
    Approval, ApprovalId, ApprovalLevel, ApprovalStatus,
};
use procura_core::domain::purchase_request::{
    PurchaseRequest, RequestId, RequestStatus, RequestWithApprovals, StoredFile,
};
use procura_core::domain::user::UserId;

use super::{PurchaseRequestRepository, RepositoryError};
use crate::DbPool;

pub struct SqlPurchaseRequestRepository {
    pool: DbPool,
}

impl SqlPurchaseRequestRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

pub(crate) const REQUEST_COLUMNS: &str = "id, title, description, amount, status, created_by,
    proforma_path, proforma_metadata, purchase_order_path, po_metadata,
    receipt_path, receipt_validation, created_at, updated_at";

pub(crate) const APPROVAL_COLUMNS: &str = "id, purchase_request_id, level, status, approver_id,
    comments, reviewed_at, created_at";

pub(crate) fn request_from_row(row: &SqliteRow) -> Result<PurchaseRequest, RepositoryError> {
    let status_raw: String = row.try_get("status")?;
    let status = RequestStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown request status `{status_raw}`")))?;

    Ok(PurchaseRequest {
        id: RequestId(row.try_get("id")?),
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        amount: parse_decimal("amount", row.try_get("amount")?)?,
        status,
        created_by: UserId(row.try_get("created_by")?),
        proforma: stored_file(row.try_get("proforma_path")?),
        proforma_metadata: parse_json("proforma_metadata", row.try_get("proforma_metadata")?)?,
        purchase_order: stored_file(row.try_get("purchase_order_path")?),
        po_metadata: parse_json("po_metadata", row.try_get("po_metadata")?)?,
        receipt: stored_file(row.try_get("receipt_path")?),
        receipt_validation: parse_json("receipt_validation", row.try_get("receipt_validation")?)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

pub(crate) fn approval_from_row(row: &SqliteRow) -> Result<Approval, RepositoryError> {
    let status_raw: String = row.try_get("status")?;
    let status = ApprovalStatus::parse(&status_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown approval status `{status_raw}`"))
    })?;

    let level_raw: i64 = row.try_get("level")?;
    let level = ApprovalLevel::parse(level_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown approval level `{level_raw}`")))?;

    Ok(Approval {
        id: ApprovalId(row.try_get("id")?),
        request_id: RequestId(row.try_get("purchase_request_id")?),
        level,
        status,
        approver: row.try_get::<Option<String>, _>("approver_id")?.map(UserId),
        comments: row.try_get("comments")?,
        reviewed_at: parse_optional_timestamp("reviewed_at", row.try_get("reviewed_at")?)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}

fn stored_file(path: Option<String>) -> Option<StoredFile> {
    path.map(|path| StoredFile { path })
}

pub(crate) fn parse_decimal(column: &str, value: String) -> Result<Decimal, RepositoryError> {
    value.parse().map_err(|_| {
        RepositoryError::Decode(format!("invalid decimal in `{column}`: `{value}`"))
    })
}

pub(crate) fn parse_json(
    column: &str,
    value: String,
) -> Result<serde_json::Value, RepositoryError> {
    serde_json::from_str(&value).map_err(|error| {
        RepositoryError::Decode(format!("invalid json in `{column}`: {error}"))
    })
}

pub(crate) fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}

pub(crate) fn parse_optional_timestamp(
    column: &str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    value.map(|timestamp| parse_timestamp(column, timestamp)).transpose()
}

impl SqlPurchaseRequestRepository {
    async fn load_aggregates(
        &self,
        request_rows: Vec<SqliteRow>,
    ) -> Result<Vec<RequestWithApprovals>, RepositoryError> {
        let mut aggregates = Vec::with_capacity(request_rows.len());
        for row in &request_rows {
            let request = request_from_row(row)?;
            let approvals = self.load_approvals(&request.id).await?;
            aggregates.push(RequestWithApprovals { request, approvals });
        }
        Ok(aggregates)
    }

    async fn load_approvals(&self, id: &RequestId) -> Result<Vec<Approval>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {APPROVAL_COLUMNS} FROM approval
             WHERE purchase_request_id = ? ORDER BY level ASC",
        ))
        .bind(&id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(approval_from_row).collect()
    }
}

#[async_trait::async_trait]
impl PurchaseRequestRepository for SqlPurchaseRequestRepository {
    async fn find_by_id(
        &self,
        id: &RequestId,
    ) -> Result<Option<RequestWithApprovals>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS} FROM purchase_request WHERE id = ?"
        ))
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(ref row) => {
                let request = request_from_row(row)?;
                let approvals = self.load_approvals(&request.id).await?;
                Ok(Some(RequestWithApprovals { request, approvals }))
            }
            None => Ok(None),
        }
    }

    async fn list_for_creator(
        &self,
        creator: &UserId,
    ) -> Result<Vec<RequestWithApprovals>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS} FROM purchase_request
             WHERE created_by = ?
             ORDER BY created_at DESC, id ASC",
        ))
        .bind(&creator.0)
        .fetch_all(&self.pool)
        .await?;

        self.load_aggregates(rows).await
    }

    async fn pending_for_level(
        &self,
        level: ApprovalLevel,
    ) -> Result<Vec<RequestWithApprovals>, RepositoryError> {
        // Level 2 only sees requests whose level-1 record has already been
        // approved; level 1 sees every pending request awaiting it.
        let rows = match level {
            ApprovalLevel::First => {
                sqlx::query(&format!(
                    "SELECT {REQUEST_COLUMNS} FROM purchase_request pr
                     WHERE pr.status = 'pending'
                       AND EXISTS (
                           SELECT 1 FROM approval a
                           WHERE a.purchase_request_id = pr.id
                             AND a.level = 1 AND a.status = 'pending'
                       )
                     ORDER BY pr.created_at ASC, pr.id ASC",
                ))
                .fetch_all(&self.pool)
                .await?
            }
            ApprovalLevel::Second => {
                sqlx::query(&format!(
                    "SELECT {REQUEST_COLUMNS} FROM purchase_request pr
                     WHERE pr.status = 'pending'
                       AND EXISTS (
                           SELECT 1 FROM approval a
                           WHERE a.purchase_request_id = pr.id
                             AND a.level = 1 AND a.status = 'approved'
                       )
                       AND EXISTS (
                           SELECT 1 FROM approval a
                           WHERE a.purchase_request_id = pr.id
                             AND a.level = 2 AND a.status = 'pending'
                       )
                     ORDER BY pr.created_at ASC, pr.id ASC",
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };

        self.load_aggregates(rows).await
    }

    async fn list_by_status(
        &self,
        status: RequestStatus,
    ) -> Result<Vec<RequestWithApprovals>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS} FROM purchase_request
             WHERE status = ?
             ORDER BY created_at DESC, id ASC",
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        self.load_aggregates(rows).await
    }
}
