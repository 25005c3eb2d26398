use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::approval::{Approval, ApprovalLevel, ApprovalStatus};
use crate::domain::user::UserId;
use crate::errors::ApprovalError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
}

impl RequestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }

    pub fn is_finalized(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to a document persisted by the storage layer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredFile {
    pub path: String,
}

/// A request for purchasing goods or services.
///
/// `status` is denormalized from the two approval records for read
/// efficiency; the records remain the source of truth and the engine keeps
/// the field consistent at every transition. Requests are never deleted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PurchaseRequest {
    pub id: RequestId,
    pub title: String,
    pub description: String,
    pub amount: Decimal,
    pub status: RequestStatus,
    pub created_by: UserId,
    pub proforma: Option<StoredFile>,
    pub proforma_metadata: serde_json::Value,
    pub purchase_order: Option<StoredFile>,
    pub po_metadata: serde_json::Value,
    pub receipt: Option<StoredFile>,
    pub receipt_validation: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PurchaseRequest {
    /// Receipts attach only to approved requests that already carry a
    /// purchase order and no receipt yet.
    pub fn can_submit_receipt(&self) -> bool {
        self.status == RequestStatus::Approved
            && self.purchase_order.is_some()
            && self.receipt.is_none()
    }
}

/// Validated creation fields. `validate` runs before the engine is invoked;
/// a request that fails here never reaches storage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewPurchaseRequest {
    pub title: String,
    pub description: String,
    pub amount: Decimal,
    pub proforma: Option<StoredFile>,
}

const MAX_TITLE_LEN: usize = 255;
// 12 significant digits at 2 decimal places.
const MAX_AMOUNT_UNITS: i64 = 10_000_000_000;

impl NewPurchaseRequest {
    pub fn validate(&self) -> Result<(), ApprovalError> {
        validate_title(&self.title)?;
        validate_description(&self.description)?;
        validate_amount(self.amount)?;
        Ok(())
    }
}

pub fn validate_title(title: &str) -> Result<(), ApprovalError> {
    if title.trim().is_empty() {
        return Err(ApprovalError::Validation {
            field: "title",
            message: "title must not be empty".to_string(),
        });
    }
    if title.len() > MAX_TITLE_LEN {
        return Err(ApprovalError::Validation {
            field: "title",
            message: format!("title must be at most {MAX_TITLE_LEN} characters"),
        });
    }
    Ok(())
}

pub fn validate_description(description: &str) -> Result<(), ApprovalError> {
    if description.trim().is_empty() {
        return Err(ApprovalError::Validation {
            field: "description",
            message: "description must not be empty".to_string(),
        });
    }
    Ok(())
}

pub fn validate_amount(amount: Decimal) -> Result<(), ApprovalError> {
    if amount <= Decimal::ZERO {
        return Err(ApprovalError::Validation {
            field: "amount",
            message: "amount must be greater than zero".to_string(),
        });
    }
    if amount.round_dp(2) != amount {
        return Err(ApprovalError::Validation {
            field: "amount",
            message: "amount must have at most two decimal places".to_string(),
        });
    }
    if amount >= Decimal::from(MAX_AMOUNT_UNITS) {
        return Err(ApprovalError::Validation {
            field: "amount",
            message: format!("amount must be below {MAX_AMOUNT_UNITS}"),
        });
    }
    Ok(())
}

/// A purchase request together with its two approval records, ordered by
/// level. This is the consistency and locking unit the engine operates on.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestWithApprovals {
    pub request: PurchaseRequest,
    pub approvals: Vec<Approval>,
}

impl RequestWithApprovals {
    pub fn approval_at(&self, level: ApprovalLevel) -> Option<&Approval> {
        self.approvals.iter().find(|approval| approval.level == level)
    }

    /// Per-level statuses ordered by level; missing records read as Pending
    /// (unreachable under atomic creation, but the type stays total).
    pub fn level_statuses(&self) -> [ApprovalStatus; 2] {
        let status_of = |level| {
            self.approval_at(level).map(|approval| approval.status).unwrap_or(ApprovalStatus::Pending)
        };
        [status_of(ApprovalLevel::First), status_of(ApprovalLevel::Second)]
    }

    pub fn is_fully_approved(&self) -> bool {
        self.approvals.iter().all(|approval| approval.status == ApprovalStatus::Approved)
    }

    pub fn is_rejected(&self) -> bool {
        self.approvals.iter().any(|approval| approval.status == ApprovalStatus::Rejected)
    }

    /// The lowest level still awaiting action, or None once the chain is
    /// fully processed.
    pub fn current_level(&self) -> Option<ApprovalLevel> {
        ApprovalLevel::ALL
            .into_iter()
            .find(|level| {
                matches!(
                    self.approval_at(*level).map(|approval| approval.status),
                    Some(ApprovalStatus::Pending)
                )
            })
    }

    /// Title, description, amount, and proforma stay editable only while the
    /// request is Pending and no level has been processed.
    pub fn can_edit(&self) -> bool {
        self.request.status == RequestStatus::Pending
            && self.approvals.iter().all(|approval| !approval.is_processed())
    }
}
