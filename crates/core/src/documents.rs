//! Contracts for the external document collaborator.
//!
//! The collaborator performs proforma metadata extraction, purchase-order
//! rendering, and receipt validation. It is best-effort by contract: the
//! approval engine invokes it after a transition commits, and nothing it
//! returns can undo a committed approval or rejection.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::purchase_request::{PurchaseRequest, StoredFile};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DocumentError {
    #[error("text extraction failed: {0}")]
    Extraction(String),
    #[error("template rendering failed: {0}")]
    Template(String),
    #[error("document conversion failed: {0}")]
    Conversion(String),
    #[error("document io failed: {0}")]
    Io(String),
}

/// A rendered document plus the metadata blob persisted alongside it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeneratedDocument {
    pub file: StoredFile,
    pub metadata: serde_json::Value,
}

/// Outcome of comparing a receipt against the purchase order.
///
/// Validation is total: failures come back error-flagged inside the value
/// rather than as an `Err`, which is what makes the log-and-record contract
/// visible in the signature.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReceiptValidation {
    pub is_valid: bool,
    pub discrepancies: Vec<String>,
    pub extracted: serde_json::Value,
    pub error: Option<String>,
}

impl ReceiptValidation {
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            discrepancies: Vec::new(),
            extracted: serde_json::json!({}),
            error: Some(message.into()),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({}))
    }
}

/// The metadata blob recorded when extraction cannot run or fails. Mirrors
/// the shape successful extraction produces so readers need no branching.
pub fn proforma_error_metadata(reason: impl Into<String>) -> serde_json::Value {
    serde_json::json!({
        "error": reason.into(),
        "vendor_name": "Unknown",
        "items": [],
        "total_amount": 0,
        "currency": "USD",
    })
}

#[async_trait]
pub trait DocumentPipeline: Send + Sync {
    /// Extract structured metadata from an uploaded proforma invoice.
    /// Total: failures yield [`proforma_error_metadata`].
    async fn extract_proforma_metadata(&self, file: &StoredFile) -> serde_json::Value;

    /// Render the purchase order for a fully approved request.
    async fn generate_purchase_order(
        &self,
        request: &PurchaseRequest,
    ) -> Result<GeneratedDocument, DocumentError>;

    /// Compare a submitted receipt against the request's purchase order.
    async fn validate_receipt(
        &self,
        request: &PurchaseRequest,
        receipt: &StoredFile,
    ) -> ReceiptValidation;
}

/// Disabled pipeline for tests and environments without document tooling.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopDocumentPipeline;

#[async_trait]
impl DocumentPipeline for NoopDocumentPipeline {
    async fn extract_proforma_metadata(&self, _file: &StoredFile) -> serde_json::Value {
        proforma_error_metadata("document pipeline disabled")
    }

    async fn generate_purchase_order(
        &self,
        _request: &PurchaseRequest,
    ) -> Result<GeneratedDocument, DocumentError> {
        Err(DocumentError::Conversion("document pipeline disabled".to_string()))
    }

    async fn validate_receipt(
        &self,
        _request: &PurchaseRequest,
        _receipt: &StoredFile,
    ) -> ReceiptValidation {
        ReceiptValidation::failure("document pipeline disabled")
    }
}
