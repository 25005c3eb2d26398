//! The document service wired into the approval engine.
//!
//! Implements the `DocumentPipeline` contract: proforma metadata extraction
//! at creation time, purchase-order rendering after final approval, and
//! receipt validation after submission. Every operation here is best-effort
//! from the engine's point of view.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::warn;

use procura_core::config::AppConfig;
use procura_core::documents::{
    proforma_error_metadata, DocumentError, DocumentPipeline, GeneratedDocument,
    ReceiptValidation,
};
use procura_core::domain::purchase_request::{PurchaseRequest, StoredFile};

use crate::extract::{extract_text, ExtractionClient};
use crate::po::PurchaseOrderRenderer;

// Receipts rarely match the order to the cent; tolerate small deltas.
const TOTAL_TOLERANCE: Decimal = Decimal::from_parts(100, 0, 0, false, 2);

pub struct DocumentService {
    extraction: Option<ExtractionClient>,
    renderer: PurchaseOrderRenderer,
    root: PathBuf,
}

impl DocumentService {
    pub fn from_config(config: &AppConfig) -> Result<Self, DocumentError> {
        let extraction = ExtractionClient::from_config(&config.extraction);
        if extraction.is_none() {
            warn!("no extraction api key configured; document metadata will be degraded");
        }

        Ok(Self {
            extraction,
            renderer: PurchaseOrderRenderer::new(&config.documents.root)?,
            root: config.documents.root.clone(),
        })
    }

    fn resolve(&self, file: &StoredFile) -> PathBuf {
        let path = Path::new(&file.path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    async fn extract_document_metadata(
        &self,
        file: &StoredFile,
    ) -> Result<serde_json::Value, DocumentError> {
        let Some(extraction) = &self.extraction else {
            return Err(DocumentError::Extraction(
                "extraction api key not configured".to_string(),
            ));
        };

        let text = extract_text(&self.resolve(file)).await?;
        if text.is_empty() {
            return Err(DocumentError::Extraction(
                "no text could be extracted from document".to_string(),
            ));
        }

        extraction.extract_metadata(&text).await
    }
}

#[async_trait]
impl DocumentPipeline for DocumentService {
    async fn extract_proforma_metadata(&self, file: &StoredFile) -> serde_json::Value {
        match self.extract_document_metadata(file).await {
            Ok(metadata) => metadata,
            Err(error) => {
                warn!(path = %file.path, error = %error, "proforma extraction degraded");
                proforma_error_metadata(error.to_string())
            }
        }
    }

    async fn generate_purchase_order(
        &self,
        request: &PurchaseRequest,
    ) -> Result<GeneratedDocument, DocumentError> {
        self.renderer.render(request).await
    }

    async fn validate_receipt(
        &self,
        request: &PurchaseRequest,
        receipt: &StoredFile,
    ) -> ReceiptValidation {
        let extracted = match self.extract_document_metadata(receipt).await {
            Ok(extracted) => extracted,
            Err(error) => {
                warn!(path = %receipt.path, error = %error, "receipt extraction degraded");
                return ReceiptValidation::failure(error.to_string());
            }
        };

        compare_receipt(request, &extracted)
    }
}

/// Compare extracted receipt metadata against the order. Pure so the rules
/// are testable without network or files.
pub fn compare_receipt(
    request: &PurchaseRequest,
    extracted: &serde_json::Value,
) -> ReceiptValidation {
    let mut discrepancies = Vec::new();

    let expected_vendor = request
        .po_metadata
        .get("vendor_name")
        .or_else(|| request.proforma_metadata.get("vendor_name"))
        .and_then(|value| value.as_str())
        .filter(|vendor| !vendor.is_empty() && *vendor != "Unknown");

    if let Some(expected) = expected_vendor {
        match extracted.get("vendor_name").and_then(|value| value.as_str()) {
            Some(actual) if actual.eq_ignore_ascii_case(expected) => {}
            Some(actual) => discrepancies.push(format!(
                "vendor mismatch: receipt names `{actual}`, order names `{expected}`"
            )),
            None => discrepancies.push("receipt is missing a vendor name".to_string()),
        }
    }

    match receipt_total(extracted) {
        Some(total) => {
            let delta = (total - request.amount).abs();
            if delta > TOTAL_TOLERANCE {
                discrepancies.push(format!(
                    "total mismatch: receipt shows {total}, order amount is {}",
                    request.amount
                ));
            }
        }
        None => discrepancies.push("receipt is missing a total amount".to_string()),
    }

    ReceiptValidation {
        is_valid: discrepancies.is_empty(),
        discrepancies,
        extracted: extracted.clone(),
        error: None,
    }
}

fn receipt_total(extracted: &serde_json::Value) -> Option<Decimal> {
    let value = extracted.get("total_amount")?;

    if let Some(number) = value.as_f64() {
        return Decimal::try_from(number).ok();
    }
    value.as_str().and_then(|raw| raw.parse().ok())
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rust_decimal::Decimal;

    use procura_core::domain::purchase_request::{PurchaseRequest, RequestId, RequestStatus};
    use procura_core::domain::user::UserId;

    use super::compare_receipt;

    fn approved_request(amount: Decimal) -> PurchaseRequest {
        let now = Utc::now();
        PurchaseRequest {
            id: RequestId("pr-1".to_string()),
            title: "Field laptops".to_string(),
            description: "Replacement hardware".to_string(),
            amount,
            status: RequestStatus::Approved,
            created_by: UserId("u-staff".to_string()),
            proforma: None,
            proforma_metadata: serde_json::json!({ "vendor_name": "Acme Supplies" }),
            purchase_order: None,
            po_metadata: serde_json::json!({ "vendor_name": "Acme Supplies" }),
            receipt: None,
            receipt_validation: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn matching_receipt_validates() {
        let request = approved_request(Decimal::new(129_900, 2));
        let extracted = serde_json::json!({
            "vendor_name": "ACME SUPPLIES",
            "total_amount": 1299.00,
        });

        let validation = compare_receipt(&request, &extracted);
        assert!(validation.is_valid, "discrepancies: {:?}", validation.discrepancies);
        assert!(validation.error.is_none());
    }

    #[test]
    fn total_within_tolerance_is_accepted() {
        let request = approved_request(Decimal::new(129_900, 2));
        let extracted = serde_json::json!({
            "vendor_name": "Acme Supplies",
            "total_amount": 1299.75,
        });

        let validation = compare_receipt(&request, &extracted);
        assert!(validation.is_valid);
    }

    #[test]
    fn total_mismatch_is_flagged() {
        let request = approved_request(Decimal::new(129_900, 2));
        let extracted = serde_json::json!({
            "vendor_name": "Acme Supplies",
            "total_amount": 1500.00,
        });

        let validation = compare_receipt(&request, &extracted);
        assert!(!validation.is_valid);
        assert_eq!(validation.discrepancies.len(), 1);
        assert!(validation.discrepancies[0].contains("total mismatch"));
    }

    #[test]
    fn vendor_mismatch_and_missing_total_accumulate() {
        let request = approved_request(Decimal::new(129_900, 2));
        let extracted = serde_json::json!({ "vendor_name": "Globex" });

        let validation = compare_receipt(&request, &extracted);
        assert!(!validation.is_valid);
        assert_eq!(validation.discrepancies.len(), 2);
    }

    #[test]
    fn unknown_order_vendor_skips_the_vendor_check() {
        let mut request = approved_request(Decimal::new(100_00, 2));
        request.po_metadata = serde_json::json!({ "vendor_name": "Unknown" });
        request.proforma_metadata = serde_json::json!({});

        let extracted = serde_json::json!({ "total_amount": "100.00" });
        let validation = compare_receipt(&request, &extracted);
        assert!(validation.is_valid);
    }
}
