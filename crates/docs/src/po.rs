//! Purchase-order rendering.
//!
//! Renders an HTML purchase order from the embedded Tera template and
//! converts it with wkhtmltopdf when the binary is available. Without the
//! converter the HTML itself is stored, so generation still produces a
//! document on minimal hosts.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use chrono::Utc;
use tera::{Context, Tera};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{info, warn};

use procura_core::documents::{DocumentError, GeneratedDocument};
use procura_core::domain::purchase_request::{PurchaseRequest, StoredFile};

const PO_TEMPLATE: &str = "purchase_order.html.tera";

/// First segment of a textual UUID, used for human-readable numbers.
fn short_id(id: &str) -> String {
    id.chars().take(8).collect::<String>().to_ascii_uppercase()
}

pub struct PurchaseOrderRenderer {
    tera: Tera,
    wkhtmltopdf_path: Option<PathBuf>,
    root: PathBuf,
}

impl PurchaseOrderRenderer {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, DocumentError> {
        let mut tera = Tera::default();
        tera.add_raw_template(PO_TEMPLATE, include_str!("../templates/purchase_order.html.tera"))
            .map_err(|error| DocumentError::Template(error.to_string()))?;

        let wkhtmltopdf_path = which::which("wkhtmltopdf").ok();
        if wkhtmltopdf_path.is_none() {
            warn!("wkhtmltopdf not found in PATH; purchase orders will be stored as html");
        }

        Ok(Self { tera, wkhtmltopdf_path, root: root.into() })
    }

    /// Force HTML output regardless of what is installed. Used by tests.
    pub fn without_converter(mut self) -> Self {
        self.wkhtmltopdf_path = None;
        self
    }

    pub async fn render(
        &self,
        request: &PurchaseRequest,
    ) -> Result<GeneratedDocument, DocumentError> {
        let po_number = format!("PO-{}", short_id(&request.id.0));
        let issued_on = Utc::now();
        let vendor_name = request
            .proforma_metadata
            .get("vendor_name")
            .and_then(|value| value.as_str())
            .unwrap_or("Unknown")
            .to_string();
        let currency = request
            .proforma_metadata
            .get("currency")
            .and_then(|value| value.as_str())
            .unwrap_or("USD")
            .to_string();

        let mut context = Context::new();
        context.insert("po_number", &po_number);
        context.insert("issued_on", &issued_on.format("%Y-%m-%d").to_string());
        context.insert("vendor_name", &vendor_name);
        context.insert("request_id", &request.id.0);
        context.insert("title", &request.title);
        context.insert("description", &request.description);
        context.insert("amount", &request.amount.to_string());
        context.insert("currency", &currency);

        let html = self
            .tera
            .render(PO_TEMPLATE, &context)
            .map_err(|error| DocumentError::Template(error.to_string()))?;

        let directory = self.root.join("purchase_orders");
        tokio::fs::create_dir_all(&directory)
            .await
            .map_err(|error| DocumentError::Io(error.to_string()))?;

        let (file, renderer) = match &self.wkhtmltopdf_path {
            Some(binary) => {
                let target = directory.join(format!("{}.pdf", request.id.0));
                convert_to_pdf(binary, &html, &target).await?;
                (target, "wkhtmltopdf")
            }
            None => {
                let target = directory.join(format!("{}.html", request.id.0));
                tokio::fs::write(&target, &html)
                    .await
                    .map_err(|error| DocumentError::Io(error.to_string()))?;
                (target, "html")
            }
        };

        info!(
            request_id = %request.id.0,
            po_number = %po_number,
            renderer,
            "purchase order generated"
        );

        Ok(GeneratedDocument {
            file: StoredFile { path: file.to_string_lossy().to_string() },
            metadata: serde_json::json!({
                "po_number": po_number,
                "generated_at": issued_on.to_rfc3339(),
                "vendor_name": vendor_name,
                "total_amount": request.amount.to_string(),
                "currency": currency,
                "renderer": renderer,
            }),
        })
    }
}

async fn convert_to_pdf(binary: &Path, html: &str, target: &Path) -> Result<(), DocumentError> {
    let mut child = Command::new(binary)
        .arg("--quiet")
        .arg("-")
        .arg(target)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|error| DocumentError::Io(error.to_string()))?;

    if let Some(stdin) = child.stdin.as_mut() {
        stdin
            .write_all(html.as_bytes())
            .await
            .map_err(|error| DocumentError::Io(error.to_string()))?;
    }

    let output =
        child.wait_with_output().await.map_err(|error| DocumentError::Io(error.to_string()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(DocumentError::Conversion(format!(
            "wkhtmltopdf exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rust_decimal::Decimal;

    use procura_core::domain::purchase_request::{PurchaseRequest, RequestId, RequestStatus};
    use procura_core::domain::user::UserId;

    use super::PurchaseOrderRenderer;

    fn approved_request() -> PurchaseRequest {
        let now = Utc::now();
        PurchaseRequest {
            id: RequestId("0a1b2c3d-0000-4000-8000-000000000000".to_string()),
            title: "Field laptops".to_string(),
            description: "Replacement hardware".to_string(),
            amount: Decimal::new(129_900, 2),
            status: RequestStatus::Approved,
            created_by: UserId("u-staff".to_string()),
            proforma: None,
            proforma_metadata: serde_json::json!({ "vendor_name": "Acme Supplies" }),
            purchase_order: None,
            po_metadata: serde_json::json!({}),
            receipt: None,
            receipt_validation: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn renders_an_html_purchase_order_without_the_converter() {
        let dir = tempfile::tempdir().expect("tempdir");
        let renderer =
            PurchaseOrderRenderer::new(dir.path()).expect("renderer").without_converter();

        let document = renderer.render(&approved_request()).await.expect("render");

        assert_eq!(document.metadata["po_number"], "PO-0A1B2C3D");
        assert_eq!(document.metadata["vendor_name"], "Acme Supplies");
        assert_eq!(document.metadata["renderer"], "html");

        let html = std::fs::read_to_string(&document.file.path).expect("read output");
        assert!(html.contains("PO-0A1B2C3D"));
        assert!(html.contains("Field laptops"));
        assert!(html.contains("1299.00"));
    }
}
