//! Text and metadata extraction from uploaded documents.
//!
//! PDFs go through `pdftotext` when the binary is on PATH; plain-text files
//! are read directly. Structured metadata comes from an OpenAI-compatible
//! chat-completions endpoint and every failure path degrades instead of
//! propagating.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::json;
use tokio::process::Command;
use tracing::{debug, warn};

use procura_core::config::ExtractionConfig;
use procura_core::documents::DocumentError;

// The completion prompt caps input size; anything past this is boilerplate.
const MAX_PROMPT_CHARS: usize = 8_000;

const EXTRACTION_PROMPT: &str = "Extract structured data from this proforma invoice. \
Return JSON with these exact fields: \
vendor_name (string), vendor_email (string, empty if not found), \
vendor_phone (string, empty if not found), vendor_address (string, empty if not found), \
items (array of {name, quantity, unit_price, total}), \
subtotal (number), tax (number, 0 if not found), total_amount (number), \
currency (string such as USD or EUR), invoice_number (string, empty if not found), \
invoice_date (YYYY-MM-DD string, empty if not found), \
payment_terms (string, empty if not found), \
delivery_date (YYYY-MM-DD string, empty if not found). \
If any field cannot be determined, use an empty string or 0 for numbers.";

/// Pull plain text out of a stored document.
pub async fn extract_text(path: &Path) -> Result<String, DocumentError> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "txt" | "md" => tokio::fs::read_to_string(path)
            .await
            .map(|text| text.trim().to_string())
            .map_err(|error| DocumentError::Io(error.to_string())),
        "pdf" => pdf_to_text(path).await,
        other => Err(DocumentError::Extraction(format!(
            "unsupported file format `{other}` (supported: pdf, txt, md)"
        ))),
    }
}

async fn pdf_to_text(path: &Path) -> Result<String, DocumentError> {
    let Ok(binary) = which::which("pdftotext") else {
        return Err(DocumentError::Extraction(
            "pdftotext not found in PATH; cannot extract pdf text".to_string(),
        ));
    };

    let output = Command::new(binary)
        .arg(path)
        .arg("-")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|error| DocumentError::Io(error.to_string()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(DocumentError::Extraction(format!(
            "pdftotext exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

/// Client for the metadata-extraction API.
pub struct ExtractionClient {
    http: reqwest::Client,
    config: ExtractionConfig,
}

impl ExtractionClient {
    /// Returns None when no API key is configured; callers degrade to
    /// error-flagged metadata in that case.
    pub fn from_config(config: &ExtractionConfig) -> Option<Self> {
        config.api_key.as_ref()?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .ok()?;

        Some(Self { http, config: config.clone() })
    }

    /// Ask the completion API for the structured metadata of a document.
    pub async fn extract_metadata(&self, text: &str) -> Result<serde_json::Value, DocumentError> {
        let api_key = self
            .config
            .api_key
            .as_ref()
            .ok_or_else(|| DocumentError::Extraction("no api key configured".to_string()))?;

        let prompt: String = text.chars().take(MAX_PROMPT_CHARS).collect();
        let body = json!({
            "model": self.config.model,
            "messages": [
                { "role": "system", "content": EXTRACTION_PROMPT },
                { "role": "user", "content": prompt },
            ],
            "response_format": { "type": "json_object" },
            "temperature": 0.1,
        });
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));

        let mut last_error = DocumentError::Extraction("no attempts made".to_string());
        for attempt in 0..=self.config.max_retries {
            match self.request_once(&url, api_key.expose_secret(), &body).await {
                Ok(metadata) => return Ok(metadata),
                Err(error) => {
                    debug!(attempt, error = %error, "metadata extraction attempt failed");
                    last_error = error;
                }
            }
        }

        warn!(error = %last_error, "metadata extraction exhausted retries");
        Err(last_error)
    }

    async fn request_once(
        &self,
        url: &str,
        api_key: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, DocumentError> {
        let response = self
            .http
            .post(url)
            .bearer_auth(api_key)
            .json(body)
            .send()
            .await
            .map_err(|error| DocumentError::Extraction(error.to_string()))?;

        if !response.status().is_success() {
            return Err(DocumentError::Extraction(format!(
                "extraction api returned {}",
                response.status()
            )));
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|error| DocumentError::Extraction(error.to_string()))?;

        let content = completion
            .choices
            .first()
            .map(|choice| choice.message.content.as_str())
            .ok_or_else(|| {
                DocumentError::Extraction("extraction api returned no choices".to_string())
            })?;

        serde_json::from_str(content).map_err(|error| {
            DocumentError::Extraction(format!("extraction api returned invalid json: {error}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use procura_core::config::ExtractionConfig;
    use procura_core::documents::DocumentError;

    use super::{extract_text, ExtractionClient};

    #[tokio::test]
    async fn plain_text_files_are_read_directly() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("proforma.txt");
        let mut file = std::fs::File::create(&path).expect("create file");
        writeln!(file, "Acme Supplies\nTotal: 100.00 USD").expect("write");

        let text = extract_text(&path).await.expect("extract");
        assert!(text.contains("Acme Supplies"));
    }

    #[tokio::test]
    async fn unknown_formats_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("proforma.docx");
        std::fs::write(&path, b"binary").expect("write");

        let error = extract_text(&path).await.expect_err("unsupported format");
        assert!(matches!(error, DocumentError::Extraction(_)));
    }

    #[test]
    fn client_requires_an_api_key() {
        let config = ExtractionConfig {
            api_key: None,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            timeout_secs: 5,
            max_retries: 0,
        };

        assert!(ExtractionClient::from_config(&config).is_none());

        let with_key = ExtractionConfig { api_key: Some("sk-test".to_string().into()), ..config };
        assert!(ExtractionClient::from_config(&with_key).is_some());
    }
}
