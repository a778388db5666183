//! Optional text recognition on canonical assets
//!
//! Recognition is strictly best effort: [`OcrGate::recognize`] never returns
//! an error, and a kill switch (config or `CAPTURE_DISABLE_OCR`) turns it into
//! a no-op that always yields nothing.

use crate::CaptureError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Longest text kept from a recognition result, in characters.
pub const MAX_OCR_TEXT_CHARS: usize = 20_000;

/// Environment variable that forces recognition off.
pub const DISABLE_OCR_ENV: &str = "CAPTURE_DISABLE_OCR";

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct OcrResult {
    pub text: Option<String>,
    pub language: Option<String>,
    pub confidence: Option<f32>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TextRecognizer: Send + Sync {
    async fn recognize(&self, png: &[u8]) -> Result<Option<OcrResult>, CaptureError>;
}

/// Recognizer that never finds anything.
pub struct DisabledRecognizer;

#[async_trait]
impl TextRecognizer for DisabledRecognizer {
    async fn recognize(&self, _png: &[u8]) -> Result<Option<OcrResult>, CaptureError> {
        Ok(None)
    }
}

/// Posts PNG bytes to a recognition service that answers with an
/// [`OcrResult`] JSON body.
pub struct HttpRecognizer {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpRecognizer {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, CaptureError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl TextRecognizer for HttpRecognizer {
    async fn recognize(&self, png: &[u8]) -> Result<Option<OcrResult>, CaptureError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "image/png")
            .body(png.to_vec())
            .send()
            .await?
            .error_for_status()?;

        if response.status() == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }
        Ok(Some(response.json::<OcrResult>().await?))
    }
}

pub fn ocr_disabled_by_env() -> bool {
    std::env::var(DISABLE_OCR_ENV)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

/// Trim, drop empty text, and clamp to [`MAX_OCR_TEXT_CHARS`] characters.
pub fn sanitize_ocr_text(text: Option<&str>) -> Option<String> {
    let trimmed = text?.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.chars().take(MAX_OCR_TEXT_CHARS).collect())
}

/// Kill switch plus error containment around a [`TextRecognizer`].
pub struct OcrGate {
    recognizer: Arc<dyn TextRecognizer>,
    enabled: bool,
    disabled_notice: std::sync::atomic::AtomicBool,
}

impl OcrGate {
    pub fn new(recognizer: Arc<dyn TextRecognizer>, enabled: bool) -> Self {
        Self {
            recognizer,
            enabled: enabled && !ocr_disabled_by_env(),
            disabled_notice: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn disabled() -> Self {
        Self::new(Arc::new(DisabledRecognizer), false)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub async fn recognize(&self, png: &[u8]) -> Option<OcrResult> {
        if !self.enabled {
            if !self.disabled_notice.swap(true, std::sync::atomic::Ordering::Relaxed) {
                info!(event = "ocr_disabled", "Text recognition disabled");
            }
            return None;
        }
        if png.is_empty() {
            return None;
        }

        match self.recognizer.recognize(png).await {
            Ok(Some(result)) => {
                let text = sanitize_ocr_text(result.text.as_deref());
                Some(OcrResult {
                    text,
                    language: result.language.filter(|l| !l.trim().is_empty()),
                    confidence: result.confidence,
                })
            }
            Ok(None) => None,
            Err(e) => {
                warn!(event = "ocr_error", error = %e, "Text recognition failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_trims_and_clamps() {
        assert_eq!(sanitize_ocr_text(None), None);
        assert_eq!(sanitize_ocr_text(Some("   \n ")), None);
        assert_eq!(sanitize_ocr_text(Some("  Buy now \n")).as_deref(), Some("Buy now"));

        let long = "é".repeat(MAX_OCR_TEXT_CHARS + 50);
        assert_eq!(sanitize_ocr_text(Some(&long)).unwrap().chars().count(), MAX_OCR_TEXT_CHARS);
    }

    #[tokio::test]
    async fn errors_are_swallowed() {
        let mut mock = MockTextRecognizer::new();
        mock.expect_recognize()
            .times(1)
            .returning(|_| Err(CaptureError::Network("503".to_string())));

        let gate = OcrGate::new(Arc::new(mock), true);
        assert_eq!(gate.recognize(b"png").await, None);
    }

    #[tokio::test]
    async fn results_are_sanitized() {
        let mut mock = MockTextRecognizer::new();
        mock.expect_recognize().returning(|_| {
            Ok(Some(OcrResult {
                text: Some("  SALE 50%  ".to_string()),
                language: Some(String::new()),
                confidence: Some(0.93),
            }))
        });

        let gate = OcrGate::new(Arc::new(mock), true);
        let result = gate.recognize(b"png").await.unwrap();
        assert_eq!(result.text.as_deref(), Some("SALE 50%"));
        assert_eq!(result.language, None);
        assert_eq!(result.confidence, Some(0.93));
    }

    #[tokio::test]
    async fn disabled_gate_never_calls_recognizer() {
        let mut mock = MockTextRecognizer::new();
        mock.expect_recognize().times(0);

        let gate = OcrGate::new(Arc::new(mock), false);
        assert!(!gate.is_enabled());
        assert_eq!(gate.recognize(b"png").await, None);
    }
}
