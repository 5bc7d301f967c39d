//! Enrichment capability boundary: generated product images and copy.
//!
//! The pipeline talks to a trait; failures are per-call values the caller
//! absorbs at row level, never batch-fatal control flow.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use pce_core::ProductRecord;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "pce-enrich";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentKind {
    Image,
    ShortDescription,
    LongDescription,
}

impl EnrichmentKind {
    pub const ALL: [EnrichmentKind; 3] = [
        EnrichmentKind::Image,
        EnrichmentKind::ShortDescription,
        EnrichmentKind::LongDescription,
    ];
}

impl FromStr for EnrichmentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "image" => Ok(EnrichmentKind::Image),
            "short" | "short_description" | "short-description" => {
                Ok(EnrichmentKind::ShortDescription)
            }
            "long" | "long_description" | "long-description" => {
                Ok(EnrichmentKind::LongDescription)
            }
            other => Err(format!(
                "unknown enrichment kind `{other}` (expected image, short, or long)"
            )),
        }
    }
}

/// Generated artifacts for one record. Absent fields were not requested or
/// not produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Enrichment {
    pub image: Option<String>,
    pub short_description: Option<String>,
    pub long_description: Option<String>,
}

impl Enrichment {
    pub fn is_empty(&self) -> bool {
        self.image.is_none() && self.short_description.is_none() && self.long_description.is_none()
    }
}

#[derive(Debug, Error)]
pub enum EnrichError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} from generation endpoint")]
    HttpStatus { status: u16 },
    #[error("generation response carried no usable payload")]
    EmptyPayload,
    #[error("missing API key; set GEMINI_API_KEY or use the template enricher")]
    MissingApiKey,
}

/// External generation capability. Calls are rate/cost-bounded; the caller
/// is expected to invoke them strictly sequentially.
#[async_trait]
pub trait Enricher: Send + Sync {
    async fn enrich(
        &self,
        record: &ProductRecord,
        kinds: &[EnrichmentKind],
    ) -> Result<Enrichment, EnrichError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct EnrichConfig {
    pub api_key: Option<String>,
    pub text_model: String,
    pub image_model: String,
    /// Base URL of the generative-language REST API; overridable for tests.
    pub endpoint: String,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl EnrichConfig {
    pub fn from_env() -> Self {
        Self {
            api_key: std::env::var("GEMINI_API_KEY")
                .ok()
                .filter(|key| !key.trim().is_empty()),
            text_model: std::env::var("PCE_TEXT_MODEL")
                .unwrap_or_else(|_| "gemini-2.0-flash".to_string()),
            image_model: std::env::var("PCE_IMAGE_MODEL")
                .unwrap_or_else(|_| "gemini-2.5-flash-image".to_string()),
            endpoint: std::env::var("PCE_GENAI_ENDPOINT")
                .unwrap_or_else(|_| "https://generativelanguage.googleapis.com/v1beta".to_string()),
            timeout: Duration::from_secs(
                std::env::var("PCE_HTTP_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(30),
            ),
            backoff: BackoffPolicy::default(),
        }
    }
}

// ------------------------------
// Wire format (generateContent)
// ------------------------------

#[derive(Debug, Clone, Serialize)]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(rename = "generationConfig", skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Clone, Serialize)]
struct GenerationConfig {
    #[serde(rename = "responseModalities")]
    response_modalities: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(
        rename = "inlineData",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    inline_data: Option<InlineData>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct InlineData {
    #[serde(rename = "mimeType", default)]
    mime_type: String,
    data: String,
}

#[derive(Debug, Clone, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Clone, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
}

fn response_text(response: &GenerateContentResponse) -> Option<String> {
    let content = response.candidates.first()?.content.as_ref()?;
    let text: String = content
        .parts
        .iter()
        .filter_map(|part| part.text.as_deref())
        .collect();
    let text = text.trim().to_string();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn response_image_data_uri(response: &GenerateContentResponse) -> Option<String> {
    let content = response.candidates.first()?.content.as_ref()?;
    content.parts.iter().find_map(|part| {
        part.inline_data.as_ref().map(|inline| {
            let mime = if inline.mime_type.is_empty() {
                "image/png"
            } else {
                inline.mime_type.as_str()
            };
            format!("data:{};base64,{}", mime, inline.data)
        })
    })
}

fn image_prompt(subject: &str) -> String {
    format!(
        "High-quality e-commerce product photo of {subject}, white background, \
         realistic, studio lighting"
    )
}

fn short_description_prompt(subject: &str) -> String {
    format!(
        "Write a short, concise paragraph describing '{subject}' for e-commerce. \
         Highlight quality and key features in 1-2 sentences."
    )
}

fn long_description_prompt(subject: &str) -> String {
    format!(
        "Write a detailed e-commerce product description for '{subject}'. \
         Cover key features, materials, and typical use cases in 3-5 sentences."
    )
}

/// Hosted-model enricher speaking the generative-language REST API, with
/// exponential backoff on 429/5xx and transport errors.
pub struct GeminiEnricher {
    client: reqwest::Client,
    config: EnrichConfig,
    api_key: String,
}

impl GeminiEnricher {
    pub fn new(config: EnrichConfig) -> Result<Self, EnrichError> {
        let api_key = config.api_key.clone().ok_or(EnrichError::MissingApiKey)?;
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            client,
            config,
            api_key,
        })
    }

    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        image_output: bool,
    ) -> Result<GenerateContentResponse, EnrichError> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.config.endpoint.trim_end_matches('/'),
            model,
            self.api_key
        );
        let request = GenerateContentRequest {
            contents: vec![Content {
                parts: vec![Part {
                    text: Some(prompt.to_string()),
                    inline_data: None,
                }],
            }],
            generation_config: image_output.then(|| GenerationConfig {
                response_modalities: vec!["IMAGE".to_string()],
            }),
        };

        let mut attempt = 0;
        loop {
            match self.client.post(&url).json(&request).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp.json::<GenerateContentResponse>().await?);
                    }
                    if classify_status(status) == RetryDisposition::NonRetryable
                        || attempt >= self.config.backoff.max_retries
                    {
                        return Err(EnrichError::HttpStatus {
                            status: status.as_u16(),
                        });
                    }
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::NonRetryable
                        || attempt >= self.config.backoff.max_retries
                    {
                        return Err(EnrichError::Request(err));
                    }
                }
            }

            let delay = self.config.backoff.delay_for_attempt(attempt);
            debug!(model, attempt, ?delay, "generation call failed; retrying");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[async_trait]
impl Enricher for GeminiEnricher {
    async fn enrich(
        &self,
        record: &ProductRecord,
        kinds: &[EnrichmentKind],
    ) -> Result<Enrichment, EnrichError> {
        let subject = record.identifier.trim();
        let mut out = Enrichment::default();

        for kind in kinds {
            match kind {
                EnrichmentKind::Image => {
                    let response = self
                        .generate(&self.config.image_model, &image_prompt(subject), true)
                        .await?;
                    out.image =
                        Some(response_image_data_uri(&response).ok_or(EnrichError::EmptyPayload)?);
                }
                EnrichmentKind::ShortDescription => {
                    let response = self
                        .generate(
                            &self.config.text_model,
                            &short_description_prompt(subject),
                            false,
                        )
                        .await?;
                    out.short_description =
                        Some(response_text(&response).ok_or(EnrichError::EmptyPayload)?);
                }
                EnrichmentKind::LongDescription => {
                    let response = self
                        .generate(
                            &self.config.text_model,
                            &long_description_prompt(subject),
                            false,
                        )
                        .await?;
                    out.long_description =
                        Some(response_text(&response).ok_or(EnrichError::EmptyPayload)?);
                }
            }
        }
        Ok(out)
    }
}

/// 1x1 placeholder PNG used when no hosted image model is reachable.
pub const PLACEHOLDER_PNG_BASE64: &str =
    "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAQAAAC1HAwCAAAAC0lEQVR42mNkYAAAAAYAAjCB0C8AAAAASUVORK5CYII=";

/// Deterministic offline enricher mirroring the templated copy the hosted
/// service falls back to. Useful for air-gapped runs and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateEnricher;

#[async_trait]
impl Enricher for TemplateEnricher {
    async fn enrich(
        &self,
        record: &ProductRecord,
        kinds: &[EnrichmentKind],
    ) -> Result<Enrichment, EnrichError> {
        let subject = record.identifier.trim();
        let mut out = Enrichment::default();
        for kind in kinds {
            match kind {
                EnrichmentKind::Image => {
                    out.image = Some(format!("data:image/png;base64,{PLACEHOLDER_PNG_BASE64}"));
                }
                EnrichmentKind::ShortDescription => {
                    out.short_description = Some(format!(
                        "{subject} is a high-quality, reliable product for e-commerce."
                    ));
                }
                EnrichmentKind::LongDescription => {
                    out.long_description = Some(format!(
                        "{subject} is a premium product suitable for your e-commerce store. \
                         Features high quality, durability, and excellent value for customers."
                    ));
                }
            }
        }
        Ok(out)
    }
}
