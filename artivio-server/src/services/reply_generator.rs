//! Reply generation against the Gemini API.
//!
//! The generator has a total contract: `generate` always resolves to text
//! that can be shown to the user. Provider failures never escape this
//! boundary; each error class maps to a fixed, user-safe apology string.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{Value, json};
use shared::config::server::AiConfig;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// User-facing strings substituted for provider failures, keyed by error
/// class. Fixed wording: clients and history records depend on it.
pub mod apologies {
    pub const NOT_CONFIGURED: &str =
        "Gemini AI is not properly configured. Please check the API key.";
    pub const BAD_REQUEST: &str = "I received an invalid request. Please rephrase your message.";
    pub const UNAUTHORIZED: &str = "I'm having authentication issues. Please contact support.";
    pub const FORBIDDEN: &str = "I don't have permission to process this request.";
    pub const RATE_LIMITED: &str =
        "I'm getting too many requests right now. Please wait a moment and try again.";
    pub const SERVICE_UNAVAILABLE: &str =
        "The AI service is temporarily unavailable. Please try again in a moment.";
    pub const UNEXPECTED: &str = "Sorry, I encountered an unexpected error. Please try again.";
    pub const UNEXPECTED_FORMAT: &str =
        "I received an unexpected response format. Please try again.";
    pub const PARSE_FAILURE: &str = "I had trouble processing the response. Please try again.";
}

/// Black-box text generation capability.
///
/// Contract: `generate` always resolves to some text and never returns an
/// error past this boundary; provider failures surface as user-safe
/// apology strings.
#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    async fn generate(&self, prompt: &str, context: Option<&str>) -> String;

    fn is_configured(&self) -> bool;

    fn model_name(&self) -> &str;
}

/// [`ReplyGenerator`] backed by the Gemini `generateContent` endpoint.
pub struct GeminiReplyGenerator {
    http: reqwest::Client,
    config: AiConfig,
}

impl std::fmt::Debug for GeminiReplyGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiReplyGenerator")
            .field("model", &self.config.model)
            .finish()
    }
}

impl GeminiReplyGenerator {
    /// Builds a generator whose HTTP client enforces the configured
    /// round-trip timeout.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: AiConfig) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;
        Ok(Self { http, config })
    }

    async fn call_gemini(&self, full_prompt: &str) -> String {
        let url = format!("{GEMINI_API_BASE}/{}:generateContent", self.config.model);
        let body = json!({
            "contents": [{ "parts": [{ "text": full_prompt }] }],
            "generationConfig": {
                "temperature": self.config.temperature,
                "topK": 32,
                "topP": 1.0,
                "maxOutputTokens": self.config.max_tokens,
                "stopSequences": [],
            },
            "safetySettings": [
                { "category": "HARM_CATEGORY_HARASSMENT", "threshold": "BLOCK_MEDIUM_AND_ABOVE" },
                { "category": "HARM_CATEGORY_HATE_SPEECH", "threshold": "BLOCK_MEDIUM_AND_ABOVE" },
                { "category": "HARM_CATEGORY_SEXUALLY_EXPLICIT", "threshold": "BLOCK_MEDIUM_AND_ABOVE" },
                { "category": "HARM_CATEGORY_DANGEROUS_CONTENT", "threshold": "BLOCK_MEDIUM_AND_ABOVE" },
            ],
        });

        debug!(model = %self.config.model, "sending request to Gemini API");

        let response = match self
            .http
            .post(&url)
            .header("x-goog-api-key", &self.config.api_key)
            .json(&body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) if err.is_timeout() => {
                error!(model = %self.config.model, "Gemini API request timed out");
                return apologies::SERVICE_UNAVAILABLE.to_string();
            }
            Err(err) => {
                error!(error = %err, "error calling Gemini API");
                return apologies::UNEXPECTED.to_string();
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Gemini API returned an error status");
            return apology_for_status(status).to_string();
        }

        match response.json::<Value>().await {
            Ok(value) => extract_text(&value).unwrap_or_else(|| {
                warn!("unexpected response format from Gemini API");
                apologies::UNEXPECTED_FORMAT.to_string()
            }),
            Err(err) => {
                error!(error = %err, "error parsing Gemini response");
                apologies::PARSE_FAILURE.to_string()
            }
        }
    }
}

#[async_trait]
impl ReplyGenerator for GeminiReplyGenerator {
    async fn generate(&self, prompt: &str, context: Option<&str>) -> String {
        if !self.is_configured() {
            warn!("Gemini API key not configured; returning canned reply");
            return apologies::NOT_CONFIGURED.to_string();
        }

        let full_prompt = build_full_prompt(prompt, context);
        let started = Instant::now();
        let reply = self.call_gemini(&full_prompt).await;
        metrics::histogram!("artivio_generation_seconds").record(started.elapsed().as_secs_f64());
        reply
    }

    fn is_configured(&self) -> bool {
        !self.config.api_key.is_empty() && self.config.api_key != "demo"
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}

/// Maps a provider error status to its fixed user-facing apology.
#[must_use]
pub fn apology_for_status(status: StatusCode) -> &'static str {
    match status.as_u16() {
        400 => apologies::BAD_REQUEST,
        401 => apologies::UNAUTHORIZED,
        403 => apologies::FORBIDDEN,
        429 => apologies::RATE_LIMITED,
        500 | 502 | 503 => apologies::SERVICE_UNAVAILABLE,
        _ => apologies::UNEXPECTED,
    }
}

/// Assembles the persona preamble, optional conversation context, and the
/// user message into one prompt.
#[must_use]
pub fn build_full_prompt(user_message: &str, context: Option<&str>) -> String {
    let mut prompt = String::new();

    prompt.push_str(
        "You are Artivio AI, a helpful and creative assistant integrated into the Artivio \
         chat application. Artivio's tagline is 'Where creativity meets intelligence'. ",
    );
    prompt.push_str("\n\nPersonality and Guidelines:");
    prompt.push_str("\n- Be conversational, friendly, and engaging");
    prompt.push_str("\n- Provide helpful, accurate, and creative responses");
    prompt.push_str("\n- Keep responses concise but informative (aim for 1-3 paragraphs)");
    prompt.push_str("\n- Use a warm, professional tone");
    prompt.push_str("\n- If asked about yourself, mention you're Artivio AI");
    prompt.push_str("\n- Be helpful with coding, creative writing, analysis, and general questions");
    prompt.push_str("\n- If you're unsure about something, say so honestly");

    if let Some(context) = context.filter(|context| !context.trim().is_empty()) {
        prompt.push_str("\n\nPrevious conversation context:\n");
        prompt.push_str(context);
    }

    prompt.push_str("\n\nUser message: ");
    prompt.push_str(user_message);
    prompt.push_str("\n\nPlease provide a helpful response:");

    prompt
}

fn extract_text(value: &Value) -> Option<String> {
    let text = value
        .get("candidates")?
        .get(0)?
        .get("content")?
        .get("parts")?
        .get(0)?
        .get("text")?
        .as_str()?;
    Some(text.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_is_fixed_per_error_class() {
        assert_eq!(
            apology_for_status(StatusCode::BAD_REQUEST),
            apologies::BAD_REQUEST
        );
        assert_eq!(
            apology_for_status(StatusCode::UNAUTHORIZED),
            apologies::UNAUTHORIZED
        );
        assert_eq!(
            apology_for_status(StatusCode::FORBIDDEN),
            apologies::FORBIDDEN
        );
        assert_eq!(
            apology_for_status(StatusCode::TOO_MANY_REQUESTS),
            apologies::RATE_LIMITED
        );
        for status in [
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
        ] {
            assert_eq!(apology_for_status(status), apologies::SERVICE_UNAVAILABLE);
        }
        assert_eq!(
            apology_for_status(StatusCode::IM_A_TEAPOT),
            apologies::UNEXPECTED
        );
    }

    #[test]
    fn prompt_includes_context_when_present() {
        let prompt = build_full_prompt("What is Rust?", Some("[Alice]: hi\n[Artivio AI]: hello"));
        assert!(prompt.contains("Previous conversation context:"));
        assert!(prompt.contains("[Alice]: hi"));
        assert!(prompt.contains("User message: What is Rust?"));
    }

    #[test]
    fn prompt_omits_empty_context() {
        for context in [None, Some(""), Some("   ")] {
            let prompt = build_full_prompt("hello", context);
            assert!(!prompt.contains("Previous conversation context:"));
        }
    }

    #[test]
    fn extract_text_reads_first_candidate() {
        let value = json!({
            "candidates": [{
                "content": { "parts": [{ "text": "  Hello from Gemini.  " }] }
            }]
        });
        assert_eq!(extract_text(&value).unwrap(), "Hello from Gemini.");
    }

    #[test]
    fn extract_text_rejects_malformed_payloads() {
        assert!(extract_text(&json!({})).is_none());
        assert!(extract_text(&json!({ "candidates": [] })).is_none());
        assert!(extract_text(&json!({ "candidates": [{ "content": {} }] })).is_none());
    }

    #[tokio::test]
    async fn unconfigured_generator_short_circuits() {
        let generator = GeminiReplyGenerator::new(AiConfig::default()).unwrap();
        assert!(!generator.is_configured());
        let reply = generator.generate("hello", None).await;
        assert_eq!(reply, apologies::NOT_CONFIGURED);
    }

    #[test]
    fn placeholder_key_counts_as_unconfigured() {
        let generator = GeminiReplyGenerator::new(AiConfig::default()).unwrap();
        assert!(!generator.is_configured());

        let configured = GeminiReplyGenerator::new(AiConfig {
            api_key: "real-key".into(),
            ..AiConfig::default()
        })
        .unwrap();
        assert!(configured.is_configured());
    }
}
