//! Remote text extraction: one page image in, transcribed text out.
//!
//! [`ExtractionClient`] is the seam between the page processor and the
//! remote model. [`VisionExtractor`] implements it over any
//! `edgequake_llm::LLMProvider`; tests substitute scripted clients.
//!
//! ## Error classification
//!
//! Typed `LlmError` variants (rate limit, auth, network, timeout, unknown
//! model) map straight onto an [`ErrorKind`]. Several providers fold every
//! HTTP failure into a free-form `ApiError` ("Gemini API error (429): ...",
//! "Request failed: error sending request for url ..."), so [`classify`]
//! falls back to matching the message text.
//!
//! Messages are passed through [`redact_secrets`] before they are classified,
//! logged or stored: Gemini puts the API key in the request URL.

use crate::error::ErrorKind;
use crate::pipeline::encode::PageImage;
use crate::pipeline::postprocess::clean_text;
use crate::prompts::DEFAULT_SYSTEM_PROMPT;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, LlmError};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::debug;

/// A classified extraction failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct ExtractionError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ExtractionError {
    /// The message is redacted before it is kept.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: redact_secrets(&message.into()),
        }
    }

    /// Build an error from a raw provider message, classifying it.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = redact_secrets(&message.into());
        Self {
            kind: classify(&message),
            message,
        }
    }
}

impl From<LlmError> for ExtractionError {
    fn from(err: LlmError) -> Self {
        let kind = match &err {
            LlmError::RateLimited(_) => ErrorKind::RateLimited,
            LlmError::AuthError(_) => ErrorKind::Unauthorized,
            LlmError::NetworkError(_) | LlmError::Timeout => ErrorKind::NetworkError,
            LlmError::ModelNotFound(_) | LlmError::ConfigError(_) => ErrorKind::ModelUnavailable,
            LlmError::InvalidRequest(_)
            | LlmError::TokenLimitExceeded { .. }
            | LlmError::NotSupported(_) => ErrorKind::InvalidInput,
            _ => return Self::from_message(err.to_string()),
        };
        Self::new(kind, err.to_string())
    }
}

/// Turns one page image into text.
#[async_trait]
pub trait ExtractionClient: Send + Sync {
    async fn extract(&self, image: &PageImage) -> Result<String, ExtractionError>;
}

static RE_RATE_LIMITED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b429\b|resource[_ ]exhausted|rate[- _]?limit|too many requests|quota")
        .unwrap()
});

static RE_UNAUTHORIZED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b40[13]\b|api[_ ]key[_ ]invalid|api key not valid|invalid api key|unauthori[sz]ed|permission[_ ]denied|authentication",
    )
    .unwrap()
});

static RE_UNAVAILABLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b503\b|unavailable|overloaded").unwrap());

static RE_INTERNAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b50[024]\b|\binternal\b|bad gateway|gateway timeout").unwrap());

static RE_NETWORK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)timed? ?out|connection|network|\bdns\b|connect error|reset by peer|broken pipe|error sending request|failed to read response|incomplete message",
    )
    .unwrap()
});

static RE_MODEL_UNAVAILABLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b404\b|model[^.]*not (found|supported)|not_found|no such model").unwrap()
});

static RE_SECRET_PARAM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)([?&](?:key|api[_-]?key|access_token|token)=)[^&\s)\]\x22']+").unwrap()
});

static RE_BEARER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(bearer\s+)[A-Za-z0-9._~+/=-]+").unwrap());

static RE_KEY_LITERAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:AIza[0-9A-Za-z_-]{20,}|sk-[A-Za-z0-9_-]{16,})").unwrap());

/// Replace credentials embedded in a provider message with `<redacted>`.
///
/// Covers `key=`/`api_key=`/`token=` query parameters, bearer tokens, and
/// bare Google (`AIza...`) and OpenAI/Anthropic (`sk-...`) keys.
pub fn redact_secrets(message: &str) -> String {
    let message = RE_SECRET_PARAM.replace_all(message, "${1}<redacted>");
    let message = RE_BEARER.replace_all(&message, "${1}<redacted>");
    RE_KEY_LITERAL
        .replace_all(&message, "<redacted>")
        .into_owned()
}

static RE_INVALID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b400\b|\b413\b|invalid|unsupported|too large").unwrap());

/// Classify a raw provider error message.
///
/// Checked in order: rate limiting, rejected credentials, unavailability,
/// server errors, network problems, unknown model, invalid input. Anything
/// else is [`ErrorKind::Unknown`].
pub fn classify(message: &str) -> ErrorKind {
    if RE_RATE_LIMITED.is_match(message) {
        ErrorKind::RateLimited
    } else if RE_UNAUTHORIZED.is_match(message) {
        ErrorKind::Unauthorized
    } else if RE_UNAVAILABLE.is_match(message) {
        ErrorKind::ServiceUnavailable
    } else if RE_INTERNAL.is_match(message) {
        ErrorKind::InternalError
    } else if RE_NETWORK.is_match(message) {
        ErrorKind::NetworkError
    } else if RE_MODEL_UNAVAILABLE.is_match(message) {
        ErrorKind::ModelUnavailable
    } else if RE_INVALID.is_match(message) {
        ErrorKind::InvalidInput
    } else {
        ErrorKind::Unknown
    }
}

/// [`ExtractionClient`] backed by a vision-capable LLM provider.
///
/// ## Message Layout
///
/// 1. **System message**: the transcription prompt (or user-supplied override)
/// 2. **User message**: the page image as a base64 attachment (empty text)
pub struct VisionExtractor {
    provider: Arc<dyn LLMProvider>,
    system_prompt: String,
    options: CompletionOptions,
}

impl VisionExtractor {
    pub fn new(provider: Arc<dyn LLMProvider>) -> Self {
        Self {
            provider,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            options: CompletionOptions {
                temperature: Some(0.1),
                max_tokens: Some(8192),
                ..Default::default()
            },
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_sampling(mut self, temperature: f32, max_tokens: usize) -> Self {
        self.options.temperature = Some(temperature);
        self.options.max_tokens = Some(max_tokens);
        self
    }
}

#[async_trait]
impl ExtractionClient for VisionExtractor {
    async fn extract(&self, image: &PageImage) -> Result<String, ExtractionError> {
        let start = Instant::now();
        let image_data =
            ImageData::new(STANDARD.encode(&image.data), image.mime_type).with_detail("high");
        let messages = vec![
            ChatMessage::system(self.system_prompt.as_str()),
            ChatMessage::user_with_images("", vec![image_data]),
        ];

        let response = self
            .provider
            .chat(&messages, Some(&self.options))
            .await
            .map_err(ExtractionError::from)?;

        debug!(
            input_tokens = response.prompt_tokens,
            output_tokens = response.completion_tokens,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Model replied"
        );

        let text = clean_text(&response.content);
        if text.trim().is_empty() {
            return Err(ExtractionError::new(
                ErrorKind::EmptyResponse,
                "model returned no text",
            ));
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_messages() {
        for msg in [
            "HTTP 429 Too Many Requests",
            "status: RESOURCE_EXHAUSTED",
            "You exceeded your current quota",
            "Rate limit reached for requests",
        ] {
            assert_eq!(classify(msg), ErrorKind::RateLimited, "{msg}");
        }
    }

    #[test]
    fn credential_messages() {
        for msg in [
            "API key not valid. Please pass a valid API key. (API_KEY_INVALID)",
            "401 Unauthorized",
            "PERMISSION_DENIED: caller lacks permission",
        ] {
            assert_eq!(classify(msg), ErrorKind::Unauthorized, "{msg}");
        }
    }

    #[test]
    fn transient_messages() {
        assert_eq!(
            classify("503 Service Unavailable: model is overloaded"),
            ErrorKind::ServiceUnavailable
        );
        assert_eq!(classify("500 Internal Server Error"), ErrorKind::InternalError);
        assert_eq!(classify("502 Bad Gateway"), ErrorKind::InternalError);
        assert_eq!(
            classify("error sending request: connection refused"),
            ErrorKind::NetworkError
        );
        assert_eq!(classify("operation timed out"), ErrorKind::NetworkError);
    }

    #[test]
    fn invalid_and_unknown_messages() {
        assert_eq!(
            classify("400 Bad Request: unsupported image format"),
            ErrorKind::InvalidInput
        );
        assert_eq!(classify("something odd happened"), ErrorKind::Unknown);
    }

    #[test]
    fn rate_limit_wins_over_other_patterns() {
        assert_eq!(
            classify("503 UNAVAILABLE: quota exceeded"),
            ErrorKind::RateLimited
        );
    }

    const GEMINI_SEND_FAILURE: &str = "API error: Request failed: error sending request for url \
        (https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-pro:generateContent?key=AIzaSyDUMMYSECRETKEY1234567)";

    #[test]
    fn gemini_send_failure_is_a_network_error() {
        assert_eq!(classify(GEMINI_SEND_FAILURE), ErrorKind::NetworkError);
        let err = ExtractionError::from(LlmError::ApiError(
            "Request failed: error sending request for url (https://example.test/)".into(),
        ));
        assert_eq!(err.kind, ErrorKind::NetworkError);
    }

    #[test]
    fn gemini_status_messages() {
        assert_eq!(
            classify("API error: Gemini API error (429): Resource has been exhausted"),
            ErrorKind::RateLimited
        );
        assert_eq!(
            classify("API error: Gemini API error (503): The model is overloaded."),
            ErrorKind::ServiceUnavailable
        );
        assert_eq!(
            classify("API error: Gemini API error (404): models/gemini-9 is not found for API version v1beta"),
            ErrorKind::ModelUnavailable
        );
    }

    #[test]
    fn typed_provider_errors_skip_message_matching() {
        let cases = [
            (LlmError::RateLimited("slow down".into()), ErrorKind::RateLimited),
            (LlmError::AuthError("bad key".into()), ErrorKind::Unauthorized),
            (LlmError::NetworkError("Connection failed".into()), ErrorKind::NetworkError),
            (LlmError::Timeout, ErrorKind::NetworkError),
            (LlmError::ModelNotFound("gpt-9".into()), ErrorKind::ModelUnavailable),
            (LlmError::ConfigError("no endpoint".into()), ErrorKind::ModelUnavailable),
            (LlmError::InvalidRequest("image too large".into()), ErrorKind::InvalidInput),
            (LlmError::ProviderError("something odd".into()), ErrorKind::Unknown),
        ];
        for (err, kind) in cases {
            let text = err.to_string();
            assert_eq!(ExtractionError::from(err).kind, kind, "{text}");
        }
    }

    #[test]
    fn secrets_are_redacted_from_messages() {
        let err = ExtractionError::from_message(GEMINI_SEND_FAILURE);
        assert!(!err.message.contains("AIzaSyDUMMYSECRETKEY1234567"), "{}", err.message);
        assert!(err.message.contains("key=<redacted>)"), "{}", err.message);
        assert_eq!(err.kind, ErrorKind::NetworkError);

        assert_eq!(
            redact_secrets("Authorization: Bearer sk-ant-REDACTED"),
            "Authorization: Bearer <redacted>"
        );
        assert_eq!(
            redact_secrets("invalid key sk-proj-abcdefghijklmnop1234 supplied"),
            "invalid key <redacted> supplied"
        );
        assert_eq!(
            ExtractionError::new(ErrorKind::Unknown, "url?alt=sse&api_key=s3cr3t").message,
            "url?alt=sse&api_key=<redacted>"
        );
    }

    #[test]
    fn error_display_includes_kind() {
        let err = ExtractionError::from_message("HTTP 429");
        assert_eq!(err.kind, ErrorKind::RateLimited);
        assert_eq!(err.to_string(), "rate_limited: HTTP 429");
    }
}
