//! Error types for the pdf-ocr-batch library.
//!
//! Two distinct shapes reflect two distinct failure modes:
//!
//! * [`OcrError`]: **Fatal**: the run cannot proceed at all (no credential,
//!   no input folder, the progress file cannot be written). Returned as
//!   `Err(OcrError)` from the batch entry points.
//!
//! * [`ErrorKind`]: **Per page**: the classification of a single failed
//!   extraction attempt. It is stored in the progress file next to the page
//!   it belongs to, and its [`FailureClass`] decides whether the page is
//!   retried, recorded as failed, or halts the whole batch.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the pdf-ocr-batch library.
///
/// Page-level failures are classified with [`ErrorKind`] and recorded in the
/// progress file rather than propagated here.
#[derive(Debug, Error)]
pub enum OcrError {
    // ── Configuration errors ──────────────────────────────────────────────
    /// The configured provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// Builder or CLI validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// None of the candidate input folders exists.
    #[error("No input folder found (tried: {})", display_paths(.tried))]
    InputDirNotFound { tried: Vec<PathBuf> },

    /// The input folder exists but holds no PDF files.
    #[error("No PDF files found in '{}'", .dir.display())]
    NoDocuments { dir: PathBuf },

    /// No pdfium library could be loaded.
    #[error("PDF engine unavailable: {0}")]
    PdfEngineUnavailable(String),

    // ── Input errors ──────────────────────────────────────────────────────
    /// The input folder could not be listed.
    #[error("Failed to read input folder '{}': {source}", .path.display())]
    InputDirUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Persistence errors ────────────────────────────────────────────────
    /// The progress snapshot could not be written.
    #[error("Failed to write progress file '{}': {source}", .path.display())]
    ProgressWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The progress snapshot could not be serialised.
    #[error("Failed to serialise progress: {0}")]
    ProgressSerialize(#[from] serde_json::Error),

    /// A transcript could not be created, appended to or rebuilt.
    #[error("Failed to write transcript '{}': {source}", .path.display())]
    TranscriptWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl OcrError {
    /// True for errors an operator fixes by changing the setup rather than by
    /// re-running later. These map to the configuration-error exit status.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            OcrError::ProviderNotConfigured { .. }
                | OcrError::InvalidConfig(_)
                | OcrError::InputDirNotFound { .. }
                | OcrError::NoDocuments { .. }
                | OcrError::PdfEngineUnavailable(_)
        )
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| format!("'{}'", p.display()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Classification of a failed page attempt.
///
/// Serialised in snake_case inside the progress file. Kinds written by a
/// newer version deserialise as [`ErrorKind::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Quota exhausted (HTTP 429, `RESOURCE_EXHAUSTED`).
    RateLimited,
    /// The provider is temporarily unavailable (HTTP 503, overloaded).
    ServiceUnavailable,
    /// The provider failed internally (HTTP 500/502).
    InternalError,
    /// Connection failure or call timeout.
    NetworkError,
    /// The provider rejected the request content (HTTP 400).
    InvalidInput,
    /// The provider answered with no text.
    EmptyResponse,
    /// The page could not be rasterised or encoded.
    RenderFailed,
    /// The credential was rejected (HTTP 401/403, `API_KEY_INVALID`).
    Unauthorized,
    /// The configured model does not exist for this provider, or the
    /// provider itself is misconfigured (HTTP 404).
    ModelUnavailable,
    /// Anything else.
    #[serde(other)]
    Unknown,
}

/// How the pipeline reacts to an [`ErrorKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Stop the whole batch; retry in a later scheduling window.
    RateLimited,
    /// Retry with backoff, then record the page as failed.
    Transient,
    /// Record the page as failed without retrying.
    Permanent,
    /// Stop the whole batch; the setup must be fixed first.
    Fatal,
}

impl ErrorKind {
    pub fn class(self) -> FailureClass {
        match self {
            ErrorKind::RateLimited => FailureClass::RateLimited,
            ErrorKind::ServiceUnavailable | ErrorKind::InternalError | ErrorKind::NetworkError => {
                FailureClass::Transient
            }
            ErrorKind::Unauthorized | ErrorKind::ModelUnavailable => FailureClass::Fatal,
            ErrorKind::InvalidInput
            | ErrorKind::EmptyResponse
            | ErrorKind::RenderFailed
            | ErrorKind::Unknown => FailureClass::Permanent,
        }
    }

    /// The snake_case name used in the progress file and the transcript.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::ServiceUnavailable => "service_unavailable",
            ErrorKind::InternalError => "internal_error",
            ErrorKind::NetworkError => "network_error",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::EmptyResponse => "empty_response",
            ErrorKind::RenderFailed => "render_failed",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::ModelUnavailable => "model_unavailable",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
