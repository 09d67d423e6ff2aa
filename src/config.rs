//! Configuration types for batch OCR runs.
//!
//! All run behaviour is controlled through [`OcrConfig`], built via its
//! [`OcrConfigBuilder`]. Only the pacing and retry knobs influence how the
//! remote model is called; none of them affects which pages end up in the
//! progress file or the transcripts.

use crate::error::OcrError;
use crate::events::ProgressCallback;
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Default model when a provider is selected without an explicit model.
pub const DEFAULT_MODEL: &str = "gemini-2.5-pro";

/// Default progress file, relative to the working directory.
pub const DEFAULT_PROGRESS_FILE: &str = "ocr_progress.json";

/// Configuration for a batch OCR run.
///
/// Built via [`OcrConfig::builder()`] or using [`OcrConfig::default()`].
///
/// # Example
/// ```rust
/// use pdf_ocr_batch::OcrConfig;
///
/// let config = OcrConfig::builder()
///     .model("gemini-2.5-flash")
///     .request_delay_ms(1_000)
///     .max_retries(5)
///     .build()
///     .unwrap();
/// assert_eq!(config.max_retries, 5);
/// ```
#[derive(Clone)]
pub struct OcrConfig {
    /// Folder scanned for `*.pdf` files. Default: `pdfs`.
    pub input_dir: PathBuf,

    /// Folder used when `input_dir` does not exist. Default: `pdfs_compressed`.
    pub fallback_input_dir: Option<PathBuf>,

    /// Folder receiving one `<stem>_ocr.txt` transcript per document.
    /// Default: `ocr_output`.
    pub output_dir: PathBuf,

    /// Progress snapshot shared by every document of the run.
    /// Default: [`DEFAULT_PROGRESS_FILE`].
    pub progress_file: PathBuf,

    /// LLM model identifier, e.g. "gemini-2.5-pro", "gpt-4.1-mini".
    /// If None, [`DEFAULT_MODEL`] or the provider default is used.
    pub model: Option<String>,

    /// LLM provider name (e.g. "gemini", "openai", "anthropic").
    /// If None along with `provider`, the provider is detected from the
    /// environment.
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature for the LLM completion. Default: 0.1.
    pub temperature: f32,

    /// Maximum tokens the LLM may generate per page. Default: 8192.
    ///
    /// Handwritten pages with dense text regularly exceed 4 000 tokens.
    pub max_tokens: usize,

    /// Fixed pause before every remote call, retries included. Default: 3000.
    ///
    /// Keeps a sequential run below per-minute request ceilings.
    pub request_delay_ms: u64,

    /// Additional attempts on a transient failure. Default: 10.
    ///
    /// Rate limits and permanent errors are never retried.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds (exponential backoff). Default: 10000.
    pub retry_backoff_ms: u64,

    /// Upper bound for a single backoff wait in milliseconds. Default: 300000.
    pub retry_backoff_cap_ms: u64,

    /// Per-call timeout in seconds; 0 disables it. Default: 120.
    pub api_timeout_secs: u64,

    /// Whether pages recorded as failed are attempted again on a later run.
    /// Default: [`FailedPagePolicy::Terminal`].
    pub failed_page_policy: FailedPagePolicy,

    /// Longest edge of a rendered page in pixels. Default: 2048.
    ///
    /// Bounds memory for large-format pages and keeps uploads below provider
    /// size limits.
    pub max_rendered_pixels: u32,

    /// Encoding of the page image sent to the model. Default: JPEG, quality 85.
    pub image_encoding: ImageEncoding,

    /// PDF user password for encrypted documents.
    pub password: Option<String>,

    /// Custom system prompt. If None, uses built-in default.
    pub system_prompt: Option<String>,

    /// Receives per-document and per-page events. Default: None.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("pdfs"),
            fallback_input_dir: Some(PathBuf::from("pdfs_compressed")),
            output_dir: PathBuf::from("ocr_output"),
            progress_file: PathBuf::from(DEFAULT_PROGRESS_FILE),
            model: None,
            provider_name: None,
            provider: None,
            temperature: 0.1,
            max_tokens: 8192,
            request_delay_ms: 3_000,
            max_retries: 10,
            retry_backoff_ms: 10_000,
            retry_backoff_cap_ms: 300_000,
            api_timeout_secs: 120,
            failed_page_policy: FailedPagePolicy::default(),
            max_rendered_pixels: 2048,
            image_encoding: ImageEncoding::default(),
            password: None,
            system_prompt: None,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for OcrConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OcrConfig")
            .field("input_dir", &self.input_dir)
            .field("fallback_input_dir", &self.fallback_input_dir)
            .field("output_dir", &self.output_dir)
            .field("progress_file", &self.progress_file)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("request_delay_ms", &self.request_delay_ms)
            .field("max_retries", &self.max_retries)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("retry_backoff_cap_ms", &self.retry_backoff_cap_ms)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field("failed_page_policy", &self.failed_page_policy)
            .field("max_rendered_pixels", &self.max_rendered_pixels)
            .field("image_encoding", &self.image_encoding)
            .finish()
    }
}

impl OcrConfig {
    /// Create a new builder for `OcrConfig`.
    pub fn builder() -> OcrConfigBuilder {
        OcrConfigBuilder {
            config: Self::default(),
        }
    }

    /// The retry and pacing policy derived from this configuration.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            request_delay: Duration::from_millis(self.request_delay_ms),
            backoff_base: Duration::from_millis(self.retry_backoff_ms),
            backoff_cap: Duration::from_millis(self.retry_backoff_cap_ms),
            call_timeout: (self.api_timeout_secs > 0)
                .then(|| Duration::from_secs(self.api_timeout_secs)),
        }
    }
}

/// Builder for [`OcrConfig`].
#[derive(Debug)]
pub struct OcrConfigBuilder {
    config: OcrConfig,
}

impl OcrConfigBuilder {
    pub fn input_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.input_dir = dir.into();
        self
    }

    pub fn fallback_input_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.config.fallback_input_dir = dir;
        self
    }

    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.output_dir = dir.into();
        self
    }

    pub fn progress_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.progress_file = path.into();
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn request_delay_ms(mut self, ms: u64) -> Self {
        self.config.request_delay_ms = ms;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn retry_backoff_cap_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_cap_ms = ms;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn failed_page_policy(mut self, policy: FailedPagePolicy) -> Self {
        self.config.failed_page_policy = policy;
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn image_encoding(mut self, encoding: ImageEncoding) -> Self {
        self.config.image_encoding = encoding;
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<OcrConfig, OcrError> {
        let c = &self.config;
        if c.retry_backoff_cap_ms < c.retry_backoff_ms {
            return Err(OcrError::InvalidConfig(format!(
                "Backoff cap ({} ms) must be ≥ backoff base ({} ms)",
                c.retry_backoff_cap_ms, c.retry_backoff_ms
            )));
        }
        if let ImageEncoding::Jpeg { quality } = c.image_encoding {
            if !(1..=100).contains(&quality) {
                return Err(OcrError::InvalidConfig(format!(
                    "JPEG quality must be 1–100, got {quality}"
                )));
            }
        }
        if c.output_dir.as_os_str().is_empty() {
            return Err(OcrError::InvalidConfig("Output folder must not be empty".into()));
        }
        Ok(self.config)
    }
}

// ── Policies ─────────────────────────────────────────────────────────────

/// Pacing and retry parameters applied by the page processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub request_delay: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub call_timeout: Option<Duration>,
}

impl RetryPolicy {
    /// The wait before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        backoff_delay(attempt, self.backoff_base, self.backoff_cap)
    }
}

/// Exponential backoff: `base · 2^(attempt − 1)`, capped at `cap`.
///
/// Attempt 0 is the first call and never waits.
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let factor = 2u32.checked_pow(attempt - 1).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(cap).min(cap)
}

/// What a later run does with a page recorded as failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailedPagePolicy {
    /// Failed pages are final, like done pages. (default)
    #[default]
    Terminal,
    /// Failed pages are attempted again; done pages are still never resent.
    Retry,
}

/// Encoding of the page image uploaded to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageEncoding {
    /// Lossless; larger uploads.
    Png,
    /// Lossy with the given quality (1–100).
    Jpeg { quality: u8 },
}

impl Default for ImageEncoding {
    fn default() -> Self {
        ImageEncoding::Jpeg { quality: 85 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_free_tier_pacing() {
        let c = OcrConfig::default();
        assert_eq!(c.request_delay_ms, 3_000);
        assert_eq!(c.max_retries, 10);
        assert_eq!(c.failed_page_policy, FailedPagePolicy::Terminal);
        assert_eq!(c.progress_file, PathBuf::from(DEFAULT_PROGRESS_FILE));
    }

    #[test]
    fn builder_rejects_cap_below_base() {
        let err = OcrConfig::builder()
            .retry_backoff_ms(5_000)
            .retry_backoff_cap_ms(1_000)
            .build()
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn builder_rejects_zero_jpeg_quality() {
        let result = OcrConfig::builder()
            .image_encoding(ImageEncoding::Jpeg { quality: 0 })
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let base = Duration::from_millis(500);
        let cap = Duration::from_secs(3);
        assert_eq!(backoff_delay(0, base, cap), Duration::ZERO);
        assert_eq!(backoff_delay(1, base, cap), Duration::from_millis(500));
        assert_eq!(backoff_delay(2, base, cap), Duration::from_millis(1_000));
        assert_eq!(backoff_delay(3, base, cap), Duration::from_millis(2_000));
        assert_eq!(backoff_delay(4, base, cap), cap);
        assert_eq!(backoff_delay(60, base, cap), cap);
    }

    #[test]
    fn zero_timeout_disables_call_timeout() {
        let c = OcrConfig::builder().api_timeout_secs(0).build().unwrap();
        assert_eq!(c.retry_policy().call_timeout, None);
    }
}
