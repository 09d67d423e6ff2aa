//! One page through the extraction client: pacing, retries, classification.
//!
//! ## Retry Strategy
//!
//! Every call, the first one included, is preceded by the fixed request
//! delay that keeps a sequential run under per-minute request ceilings.
//! Transient failures (503, 500/502, network, timeout) are retried up to
//! `max_retries` additional times with exponential backoff
//! `min(base · 2^(attempt−1), cap)` on top of that delay. With the defaults
//! (10 s base, 300 s cap) the waits run 10 s → 20 s → 40 s → ... → 300 s.
//!
//! Rate limiting is never retried here: quota windows reset on the order of
//! hours, so the page is handed back and the batch stops. Permanent failures
//! are returned after a single attempt. A rejected credential is fatal.

use crate::config::RetryPolicy;
use crate::context::RunContext;
use crate::error::{ErrorKind, FailureClass};
use crate::pipeline::encode::PageImage;
use crate::pipeline::extract::{ExtractionClient, ExtractionError};
use crate::progress::DocumentId;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Result of processing one page.
#[derive(Debug, Clone, PartialEq)]
pub enum PageOutcome {
    Success(String),
    /// The provider rejected the call for quota reasons.
    RateLimited,
    /// Retries were exhausted; carries the last error.
    TransientFailure(ErrorKind, String),
    PermanentFailure(ErrorKind, String),
    /// The credential or the model was rejected; nothing further can succeed.
    Fatal(ErrorKind, String),
    /// The cancellation token fired during a wait or a call.
    Interrupted,
}

/// Drives a single page through an [`ExtractionClient`].
pub struct PageProcessor {
    client: Arc<dyn ExtractionClient>,
    policy: RetryPolicy,
}

impl PageProcessor {
    pub fn new(client: Arc<dyn ExtractionClient>, policy: RetryPolicy) -> Self {
        Self { client, policy }
    }

    /// Process page `page_index` (0-based) of `document`.
    ///
    /// Never fails: every error ends up in the returned [`PageOutcome`].
    pub async fn process(
        &self,
        document: &DocumentId,
        page_index: usize,
        image: &PageImage,
        ctx: &mut RunContext,
    ) -> PageOutcome {
        let cancel = ctx.cancel_token().clone();
        let page = page_index + 1;
        let max_retries = self.policy.max_retries;
        let mut last_err: Option<ExtractionError> = None;

        for attempt in 0..=max_retries {
            if attempt > 0 {
                let backoff = self.policy.backoff(attempt);
                warn!(
                    document = %document,
                    page,
                    attempt,
                    max_retries,
                    backoff_ms = backoff.as_millis() as u64,
                    "Retrying after backoff"
                );
                if !pause(&cancel, backoff).await {
                    return PageOutcome::Interrupted;
                }
            }
            if !pause(&cancel, self.policy.request_delay).await {
                return PageOutcome::Interrupted;
            }

            ctx.stats.api_calls += 1;
            debug!(document = %document, page, attempt, "Sending page");

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return PageOutcome::Interrupted,
                r = self.call(image) => r,
            };

            let err = match result {
                Ok(text) => {
                    info!(
                        document = %document,
                        page,
                        attempt,
                        chars = text.chars().count(),
                        "Page transcribed"
                    );
                    return PageOutcome::Success(text);
                }
                Err(err) => err,
            };

            match err.kind.class() {
                FailureClass::RateLimited => {
                    warn!(
                        document = %document,
                        page,
                        attempt,
                        kind = %err.kind,
                        error = %err.message,
                        "Rate limited"
                    );
                    return PageOutcome::RateLimited;
                }
                FailureClass::Fatal => {
                    error!(
                        document = %document,
                        page,
                        kind = %err.kind,
                        error = %err.message,
                        "Provider rejected the setup"
                    );
                    return PageOutcome::Fatal(err.kind, err.message);
                }
                FailureClass::Permanent => {
                    warn!(
                        document = %document,
                        page,
                        attempt,
                        kind = %err.kind,
                        error = %err.message,
                        "Permanent failure, not retrying"
                    );
                    return PageOutcome::PermanentFailure(err.kind, err.message);
                }
                FailureClass::Transient => {
                    warn!(
                        document = %document,
                        page,
                        attempt,
                        kind = %err.kind,
                        error = %err.message,
                        "Transient failure"
                    );
                    last_err = Some(err);
                }
            }
        }

        let err = last_err
            .unwrap_or_else(|| ExtractionError::new(ErrorKind::Unknown, "no attempt was made"));
        error!(
            document = %document,
            page,
            retries = max_retries,
            kind = %err.kind,
            "Retries exhausted"
        );
        PageOutcome::TransientFailure(err.kind, err.message)
    }

    async fn call(&self, image: &PageImage) -> Result<String, ExtractionError> {
        match self.policy.call_timeout {
            Some(limit) => tokio::time::timeout(limit, self.client.extract(image))
                .await
                .unwrap_or_else(|_| {
                    Err(ExtractionError::new(
                        ErrorKind::NetworkError,
                        format!("call timed out after {}s", limit.as_secs()),
                    ))
                }),
            None => self.client.extract(image).await,
        }
    }
}

/// Sleep for `duration` unless cancelled first. Returns false on cancellation.
async fn pause(cancel: &CancellationToken, duration: Duration) -> bool {
    if duration.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = sleep(duration) => true,
    }
}
