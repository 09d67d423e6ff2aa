//! Batch entry points: discover documents, run them in order, summarise.
//!
//! Documents run one after another in file-name order. A rate-limited
//! document stops the whole batch, since every later call would hit the same
//! quota; so do a rejected credential and a cancellation. An unreadable PDF
//! is recorded and skipped, and the batch then ends as incomplete.

use crate::config::{OcrConfig, DEFAULT_MODEL};
use crate::context::{RunContext, RunStats};
use crate::error::OcrError;
use crate::events::{NoopProgressCallback, ProgressCallback};
use crate::pipeline::document::{AbortReason, Document, DocumentOutcome, DocumentPipeline};
use crate::pipeline::extract::{ExtractionClient, VisionExtractor};
use crate::pipeline::page::PageProcessor;
use crate::pipeline::raster::{PdfiumRaster, RasterSource};
use crate::progress::{DocumentId, ProgressStore};
use edgequake_llm::{LLMProvider, ProviderFactory};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How a batch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    /// Every document was completed.
    Completed,
    /// Every readable document was completed but some PDFs could not be
    /// opened.
    Incomplete,
    /// A document was stopped by rate limiting; retry in a later window.
    RateLimited,
    /// The run was cancelled.
    Interrupted,
    /// The setup must be fixed before a run can make progress.
    ConfigurationError,
}

impl BatchStatus {
    /// Process exit status for this outcome.
    ///
    /// `75` and `78` are `EX_TEMPFAIL` and `EX_CONFIG` from `sysexits.h`,
    /// so schedulers can tell "try again later" from "fix the setup".
    pub fn exit_code(self) -> u8 {
        match self {
            BatchStatus::Completed => 0,
            BatchStatus::Incomplete => 1,
            BatchStatus::RateLimited => 75,
            BatchStatus::ConfigurationError => 78,
            BatchStatus::Interrupted => 130,
        }
    }
}

/// Result of [`BatchRunner::run_all`].
#[derive(Debug, Clone)]
pub struct BatchSummary {
    pub status: BatchStatus,
    /// Outcome of every document that was started, in processing order.
    pub documents: Vec<(DocumentId, DocumentOutcome)>,
    /// Documents never started because the batch stopped early.
    pub not_started: Vec<DocumentId>,
    pub stats: RunStats,
}

impl BatchSummary {
    pub fn exit_code(&self) -> u8 {
        self.status.exit_code()
    }
}

/// Runs documents sequentially through a [`DocumentPipeline`].
pub struct BatchRunner {
    pipeline: DocumentPipeline,
    progress_callback: ProgressCallback,
}

impl BatchRunner {
    pub fn new(pipeline: DocumentPipeline) -> Self {
        Self {
            pipeline,
            progress_callback: Arc::new(NoopProgressCallback),
        }
    }

    pub fn with_progress_callback(mut self, callback: ProgressCallback) -> Self {
        self.progress_callback = callback;
        self
    }

    pub async fn run_all(
        &self,
        mut documents: Vec<Document>,
        store: &mut ProgressStore,
        ctx: &mut RunContext,
    ) -> Result<BatchSummary, OcrError> {
        documents.sort_by(|a, b| a.id.cmp(&b.id));
        documents.dedup_by(|a, b| a.id == b.id);

        info!(documents = documents.len(), "Starting batch");
        self.progress_callback.on_batch_start(documents.len());

        let mut results = Vec::with_capacity(documents.len());
        let mut status = BatchStatus::Completed;
        let mut stopped_at: Option<usize> = None;
        let mut unreadable = 0usize;

        for (i, doc) in documents.iter().enumerate() {
            if ctx.is_cancelled() {
                status = BatchStatus::Interrupted;
                stopped_at = Some(i);
                break;
            }

            let outcome = self.pipeline.run(doc, store, ctx).await?;
            let halt = match &outcome {
                DocumentOutcome::Completed => None,
                DocumentOutcome::Aborted(AbortReason::Unreadable(_)) => {
                    unreadable += 1;
                    None
                }
                DocumentOutcome::StoppedByRateLimit => {
                    warn!(document = %doc.id, "Rate limited; stopping batch, retry later");
                    Some(BatchStatus::RateLimited)
                }
                DocumentOutcome::Aborted(AbortReason::Unauthorized(detail)) => {
                    error!(document = %doc.id, error = %detail, "Credential rejected; stopping batch");
                    Some(BatchStatus::ConfigurationError)
                }
                DocumentOutcome::Aborted(AbortReason::ModelUnavailable(detail)) => {
                    error!(document = %doc.id, error = %detail, "Model unavailable; stopping batch");
                    Some(BatchStatus::ConfigurationError)
                }
                DocumentOutcome::Aborted(AbortReason::Interrupted) => {
                    Some(BatchStatus::Interrupted)
                }
            };
            results.push((doc.id.clone(), outcome));

            if let Some(s) = halt {
                status = s;
                stopped_at = Some(i + 1);
                break;
            }
        }

        if status == BatchStatus::Completed && unreadable > 0 {
            warn!(unreadable, "Some documents could not be opened");
            status = BatchStatus::Incomplete;
        }

        if status == BatchStatus::Interrupted {
            info!("Interrupted; saving progress");
            if let Err(e) = store.flush() {
                warn!(error = %e, "Could not save progress on interruption");
            }
        }

        let not_started: Vec<DocumentId> = stopped_at
            .map(|i| documents[i..].iter().map(|d| d.id.clone()).collect())
            .unwrap_or_default();

        info!(
            status = ?status,
            started = results.len(),
            not_started = not_started.len(),
            api_calls = ctx.stats.api_calls,
            pages_done = ctx.stats.pages_done,
            pages_failed = ctx.stats.pages_failed,
            pages_skipped = ctx.stats.pages_skipped,
            "Batch finished"
        );

        Ok(BatchSummary {
            status,
            documents: results,
            not_started,
            stats: ctx.stats.clone(),
        })
    }
}

/// List the PDFs directly inside `dir`, sorted by file name.
///
/// The `.pdf` extension is matched case-insensitively. Subfolders are not
/// searched. An empty listing is a configuration error.
pub fn discover_documents(dir: &Path) -> Result<Vec<Document>, OcrError> {
    let unreadable = |source| OcrError::InputDirUnreadable {
        path: dir.to_path_buf(),
        source,
    };

    let mut documents = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(unreadable)? {
        let path = entry.map_err(unreadable)?.path();
        let is_pdf = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));
        if is_pdf && path.is_file() {
            documents.push(Document::from_path(path));
        }
    }

    if documents.is_empty() {
        return Err(OcrError::NoDocuments {
            dir: dir.to_path_buf(),
        });
    }
    documents.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(documents)
}

/// The first existing folder among `input_dir` and `fallback_input_dir`.
pub fn resolve_input_dir(config: &OcrConfig) -> Result<PathBuf, OcrError> {
    let candidates: Vec<PathBuf> = std::iter::once(config.input_dir.clone())
        .chain(config.fallback_input_dir.clone())
        .collect();

    for (i, dir) in candidates.iter().enumerate() {
        if dir.is_dir() {
            if i > 0 {
                info!(dir = %dir.display(), "Input folder missing, using fallback");
            }
            return Ok(dir.clone());
        }
    }
    Err(OcrError::InputDirNotFound { tried: candidates })
}

/// Default model for a provider named without a model.
fn default_model_for(provider: &str) -> &'static str {
    match provider {
        "openai" => "gpt-4.1-mini",
        "anthropic" => "claude-sonnet-4-20250514",
        _ => DEFAULT_MODEL,
    }
}

fn create_vision_provider(
    provider_name: &str,
    model: &str,
) -> Result<Arc<dyn LLMProvider>, OcrError> {
    info!(provider = provider_name, model, "Using LLM provider");
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        OcrError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

fn env_is_set(name: &str) -> bool {
    std::env::var(name).is_ok_and(|v| !v.is_empty())
}

/// Resolve the LLM provider, from most-specific to least-specific.
///
/// 1. **Pre-built provider** (`config.provider`), used as-is.
/// 2. **Named provider** (`config.provider_name`) with `config.model` or
///    that provider's default model.
/// 3. **Environment pair** (`EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`).
/// 4. **Key detection**: the first of `GEMINI_API_KEY` / `GOOGLE_API_KEY`,
///    `OPENAI_API_KEY`, `ANTHROPIC_API_KEY` that is set selects its provider.
/// 5. [`ProviderFactory::from_env`] as the last resort.
pub fn resolve_provider(config: &OcrConfig) -> Result<Arc<dyn LLMProvider>, OcrError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    if let Some(ref name) = config.provider_name {
        let model = config.model.as_deref().unwrap_or(default_model_for(name));
        return create_vision_provider(name, model);
    }

    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return create_vision_provider(&prov, &model);
        }
    }

    let detected = if env_is_set("GEMINI_API_KEY") || env_is_set("GOOGLE_API_KEY") {
        Some("gemini")
    } else if env_is_set("OPENAI_API_KEY") {
        Some("openai")
    } else if env_is_set("ANTHROPIC_API_KEY") {
        Some("anthropic")
    } else {
        None
    };
    if let Some(name) = detected {
        let model = config.model.as_deref().unwrap_or(default_model_for(name));
        return create_vision_provider(name, model);
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| OcrError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set GEMINI_API_KEY, OPENAI_API_KEY or ANTHROPIC_API_KEY.\n\
                Error: {}",
                e
            ),
        })?;

    Ok(llm_provider)
}

/// Run a full batch as configured: resolve the provider, discover the input
/// folder, and process every document with pdfium and the remote model.
///
/// # Errors
/// Returns `Err(OcrError)` only for fatal errors: no usable provider, no input
/// folder or documents, or progress/transcript I/O failures. Page-level
/// failures are reported in the summary and the progress file.
pub async fn run_batch(
    config: &OcrConfig,
    cancel: CancellationToken,
) -> Result<BatchSummary, OcrError> {
    let provider = resolve_provider(config)?;
    let input_dir = resolve_input_dir(config)?;
    let documents = discover_documents(&input_dir)?;
    info!(
        dir = %input_dir.display(),
        documents = documents.len(),
        "Discovered documents"
    );

    let mut extractor =
        VisionExtractor::new(provider).with_sampling(config.temperature, config.max_tokens);
    if let Some(ref prompt) = config.system_prompt {
        extractor = extractor.with_system_prompt(prompt.clone());
    }

    run_batch_with(
        config,
        documents,
        Arc::new(PdfiumRaster::new(config)),
        Arc::new(extractor),
        cancel,
    )
    .await
}

/// Run `documents` with the given collaborators, honouring the store,
/// output, retry and callback settings of `config`.
pub async fn run_batch_with(
    config: &OcrConfig,
    documents: Vec<Document>,
    raster: Arc<dyn RasterSource>,
    client: Arc<dyn ExtractionClient>,
    cancel: CancellationToken,
) -> Result<BatchSummary, OcrError> {
    let mut store = ProgressStore::load(&config.progress_file)
        .with_failed_page_policy(config.failed_page_policy);
    let callback: ProgressCallback = config
        .progress_callback
        .clone()
        .unwrap_or_else(|| Arc::new(NoopProgressCallback));

    let pipeline = DocumentPipeline::new(
        raster,
        PageProcessor::new(client, config.retry_policy()),
        &config.output_dir,
    )
    .with_progress_callback(Arc::clone(&callback));
    let runner = BatchRunner::new(pipeline).with_progress_callback(callback);

    let mut ctx = RunContext::new(cancel);
    runner.run_all(documents, &mut store, &mut ctx).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn exit_codes() {
        assert_eq!(BatchStatus::Completed.exit_code(), 0);
        assert_eq!(BatchStatus::Incomplete.exit_code(), 1);
        assert_eq!(BatchStatus::RateLimited.exit_code(), 75);
        assert_eq!(BatchStatus::ConfigurationError.exit_code(), 78);
        assert_eq!(BatchStatus::Interrupted.exit_code(), 130);
    }

    #[test]
    fn discovery_filters_and_sorts() {
        let dir = TempDir::new().unwrap();
        for name in ["b.pdf", "A.PDF", "notes.txt", "c.pdf.bak"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        std::fs::create_dir(dir.path().join("nested.pdf")).unwrap();

        let docs = discover_documents(dir.path()).unwrap();
        let names: Vec<_> = docs.iter().map(|d| d.id.as_str().to_string()).collect();
        assert_eq!(names, vec!["A.PDF", "b.pdf"]);
    }

    #[test]
    fn empty_folder_is_a_configuration_error() {
        let dir = TempDir::new().unwrap();
        let err = discover_documents(dir.path()).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn input_dir_falls_back() {
        let dir = TempDir::new().unwrap();
        let fallback = dir.path().join("pdfs_compressed");
        std::fs::create_dir(&fallback).unwrap();
        let config = OcrConfig::builder()
            .input_dir(dir.path().join("pdfs"))
            .fallback_input_dir(Some(fallback.clone()))
            .build()
            .unwrap();
        assert_eq!(resolve_input_dir(&config).unwrap(), fallback);
    }

    #[test]
    fn missing_input_dirs_are_reported() {
        let dir = TempDir::new().unwrap();
        let config = OcrConfig::builder()
            .input_dir(dir.path().join("pdfs"))
            .fallback_input_dir(None)
            .build()
            .unwrap();
        match resolve_input_dir(&config).unwrap_err() {
            OcrError::InputDirNotFound { tried } => assert_eq!(tried.len(), 1),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn default_models() {
        assert_eq!(default_model_for("gemini"), DEFAULT_MODEL);
        assert_eq!(default_model_for("openai"), "gpt-4.1-mini");
    }
}
