//! One document end to end: pages in order, store and transcript kept in step.
//!
//! ## Commit order
//!
//! A successful page is appended to the transcript before the store records
//! it; a failed page is recorded first. Either way, a crash between the two
//! writes leaves a difference that [`TranscriptWriter::open`] repairs on the
//! next run, because the transcript is rebuilt from the store whenever the
//! store already holds finished pages.
//!
//! A section that cannot be appended in ascending order (a failed page
//! retried under [`FailedPagePolicy::Retry`](crate::config::FailedPagePolicy))
//! triggers an atomic rebuild instead.

use crate::context::RunContext;
use crate::error::{ErrorKind, OcrError};
use crate::events::{NoopProgressCallback, ProgressCallback};
use crate::pipeline::page::{PageOutcome, PageProcessor};
use crate::pipeline::raster::{RasterError, RasterSource};
use crate::progress::{DocumentId, DocumentStatus, PageResolution, ProgressStore};
use crate::transcript::{resolution_body, transcript_file_name, TranscriptWriter};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// A PDF scheduled for processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub id: DocumentId,
    pub path: PathBuf,
}

impl Document {
    /// Identity is the file name of `path`.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            id: DocumentId::from_path(&path),
            path,
        }
    }
}

/// Why a document stopped before completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// The PDF could not be opened. It is recorded as unreadable and the
    /// batch moves on.
    Unreadable(String),
    /// The provider rejected the credential. The batch stops.
    Unauthorized(String),
    /// The provider does not know the configured model. The batch stops.
    ModelUnavailable(String),
    /// The run was cancelled.
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentOutcome {
    /// Every page is done or failed.
    Completed,
    StoppedByRateLimit,
    Aborted(AbortReason),
}

pub struct DocumentPipeline {
    raster: Arc<dyn RasterSource>,
    processor: PageProcessor,
    output_dir: PathBuf,
    progress_callback: ProgressCallback,
}

impl DocumentPipeline {
    pub fn new(
        raster: Arc<dyn RasterSource>,
        processor: PageProcessor,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            raster,
            processor,
            output_dir: output_dir.into(),
            progress_callback: Arc::new(NoopProgressCallback),
        }
    }

    pub fn with_progress_callback(mut self, callback: ProgressCallback) -> Self {
        self.progress_callback = callback;
        self
    }

    /// Process every outstanding page of `doc`.
    ///
    /// Page-level failures are absorbed into the store and the transcript.
    /// Only persistence errors and a missing PDF engine are returned as `Err`.
    pub async fn run(
        &self,
        doc: &Document,
        store: &mut ProgressStore,
        ctx: &mut RunContext,
    ) -> Result<DocumentOutcome, OcrError> {
        let id = &doc.id;

        if let Some(progress) = store.document(id) {
            let nothing_left = (0..progress.pages.len()).all(|i| store.is_done(id, i));
            if progress.status == DocumentStatus::Completed && nothing_left {
                info!(document = %id, "Already completed, skipping");
                ctx.stats.pages_skipped += progress.pages.len();
                return self.finish(id, DocumentOutcome::Completed);
            }
        }

        if ctx.is_cancelled() {
            return self.finish(id, DocumentOutcome::Aborted(AbortReason::Interrupted));
        }

        let page_count = match self.raster.page_count(&doc.path).await {
            Ok(n) => n,
            Err(RasterError::Binding(detail)) => {
                return Err(OcrError::PdfEngineUnavailable(detail));
            }
            Err(e) => {
                let detail = e.to_string();
                error!(document = %id, error = %detail, "Cannot open document, skipping");
                store.mark_unreadable(id, &doc.path, &detail)?;
                return self.finish(id, DocumentOutcome::Aborted(AbortReason::Unreadable(detail)));
            }
        };

        let output_file = self.output_dir.join(transcript_file_name(id));
        store.ensure_document(id, &doc.path, page_count, &output_file)?;
        let progress = store
            .document(id)
            .ok_or_else(|| OcrError::Internal(format!("Progress entry missing for '{id}'")))?;
        let mut writer = TranscriptWriter::open(&output_file, id, progress)?;
        if page_count == 0 {
            warn!(document = %id, "Document has no pages");
            writer.rebuild(progress)?;
        }

        let already_done = (0..page_count).filter(|&i| store.is_done(id, i)).count();
        info!(
            document = %id,
            pages = page_count,
            already_done,
            output = %output_file.display(),
            "Processing document"
        );
        self.progress_callback
            .on_document_start(id, page_count, already_done);

        for page_index in 0..page_count {
            if ctx.is_cancelled() {
                info!(document = %id, page = page_index + 1, "Interrupted");
                return self.finish(id, DocumentOutcome::Aborted(AbortReason::Interrupted));
            }
            if store.is_done(id, page_index) {
                debug!(document = %id, page = page_index + 1, "Already processed, skipping");
                ctx.stats.pages_skipped += 1;
                continue;
            }

            let page = page_index + 1;
            ctx.enter_page(id, page_index);
            self.progress_callback.on_page_start(id, page, page_count);

            let outcome = match self.raster.render_page(&doc.path, page_index).await {
                Ok(image) => self.processor.process(id, page_index, &image, ctx).await,
                Err(RasterError::Binding(detail)) => {
                    ctx.leave_page();
                    return Err(OcrError::PdfEngineUnavailable(detail));
                }
                Err(e) => {
                    warn!(document = %id, page, error = %e, "Page could not be rendered");
                    PageOutcome::PermanentFailure(ErrorKind::RenderFailed, e.to_string())
                }
            };
            ctx.leave_page();

            let resolution = match outcome {
                PageOutcome::Success(text) => PageResolution::Done(text),
                PageOutcome::TransientFailure(kind, detail)
                | PageOutcome::PermanentFailure(kind, detail) => {
                    PageResolution::Failed { kind, detail }
                }
                PageOutcome::RateLimited => {
                    store.mark_document_status(id, DocumentStatus::StoppedByRateLimit)?;
                    warn!(document = %id, page, "Stopping document: rate limited");
                    return self.finish(id, DocumentOutcome::StoppedByRateLimit);
                }
                PageOutcome::Fatal(kind, detail) => {
                    let reason = match kind {
                        ErrorKind::Unauthorized => AbortReason::Unauthorized(detail),
                        _ => AbortReason::ModelUnavailable(detail),
                    };
                    return self.finish(id, DocumentOutcome::Aborted(reason));
                }
                PageOutcome::Interrupted => {
                    return self.finish(id, DocumentOutcome::Aborted(AbortReason::Interrupted));
                }
            };

            match &resolution {
                PageResolution::Done(text) => {
                    ctx.stats.pages_done += 1;
                    self.progress_callback
                        .on_page_complete(id, page, page_count, text.len());
                }
                PageResolution::Failed { kind, detail } => {
                    ctx.stats.pages_failed += 1;
                    self.progress_callback.on_page_error(
                        id,
                        page,
                        page_count,
                        &format!("{kind}: {detail}"),
                    );
                }
            }
            commit(store, &mut writer, id, page_index, resolution)?;
        }

        store.mark_document_status(id, DocumentStatus::Completed)?;
        ctx.stats.documents_completed += 1;
        if let Some(progress) = store.document(id) {
            info!(
                document = %id,
                done = progress.done_pages(),
                failed = progress.failed_pages(),
                "Document completed"
            );
        }
        self.finish(id, DocumentOutcome::Completed)
    }

    fn finish(
        &self,
        id: &DocumentId,
        outcome: DocumentOutcome,
    ) -> Result<DocumentOutcome, OcrError> {
        self.progress_callback.on_document_complete(id, &outcome);
        Ok(outcome)
    }
}

/// Persist one page to both the store and the transcript.
fn commit(
    store: &mut ProgressStore,
    writer: &mut TranscriptWriter,
    id: &DocumentId,
    page_index: usize,
    resolution: PageResolution,
) -> Result<(), OcrError> {
    let body = resolution_body(&resolution);
    let succeeded = matches!(resolution, PageResolution::Done(_));

    if succeeded && writer.can_append(page_index) {
        writer.append(page_index, &body)?;
        return store.record_page(id, page_index, resolution);
    }

    store.record_page(id, page_index, resolution)?;
    if writer.can_append(page_index) {
        writer.append(page_index, &body)
    } else {
        let progress = store
            .document(id)
            .ok_or_else(|| OcrError::Internal(format!("Progress entry missing for '{id}'")))?;
        writer.rebuild(progress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use crate::config::RetryPolicy;
    use crate::pipeline::encode::PageImage;
    use crate::pipeline::extract::{ExtractionClient, ExtractionError};
    use async_trait::async_trait;
    use std::time::Duration;
    use tempfile::TempDir;

    struct FixedRaster(Option<usize>);

    #[async_trait]
    impl RasterSource for FixedRaster {
        async fn page_count(&self, path: &Path) -> Result<usize, RasterError> {
            self.0.ok_or_else(|| RasterError::Open {
                path: path.to_path_buf(),
                detail: "not a PDF".into(),
            })
        }

        async fn render_page(&self, _path: &Path, page_index: usize) -> Result<PageImage, RasterError> {
            Ok(PageImage {
                data: page_index.to_string().into_bytes(),
                mime_type: "image/png",
                width: 1,
                height: 1,
            })
        }
    }

    struct Echo;

    #[async_trait]
    impl ExtractionClient for Echo {
        async fn extract(&self, image: &PageImage) -> Result<String, ExtractionError> {
            Ok(format!("text {}", String::from_utf8_lossy(&image.data)))
        }
    }

    fn pipeline(pages: Option<usize>, out: &Path) -> DocumentPipeline {
        let policy = RetryPolicy {
            max_retries: 0,
            request_delay: Duration::ZERO,
            backoff_base: Duration::ZERO,
            backoff_cap: Duration::ZERO,
            call_timeout: None,
        };
        DocumentPipeline::new(
            Arc::new(FixedRaster(pages)),
            PageProcessor::new(Arc::new(Echo), policy),
            out,
        )
    }

    #[tokio::test]
    async fn completes_and_writes_every_page() {
        let dir = TempDir::new().unwrap();
        let mut store = ProgressStore::load(dir.path().join("progress.json"));
        let mut ctx = RunContext::default();
        let doc = Document::from_path(dir.path().join("a.pdf"));

        let outcome = pipeline(Some(2), dir.path())
            .run(&doc, &mut store, &mut ctx)
            .await
            .unwrap();

        assert_eq!(outcome, DocumentOutcome::Completed);
        assert_eq!(ctx.stats.pages_done, 2);
        let text = std::fs::read_to_string(dir.path().join("a_ocr.txt")).unwrap();
        assert!(text.contains("--- Page 1 ---\ntext 0\n"));
        assert!(text.contains("--- Page 2 ---\ntext 1\n"));
        assert_eq!(
            store.document(&doc.id).unwrap().status,
            DocumentStatus::Completed
        );
    }

    #[tokio::test]
    async fn unreadable_document_is_recorded() {
        let dir = TempDir::new().unwrap();
        let mut store = ProgressStore::load(dir.path().join("progress.json"));
        let mut ctx = RunContext::default();
        let doc = Document::from_path(dir.path().join("broken.pdf"));

        let outcome = pipeline(None, dir.path())
            .run(&doc, &mut store, &mut ctx)
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            DocumentOutcome::Aborted(AbortReason::Unreadable(_))
        ));
        let progress = store.document(&doc.id).unwrap();
        assert_eq!(progress.status, DocumentStatus::Unreadable);
        assert!(progress.last_error.as_deref().unwrap().contains("not a PDF"));
        assert!(progress.pages.is_empty());
        assert!(!dir.path().join("broken_ocr.txt").exists());
    }

    #[tokio::test]
    async fn zero_page_document_gets_header_only_transcript() {
        let dir = TempDir::new().unwrap();
        let mut store = ProgressStore::load(dir.path().join("progress.json"));
        let mut ctx = RunContext::default();
        let doc = Document::from_path(dir.path().join("empty.pdf"));

        let outcome = pipeline(Some(0), dir.path())
            .run(&doc, &mut store, &mut ctx)
            .await
            .unwrap();

        assert_eq!(outcome, DocumentOutcome::Completed);
        let text = std::fs::read_to_string(dir.path().join("empty_ocr.txt")).unwrap();
        assert!(text.starts_with("=== OCR Results for empty.pdf ==="));
        assert!(!text.contains("--- Page"));
    }

    #[tokio::test]
    async fn cancelled_context_aborts_before_opening() {
        let dir = TempDir::new().unwrap();
        let mut store = ProgressStore::load(dir.path().join("progress.json"));
        let mut ctx = RunContext::default();
        ctx.cancel_token().cancel();
        let doc = Document::from_path(dir.path().join("a.pdf"));

        let outcome = pipeline(Some(3), dir.path())
            .run(&doc, &mut store, &mut ctx)
            .await
            .unwrap();

        assert_eq!(outcome, DocumentOutcome::Aborted(AbortReason::Interrupted));
        assert_eq!(ctx.stats.api_calls, 0);
    }
}
