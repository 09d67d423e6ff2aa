//! # pdf-ocr-batch
//!
//! Resumable batch OCR of PDF folders using Vision Language Models (VLMs).
//!
//! ## Why this crate?
//!
//! Scanned and handwritten PDFs carry no text layer, and classic OCR engines
//! struggle with handwriting and mixed layouts. This crate rasterises each
//! page, lets a VLM read it, and writes one plain-text transcript per
//! document. Long runs against rate-limited APIs are the normal case, so every
//! finished page is recorded in a progress file before the next one starts:
//! a run stopped by a quota, a crash or Ctrl-C picks up exactly where it left
//! off and never pays for a page twice.
//!
//! ## Pipeline Overview
//!
//! ```text
//! pdfs/
//!  │
//!  ├─ 1. Discover  *.pdf, sorted by file name
//!  ├─ 2. Resume    skip pages the progress file marks as finished
//!  ├─ 3. Render    one page at a time via pdfium (spawn_blocking)
//!  ├─ 4. Extract   VLM call with pacing, retry and failure classification
//!  └─ 5. Persist   transcript section + progress snapshot after every page
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pdf_ocr_batch::{run_batch, OcrConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from GEMINI_API_KEY / OPENAI_API_KEY / ANTHROPIC_API_KEY
//!     let config = OcrConfig::builder()
//!         .input_dir("pdfs")
//!         .output_dir("ocr_output")
//!         .build()?;
//!     let summary = run_batch(&config, CancellationToken::new()).await?;
//!     eprintln!(
//!         "{} pages done, {} failed, {} API calls",
//!         summary.stats.pages_done, summary.stats.pages_failed, summary.stats.api_calls
//!     );
//!     std::process::exit(summary.exit_code().into());
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pdf-ocr` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! pdf-ocr-batch = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub(crate) mod atomic;
pub mod batch;
pub mod config;
pub mod context;
pub mod credentials;
pub mod error;
pub mod events;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod transcript;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use batch::{
    discover_documents, run_batch, run_batch_with, BatchRunner, BatchStatus, BatchSummary,
};
pub use config::{FailedPagePolicy, ImageEncoding, OcrConfig, OcrConfigBuilder, RetryPolicy};
pub use context::{RunContext, RunStats};
pub use error::{ErrorKind, FailureClass, OcrError};
pub use events::{BatchProgressCallback, NoopProgressCallback, ProgressCallback};
pub use pipeline::document::{AbortReason, Document, DocumentOutcome, DocumentPipeline};
pub use pipeline::encode::PageImage;
pub use pipeline::extract::{ExtractionClient, ExtractionError, VisionExtractor};
pub use pipeline::page::{PageOutcome, PageProcessor};
pub use pipeline::raster::{PdfiumRaster, RasterError, RasterSource};
pub use progress::{DocumentId, DocumentStatus, PageState, ProgressStore};
