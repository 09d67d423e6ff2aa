//! Pipeline stages for batch OCR.
//!
//! Each submodule implements one step. The two external collaborators,
//! rasterisation and remote extraction, sit behind traits so the stages
//! above them can be driven by in-memory fakes.
//!
//! ## Data Flow
//!
//! ```text
//! document ──▶ raster ──▶ encode ──▶ page ──▶ extract ──▶ postprocess
//!              (pdfium)   (jpeg/png)  (retry)   (VLM)       (cleanup)
//! ```
//!
//! 1. [`raster`]   rasterise one page at a time; pdfium runs in
//!    `spawn_blocking` because it is not async-safe
//! 2. [`encode`]   shrink to the configured edge and compress for upload
//! 3. [`page`]     pacing, retry with backoff, failure classification
//! 4. [`extract`]  the remote call; the only stage with network I/O
//! 5. [`postprocess`] deterministic cleanup of the reply
//!
//! [`document`] drives the stages for one PDF and keeps the progress store
//! and the transcript in step.

pub mod document;
pub mod encode;
pub mod extract;
pub mod page;
pub mod postprocess;
pub mod raster;
