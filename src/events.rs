//! Progress-callback trait for per-document and per-page batch events.
//!
//! Inject an [`Arc<dyn BatchProgressCallback>`] via
//! [`crate::config::OcrConfigBuilder::progress_callback`] to receive events as
//! the batch advances. The CLI uses it to drive its progress bar; library
//! users can forward events to a channel, a log sink, or a job table.
//!
//! # Example
//!
//! ```rust
//! use pdf_ocr_batch::{BatchProgressCallback, DocumentId, OcrConfig};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct PageCounter {
//!     done: AtomicUsize,
//! }
//!
//! impl BatchProgressCallback for PageCounter {
//!     fn on_page_complete(&self, _doc: &DocumentId, _page: usize, _total: usize, _len: usize) {
//!         self.done.fetch_add(1, Ordering::SeqCst);
//!     }
//! }
//!
//! let counter = Arc::new(PageCounter { done: AtomicUsize::new(0) });
//! let config = OcrConfig::builder()
//!     .progress_callback(counter as Arc<dyn BatchProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use crate::pipeline::document::DocumentOutcome;
use crate::progress::DocumentId;
use std::sync::Arc;

/// Called by the batch runner and the document pipeline as work advances.
///
/// Page numbers are 1-indexed. All methods default to no-ops so callers only
/// override what they care about. Events arrive strictly in processing order.
pub trait BatchProgressCallback: Send + Sync {
    /// Called once with the number of documents about to be considered.
    fn on_batch_start(&self, total_documents: usize) {
        let _ = total_documents;
    }

    /// Called when a document is opened.
    ///
    /// # Arguments
    /// * `total_pages`   : page count of the PDF
    /// * `already_done`  : pages that will be skipped because a previous run
    ///   finished them
    fn on_document_start(&self, document: &DocumentId, total_pages: usize, already_done: usize) {
        let _ = (document, total_pages, already_done);
    }

    /// Called just before a page is rasterised and sent.
    fn on_page_start(&self, document: &DocumentId, page_num: usize, total_pages: usize) {
        let _ = (document, page_num, total_pages);
    }

    /// Called when a page's text has been recorded.
    fn on_page_complete(
        &self,
        document: &DocumentId,
        page_num: usize,
        total_pages: usize,
        text_len: usize,
    ) {
        let _ = (document, page_num, total_pages, text_len);
    }

    /// Called when a page has been recorded as failed.
    fn on_page_error(&self, document: &DocumentId, page_num: usize, total_pages: usize, error: &str) {
        let _ = (document, page_num, total_pages, error);
    }

    /// Called when the pipeline returns for a document.
    fn on_document_complete(&self, document: &DocumentId, outcome: &DocumentOutcome) {
        let _ = (document, outcome);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl BatchProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::OcrConfig`].
pub type ProgressCallback = Arc<dyn BatchProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct TrackingCallback {
        starts: AtomicUsize,
        completes: AtomicUsize,
        errors: AtomicUsize,
    }

    impl BatchProgressCallback for TrackingCallback {
        fn on_page_start(&self, _doc: &DocumentId, _page: usize, _total: usize) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn on_page_complete(&self, _doc: &DocumentId, _page: usize, _total: usize, _len: usize) {
            self.completes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_page_error(&self, _doc: &DocumentId, _page: usize, _total: usize, _error: &str) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        let doc = DocumentId::new("a.pdf");
        cb.on_batch_start(2);
        cb.on_document_start(&doc, 3, 1);
        cb.on_page_start(&doc, 2, 3);
        cb.on_page_complete(&doc, 2, 3, 42);
        cb.on_page_error(&doc, 3, 3, "service_unavailable");
        cb.on_document_complete(&doc, &DocumentOutcome::Completed);
    }

    #[test]
    fn arc_dyn_callback_receives_events() {
        let tracker = Arc::new(TrackingCallback::default());
        let cb: ProgressCallback = tracker.clone();
        let doc = DocumentId::new("a.pdf");

        cb.on_page_start(&doc, 1, 2);
        cb.on_page_complete(&doc, 1, 2, 100);
        cb.on_page_start(&doc, 2, 2);
        cb.on_page_error(&doc, 2, 2, "invalid_input");

        assert_eq!(tracker.starts.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.completes.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.errors.load(Ordering::SeqCst), 1);
    }
}
