//! Explicit run state threaded through the batch.
//!
//! The batch runner, the document pipeline and the page processor all take a
//! `&mut RunContext` instead of reaching for globals. It carries the
//! cooperative cancellation token, the page currently in flight, and the run
//! counters reported in the final summary. Tests construct one directly and
//! inspect it afterwards.

use crate::progress::DocumentId;
use tokio_util::sync::CancellationToken;

/// The page currently being worked on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageCursor {
    pub document: DocumentId,
    pub page_index: usize,
}

/// Counters for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Calls issued to the extraction client, retries included.
    pub api_calls: u64,
    pub pages_done: usize,
    pub pages_failed: usize,
    /// Pages skipped because an earlier run finished them.
    pub pages_skipped: usize,
    pub documents_completed: usize,
}

#[derive(Debug)]
pub struct RunContext {
    cancel: CancellationToken,
    current: Option<PageCursor>,
    pub stats: RunStats,
}

impl RunContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            current: None,
            stats: RunStats::default(),
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn current(&self) -> Option<&PageCursor> {
        self.current.as_ref()
    }

    pub(crate) fn enter_page(&mut self, document: &DocumentId, page_index: usize) {
        self.current = Some(PageCursor {
            document: document.clone(),
            page_index,
        });
    }

    pub(crate) fn leave_page(&mut self) {
        self.current = None;
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new(CancellationToken::new())
    }
}
