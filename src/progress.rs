//! Durable per-page progress for a batch run.
//!
//! [`ProgressStore`] owns one JSON snapshot per run directory mapping every
//! document to the state of each of its pages. Every mutation rewrites the
//! whole snapshot through [`crate::atomic::write_atomic`] before returning, so
//! a process killed at any point leaves either the previous snapshot or the
//! new one on disk, and loses at most the page that was in flight.
//!
//! ## Snapshot format
//!
//! ```json
//! {
//!   "version": 1,
//!   "documents": {
//!     "report.pdf": {
//!       "source_path": "pdfs/report.pdf",
//!       "page_count": 2,
//!       "status": "in_progress",
//!       "output_file": "ocr_output/report_ocr.txt",
//!       "started_at": "2026-10-16T08:00:00Z",
//!       "pages": [
//!         { "page_index": 0, "status": "done", "text": "…", "last_attempt_at": "…" },
//!         { "page_index": 1, "status": "pending" }
//!       ]
//!     }
//!   }
//! }
//! ```
//!
//! Unknown fields are ignored on read so snapshots written by newer versions
//! stay loadable. An unreadable snapshot is moved aside and the run starts
//! fresh; it is never fatal.

use crate::atomic::write_atomic;
use crate::config::FailedPagePolicy;
use crate::error::{ErrorKind, OcrError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const SNAPSHOT_VERSION: u32 = 1;

/// Stable identity of a document: its file name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Identity derived from the file name of `path`.
    pub fn from_path(path: &Path) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        Self(name)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of a document across runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    #[default]
    InProgress,
    Completed,
    StoppedByRateLimit,
    /// The PDF could not be opened on the last attempt.
    Unreadable,
}

/// State of one page. Text exists only for done pages, an error kind only
/// for failed ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PageState {
    Pending,
    Done {
        text: String,
    },
    Failed {
        error_kind: ErrorKind,
        #[serde(default)]
        detail: String,
    },
}

impl PageState {
    pub fn is_pending(&self) -> bool {
        matches!(self, PageState::Pending)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageRecord {
    pub page_index: usize,
    #[serde(flatten)]
    pub state: PageState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl PageRecord {
    fn pending(page_index: usize) -> Self {
        Self {
            page_index,
            state: PageState::Pending,
            last_attempt_at: None,
        }
    }
}

/// Terminal result of a page proposed by the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum PageResolution {
    Done(String),
    Failed { kind: ErrorKind, detail: String },
}

impl From<PageResolution> for PageState {
    fn from(r: PageResolution) -> Self {
        match r {
            PageResolution::Done(text) => PageState::Done { text },
            PageResolution::Failed { kind, detail } => PageState::Failed {
                error_kind: kind,
                detail,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentProgress {
    pub source_path: PathBuf,
    pub page_count: usize,
    #[serde(default)]
    pub status: DocumentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_file: Option<PathBuf>,
    /// Also the generation timestamp printed in the transcript header.
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pages: Vec<PageRecord>,
    /// Why the document could not be opened, while it is unreadable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl DocumentProgress {
    pub fn done_pages(&self) -> usize {
        self.pages
            .iter()
            .filter(|p| matches!(p.state, PageState::Done { .. }))
            .count()
    }

    pub fn failed_pages(&self) -> usize {
        self.pages
            .iter()
            .filter(|p| matches!(p.state, PageState::Failed { .. }))
            .count()
    }
}

/// The whole persisted snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressState {
    #[serde(default = "snapshot_version")]
    pub version: u32,
    #[serde(default)]
    pub documents: BTreeMap<DocumentId, DocumentProgress>,
}

fn snapshot_version() -> u32 {
    SNAPSHOT_VERSION
}

impl Default for ProgressState {
    fn default() -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            documents: BTreeMap::new(),
        }
    }
}

/// Write-through store of [`ProgressState`].
#[derive(Debug)]
pub struct ProgressStore {
    path: PathBuf,
    state: ProgressState,
    failed_page_policy: FailedPagePolicy,
}

impl ProgressStore {
    /// Load the snapshot at `path`.
    ///
    /// A missing file yields an empty state. A file that cannot be read or
    /// parsed is logged, moved aside to `<name>.corrupt`, and also yields an
    /// empty state.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<ProgressState>(&bytes) {
                Ok(state) => {
                    info!(
                        path = %path.display(),
                        documents = state.documents.len(),
                        "Loaded progress"
                    );
                    state
                }
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "Progress file is corrupt, starting fresh"
                    );
                    quarantine(&path);
                    ProgressState::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No progress file found, starting fresh");
                ProgressState::default()
            }
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "Progress file is unreadable, starting fresh"
                );
                ProgressState::default()
            }
        };

        Self {
            path,
            state,
            failed_page_policy: FailedPagePolicy::default(),
        }
    }

    pub fn with_failed_page_policy(mut self, policy: FailedPagePolicy) -> Self {
        self.failed_page_policy = policy;
        self
    }

    pub fn document(&self, id: &DocumentId) -> Option<&DocumentProgress> {
        self.state.documents.get(id)
    }

    /// Create the entry for `id`, or reconcile an existing one with the page
    /// count observed in this run. Persists the snapshot.
    ///
    /// Records of pages that still exist are kept as they are. When the PDF
    /// now has fewer pages, records past the new end are dropped and the loss
    /// is logged. A reopened document goes back to in-progress until the
    /// pipeline completes it again.
    pub fn ensure_document(
        &mut self,
        id: &DocumentId,
        source_path: &Path,
        page_count: usize,
        output_file: &Path,
    ) -> Result<(), OcrError> {
        let entry = self
            .state
            .documents
            .entry(id.clone())
            .or_insert_with(|| DocumentProgress {
                source_path: source_path.to_path_buf(),
                page_count,
                status: DocumentStatus::InProgress,
                output_file: Some(output_file.to_path_buf()),
                started_at: Utc::now(),
                completed_at: None,
                pages: Vec::new(),
                last_error: None,
            });

        if entry.page_count != page_count && !entry.pages.is_empty() {
            warn!(
                document = %id,
                recorded = entry.page_count,
                observed = page_count,
                "Page count changed since the last run"
            );
        }
        entry.page_count = page_count;
        entry.source_path = source_path.to_path_buf();
        entry.output_file = Some(output_file.to_path_buf());
        if entry.status != DocumentStatus::InProgress {
            entry.status = DocumentStatus::InProgress;
            entry.completed_at = None;
        }
        entry.last_error = None;

        // Records are positional: record i describes page i.
        entry.pages.sort_by_key(|p| p.page_index);
        entry.pages.dedup_by_key(|p| p.page_index);
        let before = entry.pages.len();
        entry.pages.retain(|p| p.page_index < page_count);
        if entry.pages.len() < before {
            warn!(
                document = %id,
                dropped = before - entry.pages.len(),
                "Dropped records of pages past the end of the document"
            );
        }
        if entry.pages.len() != page_count
            || entry.pages.iter().enumerate().any(|(i, p)| p.page_index != i)
        {
            let mut by_index: BTreeMap<usize, PageRecord> = entry
                .pages
                .drain(..)
                .map(|p| (p.page_index, p))
                .collect();
            entry.pages = (0..page_count)
                .map(|i| by_index.remove(&i).unwrap_or_else(|| PageRecord::pending(i)))
                .collect();
        }

        self.save()
    }

    /// True when `page_index` of `id` must not be sent again: it is done, or
    /// it failed and failed pages are terminal.
    pub fn is_done(&self, id: &DocumentId, page_index: usize) -> bool {
        let Some(record) = self
            .state
            .documents
            .get(id)
            .and_then(|d| d.pages.get(page_index))
        else {
            return false;
        };
        match record.state {
            PageState::Pending => false,
            PageState::Done { .. } => true,
            PageState::Failed { .. } => self.failed_page_policy == FailedPagePolicy::Terminal,
        }
    }

    /// Record the terminal result of one page and persist the snapshot.
    ///
    /// A page that is already done is left untouched.
    pub fn record_page(
        &mut self,
        id: &DocumentId,
        page_index: usize,
        resolution: PageResolution,
    ) -> Result<(), OcrError> {
        let document = self
            .state
            .documents
            .get_mut(id)
            .ok_or_else(|| OcrError::Internal(format!("Unknown document '{id}'")))?;
        let page_count = document.page_count;
        let record = document.pages.get_mut(page_index).ok_or_else(|| {
            OcrError::Internal(format!(
                "Page index {page_index} out of range for '{id}' ({page_count} pages)"
            ))
        })?;

        if matches!(record.state, PageState::Done { .. }) {
            warn!(document = %id, page = page_index + 1, "Ignoring update of a done page");
            return Ok(());
        }

        record.state = resolution.into();
        record.last_attempt_at = Some(Utc::now());
        debug!(document = %id, page = page_index + 1, "Recorded page");
        self.save()
    }

    /// Set the status of `id` and persist the snapshot.
    pub fn mark_document_status(
        &mut self,
        id: &DocumentId,
        status: DocumentStatus,
    ) -> Result<(), OcrError> {
        let document = self
            .state
            .documents
            .get_mut(id)
            .ok_or_else(|| OcrError::Internal(format!("Unknown document '{id}'")))?;
        document.status = status;
        if status == DocumentStatus::Completed {
            document.completed_at = Some(Utc::now());
        }
        self.save()
    }

    /// Record that `id` could not be opened and persist the snapshot.
    ///
    /// Page records from earlier runs are kept; the next run that opens the
    /// file reconciles them as usual.
    pub fn mark_unreadable(
        &mut self,
        id: &DocumentId,
        source_path: &Path,
        detail: &str,
    ) -> Result<(), OcrError> {
        let entry = self
            .state
            .documents
            .entry(id.clone())
            .or_insert_with(|| DocumentProgress {
                source_path: source_path.to_path_buf(),
                page_count: 0,
                status: DocumentStatus::Unreadable,
                output_file: None,
                started_at: Utc::now(),
                completed_at: None,
                pages: Vec::new(),
                last_error: None,
            });
        entry.source_path = source_path.to_path_buf();
        entry.status = DocumentStatus::Unreadable;
        entry.completed_at = None;
        entry.last_error = Some(detail.to_string());
        self.save()
    }

    /// Persist the current snapshot again. Used on interruption.
    pub fn flush(&self) -> Result<(), OcrError> {
        self.save()
    }

    fn save(&self) -> Result<(), OcrError> {
        let json = serde_json::to_vec_pretty(&self.state)?;
        write_atomic(&self.path, &json).map_err(|source| OcrError::ProgressWriteFailed {
            path: self.path.clone(),
            source,
        })?;
        debug!(
            path = %self.path.display(),
            documents = self.state.documents.len(),
            "Progress saved"
        );
        Ok(())
    }
}

/// Move an unparseable snapshot out of the way so the next save does not
/// destroy it. Best effort.
fn quarantine(path: &Path) {
    let mut aside = path.as_os_str().to_owned();
    aside.push(".corrupt");
    let aside = PathBuf::from(aside);
    match std::fs::rename(path, &aside) {
        Ok(()) => warn!(path = %aside.display(), "Corrupt progress file kept for inspection"),
        Err(e) => warn!(error = %e, "Could not move corrupt progress file aside"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> ProgressStore {
        ProgressStore::load(dir.path().join("ocr_progress.json"))
    }

    fn doc() -> DocumentId {
        DocumentId::new("report.pdf")
    }

    fn ensure(store: &mut ProgressStore, pages: usize) {
        store
            .ensure_document(
                &doc(),
                Path::new("pdfs/report.pdf"),
                pages,
                Path::new("ocr_output/report_ocr.txt"),
            )
            .unwrap();
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        assert!(store.state.documents.is_empty());
        assert!(!store.is_done(&doc(), 0));
    }

    #[test]
    fn corrupt_file_loads_empty_and_is_moved_aside() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ocr_progress.json");
        std::fs::write(&path, b"{\"documents\": {\"a.pdf\": ").unwrap();

        let store = ProgressStore::load(&path);
        assert!(store.state.documents.is_empty());
        assert!(dir.path().join("ocr_progress.json.corrupt").exists());
        assert!(!path.exists());
    }

    #[test]
    fn ensure_creates_pending_pages_and_persists() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);
        ensure(&mut store, 3);

        let reloaded = store_in(&dir);
        let progress = reloaded.document(&doc()).unwrap();
        assert_eq!(progress.page_count, 3);
        assert_eq!(progress.pages.len(), 3);
        assert!(progress.pages.iter().all(|p| p.state.is_pending()));
        assert_eq!(progress.status, DocumentStatus::InProgress);
    }

    #[test]
    fn record_page_is_write_through() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);
        ensure(&mut store, 2);
        store
            .record_page(&doc(), 0, PageResolution::Done("Grüße, 世界".into()))
            .unwrap();

        let reloaded = store_in(&dir);
        assert!(reloaded.is_done(&doc(), 0));
        assert!(!reloaded.is_done(&doc(), 1));
        let record = &reloaded.document(&doc()).unwrap().pages[0];
        assert_eq!(
            record.state,
            PageState::Done {
                text: "Grüße, 世界".into()
            }
        );
        assert!(record.last_attempt_at.is_some());
    }

    #[test]
    fn done_page_is_never_altered() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);
        ensure(&mut store, 1);
        store
            .record_page(&doc(), 0, PageResolution::Done("first".into()))
            .unwrap();
        store
            .record_page(
                &doc(),
                0,
                PageResolution::Failed {
                    kind: ErrorKind::InvalidInput,
                    detail: "late".into(),
                },
            )
            .unwrap();

        let record = &store.document(&doc()).unwrap().pages[0];
        assert_eq!(
            record.state,
            PageState::Done {
                text: "first".into()
            }
        );
    }

    #[test]
    fn failed_page_policy_controls_is_done() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);
        ensure(&mut store, 1);
        store
            .record_page(
                &doc(),
                0,
                PageResolution::Failed {
                    kind: ErrorKind::ServiceUnavailable,
                    detail: "503".into(),
                },
            )
            .unwrap();
        assert!(store.is_done(&doc(), 0));

        let retrying = store_in(&dir).with_failed_page_policy(FailedPagePolicy::Retry);
        assert!(!retrying.is_done(&doc(), 0));
    }

    #[test]
    fn record_page_rejects_unknown_page() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);
        ensure(&mut store, 1);
        let err = store
            .record_page(&doc(), 5, PageResolution::Done("x".into()))
            .unwrap_err();
        assert!(matches!(err, OcrError::Internal(_)));
    }

    #[test]
    fn rate_limited_document_resumes_in_progress() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);
        ensure(&mut store, 2);
        store
            .mark_document_status(&doc(), DocumentStatus::StoppedByRateLimit)
            .unwrap();
        ensure(&mut store, 2);
        assert_eq!(
            store.document(&doc()).unwrap().status,
            DocumentStatus::InProgress
        );
    }

    #[test]
    fn completed_sets_completion_time() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);
        ensure(&mut store, 0);
        store
            .mark_document_status(&doc(), DocumentStatus::Completed)
            .unwrap();
        assert!(store.document(&doc()).unwrap().completed_at.is_some());
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ocr_progress.json");
        let json = r#"{
            "version": 7,
            "written_by": "a future release",
            "documents": {
                "report.pdf": {
                    "source_path": "pdfs/report.pdf",
                    "page_count": 1,
                    "status": "in_progress",
                    "started_at": "2026-10-16T08:00:00Z",
                    "checksum": "abc",
                    "pages": [
                        { "page_index": 0, "status": "done", "text": "hello", "tokens": 12 }
                    ]
                }
            }
        }"#;
        std::fs::write(&path, json).unwrap();

        let store = ProgressStore::load(&path);
        assert_eq!(store.state.version, 7);
        assert!(store.is_done(&doc(), 0));
    }

    #[test]
    fn reconcile_drops_only_records_past_a_smaller_page_count() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);
        ensure(&mut store, 3);
        store
            .record_page(&doc(), 0, PageResolution::Done("kept".into()))
            .unwrap();
        store
            .record_page(&doc(), 2, PageResolution::Done("gone".into()))
            .unwrap();
        ensure(&mut store, 2);

        let progress = store_in(&dir).document(&doc()).cloned().unwrap();
        assert_eq!(progress.page_count, 2);
        assert_eq!(progress.pages.len(), 2);
        assert_eq!(progress.pages[0].state, PageState::Done { text: "kept".into() });
        assert!(progress.pages[1].state.is_pending());
    }

    #[test]
    fn unreadable_document_keeps_its_records_and_reason() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);
        ensure(&mut store, 1);
        store
            .record_page(&doc(), 0, PageResolution::Done("kept".into()))
            .unwrap();
        store
            .mark_unreadable(&doc(), Path::new("pdfs/report.pdf"), "file is truncated")
            .unwrap();

        let reloaded = store_in(&dir);
        let progress = reloaded.document(&doc()).unwrap();
        assert_eq!(progress.status, DocumentStatus::Unreadable);
        assert_eq!(progress.last_error.as_deref(), Some("file is truncated"));
        assert!(reloaded.is_done(&doc(), 0));

        ensure(&mut store, 1);
        let progress = store.document(&doc()).unwrap();
        assert_eq!(progress.status, DocumentStatus::InProgress);
        assert!(progress.last_error.is_none());
    }

    #[test]
    fn reconcile_keeps_existing_records_when_page_count_grows() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);
        ensure(&mut store, 1);
        store
            .record_page(&doc(), 0, PageResolution::Done("kept".into()))
            .unwrap();
        ensure(&mut store, 3);

        let progress = store.document(&doc()).unwrap();
        assert_eq!(progress.pages.len(), 3);
        assert!(store.is_done(&doc(), 0));
        assert!(progress.pages[2].state.is_pending());
    }
}
