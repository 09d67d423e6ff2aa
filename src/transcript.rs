//! Per-document transcript files.
//!
//! A transcript is plain UTF-8 text:
//!
//! ```text
//! === OCR Results for report.pdf ===
//! Generated on: 2026-10-16 10:00:00
//!
//! --- Page 1 ---
//! <text>
//!
//! ==================================================
//!
//! --- Page 2 ---
//! [OCR failed: service_unavailable]
//!
//! ==================================================
//!
//! ```
//!
//! [`TranscriptWriter`] appends one section per finished page. When a section
//! would land out of order, or when a previous run left the file out of step
//! with the progress store, the file is rebuilt from the store in one atomic
//! replace. A rebuild and the equivalent sequence of appends produce the
//! same bytes, since the header timestamp comes from the store too.

use crate::atomic::write_atomic;
use crate::error::{ErrorKind, OcrError};
use crate::progress::{DocumentId, DocumentProgress, PageResolution, PageState};
use chrono::{DateTime, Local, Utc};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

const SEPARATOR_WIDTH: usize = 50;

/// File name of the transcript for `id`: `<stem>_ocr.txt`.
pub fn transcript_file_name(id: &DocumentId) -> String {
    let stem = Path::new(id.as_str())
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| id.as_str().to_string());
    format!("{stem}_ocr.txt")
}

pub fn render_header(id: &DocumentId, generated_at: DateTime<Utc>) -> String {
    format!(
        "=== OCR Results for {} ===\nGenerated on: {}\n\n",
        id,
        generated_at
            .with_timezone(&Local)
            .format("%Y-%m-%d %H:%M:%S")
    )
}

/// One page section. `page_index` is 0-based; the marker shows it 1-based.
pub fn render_section(page_index: usize, body: &str) -> String {
    format!(
        "--- Page {} ---\n{}\n\n{}\n\n",
        page_index + 1,
        body,
        "=".repeat(SEPARATOR_WIDTH)
    )
}

fn failure_body(kind: ErrorKind) -> String {
    format!("[OCR failed: {kind}]")
}

/// Section body for a resolved page.
pub fn resolution_body(resolution: &PageResolution) -> String {
    match resolution {
        PageResolution::Done(text) => text.clone(),
        PageResolution::Failed { kind, .. } => failure_body(*kind),
    }
}

/// Section body for a stored page; `None` while the page is pending.
pub fn state_body(state: &PageState) -> Option<String> {
    match state {
        PageState::Pending => None,
        PageState::Done { text } => Some(text.clone()),
        PageState::Failed { error_kind, .. } => Some(failure_body(*error_kind)),
    }
}

/// The full transcript implied by the store: header plus every non-pending
/// page in ascending order.
pub fn render_document(id: &DocumentId, progress: &DocumentProgress) -> String {
    let mut out = render_header(id, progress.started_at);
    let mut pages: Vec<_> = progress.pages.iter().collect();
    pages.sort_by_key(|p| p.page_index);
    for page in pages {
        if let Some(body) = state_body(&page.state) {
            out.push_str(&render_section(page.page_index, &body));
        }
    }
    out
}

/// Incremental writer for one document's transcript.
#[derive(Debug)]
pub struct TranscriptWriter {
    path: PathBuf,
    id: DocumentId,
    generated_at: DateTime<Utc>,
    last_written: Option<usize>,
}

impl TranscriptWriter {
    /// Prepare the transcript at `path` for `progress`.
    ///
    /// When the store already holds finished pages, the file is rebuilt from
    /// the store so that any section appended after the last durable store
    /// update disappears. Otherwise the file is left alone until the first
    /// section is written, which truncates it and writes the header.
    pub fn open(
        path: impl Into<PathBuf>,
        id: &DocumentId,
        progress: &DocumentProgress,
    ) -> Result<Self, OcrError> {
        let mut writer = Self {
            path: path.into(),
            id: id.clone(),
            generated_at: progress.started_at,
            last_written: None,
        };
        if progress.pages.iter().any(|p| !p.state.is_pending()) {
            writer.rebuild(progress)?;
        }
        Ok(writer)
    }

    /// True when a section for `page_index` can be appended without breaking
    /// ascending order.
    pub fn can_append(&self, page_index: usize) -> bool {
        self.last_written.is_none_or(|last| page_index > last)
    }

    /// Append one section, writing the header first if the file is new.
    pub fn append(&mut self, page_index: usize, body: &str) -> Result<(), OcrError> {
        if !self.can_append(page_index) {
            return Err(OcrError::Internal(format!(
                "Page {} would be written out of order in '{}'",
                page_index + 1,
                self.path.display()
            )));
        }

        let mut chunk = String::new();
        if self.last_written.is_none() {
            chunk.push_str(&render_header(&self.id, self.generated_at));
        }
        chunk.push_str(&render_section(page_index, body));

        let fresh = self.last_written.is_none();
        self.write_chunk(&chunk, fresh)
            .map_err(|source| OcrError::TranscriptWriteFailed {
                path: self.path.clone(),
                source,
            })?;
        self.last_written = Some(page_index);
        debug!(document = %self.id, page = page_index + 1, "Appended transcript section");
        Ok(())
    }

    /// Replace the file with the transcript implied by `progress`.
    pub fn rebuild(&mut self, progress: &DocumentProgress) -> Result<(), OcrError> {
        let content = render_document(&self.id, progress);
        write_atomic(&self.path, content.as_bytes()).map_err(|source| {
            OcrError::TranscriptWriteFailed {
                path: self.path.clone(),
                source,
            }
        })?;
        self.generated_at = progress.started_at;
        self.last_written = progress
            .pages
            .iter()
            .filter(|p| !p.state.is_pending())
            .map(|p| p.page_index)
            .max();
        debug!(document = %self.id, "Rebuilt transcript from progress");
        Ok(())
    }

    fn write_chunk(&self, chunk: &str, fresh: bool) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut file = if fresh {
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&self.path)?
        } else {
            OpenOptions::new().append(true).open(&self.path)?
        };
        file.write_all(chunk.as_bytes())?;
        file.sync_data()
    }
}
