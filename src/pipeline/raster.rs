//! PDF rasterisation: page counts and per-page images via pdfium.
//!
//! ## Why spawn_blocking?
//!
//! The `pdfium-render` crate wraps the pdfium C++ library, which uses
//! thread-local state internally and is not safe to call from async contexts.
//! `tokio::task::spawn_blocking` moves the work onto a dedicated thread pool
//! thread designed for blocking operations.
//!
//! ## Why one page per call?
//!
//! The pipeline needs exactly one page image at a time. Rendering lazily keeps
//! peak memory at one page regardless of document length, and a page that
//! pdfium cannot render fails on its own instead of taking the whole document
//! down with it.

use crate::config::{ImageEncoding, OcrConfig};
use crate::pipeline::encode::{encode_page, PageImage};
use async_trait::async_trait;
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Errors from opening or rendering a document.
#[derive(Debug, Error)]
pub enum RasterError {
    /// The PDF could not be opened (missing, corrupt, encrypted).
    #[error("Cannot open '{}': {detail}", .path.display())]
    Open { path: PathBuf, detail: String },

    #[error("Page {page} is out of range (document has {total} pages)")]
    PageOutOfRange { page: usize, total: usize },

    /// pdfium returned an error for a specific page.
    #[error("Rasterisation failed for page {page}: {detail}")]
    Render { page: usize, detail: String },

    #[error("Image encoding failed for page {page}: {detail}")]
    Encode { page: usize, detail: String },

    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\
Set PDFIUM_LIB_PATH=/path/to/libpdfium or install pdfium system-wide."
    )]
    Binding(String),

    #[error("Render task failed: {0}")]
    Task(String),
}

/// Source of page images for a document.
#[async_trait]
pub trait RasterSource: Send + Sync {
    /// Number of pages in the document at `path`.
    async fn page_count(&self, path: &Path) -> Result<usize, RasterError>;

    /// Render and encode page `page_index` (0-based).
    async fn render_page(&self, path: &Path, page_index: usize) -> Result<PageImage, RasterError>;
}

/// [`RasterSource`] backed by pdfium.
#[derive(Debug, Clone)]
pub struct PdfiumRaster {
    max_rendered_pixels: u32,
    encoding: ImageEncoding,
    password: Option<String>,
}

impl PdfiumRaster {
    pub fn new(config: &OcrConfig) -> Self {
        Self {
            max_rendered_pixels: config.max_rendered_pixels,
            encoding: config.image_encoding,
            password: config.password.clone(),
        }
    }
}

#[async_trait]
impl RasterSource for PdfiumRaster {
    async fn page_count(&self, path: &Path) -> Result<usize, RasterError> {
        let path = path.to_path_buf();
        let password = self.password.clone();

        tokio::task::spawn_blocking(move || page_count_blocking(&path, password.as_deref()))
            .await
            .map_err(|e| RasterError::Task(format!("Page count task panicked: {e}")))?
    }

    async fn render_page(&self, path: &Path, page_index: usize) -> Result<PageImage, RasterError> {
        let path = path.to_path_buf();
        let password = self.password.clone();
        let max_pixels = self.max_rendered_pixels;
        let encoding = self.encoding;

        tokio::task::spawn_blocking(move || {
            render_page_blocking(&path, password.as_deref(), page_index, max_pixels, encoding)
        })
        .await
        .map_err(|e| RasterError::Task(format!("Render task panicked: {e}")))?
    }
}

/// Bind pdfium from `PDFIUM_LIB_PATH` when set, else from the system library
/// search path.
fn bind_pdfium() -> Result<Pdfium, RasterError> {
    let bindings = match std::env::var("PDFIUM_LIB_PATH") {
        Ok(p) if !p.is_empty() => Pdfium::bind_to_library(p.as_str()),
        _ => Pdfium::bind_to_system_library(),
    }
    .map_err(|e| RasterError::Binding(format!("{e:?}")))?;

    Ok(Pdfium::new(bindings))
}

fn open_error(path: &Path, password: Option<&str>, e: PdfiumError) -> RasterError {
    let err_str = format!("{:?}", e);
    let detail = if err_str.contains("Password") || err_str.contains("password") {
        if password.is_some() {
            "wrong password".to_string()
        } else {
            "encrypted; a password is required".to_string()
        }
    } else {
        err_str
    };
    RasterError::Open {
        path: path.to_path_buf(),
        detail,
    }
}

fn page_count_blocking(pdf_path: &Path, password: Option<&str>) -> Result<usize, RasterError> {
    let pdfium = bind_pdfium()?;
    let document = pdfium
        .load_pdf_from_file(pdf_path, password)
        .map_err(|e| open_error(pdf_path, password, e))?;

    let total = document.pages().len() as usize;
    info!("PDF loaded: {} ({} pages)", pdf_path.display(), total);
    Ok(total)
}

fn render_page_blocking(
    pdf_path: &Path,
    password: Option<&str>,
    page_index: usize,
    max_pixels: u32,
    encoding: ImageEncoding,
) -> Result<PageImage, RasterError> {
    let pdfium = bind_pdfium()?;
    let document = pdfium
        .load_pdf_from_file(pdf_path, password)
        .map_err(|e| open_error(pdf_path, password, e))?;

    let pages = document.pages();
    let total = pages.len() as usize;
    if page_index >= total {
        return Err(RasterError::PageOutOfRange {
            page: page_index + 1,
            total,
        });
    }

    let page = pages
        .get(page_index as u16)
        .map_err(|e| RasterError::Render {
            page: page_index + 1,
            detail: format!("{:?}", e),
        })?;

    let render_config = PdfRenderConfig::new()
        .set_target_width(max_pixels as i32)
        .set_maximum_height(max_pixels as i32);

    let bitmap = page
        .render_with_config(&render_config)
        .map_err(|e| RasterError::Render {
            page: page_index + 1,
            detail: format!("{:?}", e),
        })?;

    let image = bitmap.as_image();
    debug!(
        "Rendered page {} → {}x{} px",
        page_index + 1,
        image.width(),
        image.height()
    );

    encode_page(&image, encoding, max_pixels).map_err(|e| RasterError::Encode {
        page: page_index + 1,
        detail: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raster_takes_limits_from_config() {
        let config = OcrConfig::builder()
            .max_rendered_pixels(1024)
            .image_encoding(ImageEncoding::Png)
            .password("secret")
            .build()
            .unwrap();
        let raster = PdfiumRaster::new(&config);
        assert_eq!(raster.max_rendered_pixels, 1024);
        assert_eq!(raster.encoding, ImageEncoding::Png);
        assert_eq!(raster.password.as_deref(), Some("secret"));
    }

    #[test]
    fn open_error_explains_password_problems() {
        let err = RasterError::Open {
            path: "pdfs/locked.pdf".into(),
            detail: "encrypted; a password is required".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("locked.pdf"), "got: {msg}");
        assert!(msg.contains("password"), "got: {msg}");
    }
}
