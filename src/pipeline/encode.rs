//! Image encoding: `DynamicImage` → compressed bytes ready for upload.
//!
//! JPEG at quality 85 is the default. Scanned and handwritten pages are
//! photographic, so PNG would multiply upload size without helping the model
//! read them. PNG remains available for crisp born-digital pages.

use crate::config::ImageEncoding;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

/// An encoded page image, as handed to an extraction client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageImage {
    pub data: Vec<u8>,
    pub mime_type: &'static str,
    pub width: u32,
    pub height: u32,
}

/// Encode a rasterised page, first shrinking it so neither edge exceeds
/// `max_edge`.
pub fn encode_page(
    img: &DynamicImage,
    encoding: ImageEncoding,
    max_edge: u32,
) -> Result<PageImage, image::ImageError> {
    let resized;
    let img = if img.width() > max_edge || img.height() > max_edge {
        resized = img.resize(max_edge, max_edge, FilterType::Lanczos3);
        &resized
    } else {
        img
    };

    let mut buf = Vec::new();
    let mime_type = match encoding {
        ImageEncoding::Png => {
            img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
            "image/png"
        }
        ImageEncoding::Jpeg { quality } => {
            // JPEG has no alpha channel.
            let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
            rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut buf, quality))?;
            "image/jpeg"
        }
    };

    debug!(
        "Encoded {}x{} page → {} bytes {}",
        img.width(),
        img.height(),
        buf.len(),
        mime_type
    );

    Ok(PageImage {
        data: buf,
        mime_type,
        width: img.width(),
        height: img.height(),
    })
}
