// Image decoding/encoding helpers shared by the processing pipeline.
// Everything here is blocking and is meant to run on the worker pool.

use image::{DynamicImage, ImageFormat};
use std::io::{self, Cursor};
use std::path::Path;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to decode image: {0}")]
    Decode(#[source] image::ImageError),
    #[error("failed to encode image: {0}")]
    Encode(#[source] image::ImageError),
    #[error("failed to write image: {0}")]
    Io(#[from] io::Error),
}

fn format_hint(media_type: Option<&str>) -> Option<ImageFormat> {
    let essence = media_type.map(|s| s[0..s.find(';').unwrap_or(s.len())].trim());
    match essence {
        Some("image/png") => Some(ImageFormat::Png),
        Some("image/jpeg") => Some(ImageFormat::Jpeg),
        Some("image/webp") => Some(ImageFormat::WebP),
        _ => None,
    }
}

/// Decodes an input image, using `media_type` as a hint when it names a known format.
pub fn decode_image(data: &[u8], media_type: Option<&str>) -> Result<DynamicImage, CodecError> {
    let image = match format_hint(media_type) {
        Some(format) => image::load_from_memory_with_format(data, format),
        None => image::load_from_memory(data),
    }
    .map_err(CodecError::Decode)?;

    // Colorizer input is 3-channel.
    Ok(match image {
        DynamicImage::ImageRgb8(_) => image,
        other => DynamicImage::ImageRgb8(other.to_rgb8()),
    })
}

pub fn encode_png(image: &DynamicImage) -> Result<Vec<u8>, CodecError> {
    let mut buffer = Cursor::new(Vec::new());
    image
        .write_to(&mut buffer, ImageFormat::Png)
        .map_err(CodecError::Encode)?;
    debug!(
        width = image.width(),
        height = image.height(),
        bytes = buffer.get_ref().len(),
        "Encoded PNG"
    );
    Ok(buffer.into_inner())
}

/// Re-encodes any supported input as a 3-channel PNG.
pub fn normalize_to_png(data: &[u8], media_type: Option<&str>) -> Result<Vec<u8>, CodecError> {
    encode_png(&decode_image(data, media_type)?)
}

/// Writes `png` next to `path` and renames it into place, so readers never see a partial file.
pub fn write_png_atomically(path: &Path, png: &[u8]) -> Result<(), CodecError> {
    let mut staging = path.as_os_str().to_owned();
    staging.push(".part");

    std::fs::write(&staging, png)?;
    if let Err(err) = std::fs::rename(&staging, path) {
        let _ = std::fs::remove_file(&staging);
        return Err(err.into());
    }
    Ok(())
}
