// ============================================================================
// IMAGE I/O: decode uploads, encode exports
// ============================================================================

use std::fs::File;
use std::io::{BufWriter, Cursor, Write};
use std::path::Path;

use image::codecs::bmp::BmpEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::codecs::webp::WebPEncoder;
use image::{DynamicImage, ImageEncoder, ImageFormat, RgbaImage};

use crate::error::EngineError;

/// Default JPEG quality for exports.
pub const DEFAULT_JPEG_QUALITY: u8 = 92;

/// Formats an export can be written as.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ExportFormat {
    #[default]
    Png,
    Jpeg,
    Webp,
    Bmp,
}

impl ExportFormat {
    pub fn mime(&self) -> &'static str {
        match self {
            ExportFormat::Png => "image/png",
            ExportFormat::Jpeg => "image/jpeg",
            ExportFormat::Webp => "image/webp",
            ExportFormat::Bmp => "image/bmp",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Png => "png",
            ExportFormat::Jpeg => "jpg",
            ExportFormat::Webp => "webp",
            ExportFormat::Bmp => "bmp",
        }
    }

    pub fn from_mime(mime: &str) -> Option<Self> {
        match mime.trim().to_ascii_lowercase().as_str() {
            "image/png" => Some(ExportFormat::Png),
            "image/jpeg" | "image/jpg" => Some(ExportFormat::Jpeg),
            "image/webp" => Some(ExportFormat::Webp),
            "image/bmp" | "image/x-bmp" => Some(ExportFormat::Bmp),
            _ => None,
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "png" => Some(ExportFormat::Png),
            "jpg" | "jpeg" => Some(ExportFormat::Jpeg),
            "webp" => Some(ExportFormat::Webp),
            "bmp" => Some(ExportFormat::Bmp),
            _ => None,
        }
    }

    /// Whether the format keeps every pixel (and alpha) exactly.
    pub fn is_lossless(&self) -> bool {
        !matches!(self, ExportFormat::Jpeg)
    }
}

/// A decoded upload.
#[derive(Clone, Debug)]
pub struct DecodedImage {
    pub pixels: RgbaImage,
    /// MIME type sniffed from the bytes, when recognised.
    pub mime: Option<&'static str>,
}

/// Sniff the MIME type from magic bytes.
pub fn mime_from_bytes(bytes: &[u8]) -> Option<&'static str> {
    let format = image::guess_format(bytes).ok()?;
    let mime = match format {
        ImageFormat::Png => "image/png",
        ImageFormat::Jpeg => "image/jpeg",
        ImageFormat::WebP => "image/webp",
        ImageFormat::Bmp => "image/bmp",
        ImageFormat::Gif => "image/gif",
        ImageFormat::Tiff => "image/tiff",
        _ => return None,
    };
    Some(mime)
}

/// Decode arbitrary image bytes to RGBA8.
pub fn decode_image(bytes: &[u8]) -> Result<DecodedImage, EngineError> {
    if bytes.is_empty() {
        return Err(EngineError::Decode("empty input".to_string()));
    }
    let mime = mime_from_bytes(bytes);
    let pixels = image::load_from_memory(bytes)?.to_rgba8();
    if pixels.width() == 0 || pixels.height() == 0 {
        return Err(EngineError::Decode("image has zero area".to_string()));
    }
    Ok(DecodedImage { pixels, mime })
}

/// Read and decode a file.
pub fn load_file(path: &Path) -> Result<DecodedImage, EngineError> {
    let bytes = std::fs::read(path)?;
    decode_image(&bytes).map_err(|e| match e {
        EngineError::Decode(msg) => EngineError::Decode(format!("{}: {}", path.display(), msg)),
        other => other,
    })
}

pub fn encode_image(image: &RgbaImage, format: ExportFormat) -> Result<Vec<u8>, EngineError> {
    encode_image_with_quality(image, format, DEFAULT_JPEG_QUALITY)
}

/// Encode to an in-memory buffer. `quality` only affects JPEG.
pub fn encode_image_with_quality(
    image: &RgbaImage,
    format: ExportFormat,
    quality: u8,
) -> Result<Vec<u8>, EngineError> {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 {
        return Err(EngineError::Encode("cannot encode an empty image".to_string()));
    }
    let mut buf = Cursor::new(Vec::new());
    let encode_err = |e: image::ImageError| EngineError::Encode(format!("{}: {}", format.mime(), e));

    match format {
        ExportFormat::Png => {
            PngEncoder::new(&mut buf)
                .write_image(image.as_raw(), w, h, image::ColorType::Rgba8)
                .map_err(encode_err)?;
        }
        ExportFormat::Jpeg => {
            // No alpha channel in JPEG
            let rgb_image = DynamicImage::ImageRgba8(image.clone()).to_rgb8();
            JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100))
                .write_image(rgb_image.as_raw(), w, h, image::ColorType::Rgb8)
                .map_err(encode_err)?;
        }
        ExportFormat::Webp => {
            WebPEncoder::new_lossless(&mut buf)
                .write_image(image.as_raw(), w, h, image::ColorType::Rgba8)
                .map_err(encode_err)?;
        }
        ExportFormat::Bmp => {
            BmpEncoder::new(&mut buf)
                .write_image(image.as_raw(), w, h, image::ColorType::Rgba8)
                .map_err(encode_err)?;
        }
    }
    Ok(buf.into_inner())
}

/// Write encoded bytes to disk.
pub fn write_file(bytes: &[u8], path: &Path) -> Result<(), EngineError> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    writer.write_all(bytes)?;
    writer.flush()?;
    Ok(())
}
