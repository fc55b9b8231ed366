//! Captured-frame encoding.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{Local, NaiveDateTime};
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

use super::backend::RawFrame;
use super::{CameraError, CameraResult};

/// One captured, encoded frame. Produced fresh on every capture call and
/// never reused across cycles.
#[derive(Debug, Clone)]
pub struct CaptureFrame {
    /// JPEG-compressed image bytes.
    pub jpeg: Vec<u8>,
    /// The same bytes, base64-encoded for the upload payload.
    pub base64: String,
    /// Local capture time (no zone offset stored).
    pub timestamp: NaiveDateTime,
    pub width: u32,
    pub height: u32,
    /// Size of the JPEG in bytes.
    pub byte_size: usize,
}

/// Compress a raw frame to JPEG at `quality` and base64-encode it.
pub(crate) fn encode_frame(raw: &RawFrame, quality: u8) -> CameraResult<CaptureFrame> {
    let timestamp = Local::now().naive_local();

    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, quality)
        .encode(&raw.pixels, raw.width, raw.height, ExtendedColorType::Rgb8)
        .map_err(|err| CameraError::EncodeFailed(err.to_string()))?;

    let base64 = BASE64.encode(&jpeg);
    Ok(CaptureFrame {
        byte_size: jpeg.len(),
        base64,
        timestamp,
        width: raw.width,
        height: raw.height,
        jpeg,
    })
}
