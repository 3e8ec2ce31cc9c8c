//! Outbound frame payloads and the options used to produce them.

use bytes::Bytes;

/// One compressed image, the unit of outbound transmission.
///
/// Sent as a single binary WebSocket message with no envelope. Moved into
/// the send call and never kept afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramePayload(Bytes);

impl FramePayload {
    pub fn new(data: impl Into<Bytes>) -> Self {
        FramePayload(data.into())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

/// Output codec for captured frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageFormat {
    #[default]
    Jpeg,
    Png,
}

impl std::str::FromStr for ImageFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" => Ok(ImageFormat::Jpeg),
            "png" => Ok(ImageFormat::Png),
            other => Err(format!("unsupported image format `{other}`")),
        }
    }
}

/// Options handed to the capture collaborator on every tick.
///
/// `quality` applies to the raw capture and `compress` to the recompression
/// step. Both are ratios in `(0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureOptions {
    pub quality: f32,
    pub format: ImageFormat,
    pub compress: f32,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        CaptureOptions {
            quality: 0.5,
            format: ImageFormat::Jpeg,
            compress: 0.5,
        }
    }
}

impl CaptureOptions {
    /// JPEG quality in 1..=100. A capture followed by a recompression is
    /// never better than the lower of its two settings.
    pub fn encoder_quality(&self) -> u8 {
        let ratio = self.quality.min(self.compress);
        (ratio * 100.0).round().clamp(1.0, 100.0) as u8
    }
}
