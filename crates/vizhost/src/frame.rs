//! Raster output: exported images and captured animation frames.

use crate::result::{VizhostError, VizhostResult};
use base64::Engine as _;
use image::{ImageFormat, ImageReader};
use std::io::Cursor;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Options for a raster export
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RasterOptions {
    /// Scale relative to the canvas (ignored when a size is given)
    pub scale: f64,
    /// Transparent background
    pub transparent: bool,
    /// Dots per inch written into the image
    pub dpi: u32,
    /// Requested output width
    pub width: Option<u32>,
    /// Requested output height
    pub height: Option<u32>,
}

impl Default for RasterOptions {
    fn default() -> Self {
        Self {
            scale: 1.0,
            transparent: false,
            dpi: 72,
            width: None,
            height: None,
        }
    }
}

impl RasterOptions {
    /// Set the scale
    #[must_use]
    pub const fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    /// Request an output size
    #[must_use]
    pub const fn with_size(mut self, width: Option<u32>, height: Option<u32>) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Set background transparency
    #[must_use]
    pub const fn with_transparent(mut self, transparent: bool) -> Self {
        self.transparent = transparent;
        self
    }

    /// Scale to hand to the engine for a canvas of `canvas` pixels.
    ///
    /// An explicit size wins over `scale`; with both dimensions the smaller
    /// ratio is used so the result fits inside the request.
    #[must_use]
    pub fn effective_scale(&self, canvas: (u32, u32)) -> f64 {
        let ratio = |target: u32, actual: u32| f64::from(target) / f64::from(actual.max(1));
        let scale = match (self.width, self.height) {
            (Some(w), Some(h)) => ratio(w, canvas.0).min(ratio(h, canvas.1)),
            (Some(w), None) => ratio(w, canvas.0),
            (None, Some(h)) => ratio(h, canvas.1),
            (None, None) => self.scale,
        };
        if scale.is_finite() && scale > 0.0 {
            scale
        } else {
            1.0
        }
    }
}

/// PNG produced by a raster export
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RasterImage {
    base64: String,
    png: Vec<u8>,
    width: u32,
    height: u32,
}

impl RasterImage {
    /// Decode a base64 PNG, with or without a `data:` URL prefix
    ///
    /// # Errors
    ///
    /// Returns `Export` if the payload is not base64 or not a PNG
    pub fn from_base64(payload: &str) -> VizhostResult<Self> {
        let base64 = strip_data_url(payload).trim().to_string();
        if base64.is_empty() {
            return Err(VizhostError::export("engine returned an empty image"));
        }
        let png = base64::engine::general_purpose::STANDARD
            .decode(&base64)
            .map_err(|e| VizhostError::export(format!("invalid base64 image: {e}")))?;
        let (width, height) = png_dimensions(&png)?;
        Ok(Self {
            base64,
            png,
            width,
            height,
        })
    }

    /// Wrap raw PNG bytes
    ///
    /// # Errors
    ///
    /// Returns `Export` if the bytes are not a PNG
    pub fn from_png(png: Vec<u8>) -> VizhostResult<Self> {
        let (width, height) = png_dimensions(&png)?;
        Ok(Self {
            base64: base64::engine::general_purpose::STANDARD.encode(&png),
            png,
            width,
            height,
        })
    }

    /// Base64 PNG without a URL prefix
    #[must_use]
    pub fn base64(&self) -> &str {
        &self.base64
    }

    /// Raw PNG bytes
    #[must_use]
    pub fn png(&self) -> &[u8] {
        &self.png
    }

    /// Width in pixels
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels
    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// `data:` URL form
    #[must_use]
    pub fn data_url(&self) -> String {
        format!("data:image/png;base64,{}", self.base64)
    }

    /// Consume into raw PNG bytes
    #[must_use]
    pub fn into_png(self) -> Vec<u8> {
        self.png
    }
}

/// Drop a leading `data:image/...;base64,` header if present
#[must_use]
pub fn strip_data_url(payload: &str) -> &str {
    if payload.starts_with("data:") {
        payload.split_once(',').map_or("", |(_, body)| body)
    } else {
        payload
    }
}

/// Read width and height from the PNG header, without decoding pixels
///
/// # Errors
///
/// Returns `Export` if the bytes do not start with a valid PNG header
pub fn png_dimensions(png: &[u8]) -> VizhostResult<(u32, u32)> {
    ImageReader::with_format(Cursor::new(png), ImageFormat::Png)
        .into_dimensions()
        .map_err(|e| VizhostError::export(format!("failed to read PNG header: {e}")))
}

/// SHA-256 of `bytes`, hex encoded
#[must_use]
pub fn checksum(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// One captured animation frame. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    index: usize,
    sample_value: f64,
    timestamp_ms: u64,
    width: u32,
    height: u32,
    png: Vec<u8>,
    checksum: String,
}

impl Frame {
    /// Wrap a captured image
    #[must_use]
    pub fn new(index: usize, sample_value: f64, timestamp_ms: u64, image: RasterImage) -> Self {
        let checksum = checksum(image.png());
        Self {
            index,
            sample_value,
            timestamp_ms,
            width: image.width(),
            height: image.height(),
            png: image.into_png(),
            checksum,
        }
    }

    /// Position in the sweep
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Parameter value this frame was captured at
    #[must_use]
    pub const fn sample_value(&self) -> f64 {
        self.sample_value
    }

    /// Presentation timestamp relative to the first frame
    #[must_use]
    pub const fn timestamp_ms(&self) -> u64 {
        self.timestamp_ms
    }

    /// Width in pixels
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels
    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// PNG bytes
    #[must_use]
    pub fn png(&self) -> &[u8] {
        &self.png
    }

    /// SHA-256 of the PNG bytes
    #[must_use]
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    /// Base64 PNG
    #[must_use]
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.png)
    }
}

/// Serializable frame summary for responses that should not carry pixels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameSummary {
    /// Position in the sweep
    pub index: usize,
    /// Parameter value
    pub sample_value: f64,
    /// Timestamp in milliseconds
    pub timestamp_ms: u64,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// SHA-256 of the PNG
    pub checksum: String,
}

impl From<&Frame> for FrameSummary {
    fn from(frame: &Frame) -> Self {
        Self {
            index: frame.index,
            sample_value: frame.sample_value,
            timestamp_ms: frame.timestamp_ms,
            width: frame.width,
            height: frame.height,
            checksum: frame.checksum.clone(),
        }
    }
}
