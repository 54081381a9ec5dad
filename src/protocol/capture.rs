//! Capture sub-protocol: the host asks the guest for a bitmap of its
//! current DOM, the guest answers with a PNG or a structured error.
use base64::Engine;
use serde::{Deserialize, Serialize};

const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

pub const MIN_PIXEL_RATIO: f64 = 1.0;
pub const MAX_PIXEL_RATIO: f64 = 3.0;

/// Clamps a requested pixel ratio into `[min, max]`.
/// Non-finite values fall back to `min`.
pub fn clamp_pixel_ratio(raw: f64, min: f64, max: f64) -> f64 {
    if !raw.is_finite() {
        return min;
    }
    raw.clamp(min, max)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CaptureOptions {
    /// Mask every ASCII digit in visible text before rasterizing.
    pub hide_numbers: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureRequest {
    pub request_id: String,
    #[serde(default = "default_pixel_ratio")]
    pub pixel_ratio: f64,
    #[serde(default)]
    pub options: CaptureOptions,
}

fn default_pixel_ratio() -> f64 {
    MIN_PIXEL_RATIO
}

impl CaptureRequest {
    /// New request with a fresh random id.
    pub fn new(pixel_ratio: f64, hide_numbers: bool) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            pixel_ratio,
            options: CaptureOptions { hide_numbers },
        }
    }

    /// Pixel ratio the guest will actually use, within the default bounds.
    pub fn effective_ratio(&self) -> f64 {
        clamp_pixel_ratio(self.pixel_ratio, MIN_PIXEL_RATIO, MAX_PIXEL_RATIO)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedImage {
    pub width: u32,
    pub height: u32,
    /// PNG-encoded bytes.
    pub png: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureOutcome {
    Image(CapturedImage),
    Failed(String),
}

/// Guest reply correlated to a [`CaptureRequest`] by `request_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawCaptureResult", into = "RawCaptureResult")]
pub struct CaptureResult {
    pub request_id: String,
    pub outcome: CaptureOutcome,
}

impl CaptureResult {
    pub fn failed(request_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            outcome: CaptureOutcome::Failed(error.into()),
        }
    }

    pub fn image(request_id: impl Into<String>, image: CapturedImage) -> Self {
        Self {
            request_id: request_id.into(),
            outcome: CaptureOutcome::Image(image),
        }
    }
}

/// Wire form: `{requestId, width, height, buffer}` or `{requestId, error}`.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCaptureResult {
    request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    buffer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl From<CaptureResult> for RawCaptureResult {
    fn from(result: CaptureResult) -> Self {
        match result.outcome {
            CaptureOutcome::Image(img) => RawCaptureResult {
                request_id: result.request_id,
                width: Some(img.width),
                height: Some(img.height),
                buffer: Some(B64.encode(&img.png)),
                error: None,
            },
            CaptureOutcome::Failed(error) => RawCaptureResult {
                request_id: result.request_id,
                width: None,
                height: None,
                buffer: None,
                error: Some(error),
            },
        }
    }
}

impl TryFrom<RawCaptureResult> for CaptureResult {
    type Error = String;

    fn try_from(raw: RawCaptureResult) -> Result<Self, Self::Error> {
        if let Some(error) = raw.error {
            return Ok(CaptureResult::failed(raw.request_id, error));
        }
        match (raw.width, raw.height, raw.buffer) {
            (Some(width), Some(height), Some(buffer)) => {
                let png = B64
                    .decode(buffer.as_bytes())
                    .map_err(|e| format!("buffer is not base64: {e}"))?;
                Ok(CaptureResult::image(
                    raw.request_id,
                    CapturedImage { width, height, png },
                ))
            }
            _ => Err("capture result needs either error or width/height/buffer".to_string()),
        }
    }
}
