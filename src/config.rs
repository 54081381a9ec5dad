use serde::Deserialize;
use std::time::Duration;

use crate::backoff::{RetryLadder, DEFAULT_LADDER_MS};

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub delivery: DeliveryConfig,
    pub guest: GuestConfig,
    pub capture: CaptureConfig,
    pub limits: TemplateLimits,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DeliveryConfig {
    /// Offsets (ms) of each retry after a delivery is triggered
    #[serde(default = "default_retry_ladder_ms")]
    pub retry_ladder_ms: Vec<u64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GuestConfig {
    /// Interval of the guest's ready/request-update pulse before the first update
    #[serde(default = "default_ready_pulse_ms")]
    pub ready_pulse_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CaptureConfig {
    #[serde(default = "default_min_pixel_ratio")]
    pub min_pixel_ratio: f64,
    #[serde(default = "default_max_pixel_ratio")]
    pub max_pixel_ratio: f64,
    /// Largest canvas edge the guest will allocate for a capture
    #[serde(default = "default_max_canvas_px")]
    pub max_canvas_px: u32,
}

/// Size limits applied to templates before a session is opened.
#[derive(Debug, Deserialize, Clone)]
pub struct TemplateLimits {
    #[serde(default = "default_max_name_chars")]
    pub max_name_chars: usize,
    #[serde(default = "default_max_html_chars")]
    pub max_html_chars: usize,
    #[serde(default = "default_max_css_chars")]
    pub max_css_chars: usize,
    #[serde(default = "default_max_js_chars")]
    pub max_js_chars: usize,
    #[serde(default = "default_max_params_chars")]
    pub max_params_chars: usize,
    #[serde(default = "default_min_height_px")]
    pub min_height_px: u32,
    #[serde(default = "default_max_height_px")]
    pub max_height_px: u32,
}

fn default_retry_ladder_ms() -> Vec<u64> {
    DEFAULT_LADDER_MS.to_vec()
}

fn default_ready_pulse_ms() -> u64 {
    200
}

fn default_min_pixel_ratio() -> f64 {
    1.0
}

fn default_max_pixel_ratio() -> f64 {
    3.0
}

fn default_max_canvas_px() -> u32 {
    16_384
}

fn default_max_name_chars() -> usize {
    64
}

fn default_max_html_chars() -> usize {
    20_000
}

fn default_max_css_chars() -> usize {
    20_000
}

fn default_max_js_chars() -> usize {
    50_000
}

fn default_max_params_chars() -> usize {
    20_000
}

fn default_min_height_px() -> u32 {
    24
}

fn default_max_height_px() -> u32 {
    6_000
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            retry_ladder_ms: default_retry_ladder_ms(),
        }
    }
}

impl Default for GuestConfig {
    fn default() -> Self {
        Self {
            ready_pulse_ms: default_ready_pulse_ms(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            min_pixel_ratio: default_min_pixel_ratio(),
            max_pixel_ratio: default_max_pixel_ratio(),
            max_canvas_px: default_max_canvas_px(),
        }
    }
}

impl Default for TemplateLimits {
    fn default() -> Self {
        Self {
            max_name_chars: default_max_name_chars(),
            max_html_chars: default_max_html_chars(),
            max_css_chars: default_max_css_chars(),
            max_js_chars: default_max_js_chars(),
            max_params_chars: default_max_params_chars(),
            min_height_px: default_min_height_px(),
            max_height_px: default_max_height_px(),
        }
    }
}

impl DeliveryConfig {
    pub fn ladder(&self) -> RetryLadder {
        RetryLadder::from_millis(&self.retry_ladder_ms)
    }
}

impl GuestConfig {
    pub fn ready_pulse(&self) -> Duration {
        Duration::from_millis(self.ready_pulse_ms)
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        // Expand environment variables like ${WIDGET_PULSE_MS}
        let expanded = shellexpand::env(&content)?;
        let config: Config = toml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values that would break delivery or capture invariants.
    pub fn validate(&self) -> anyhow::Result<()> {
        let ladder = self.delivery.ladder();
        if ladder.is_empty() {
            anyhow::bail!("delivery.retry_ladder_ms must not be empty");
        }
        if !ladder.is_increasing() {
            anyhow::bail!("delivery.retry_ladder_ms must be strictly increasing");
        }
        if self.guest.ready_pulse_ms == 0 {
            anyhow::bail!("guest.ready_pulse_ms must be greater than zero");
        }
        let (min, max) = (self.capture.min_pixel_ratio, self.capture.max_pixel_ratio);
        if !(min.is_finite() && max.is_finite()) || min <= 0.0 || min > max {
            anyhow::bail!("capture pixel ratio bounds are invalid ({min}..{max})");
        }
        if self.limits.min_height_px > self.limits.max_height_px {
            anyhow::bail!("limits.min_height_px exceeds limits.max_height_px");
        }
        Ok(())
    }
}
