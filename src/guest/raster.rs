//! Capture pipeline: turns the guest's rendered root into a PNG.
//!
//! Every step returns a tagged [`RasterError`] instead of unwinding, so a
//! failure anywhere becomes a `capture-result` with an `error` field.
//! The live tree is never mutated; all edits happen on a clone.
use std::collections::HashMap;

use image::imageops::{self, FilterType};
use image::{ImageEncoder, RgbaImage};
use quick_xml::escape::escape;
use thiserror::Error;
use tracing::debug;

use super::dom::Element;
use crate::config::CaptureConfig;
use crate::protocol::{clamp_pixel_ratio, CaptureRequest, CapturedImage};
use crate::sandbox::document::DIGIT_MASK;

const SVG_NS: &str = "http://www.w3.org/2000/svg";
const XHTML_NS: &str = "http://www.w3.org/1999/xhtml";

/// Tags whose text is never redacted.
const NON_VISIBLE_TAGS: [&str; 3] = ["script", "style", "noscript"];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RasterError {
    #[error("canvas: {0}")]
    Canvas(String),
    #[error("load: {0}")]
    Load(String),
    #[error("draw: {0}")]
    Draw(String),
    #[error("encode: {0}")]
    Encode(String),
}

/// Environment services the pipeline needs from the guest context.
pub trait RasterBackend {
    /// `(scrollWidth, scrollHeight)` of the root in CSS pixels.
    fn scroll_size(&self, root: &Element) -> (u32, u32);

    /// Current raster content of a live canvas as a `data:` URL.
    /// `index` is the canvas position in document order.
    fn canvas_data_url(&self, canvas: &Element, index: usize) -> Result<String, String>;

    /// Rules of every stylesheet, `Err` for sheets that refuse access.
    fn stylesheets(&self) -> Vec<Result<Vec<String>, String>>;

    /// Loads and decodes the image behind a `blob:` URL.
    fn load_image(&self, url: &str, blobs: &BlobStore) -> Result<RgbaImage, String>;
}

/// Temporary `blob:` URLs. Every URL created during a capture is revoked
/// before the capture returns.
#[derive(Debug, Default)]
pub struct BlobStore {
    blobs: HashMap<String, Vec<u8>>,
}

impl BlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_object_url(&mut self, bytes: Vec<u8>) -> String {
        let url = format!("blob:widget-sandbox/{}", uuid::Uuid::new_v4());
        self.blobs.insert(url.clone(), bytes);
        url
    }

    pub fn get(&self, url: &str) -> Option<&[u8]> {
        self.blobs.get(url).map(Vec::as_slice)
    }

    pub fn revoke(&mut self, url: &str) -> bool {
        self.blobs.remove(url).is_some()
    }

    /// URLs created and not yet revoked.
    pub fn live(&self) -> usize {
        self.blobs.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureBounds {
    pub min_pixel_ratio: f64,
    pub max_pixel_ratio: f64,
    pub max_canvas_px: u32,
}

impl Default for CaptureBounds {
    fn default() -> Self {
        Self::from(&CaptureConfig::default())
    }
}

impl From<&CaptureConfig> for CaptureBounds {
    fn from(config: &CaptureConfig) -> Self {
        Self {
            min_pixel_ratio: config.min_pixel_ratio,
            max_pixel_ratio: config.max_pixel_ratio,
            max_canvas_px: config.max_canvas_px,
        }
    }
}

/// Masks every ASCII digit in text outside `script`/`style`/`noscript`.
pub fn redact_digits(root: &mut Element) {
    let keep = |e: &Element| !NON_VISIBLE_TAGS.iter().any(|t| e.is(t));
    root.for_each_text_mut(&keep, &mut |text: &mut String| {
        if text.bytes().any(|b| b.is_ascii_digit()) {
            *text = text
                .chars()
                .map(|c| if c.is_ascii_digit() { DIGIT_MASK } else { c })
                .collect();
        }
    });
}

/// Swaps every `<canvas>` of `clone` for an `<img>` holding the matching
/// live canvas's pixels. Clones of canvases carry no pixels, hence the
/// pairing with `live` by document order.
pub fn replace_canvases(
    live: &Element,
    clone: &mut Element,
    backend: &dyn RasterBackend,
) -> Result<usize, RasterError> {
    let sources: Vec<Element> = live
        .descendants_by_tag("canvas")
        .into_iter()
        .cloned()
        .collect();

    for (index, canvas) in sources.iter().enumerate() {
        let url = backend
            .canvas_data_url(canvas, index)
            .map_err(RasterError::Canvas)?;
        let mut img = Element::new("img").with_attr("src", &url);
        for name in ["width", "height", "style", "class"] {
            if let Some(value) = canvas.attr(name) {
                img.set_attr(name, value);
            }
        }
        // Replaced canvases leave the list, so the next one is always 0
        if !clone.replace_nth_descendant("canvas", 0, img) {
            return Err(RasterError::Canvas(format!(
                "clone lost canvas #{index}"
            )));
        }
    }
    Ok(sources.len())
}

/// Concatenates every readable stylesheet rule; unreadable sheets are skipped.
pub fn collect_css(backend: &dyn RasterBackend) -> String {
    let mut rules = Vec::new();
    for (i, sheet) in backend.stylesheets().into_iter().enumerate() {
        match sheet {
            Ok(sheet_rules) => rules.extend(sheet_rules),
            Err(e) => debug!("Skipping stylesheet {i}: {e}"),
        }
    }
    rules.join("\n")
}

/// Wraps the clone and styles in an SVG `foreignObject` of `width`×`height`.
pub fn compose_svg(clone: &Element, css: &str, width: u32, height: u32) -> String {
    format!(
        "<svg xmlns=\"{SVG_NS}\" width=\"{width}\" height=\"{height}\">\
<foreignObject x=\"0\" y=\"0\" width=\"100%\" height=\"100%\">\
<div xmlns=\"{XHTML_NS}\"><style>{}</style>{}</div>\
</foreignObject></svg>",
        escape(css),
        clone.to_xhtml()
    )
}

/// Loads the SVG through a `blob:` URL, revoking it whatever the outcome.
pub fn load_svg(
    svg: &str,
    backend: &dyn RasterBackend,
    blobs: &mut BlobStore,
) -> Result<RgbaImage, RasterError> {
    let url = blobs.create_object_url(svg.as_bytes().to_vec());
    let loaded = backend.load_image(&url, blobs);
    blobs.revoke(&url);

    let image = loaded.map_err(RasterError::Load)?;
    if image.width() == 0 || image.height() == 0 {
        return Err(RasterError::Load("svg image has no size".to_string()));
    }
    Ok(image)
}

/// Draws `image` onto a canvas of `(width·ratio, height·ratio)`.
pub fn draw(
    image: &RgbaImage,
    width: u32,
    height: u32,
    ratio: f64,
    max_canvas_px: u32,
) -> Result<RgbaImage, RasterError> {
    let canvas_w = (f64::from(width) * ratio).round() as u32;
    let canvas_h = (f64::from(height) * ratio).round() as u32;
    if canvas_w > max_canvas_px || canvas_h > max_canvas_px {
        return Err(RasterError::Draw(format!("canvas exceeds {max_canvas_px}px")));
    }
    if canvas_w == 0 || canvas_h == 0 {
        return Err(RasterError::Draw("canvas context unavailable".to_string()));
    }

    let scaled_w = ((f64::from(image.width()) * ratio).round() as u32).max(1);
    let scaled_h = ((f64::from(image.height()) * ratio).round() as u32).max(1);
    let scaled = if (scaled_w, scaled_h) == image.dimensions() {
        image.clone()
    } else {
        imageops::resize(image, scaled_w, scaled_h, FilterType::Triangle)
    };

    let mut canvas = RgbaImage::new(canvas_w, canvas_h);
    imageops::overlay(&mut canvas, &scaled, 0, 0);
    Ok(canvas)
}

pub fn encode_png(canvas: &RgbaImage) -> Result<Vec<u8>, RasterError> {
    let mut bytes = Vec::with_capacity((canvas.width() * canvas.height()) as usize);
    image::codecs::png::PngEncoder::new(&mut bytes)
        .write_image(
            canvas.as_raw(),
            canvas.width(),
            canvas.height(),
            image::ColorType::Rgba8,
        )
        .map_err(|e| RasterError::Encode(e.to_string()))?;
    Ok(bytes)
}

/// Runs the whole pipeline for `request` against the live `root`.
pub fn capture(
    root: &Element,
    request: &CaptureRequest,
    bounds: &CaptureBounds,
    backend: &dyn RasterBackend,
    blobs: &mut BlobStore,
) -> Result<CapturedImage, RasterError> {
    let ratio = clamp_pixel_ratio(
        request.pixel_ratio,
        bounds.min_pixel_ratio,
        bounds.max_pixel_ratio,
    );
    let (width, height) = backend.scroll_size(root);
    let (width, height) = (width.max(1), height.max(1));

    let mut clone = root.clone();
    if request.options.hide_numbers {
        redact_digits(&mut clone);
    }
    replace_canvases(root, &mut clone, backend)?;
    let css = collect_css(backend);
    let svg = compose_svg(&clone, &css, width, height);
    let image = load_svg(&svg, backend, blobs)?;
    let canvas = draw(&image, width, height, ratio, bounds.max_canvas_px)?;
    let png = encode_png(&canvas)?;

    debug!(
        "Captured {}x{} at ratio {ratio} ({} bytes)",
        canvas.width(),
        canvas.height(),
        png.len()
    );
    Ok(CapturedImage {
        width: canvas.width(),
        height: canvas.height(),
        png,
    })
}
