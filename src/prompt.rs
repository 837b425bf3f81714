//! Saliency-guided prompt selection.
//!
//! The brightest point of the full-resolution saliency map becomes the single
//! foreground prompt handed to the segmenter.

use image::imageops::{self, FilterType};
use image::RgbImage;

use crate::error::{Error, Result};
use crate::saliency::{self, SaliencyMap, SaliencyService};
use crate::scale::ScaleOptions;

/// Label attached to a prompt point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointLabel {
    /// The point lies outside the object of interest.
    Background,
    /// The point lies on the object of interest.
    Foreground,
}

/// A single labelled point in full-resolution pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromptPoint {
    /// Column.
    pub x: u32,
    /// Row.
    pub y: u32,
    /// Foreground or background.
    pub label: PointLabel,
}

impl PromptPoint {
    /// A foreground point at `(x, y)`.
    #[must_use]
    pub fn foreground(x: u32, y: u32) -> Self {
        Self {
            x,
            y,
            label: PointLabel::Foreground,
        }
    }
}

/// Pick the most salient point of `image`.
///
/// The saliency service runs on the working grid derived from `scale`; its
/// map is upsampled with Catmull-Rom interpolation to the image size and the
/// first maximum in row-major order is returned.
///
/// # Errors
///
/// - [`Error::InvalidInput`] for a zero-sized image.
/// - [`Error::ServiceFailure`] if the service fails or returns a map whose
///   size differs from the requested grid or that contains non-finite values.
pub fn select_prompt(
    service: &dyn SaliencyService,
    image: &RgbImage,
    scale: &ScaleOptions,
) -> Result<PromptPoint> {
    let (width, height) = image.dimensions();
    let size = scale.working_size(width, height)?;

    let gray = imageops::grayscale(image);
    let mut map = service.compute(&gray, size)?;
    if map.dimensions() != (size.width, size.height) {
        return Err(Error::saliency(format!(
            "map is {}x{}, requested {}x{}",
            map.width(),
            map.height(),
            size.width,
            size.height
        )));
    }
    if map.pixels().any(|p| !p[0].is_finite()) {
        return Err(Error::saliency("map contains non-finite values"));
    }
    log::debug!(
        "saliency map {}x{} for {width}x{height} image",
        size.width,
        size.height
    );

    // Upsampling clamps to [0, 1]; normalize first so the peak survives.
    saliency::normalize(&mut map);
    let full = upsample(&map, width, height);
    let (x, y) = peak(&full).ok_or_else(|| Error::saliency("map is empty"))?;
    Ok(PromptPoint::foreground(x, y))
}

/// Resize a saliency map to `width` x `height` with cubic interpolation.
#[must_use]
pub fn upsample(map: &SaliencyMap, width: u32, height: u32) -> SaliencyMap {
    imageops::resize(map, width, height, FilterType::CatmullRom)
}

/// Coordinate of the first maximum in row-major order, `None` for an empty map.
#[must_use]
pub fn peak(map: &SaliencyMap) -> Option<(u32, u32)> {
    let mut best: Option<(u32, u32, f32)> = None;
    for (x, y, p) in map.enumerate_pixels() {
        match best {
            Some((_, _, v)) if p[0] <= v => {}
            _ => best = Some((x, y, p[0])),
        }
    }
    best.map(|(x, y, _)| (x, y))
}
