//! Promptable segmentation.
//!
//! [`Segmenter`] mirrors the shape of point-prompted models such as SAM:
//! the image is bound once (the expensive embedding step), then masks are
//! predicted for a set of labelled points. [`RegionGrowSegmenter`] is a
//! model-free stand-in that grows a colour-similar region from the prompt.

use std::collections::VecDeque;

use image::{GrayImage, RgbImage};

use crate::error::{Error, Result};
use crate::prompt::{PointLabel, PromptPoint};

/// A mask as returned by a segmenter, before normalization.
///
/// `shape` lists the axes (e.g. `[1, H, W]`), `data` is row-major with
/// `shape.iter().product()` elements. Values `> 0.0` are foreground.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMask {
    /// Axis lengths, outermost first.
    pub shape: Vec<usize>,
    /// Row-major values.
    pub data: Vec<f32>,
}

impl RawMask {
    /// Wrap a binary grayscale mask as a `[1, H, W]` tensor of `0.0` / `1.0`.
    #[must_use]
    pub fn from_gray(mask: &GrayImage) -> Self {
        Self {
            shape: vec![1, mask.height() as usize, mask.width() as usize],
            data: mask
                .pixels()
                .map(|p| if p[0] > 0 { 1.0 } else { 0.0 })
                .collect(),
        }
    }
}

/// Output of [`Segmenter::predict`].
#[derive(Debug, Clone, Default)]
pub struct Prediction {
    /// Candidate masks, best first.
    pub masks: Vec<RawMask>,
    /// Quality score per candidate.
    pub scores: Vec<f32>,
    /// Low-resolution logits, when the segmenter exposes them.
    pub low_res_logits: Option<RawMask>,
}

/// A point-promptable segmentation capability.
pub trait Segmenter: Send {
    /// Prime the segmenter with `image`. Must be called again whenever the
    /// image changes.
    ///
    /// # Errors
    ///
    /// Implementations report failures as [`Error::ServiceFailure`].
    fn bind(&mut self, image: &RgbImage) -> Result<()>;

    /// Predict masks for `points` on the bound image. With `multimask` unset
    /// exactly one candidate is expected.
    ///
    /// # Errors
    ///
    /// Implementations report failures as [`Error::ServiceFailure`].
    fn predict(&self, points: &[PromptPoint], multimask: bool) -> Result<Prediction>;
}

/// Tunables for [`RegionGrowSegmenter`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegionGrowOptions {
    /// Maximum Euclidean RGB distance from the seed colour.
    pub tolerance: f32,
    /// Pixels added around the grown region so the inpaint covers its edge.
    pub dilation: u32,
}

impl Default for RegionGrowOptions {
    fn default() -> Self {
        Self {
            tolerance: 40.0,
            dilation: 2,
        }
    }
}

/// Tolerance multipliers used for the three multimask candidates.
const MULTIMASK_SCALES: [f32; 3] = [0.5, 1.0, 2.0];

/// Flood-fill segmenter seeded at the first foreground prompt.
#[derive(Debug, Clone, Default)]
pub struct RegionGrowSegmenter {
    opts: RegionGrowOptions,
    bound: Option<RgbImage>,
}

impl RegionGrowSegmenter {
    /// Create a segmenter with the given options.
    #[must_use]
    pub fn new(opts: RegionGrowOptions) -> Self {
        Self { opts, bound: None }
    }

    fn grow(
        image: &RgbImage,
        seed: (u32, u32),
        blocked: &[(u32, u32)],
        tolerance: f32,
        dilation: u32,
    ) -> GrayImage {
        let (w, h) = image.dimensions();
        let seed_px = image.get_pixel(seed.0, seed.1);
        let tol_sq = tolerance * tolerance;
        let similar = |x: u32, y: u32| {
            let px = image.get_pixel(x, y);
            let dist_sq: f32 = (0..3)
                .map(|c| (f32::from(px[c]) - f32::from(seed_px[c])).powi(2))
                .sum();
            dist_sq <= tol_sq
        };

        let mut mask = GrayImage::new(w, h);
        for &(x, y) in blocked {
            // background prompts act as walls; 1 marks visited-but-excluded
            mask.put_pixel(x, y, image::Luma([1]));
        }
        let mut queue = VecDeque::from([seed]);
        mask.put_pixel(seed.0, seed.1, image::Luma([255]));
        while let Some((x, y)) = queue.pop_front() {
            let neighbors = [
                (x.wrapping_sub(1), y),
                (x + 1, y),
                (x, y.wrapping_sub(1)),
                (x, y + 1),
            ];
            for (nx, ny) in neighbors {
                if nx >= w || ny >= h || mask.get_pixel(nx, ny)[0] != 0 {
                    continue;
                }
                if similar(nx, ny) {
                    mask.put_pixel(nx, ny, image::Luma([255]));
                    queue.push_back((nx, ny));
                }
            }
        }
        for p in mask.pixels_mut() {
            if p[0] != 255 {
                p[0] = 0;
            }
        }
        dilate(&mask, dilation)
    }
}

impl Segmenter for RegionGrowSegmenter {
    fn bind(&mut self, image: &RgbImage) -> Result<()> {
        if image.width() == 0 || image.height() == 0 {
            return Err(Error::segmentation("cannot bind an empty image"));
        }
        self.bound = Some(image.clone());
        Ok(())
    }

    fn predict(&self, points: &[PromptPoint], multimask: bool) -> Result<Prediction> {
        let image = self
            .bound
            .as_ref()
            .ok_or_else(|| Error::segmentation("predict called before bind"))?;
        let (w, h) = image.dimensions();
        if let Some(p) = points.iter().find(|p| p.x >= w || p.y >= h) {
            return Err(Error::segmentation(format!(
                "prompt ({}, {}) outside {w}x{h} image",
                p.x, p.y
            )));
        }
        let seed = points
            .iter()
            .find(|p| p.label == PointLabel::Foreground)
            .ok_or_else(|| Error::segmentation("no foreground prompt supplied"))?;
        let blocked: Vec<(u32, u32)> = points
            .iter()
            .filter(|p| p.label == PointLabel::Background)
            .map(|p| (p.x, p.y))
            .collect();

        let scales: &[f32] = if multimask { &MULTIMASK_SCALES } else { &[1.0] };
        let mut candidates: Vec<(GrayImage, f32)> = scales
            .iter()
            .map(|s| {
                let mask = Self::grow(
                    image,
                    (seed.x, seed.y),
                    &blocked,
                    self.opts.tolerance * s,
                    self.opts.dilation,
                );
                let score = compactness(&mask);
                (mask, score)
            })
            .collect();
        candidates.sort_by(|a, b| b.1.total_cmp(&a.1));

        Ok(Prediction {
            scores: candidates.iter().map(|c| c.1).collect(),
            masks: candidates.iter().map(|c| RawMask::from_gray(&c.0)).collect(),
            low_res_logits: None,
        })
    }
}

/// Square (Chebyshev) dilation of a binary mask.
fn dilate(mask: &GrayImage, radius: u32) -> GrayImage {
    if radius == 0 {
        return mask.clone();
    }
    let (w, h) = mask.dimensions();
    let mut out = GrayImage::new(w, h);
    for (x, y, p) in mask.enumerate_pixels() {
        if p[0] == 0 {
            continue;
        }
        let (x0, y0) = (x.saturating_sub(radius), y.saturating_sub(radius));
        let (x1, y1) = ((x + radius).min(w - 1), (y + radius).min(h - 1));
        for yy in y0..=y1 {
            for xx in x0..=x1 {
                out.put_pixel(xx, yy, image::Luma([255]));
            }
        }
    }
    out
}

/// Foreground area over bounding-box area; 0 for an empty mask.
#[allow(clippy::cast_precision_loss)]
fn compactness(mask: &GrayImage) -> f32 {
    let mut area = 0u64;
    let (mut x0, mut y0, mut x1, mut y1) = (u32::MAX, u32::MAX, 0, 0);
    for (x, y, p) in mask.enumerate_pixels() {
        if p[0] > 0 {
            area += 1;
            x0 = x0.min(x);
            y0 = y0.min(y);
            x1 = x1.max(x);
            y1 = y1.max(y);
        }
    }
    if area == 0 {
        return 0.0;
    }
    let bbox = u64::from(x1 - x0 + 1) * u64::from(y1 - y0 + 1);
    area as f32 / bbox as f32
}
