//! Inpainting primitives.
//!
//! Two algorithms fill the masked region from its surroundings:
//!
//! - [`InpaintMethod::FastMarching`]: Telea's fast marching method, from the
//!   `inpaint` crate. Pixels are filled in order of distance from the mask
//!   boundary, each one a weighted average of the known pixels within `radius`.
//! - [`InpaintMethod::Fluid`]: a Navier-Stokes style scheme. After a Telea
//!   fill over the same radius, image smoothness (the Laplacian) is
//!   transported along isophotes into the hole, with a little diffusion for
//!   stability.

mod fluid;

use image::{GrayImage, Rgb, RgbImage};
use ::inpaint::prelude::*;

use crate::error::{Error, Result};

/// Inpainting algorithm selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InpaintMethod {
    /// Telea fast marching method.
    FastMarching,
    /// Fluid-dynamics (Navier-Stokes style) transport.
    Fluid,
}

impl InpaintMethod {
    /// Human-readable algorithm name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::FastMarching => "fast marching",
            Self::Fluid => "fluid",
        }
    }
}

/// An inpainting capability.
pub trait Inpainter: Send + Sync {
    /// Fill the pixels of `image` where `mask` is non-zero.
    ///
    /// The result has the same dimensions as `image`.
    ///
    /// # Errors
    ///
    /// Implementations report failures as [`Error::AlgorithmFailure`].
    fn inpaint(
        &self,
        image: &RgbImage,
        mask: &GrayImage,
        radius: u32,
        method: InpaintMethod,
    ) -> Result<RgbImage>;
}

/// The crate's own implementations of both algorithms.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinInpainter;

impl Inpainter for BuiltinInpainter {
    fn inpaint(
        &self,
        image: &RgbImage,
        mask: &GrayImage,
        radius: u32,
        method: InpaintMethod,
    ) -> Result<RgbImage> {
        if image.dimensions() != mask.dimensions() {
            return Err(Error::AlgorithmFailure {
                method: method.name(),
                reason: format!(
                    "mask is {}x{}, image is {}x{}",
                    mask.width(),
                    mask.height(),
                    image.width(),
                    image.height()
                ),
            });
        }

        let unknown: Vec<bool> = mask.pixels().map(|p| p[0] > 0).collect();
        if !unknown.contains(&true) {
            return Ok(image.clone());
        }
        if !unknown.contains(&false) {
            log::warn!("{} inpaint: mask covers the whole image", method.name());
            return Ok(image.clone());
        }

        let radius = radius.max(1);
        let mut filled = image.clone();
        let telea_radius = i32::try_from(radius).map_err(|_| Error::AlgorithmFailure {
            method: method.name(),
            reason: format!("radius {radius} out of range"),
        })?;
        // writes back by truncation, so a flat fill may land one below
        filled
            .telea_inpaint(mask, telea_radius)
            .map_err(|e| Error::AlgorithmFailure {
                method: method.name(),
                reason: e.to_string(),
            })?;

        match method {
            InpaintMethod::FastMarching => Ok(filled),
            InpaintMethod::Fluid => {
                let mut field = Field::from_rgb(&filled);
                fluid::transport(&mut field, &unknown, radius);
                Ok(field.to_rgb())
            }
        }
    }
}

/// Floating-point working copy of an RGB image.
#[derive(Debug, Clone)]
struct Field {
    width: usize,
    height: usize,
    px: Vec<[f32; 3]>,
}

impl Field {
    fn from_rgb(image: &RgbImage) -> Self {
        Self {
            width: image.width() as usize,
            height: image.height() as usize,
            px: image
                .pixels()
                .map(|p| [f32::from(p[0]), f32::from(p[1]), f32::from(p[2])])
                .collect(),
        }
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn to_rgb(&self) -> RgbImage {
        let mut out = RgbImage::new(self.width as u32, self.height as u32);
        for (dst, src) in out.pixels_mut().zip(&self.px) {
            *dst = Rgb(src.map(|v| v.round().clamp(0.0, 255.0) as u8));
        }
        out
    }

    /// 4-connected neighbours of `idx` that lie inside the grid.
    fn neighbors4(&self, idx: usize) -> impl Iterator<Item = usize> {
        let (x, y) = (idx % self.width, idx / self.width);
        let w = self.width;
        [
            (x > 0).then(|| idx - 1),
            (x + 1 < w).then(|| idx + 1),
            (y > 0).then(|| idx - w),
            (y + 1 < self.height).then(|| idx + w),
        ]
        .into_iter()
        .flatten()
    }
}
