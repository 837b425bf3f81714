//! Dual inpaint and blend.
//!
//! The masked region is filled twice, once by fast marching (small radius,
//! good on thin structures) and once by the fluid method (larger radius,
//! better on textured regions), and the two results are averaged:
//! `result = weight * fast + (1 - weight) * fluid`.

use image::{GrayImage, RgbImage};

use crate::error::{Error, Result};
use crate::inpaint::{InpaintMethod, Inpainter};

/// Neighbourhood radius of the fast marching pass.
pub const FAST_RADIUS: u32 = 3;

/// Neighbourhood radius of the fluid pass.
pub const FLUID_RADIUS: u32 = 7;

/// Weight of the fast marching pass in the blend.
pub const BLEND_WEIGHT: f32 = 0.5;

/// Options for [`dual_inpaint`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlendOptions {
    /// Radius for the fast marching pass.
    pub fast_radius: u32,
    /// Radius for the fluid pass.
    pub fluid_radius: u32,
    /// Weight of the fast marching result, in `[0, 1]`.
    pub weight: f32,
}

impl Default for BlendOptions {
    fn default() -> Self {
        Self {
            fast_radius: FAST_RADIUS,
            fluid_radius: FLUID_RADIUS,
            weight: BLEND_WEIGHT,
        }
    }
}

impl BlendOptions {
    /// Check that the weight is a usable blend factor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if `weight` is outside `[0, 1]`.
    pub fn validate(&self) -> Result<()> {
        if (0.0..=1.0).contains(&self.weight) {
            Ok(())
        } else {
            Err(Error::InvalidInput(format!(
                "blend weight must be within [0, 1], got {}",
                self.weight
            )))
        }
    }
}

/// Inpaint `image` under `mask` with both algorithms and blend the results.
///
/// With the `cli` feature the two passes run in parallel.
///
/// # Errors
///
/// - [`Error::InvalidInput`] for a weight outside `[0, 1]`.
/// - [`Error::AlgorithmFailure`] if the mask does not match the image, if
///   either pass fails, or if a pass returns an image of the wrong size.
pub fn dual_inpaint(
    inpainter: &dyn Inpainter,
    image: &RgbImage,
    mask: &GrayImage,
    opts: &BlendOptions,
) -> Result<RgbImage> {
    opts.validate()?;
    if mask.dimensions() != image.dimensions() {
        return Err(Error::AlgorithmFailure {
            method: "dual",
            reason: format!(
                "mask is {}x{}, image is {}x{}",
                mask.width(),
                mask.height(),
                image.width(),
                image.height()
            ),
        });
    }

    let fast = || inpainter.inpaint(image, mask, opts.fast_radius, InpaintMethod::FastMarching);
    let fluid = || inpainter.inpaint(image, mask, opts.fluid_radius, InpaintMethod::Fluid);

    #[cfg(feature = "cli")]
    let (fast, fluid) = rayon::join(fast, fluid);
    #[cfg(not(feature = "cli"))]
    let (fast, fluid) = (fast(), fluid());

    let fast = checked(fast?, image, InpaintMethod::FastMarching)?;
    let fluid = checked(fluid?, image, InpaintMethod::Fluid)?;
    blend(&fast, &fluid, opts.weight)
}

fn checked(out: RgbImage, image: &RgbImage, method: InpaintMethod) -> Result<RgbImage> {
    if out.dimensions() == image.dimensions() {
        Ok(out)
    } else {
        Err(Error::AlgorithmFailure {
            method: method.name(),
            reason: format!(
                "returned {}x{} for a {}x{} image",
                out.width(),
                out.height(),
                image.width(),
                image.height()
            ),
        })
    }
}

/// Per-subpixel `weight * a + (1 - weight) * b`, rounded half to even and
/// saturated to `u8`.
///
/// # Errors
///
/// Returns [`Error::AlgorithmFailure`] if `a` and `b` differ in size.
pub fn blend(a: &RgbImage, b: &RgbImage, weight: f32) -> Result<RgbImage> {
    if a.dimensions() != b.dimensions() {
        return Err(Error::AlgorithmFailure {
            method: "blend",
            reason: format!(
                "cannot blend {}x{} with {}x{}",
                a.width(),
                a.height(),
                b.width(),
                b.height()
            ),
        });
    }
    let inv = 1.0 - weight;
    let data: Vec<u8> = a
        .as_raw()
        .iter()
        .zip(b.as_raw())
        .map(|(&x, &y)| {
            let v = f32::from(x) * weight + f32::from(y) * inv;
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            {
                v.round_ties_even().clamp(0.0, 255.0) as u8
            }
        })
        .collect();
    RgbImage::from_raw(a.width(), a.height(), data).ok_or_else(|| Error::AlgorithmFailure {
        method: "blend",
        reason: "blended buffer has the wrong length".into(),
    })
}
