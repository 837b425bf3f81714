//! Saliency working-resolution policy.
//!
//! The saliency pass runs on a reduced grid whose size tracks the geometric
//! mean of the image dimensions: `max(min_size, floor(sqrt(W * H)) / divisor)`.

use crate::error::{Error, Result};

/// Smallest working size the saliency pass is allowed to run at.
pub const MIN_SR_SIZE: u32 = 64;

/// Divisor applied to the geometric mean of the image dimensions.
pub const SR_DIVISOR: u32 = 4;

/// Tunables for [`ScaleOptions::sr_size`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScaleOptions {
    /// Lower bound for the working size.
    pub min_size: u32,
    /// Divisor applied to the geometric mean.
    pub divisor: u32,
}

impl Default for ScaleOptions {
    fn default() -> Self {
        Self {
            min_size: MIN_SR_SIZE,
            divisor: SR_DIVISOR,
        }
    }
}

impl ScaleOptions {
    /// Working size for an image of `width` x `height`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if either dimension or the divisor is zero.
    pub fn sr_size(&self, width: u32, height: u32) -> Result<u32> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidInput(format!(
                "image dimensions must be positive, got {width}x{height}"
            )));
        }
        if self.divisor == 0 {
            return Err(Error::InvalidInput("scale divisor must be positive".into()));
        }
        let geometric_mean = (u64::from(width) * u64::from(height)).isqrt();
        // sqrt(u32::MAX^2) fits in u32
        #[allow(clippy::cast_possible_truncation)]
        let scaled = (geometric_mean / u64::from(self.divisor)) as u32;
        Ok(scaled.max(self.min_size))
    }

    /// Working grid for an image of `width` x `height`.
    ///
    /// # Errors
    ///
    /// Same as [`ScaleOptions::sr_size`].
    pub fn working_size(&self, width: u32, height: u32) -> Result<WorkingSize> {
        let sr = self.sr_size(width, height)?;
        Ok(WorkingSize::fit(sr, width, height))
    }
}

/// Working size using the default policy (`min 64`, `divisor 4`).
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] if either dimension is zero.
pub fn sr_size(width: u32, height: u32) -> Result<u32> {
    ScaleOptions::default().sr_size(width, height)
}

/// Dimensions of the saliency working grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkingSize {
    /// Grid width in cells.
    pub width: u32,
    /// Grid height in cells.
    pub height: u32,
}

impl WorkingSize {
    /// Grid with `sr` cells along the longer image side and the
    /// aspect-preserving count (at least one) along the shorter side.
    #[must_use]
    pub fn fit(sr: u32, width: u32, height: u32) -> Self {
        let long = width.max(height).max(1);
        let short = width.min(height);
        let scaled = (u64::from(sr) * u64::from(short) + u64::from(long) / 2) / u64::from(long);
        #[allow(clippy::cast_possible_truncation)]
        let scaled = (scaled as u32).max(1);
        if width >= height {
            Self {
                width: sr,
                height: scaled,
            }
        } else {
            Self {
                width: scaled,
                height: sr,
            }
        }
    }
}
