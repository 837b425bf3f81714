//! Frequency-domain saliency.
//!
//! [`SaliencyService`] is the contract the prompt selector consumes.
//! [`SpectralResidual`] is the built-in implementation (Hou & Zhang, 2007):
//! the log-amplitude spectrum minus its local mean is the "residual" that
//! carries the unexpected, and therefore conspicuous, structure of the image.

use std::f64::consts::PI;

use image::imageops::{self, FilterType};
use image::{GrayImage, ImageBuffer, Luma};

use crate::error::{Error, Result};
use crate::scale::WorkingSize;

/// Per-cell saliency scores on the working grid.
pub type SaliencyMap = ImageBuffer<Luma<f32>, Vec<f32>>;

/// A capability producing a saliency map at a requested working size.
///
/// Implementations must be deterministic for a fixed input.
pub trait SaliencyService: Send {
    /// Compute the saliency of `gray`, sampled onto a `size` grid.
    ///
    /// # Errors
    ///
    /// Implementations report failures as [`Error::ServiceFailure`].
    fn compute(&self, gray: &GrayImage, size: WorkingSize) -> Result<SaliencyMap>;
}

/// Spectral residual saliency.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpectralResidual {
    /// Gaussian sigma applied to the raw saliency, expressed for a 64-cell grid
    /// and scaled with the grid size. The raw map peaks on object edges; a wide
    /// blur moves the maximum into the object.
    pub blur_sigma: f32,
}

/// Default blur sigma on a 64-cell grid (Hou & Zhang use 8).
pub const BLUR_SIGMA: f32 = 8.0;

/// Amplitudes below this fraction of the spectrum maximum are floored before
/// taking the log.
const AMPLITUDE_FLOOR: f64 = 1.0e-3;

impl Default for SpectralResidual {
    fn default() -> Self {
        Self {
            blur_sigma: BLUR_SIGMA,
        }
    }
}

impl SaliencyService for SpectralResidual {
    fn compute(&self, gray: &GrayImage, size: WorkingSize) -> Result<SaliencyMap> {
        if gray.width() == 0 || gray.height() == 0 {
            return Err(Error::InvalidInput("cannot compute saliency of an empty image".into()));
        }
        if size.width == 0 || size.height == 0 {
            return Err(Error::InvalidInput(format!(
                "working size must be positive, got {}x{}",
                size.width, size.height
            )));
        }

        // radix-2 transform needs power-of-two sides
        let fw = size.width.next_power_of_two();
        let fh = size.height.next_power_of_two();
        let small = imageops::resize(gray, fw, fh, FilterType::Triangle);

        let (w, h) = (fw as usize, fh as usize);
        #[allow(clippy::cast_precision_loss)]
        let mean = small.pixels().map(|p| f64::from(p[0])).sum::<f64>() / (w * h) as f64;
        let mut spectrum: Vec<Complex> = small
            .pixels()
            .map(|p| Complex::new((f64::from(p[0]) - mean) / 255.0, 0.0))
            .collect();
        fft_2d(&mut spectrum, w, h, false);

        // exact zeros would drag the local mean of the log spectrum to -inf
        let max_amp = spectrum.iter().map(|c| c.norm()).fold(0.0_f64, f64::max);
        let floor = (max_amp * AMPLITUDE_FLOOR).max(f64::MIN_POSITIVE);
        let log_amp: Vec<f64> = spectrum.iter().map(|c| (c.norm() + floor).ln()).collect();
        let mean_amp = box_mean_wrapped(&log_amp, w, h);

        for ((c, &a), &m) in spectrum.iter_mut().zip(&log_amp).zip(&mean_amp) {
            let norm = c.norm();
            *c = if norm > 0.0 {
                c.scale((a - m).exp() / norm)
            } else {
                Complex::new(0.0, 0.0)
            };
        }
        // the DC term only adds a spike at the origin
        spectrum[0] = Complex::new(0.0, 0.0);
        fft_2d(&mut spectrum, w, h, true);

        let energy: Vec<f64> = spectrum.iter().map(|c| c.norm_sqr()).collect();
        let peak = energy.iter().copied().fold(0.0_f64, f64::max);
        #[allow(clippy::cast_possible_truncation)]
        let raw: Vec<f32> = energy
            .iter()
            .map(|&e| if peak > 0.0 { (e / peak) as f32 } else { 0.0 })
            .collect();
        let raw = SaliencyMap::from_raw(fw, fh, raw)
            .ok_or_else(|| Error::saliency("spectrum buffer has the wrong length"))?;

        #[allow(clippy::cast_precision_loss)]
        let sigma = self.blur_sigma * (fw.max(fh) as f32 / 64.0);
        let smoothed = imageops::blur(&raw, sigma);
        let mut map = imageops::resize(&smoothed, size.width, size.height, FilterType::Triangle);
        normalize(&mut map);
        Ok(map)
    }
}

/// Min-max normalize a map to `[0, 1]`; a constant map becomes all zeros.
pub fn normalize(map: &mut SaliencyMap) {
    let (lo, hi) = map
        .pixels()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), p| {
            (lo.min(p[0]), hi.max(p[0]))
        });
    let range = hi - lo;
    for p in map.pixels_mut() {
        p[0] = if range > f32::EPSILON {
            (p[0] - lo) / range
        } else {
            0.0
        };
    }
}

/// 3x3 mean with wrap-around borders (the spectrum is periodic).
fn box_mean_wrapped(data: &[f64], width: usize, height: usize) -> Vec<f64> {
    let mut out = vec![0.0; data.len()];
    for y in 0..height {
        for x in 0..width {
            let mut sum = 0.0;
            for dy in [height - 1, 0, 1] {
                for dx in [width - 1, 0, 1] {
                    let yy = (y + dy) % height;
                    let xx = (x + dx) % width;
                    sum += data[yy * width + xx];
                }
            }
            out[y * width + x] = sum / 9.0;
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Complex {
    re: f64,
    im: f64,
}

impl Complex {
    const fn new(re: f64, im: f64) -> Self {
        Self { re, im }
    }

    fn norm_sqr(self) -> f64 {
        self.re * self.re + self.im * self.im
    }

    fn norm(self) -> f64 {
        self.norm_sqr().sqrt()
    }

    fn scale(self, k: f64) -> Self {
        Self::new(self.re * k, self.im * k)
    }
}

impl std::ops::Add for Complex {
    type Output = Self;

    fn add(self, o: Self) -> Self {
        Self::new(self.re + o.re, self.im + o.im)
    }
}

impl std::ops::Sub for Complex {
    type Output = Self;

    fn sub(self, o: Self) -> Self {
        Self::new(self.re - o.re, self.im - o.im)
    }
}

impl std::ops::Mul for Complex {
    type Output = Self;

    fn mul(self, o: Self) -> Self {
        Self::new(
            self.re * o.re - self.im * o.im,
            self.re * o.im + self.im * o.re,
        )
    }
}

impl std::ops::MulAssign for Complex {
    fn mul_assign(&mut self, o: Self) {
        *self = *self * o;
    }
}

/// In-place iterative radix-2 FFT. `buf.len()` must be a power of two.
/// The inverse transform is scaled by `1/n`.
fn fft(buf: &mut [Complex], inverse: bool) {
    let n = buf.len();
    if n <= 1 {
        return;
    }
    debug_assert!(n.is_power_of_two());

    let mut j = 0;
    for i in 1..n {
        let mut bit = n >> 1;
        while j & bit != 0 {
            j ^= bit;
            bit >>= 1;
        }
        j |= bit;
        if i < j {
            buf.swap(i, j);
        }
    }

    let sign = if inverse { 1.0 } else { -1.0 };
    let mut len = 2;
    while len <= n {
        #[allow(clippy::cast_precision_loss)]
        let angle = sign * 2.0 * PI / len as f64;
        let step = Complex::new(angle.cos(), angle.sin());
        for start in (0..n).step_by(len) {
            let mut w = Complex::new(1.0, 0.0);
            for k in 0..len / 2 {
                let even = buf[start + k];
                let odd = buf[start + k + len / 2] * w;
                buf[start + k] = even + odd;
                buf[start + k + len / 2] = even - odd;
                w *= step;
            }
        }
        len <<= 1;
    }

    if inverse {
        #[allow(clippy::cast_precision_loss)]
        let inv = 1.0 / n as f64;
        for c in buf.iter_mut() {
            *c = c.scale(inv);
        }
    }
}

/// Row-major 2-D FFT: rows first, then columns.
fn fft_2d(data: &mut [Complex], width: usize, height: usize, inverse: bool) {
    for row in data.chunks_exact_mut(width) {
        fft(row, inverse);
    }
    let mut column = vec![Complex::new(0.0, 0.0); height];
    for x in 0..width {
        for (y, c) in column.iter_mut().enumerate() {
            *c = data[y * width + x];
        }
        fft(&mut column, inverse);
        for (y, c) in column.iter().enumerate() {
            data[y * width + x] = *c;
        }
    }
}
