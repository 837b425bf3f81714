//! Single-round erase engine.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use image::codecs::jpeg::JpegEncoder;
use image::{ImageFormat, ImageReader, RgbImage};

use crate::blending::{self, BlendOptions};
use crate::error::{Error, Result};
use crate::inpaint::{BuiltinInpainter, Inpainter};
use crate::mask;
use crate::prompt::{self, PromptPoint};
use crate::saliency::{SaliencyService, SpectralResidual};
use crate::scale::ScaleOptions;
use crate::segmentation::{RegionGrowSegmenter, Segmenter};

/// Options controlling a single erase round.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EraseOptions {
    /// Saliency working-resolution policy.
    pub scale: ScaleOptions,
    /// Inpaint radii and blend weight.
    pub blend: BlendOptions,
}

impl EraseOptions {
    /// Reject options that would make every round fail.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for a zero scale divisor or a blend
    /// weight outside `[0, 1]`.
    pub fn validate(&self) -> Result<()> {
        if self.scale.divisor == 0 {
            return Err(Error::InvalidInput("scale divisor must be positive".into()));
        }
        self.blend.validate()
    }
}

/// What one round produced.
#[derive(Debug, Clone)]
pub struct RoundOutcome {
    /// The image with the salient object filled in.
    pub image: RgbImage,
    /// The saliency peak used as the segmentation prompt.
    pub prompt: PromptPoint,
    /// Number of masked pixels.
    pub mask_pixels: u64,
    /// Wall time of the round.
    pub elapsed: Duration,
}

/// The per-round pipeline: saliency prompt, mask, dual inpaint.
///
/// Built with the crate's own capabilities by default; any of them can be
/// replaced, e.g. a model-backed [`Segmenter`].
pub struct EraserEngine {
    saliency: Box<dyn SaliencyService>,
    segmenter: Box<dyn Segmenter>,
    inpainter: Box<dyn Inpainter>,
    opts: EraseOptions,
}

impl EraserEngine {
    /// Create an engine with the built-in saliency, segmentation and
    /// inpainting capabilities.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if `opts` fail validation.
    pub fn new(opts: EraseOptions) -> Result<Self> {
        opts.validate()?;
        Ok(Self {
            saliency: Box::new(SpectralResidual::default()),
            segmenter: Box::new(RegionGrowSegmenter::default()),
            inpainter: Box::new(BuiltinInpainter),
            opts,
        })
    }

    /// Replace the saliency capability.
    #[must_use]
    pub fn with_saliency<S: SaliencyService + 'static>(mut self, saliency: S) -> Self {
        self.saliency = Box::new(saliency);
        self
    }

    /// Replace the segmentation capability.
    #[must_use]
    pub fn with_segmenter<S: Segmenter + 'static>(mut self, segmenter: S) -> Self {
        self.segmenter = Box::new(segmenter);
        self
    }

    /// Replace the inpainting capability.
    #[must_use]
    pub fn with_inpainter<I: Inpainter + 'static>(mut self, inpainter: I) -> Self {
        self.inpainter = Box::new(inpainter);
        self
    }

    /// Run one round over `image`: select the saliency peak, segment the
    /// object under it and inpaint it away.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidInput`] for a zero-sized image; otherwise the
    /// [`Error::ServiceFailure`] or [`Error::AlgorithmFailure`] of the stage
    /// that failed.
    pub fn run_round(&mut self, image: &RgbImage) -> Result<RoundOutcome> {
        let started = Instant::now();
        let (w, h) = image.dimensions();
        if w == 0 || h == 0 {
            return Err(Error::InvalidInput(format!(
                "cannot erase from a {w}x{h} image"
            )));
        }

        let prompt = prompt::select_prompt(self.saliency.as_ref(), image, &self.opts.scale)?;
        log::debug!(
            "prompt ({}, {}) selected in {:?}",
            prompt.x,
            prompt.y,
            started.elapsed()
        );

        let mask_started = Instant::now();
        let mask = mask::acquire_mask(self.segmenter.as_mut(), image, prompt)?;
        let mask_pixels = mask.pixels().filter(|p| p[0] > 0).count() as u64;
        log::debug!(
            "mask of {mask_pixels} px acquired in {:?}",
            mask_started.elapsed()
        );

        let inpaint_started = Instant::now();
        let erased = blending::dual_inpaint(self.inpainter.as_ref(), image, &mask, &self.opts.blend)?;
        log::debug!("dual inpaint finished in {:?}", inpaint_started.elapsed());

        Ok(RoundOutcome {
            image: erased,
            prompt,
            mask_pixels,
            elapsed: started.elapsed(),
        })
    }
}

/// Formats the file helpers read and write.
pub const SUPPORTED_FORMATS: [ImageFormat; 4] = [
    ImageFormat::Jpeg,
    ImageFormat::Png,
    ImageFormat::WebP,
    ImageFormat::Bmp,
];

/// Image format implied by the extension of `path`.
///
/// # Errors
///
/// Returns [`Error::UnsupportedFormat`] for a missing or unknown extension
/// and for formats outside [`SUPPORTED_FORMATS`].
pub fn image_format(path: &Path) -> Result<ImageFormat> {
    ImageFormat::from_path(path)
        .ok()
        .filter(|f| SUPPORTED_FORMATS.contains(f))
        .ok_or_else(|| Error::UnsupportedFormat(path.display().to_string()))
}

/// Whether `path` names a file the helpers can load and save.
#[must_use]
pub fn is_supported_image(path: &Path) -> bool {
    image_format(path).is_ok()
}

/// Load an image file as 8-bit RGB, decoding by extension.
///
/// # Errors
///
/// Returns [`Error::UnsupportedFormat`] for unsupported extensions,
/// [`Error::Io`] if the file cannot be opened and [`Error::Image`] if
/// decoding fails.
pub fn load_image(path: &Path) -> Result<RgbImage> {
    let format = image_format(path)?;
    let mut reader = ImageReader::open(path)?;
    reader.set_format(format);
    Ok(reader.decode()?.to_rgb8())
}

/// Save an RGB image in the format named by its extension. JPEG is written
/// at quality 100 so repeated rounds do not compound compression loss.
///
/// # Errors
///
/// Returns [`Error::UnsupportedFormat`] for unsupported extensions and
/// [`Error::Io`] or [`Error::Image`] if writing fails.
pub fn save_image(img: &RgbImage, path: &Path) -> Result<()> {
    match image_format(path)? {
        ImageFormat::Jpeg => {
            let mut file = BufWriter::new(File::create(path)?);
            JpegEncoder::new_with_quality(&mut file, 100).encode_image(img)?;
            file.flush()?;
        }
        format => img.save_with_format(path, format)?,
    }
    Ok(())
}

/// Require `output` to be written in the same format `input` was read in.
///
/// `photo.jpg` and `photo.jpeg` agree; `photo.png` and `photo.jpg` do not.
///
/// # Errors
///
/// Returns [`Error::UnsupportedFormat`] if either path has an unsupported
/// extension and [`Error::InvalidInput`] if the formats differ.
pub fn check_output_format(input: &Path, output: &Path) -> Result<()> {
    let (from, to) = (image_format(input)?, image_format(output)?);
    if from != to {
        return Err(Error::InvalidInput(format!(
            "{} would be saved as {to:?}, but {} is {from:?}",
            output.display(),
            input.display()
        )));
    }
    Ok(())
}

/// Output path next to `input` with `_erased` added to the file stem:
/// `shots/photo.jpg` becomes `shots/photo_erased.jpg`.
#[must_use]
pub fn default_output_path(input: &Path) -> PathBuf {
    let mut name = input.file_stem().unwrap_or_default().to_os_string();
    name.push("_erased");
    if let Some(ext) = input.extension() {
        name.push(".");
        name.push(ext);
    }
    input.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn solid_image_round_keeps_dimensions() {
        let mut engine = EraserEngine::new(EraseOptions::default()).unwrap();
        let img = RgbImage::from_pixel(256, 256, Rgb([90, 120, 30]));
        let outcome = engine.run_round(&img).unwrap();
        assert_eq!(outcome.image.dimensions(), (256, 256));
        assert_eq!(outcome.image, img);
    }

    /// Saliency peaking at one working-grid cell.
    struct PeakAt(u32, u32);

    impl SaliencyService for PeakAt {
        fn compute(
            &self,
            _gray: &image::GrayImage,
            size: crate::scale::WorkingSize,
        ) -> Result<crate::saliency::SaliencyMap> {
            let mut map = crate::saliency::SaliencyMap::new(size.width, size.height);
            map.put_pixel(self.0, self.1, image::Luma([1.0]));
            Ok(map)
        }
    }

    #[test]
    fn bright_square_is_erased() {
        // 128x128 works on a 64x64 grid; cell (39, 19) is the square's centre
        let mut engine = EraserEngine::new(EraseOptions::default())
            .unwrap()
            .with_saliency(PeakAt(39, 19));
        let img = RgbImage::from_fn(128, 128, |x, y| {
            if (70..86).contains(&x) && (30..46).contains(&y) {
                Rgb([250, 250, 250])
            } else {
                Rgb([20, 40, 60])
            }
        });
        let outcome = engine.run_round(&img).unwrap();
        assert!((76..80).contains(&outcome.prompt.x));
        assert!((36..40).contains(&outcome.prompt.y));
        // 16x16 square dilated by 2 px
        assert_eq!(outcome.mask_pixels, 20 * 20);
        // the fill comes from the dark surroundings
        let centre = outcome.image.get_pixel(78, 38);
        assert!(centre[0] < 128, "centre still bright: {centre:?}");
    }

    #[test]
    fn default_capabilities_find_and_erase_the_square() {
        let mut engine = EraserEngine::new(EraseOptions::default()).unwrap();
        let img = RgbImage::from_fn(128, 128, |x, y| {
            if (20..36).contains(&x) && (80..96).contains(&y) {
                Rgb([230, 230, 230])
            } else {
                Rgb([30, 30, 30])
            }
        });
        let outcome = engine.run_round(&img).unwrap();
        let p = outcome.prompt;
        assert!(
            (20..36).contains(&p.x) && (80..96).contains(&p.y),
            "prompt ({}, {}) missed the square",
            p.x,
            p.y
        );
        assert_eq!(outcome.mask_pixels, 20 * 20);
        let centre = outcome.image.get_pixel(28, 88);
        assert!(centre[0] < 128, "centre still bright: {centre:?}");
        assert_eq!(outcome.image.get_pixel(100, 20), img.get_pixel(100, 20));
    }

    #[test]
    fn invalid_options_are_rejected() {
        let opts = EraseOptions {
            blend: BlendOptions {
                weight: -0.1,
                ..BlendOptions::default()
            },
            ..EraseOptions::default()
        };
        assert!(matches!(EraserEngine::new(opts), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn output_sits_next_to_input_with_erased_stem() {
        assert_eq!(
            default_output_path(Path::new("shots/beach.webp")),
            PathBuf::from("shots/beach_erased.webp")
        );
        assert_eq!(
            default_output_path(Path::new("scan")),
            PathBuf::from("scan_erased")
        );
    }

    #[test]
    fn formats_follow_the_extension() {
        assert_eq!(image_format(Path::new("a.JPEG")).unwrap(), ImageFormat::Jpeg);
        assert_eq!(image_format(Path::new("a.bmp")).unwrap(), ImageFormat::Bmp);
        for name in ["a.gif", "a.tiff", "notes.txt", "no_extension"] {
            assert!(!is_supported_image(Path::new(name)), "{name}");
        }
    }

    #[test]
    fn output_must_keep_the_input_format() {
        assert!(check_output_format(Path::new("in.jpg"), Path::new("out.jpeg")).is_ok());
        assert!(check_output_format(Path::new("in.png"), Path::new("out/in_erased.png")).is_ok());
        assert!(matches!(
            check_output_format(Path::new("in.png"), Path::new("out.jpg")),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            check_output_format(Path::new("in.png"), Path::new("out.gif")),
            Err(Error::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn load_image_rejects_unsupported_extension() {
        assert!(matches!(
            load_image(Path::new("notes.txt")),
            Err(Error::UnsupportedFormat(_))
        ));
    }
}
