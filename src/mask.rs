//! Mask acquisition: prompt the segmenter and normalize what it returns.

use image::{GrayImage, RgbImage};

use crate::error::{Error, Result};
use crate::prompt::PromptPoint;
use crate::segmentation::{RawMask, Segmenter};

/// Mask value for foreground pixels.
pub const FOREGROUND: u8 = 255;

/// Bind `segmenter` to `image` and request a single mask for `prompt`.
///
/// The returned mask has exactly the image's dimensions, foreground 255 and
/// background 0.
///
/// # Errors
///
/// Returns [`Error::ServiceFailure`] if the segmenter fails, returns anything
/// other than one candidate, or returns a mask whose shape does not match the
/// image. Mismatched masks are never resized.
pub fn acquire_mask(
    segmenter: &mut dyn Segmenter,
    image: &RgbImage,
    prompt: PromptPoint,
) -> Result<GrayImage> {
    segmenter.bind(image)?;
    let prediction = segmenter.predict(&[prompt], false)?;
    let [raw] = prediction.masks.as_slice() else {
        return Err(Error::segmentation(format!(
            "expected exactly one mask candidate, got {}",
            prediction.masks.len()
        )));
    };
    if let Some(score) = prediction.scores.first() {
        log::debug!("mask score {score:.3} at ({}, {})", prompt.x, prompt.y);
    }

    let mask = normalize_mask(raw, image.width(), image.height())?;
    if mask.pixels().all(|p| p[0] == 0) {
        log::warn!(
            "segmenter returned an empty mask at ({}, {})",
            prompt.x,
            prompt.y
        );
    }
    Ok(mask)
}

/// Convert a raw mask tensor into a `width` x `height` binary mask.
///
/// Singleton axes around the two spatial axes (`[1, H, W]`, `[H, W, 1]`) are
/// squeezed; whatever remains must be exactly `[height, width]`.
///
/// # Errors
///
/// Returns [`Error::ServiceFailure`] on any shape or length mismatch.
pub fn normalize_mask(raw: &RawMask, width: u32, height: u32) -> Result<GrayImage> {
    let mut dims = raw.shape.as_slice();
    while dims.len() > 2 && dims[0] == 1 {
        dims = &dims[1..];
    }
    while dims.len() > 2 && dims[dims.len() - 1] == 1 {
        dims = &dims[..dims.len() - 1];
    }
    let expected = [height as usize, width as usize];
    if dims != expected.as_slice() {
        return Err(Error::segmentation(format!(
            "mask shape {:?} does not match {width}x{height} image",
            raw.shape
        )));
    }
    if raw.data.len() != expected[0] * expected[1] {
        return Err(Error::segmentation(format!(
            "mask has {} values, expected {}",
            raw.data.len(),
            expected[0] * expected[1]
        )));
    }

    let pixels = raw
        .data
        .iter()
        .map(|&v| if v > 0.0 { FOREGROUND } else { 0 })
        .collect();
    GrayImage::from_raw(width, height, pixels)
        .ok_or_else(|| Error::segmentation("mask buffer has the wrong length"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segmentation::Prediction;

    /// Returns a fixed prediction and records what it was bound to.
    struct Canned {
        prediction: Prediction,
        bound: Option<(u32, u32)>,
    }

    impl Segmenter for Canned {
        fn bind(&mut self, image: &RgbImage) -> Result<()> {
            self.bound = Some(image.dimensions());
            Ok(())
        }

        fn predict(&self, points: &[PromptPoint], multimask: bool) -> Result<Prediction> {
            assert_eq!(points.len(), 1);
            assert!(!multimask);
            Ok(self.prediction.clone())
        }
    }

    fn canned(masks: Vec<RawMask>) -> Canned {
        Canned {
            prediction: Prediction {
                scores: vec![0.9; masks.len()],
                masks,
                low_res_logits: None,
            },
            bound: None,
        }
    }

    #[test]
    fn squeezes_leading_axis_and_binarizes() {
        let raw = RawMask {
            shape: vec![1, 2, 3],
            data: vec![0.0, 1.0, -2.0, 0.5, 0.0, 3.0],
        };
        let mask = normalize_mask(&raw, 3, 2).unwrap();
        assert_eq!(mask.into_raw(), vec![0, 255, 0, 255, 0, 255]);
    }

    #[test]
    fn squeezes_trailing_axis() {
        let raw = RawMask {
            shape: vec![2, 2, 1],
            data: vec![1.0, 0.0, 0.0, 1.0],
        };
        assert!(normalize_mask(&raw, 2, 2).is_ok());
    }

    #[test]
    fn wrong_dimensions_are_fatal() {
        let raw = RawMask {
            shape: vec![1, 4, 4],
            data: vec![1.0; 16],
        };
        let err = normalize_mask(&raw, 8, 2).unwrap_err();
        assert!(matches!(
            err,
            Error::ServiceFailure {
                service: "segmentation",
                ..
            }
        ));
    }

    #[test]
    fn length_mismatch_is_fatal() {
        let raw = RawMask {
            shape: vec![2, 2],
            data: vec![1.0; 3],
        };
        assert!(normalize_mask(&raw, 2, 2).is_err());
    }

    #[test]
    fn acquire_binds_current_image_first() {
        let image = RgbImage::new(3, 2);
        let mut seg = canned(vec![RawMask {
            shape: vec![1, 2, 3],
            data: vec![1.0; 6],
        }]);
        let mask = acquire_mask(&mut seg, &image, PromptPoint::foreground(1, 1)).unwrap();
        assert_eq!(seg.bound, Some((3, 2)));
        assert_eq!(mask.dimensions(), (3, 2));
    }

    #[test]
    fn more_than_one_candidate_is_rejected() {
        let image = RgbImage::new(2, 2);
        let one = RawMask {
            shape: vec![2, 2],
            data: vec![1.0; 4],
        };
        let mut seg = canned(vec![one.clone(), one]);
        let err = acquire_mask(&mut seg, &image, PromptPoint::foreground(0, 0)).unwrap_err();
        assert!(err.to_string().contains("exactly one"));
    }
}
