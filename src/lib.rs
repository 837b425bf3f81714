//! Erase the most salient object of an image, one round at a time.
//!
//! Each round finds the saliency peak at a reduced working resolution, asks a
//! point-prompted segmenter for the object under it, fills that object in
//! with two inpainting methods and averages the results. The output of one
//! round is the input of the next, so repeated rounds peel objects off the
//! image in order of visual prominence.
//!
//! # Quick Start
//!
//! ```no_run
//! use salient_eraser::{load_image, save_image, EraseOptions, EraserEngine};
//! use std::path::Path;
//!
//! let mut engine = EraserEngine::new(EraseOptions::default()).expect("valid options");
//! let img = load_image(Path::new("photo.jpg")).unwrap();
//! let outcome = engine.run_round(&img).unwrap();
//! println!("erased {} px around ({}, {})", outcome.mask_pixels, outcome.prompt.x, outcome.prompt.y);
//! save_image(&outcome.image, Path::new("photo_erased.jpg")).unwrap();
//! ```
//!
//! # Running rounds in the background
//!
//! [`Controller`] repeats rounds on a worker thread until stopped and
//! publishes every result as a [`PipelineEvent`].
//!
//! ```no_run
//! use salient_eraser::{Controller, ControllerOptions, EraseOptions, EraserEngine, PipelineEvent};
//!
//! let engine = EraserEngine::new(EraseOptions::default()).expect("valid options");
//! let controller = Controller::new(engine, ControllerOptions::default());
//! let events = controller.subscribe();
//! controller.load(image::open("photo.jpg").unwrap().to_rgb8()).unwrap();
//! controller.start().unwrap();
//! for event in events.iter() {
//!     if let PipelineEvent::RoundCompleted { iteration: 3, .. } = event {
//!         controller.stop();
//!         break;
//!     }
//! }
//! ```
//!
//! # Capabilities
//!
//! Saliency, segmentation and inpainting sit behind the [`SaliencyService`],
//! [`Segmenter`] and [`Inpainter`] traits. The built-in implementations are a
//! spectral residual saliency detector, a colour region-grow segmenter and
//! fast marching / fluid inpainting; any of them can be swapped for a
//! model-backed one with [`EraserEngine::with_segmenter`] and friends.

#![deny(missing_docs)]

pub mod blending;
pub mod controller;
mod engine;
pub mod error;
pub mod inpaint;
pub mod mask;
pub mod prompt;
pub mod saliency;
pub mod scale;
pub mod segmentation;

pub use blending::BlendOptions;
pub use controller::{Controller, ControllerOptions, PipelineEvent, PipelineSnapshot, RunState};
pub use engine::{
    check_output_format, default_output_path, image_format, is_supported_image, load_image,
    save_image, EraseOptions, EraserEngine, RoundOutcome, SUPPORTED_FORMATS,
};
pub use error::{Error, Result};
pub use crate::inpaint::{BuiltinInpainter, InpaintMethod, Inpainter};
pub use prompt::{PointLabel, PromptPoint};
pub use saliency::{SaliencyMap, SaliencyService, SpectralResidual};
pub use scale::{ScaleOptions, WorkingSize};
pub use segmentation::{Prediction, RawMask, RegionGrowOptions, RegionGrowSegmenter, Segmenter};
