//! Error types for the salient-eraser crate.

/// Errors that can occur while erasing salient objects.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A caller supplied an argument or made a request the pipeline cannot honour
    /// (zero-sized image, `start()` with no image loaded, bad blend weight).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The saliency or segmentation capability returned malformed output.
    #[error("{service} service failure: {reason}")]
    ServiceFailure {
        /// Which capability failed (`"saliency"` or `"segmentation"`).
        service: &'static str,
        /// What was wrong with its output.
        reason: String,
    },

    /// An inpainting pass failed or produced output of the wrong shape.
    #[error("{method} inpainting failed: {reason}")]
    AlgorithmFailure {
        /// Name of the inpainting algorithm.
        method: &'static str,
        /// Failure description.
        reason: String,
    },

    /// An I/O error occurred while reading or writing files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The image format is not supported.
    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),

    /// An error occurred while decoding or encoding an image file.
    #[error("image processing error: {0}")]
    Image(#[from] image::ImageError),
}

impl Error {
    pub(crate) fn saliency(reason: impl Into<String>) -> Self {
        Self::ServiceFailure {
            service: "saliency",
            reason: reason.into(),
        }
    }

    pub(crate) fn segmentation(reason: impl Into<String>) -> Self {
        Self::ServiceFailure {
            service: "segmentation",
            reason: reason.into(),
        }
    }

    /// Whether this error aborts a round (as opposed to being rejected up front).
    #[must_use]
    pub fn is_round_failure(&self) -> bool {
        matches!(
            self,
            Self::ServiceFailure { .. } | Self::AlgorithmFailure { .. }
        )
    }
}

/// A specialized `Result` type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
