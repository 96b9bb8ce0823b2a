use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image error for {path:?}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// Only RGBA with 8 or 16 bits per channel is connected to the pixel paths.
    #[error("unsupported pixel depth ({0}): not connected yet")]
    UnsupportedDepth(String),

    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("field reconstruction backend failed: {0}")]
    Backend(String),

    #[error("interpolation failed: {0}")]
    Interpolation(String),

    #[error("invalid tag on frame {index}: {reason}")]
    InvalidTag { index: usize, reason: String },

    #[error("frame directory error: {0}")]
    Movie(String),

    #[error("project file error: {0}")]
    Project(#[from] serde_json::Error),

    #[error("render cancelled")]
    Cancelled,
}

impl Error {
    pub fn image(path: impl Into<PathBuf>, source: image::ImageError) -> Self {
        Error::Image {
            path: path.into(),
            source,
        }
    }

    pub fn mismatch<S: Into<String>>(msg: S) -> Self {
        Error::DimensionMismatch(msg.into())
    }

    pub fn backend<S: Into<String>>(msg: S) -> Self {
        Error::Backend(msg.into())
    }

    pub fn invalid_tag<S: Into<String>>(index: usize, reason: S) -> Self {
        Error::InvalidTag {
            index,
            reason: reason.into(),
        }
    }
}
