use crate::models::ModelState;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Json Error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid Configuration: {0}")]
    Config(String),

    #[error("Initialization Failed: {0}")]
    Init(String),

    #[error("Inference Error: {0}")]
    Inference(String),
}

/// Failures while acquiring an image from the camera or the gallery.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("Camera permission denied")]
    PermissionDenied,

    #[error("Camera capture failed: {0}")]
    CaptureFailed(String),

    #[error("Gallery selection cancelled")]
    SelectionCancelled,

    #[error("Failed to read selected image: {0}")]
    ReadFailed(String),
}

impl SourceError {
    /// Text shown to the user, `None` when nothing should be shown.
    pub fn user_message(&self) -> Option<&'static str> {
        match self {
            Self::PermissionDenied => Some("Please allow camera access to use this feature."),
            Self::CaptureFailed(_) => Some("Failed to take picture"),
            Self::SelectionCancelled => None,
            Self::ReadFailed(_) => Some("Failed to select image from gallery"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModelError {
    #[error("Model not ready (state: {0})")]
    NotReady(ModelState),

    #[error("Inference failed: {0}")]
    InferenceFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PreprocessError {
    #[error("Image buffer is empty")]
    EmptyImage,

    #[error("Target shape has a zero dimension: {width}x{height}x{channels}")]
    ZeroDimension { width: u32, height: u32, channels: u32 },

    #[error("Unsupported channel count: {0}")]
    UnsupportedChannels(u32),

    #[error("Pixel buffer holds {actual} bytes, expected a multiple of {pixels} pixels")]
    PixelBufferMismatch { pixels: usize, actual: usize },

    #[error("Failed to decode image: {0}")]
    Decode(String),
}

/// The single error a failed classification request resolves to.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClassifyError {
    #[error("Model not ready (state: {0})")]
    ModelNotReady(ModelState),

    #[error("Preprocessing failed: {0}")]
    PreprocessFailed(#[from] PreprocessError),

    #[error("Inference failed: {0}")]
    InferenceFailed(String),
}

impl From<ModelError> for ClassifyError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::NotReady(state) => Self::ModelNotReady(state),
            ModelError::InferenceFailed(reason) => Self::InferenceFailed(reason),
        }
    }
}

impl ClassifyError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::ModelNotReady(ModelState::Failed(_)) => {
                "The classification model could not be loaded."
            }
            Self::ModelNotReady(_) => "Model not loaded. Please wait for the model to load.",
            Self::PreprocessFailed(_) => "Could not read the photo for classification.",
            Self::InferenceFailed(_) => "Failed to classify image",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ServiceError {
    #[error("A classification request is already in flight")]
    Busy,

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("Classification worker has stopped")]
    Stopped,
}

impl ServiceError {
    pub fn user_message(&self) -> Option<&'static str> {
        match self {
            Self::Busy => None,
            Self::Source(err) => err.user_message(),
            Self::Stopped => Some("Failed to classify image"),
        }
    }
}
