use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The query image has no usable face. A normal outcome for a selfie
    /// that cannot be matched, surfaced so the caller can say so.
    #[error("no face detected")]
    NoFaceDetected,

    #[error("embedding has {actual} dimensions, index expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Persisted index artifacts are missing, unreadable or disagree with
    /// each other. The namespace must be repaired or rebuilt.
    #[error("corrupt index state: {0}")]
    CorruptIndexState(String),

    #[error("failed to load face models: {0}")]
    ModelLoadFailure(String),

    /// Inference crashed on an image that was otherwise valid.
    #[error("embedding extraction failed: {0}")]
    ExtractionFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Encode(#[from] postcard::Error),
}

impl Error {
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::CorruptIndexState(msg.into())
    }

    pub fn is_corrupt(&self) -> bool {
        matches!(self, Self::CorruptIndexState(_))
    }

    pub fn is_dimension_mismatch(&self) -> bool {
        matches!(self, Self::DimensionMismatch { .. })
    }
}
