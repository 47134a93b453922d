use std::fmt;

use anyhow::{Context, Result};
use image::{DynamicImage, ImageFormat};

use crate::face::FaceEmbedding;

/// Why an extraction produced no embeddings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmptyReason {
    /// Undecodable or zero-area input.
    InvalidImage,
    /// The detector ran and found nothing usable.
    NoFaceDetected,
    /// Inference failed; the message is the error chain.
    ModelFailure(String),
}

impl fmt::Display for EmptyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmptyReason::InvalidImage => f.write_str("invalid or empty image"),
            EmptyReason::NoFaceDetected => f.write_str("no face detected"),
            EmptyReason::ModelFailure(msg) => write!(f, "model failure: {}", msg),
        }
    }
}

/// Outcome of running the extractor over one image.
///
/// "No face" is an ordinary value here, not an error, so callers and caches
/// can keep it and tests can tell it apart from a model crash.
#[derive(Debug, Clone, PartialEq)]
pub enum Extraction {
    /// At least one embedding, in canonical face order.
    Faces(Vec<FaceEmbedding>),
    Empty(EmptyReason),
}

impl Extraction {
    pub fn from_faces(faces: Vec<FaceEmbedding>) -> Self {
        if faces.is_empty() {
            Extraction::Empty(EmptyReason::NoFaceDetected)
        } else {
            Extraction::Faces(faces)
        }
    }

    pub fn embeddings(&self) -> &[FaceEmbedding] {
        match self {
            Extraction::Faces(faces) => faces,
            Extraction::Empty(_) => &[],
        }
    }

    /// The canonical face: first in the extractor's deterministic order.
    pub fn primary(&self) -> Option<&FaceEmbedding> {
        self.embeddings().first()
    }

    pub fn empty_reason(&self) -> Option<&EmptyReason> {
        match self {
            Extraction::Faces(_) => None,
            Extraction::Empty(reason) => Some(reason),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Extraction::Empty(_))
    }
}

/// Image → face embeddings. Implementations never fail to the caller; every
/// failure path becomes an [`Extraction::Empty`] with its reason.
pub trait EmbeddingExtractor: Send + Sync {
    fn extract(&self, image: &DynamicImage) -> Extraction;
}

impl<T: EmbeddingExtractor + ?Sized> EmbeddingExtractor for std::sync::Arc<T> {
    fn extract(&self, image: &DynamicImage) -> Extraction {
        (**self).extract(image)
    }
}

/// Formats accepted from a photo source.
pub const ACCEPTED_FORMATS: [ImageFormat; 2] = [ImageFormat::Jpeg, ImageFormat::Png];

/// Decode downloaded jpeg or png bytes into an image. Anything else is
/// refused before decoding.
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage> {
    let format = image::guess_format(bytes).context("unrecognized image data")?;
    if !ACCEPTED_FORMATS.contains(&format) {
        anyhow::bail!("unsupported image format {:?}", format);
    }
    image::load_from_memory_with_format(bytes, format).context("decoding image")
}
