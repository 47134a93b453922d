pub mod extractor;
pub mod face;
pub mod model;
pub mod pipeline;
pub mod yunet;

// Re-export commonly used types
pub use extractor::{decode_image, EmbeddingExtractor, EmptyReason, Extraction};
pub use face::{Detection, FaceEmbedding, EMBEDDING_DIM};
pub use model::ModelPaths;
pub use pipeline::Pipeline;
