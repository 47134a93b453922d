pub mod cache;
pub mod config;
pub mod error;
pub mod index;
pub mod matcher;
pub mod policy;
pub mod source;

// Re-export vision types for convenience
pub use facematch_vision::{
    decode_image, Detection, EmbeddingExtractor, EmptyReason, Extraction, FaceEmbedding,
    ModelPaths, Pipeline, EMBEDDING_DIM,
};

pub use cache::EmbeddingCache;
pub use error::{Error, Result};
pub use index::{IndexPaths, Neighbor, SimilarityIndex};
pub use matcher::{FaceMatcher, IndexReport, Match, MatchOutcome, ScanMatch, ScanOutcome};
pub use policy::{MatchPolicy, Metric};
pub use source::{Folder, FolderId, LocalDirSource, PhotoSource, RemoteImage};
