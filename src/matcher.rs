use std::sync::Arc;

use image::DynamicImage;
use log::{info, warn};
use serde::Serialize;

use crate::cache::EmbeddingCache;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::index::SimilarityIndex;
use crate::policy::MatchPolicy;
use crate::source::{FolderId, PhotoSource, RemoteImage};
use crate::{decode_image, EmbeddingExtractor, EmptyReason, Extraction, Pipeline};

/// An indexed image accepted by the decision policy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Match {
    pub image_id: String,
    /// Cosine similarity or euclidean distance, per the policy's metric.
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    /// The selfie gave no usable face, so nothing can match.
    NoFace(EmptyReason),
    /// Accepted candidates, nearest first. May be empty.
    Matches(Vec<Match>),
}

impl MatchOutcome {
    /// Flatten into a result: a faceless selfie becomes
    /// [`Error::NoFaceDetected`], a model crash [`Error::ExtractionFailed`].
    pub fn into_matches(self) -> Result<Vec<Match>> {
        match self {
            MatchOutcome::Matches(matches) => Ok(matches),
            MatchOutcome::NoFace(EmptyReason::ModelFailure(msg)) => Err(Error::ExtractionFailed(msg)),
            MatchOutcome::NoFace(_) => Err(Error::NoFaceDetected),
        }
    }
}

/// A photo from a scanned folder whose faces match the selfie.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanMatch {
    pub name: String,
    pub download_url: String,
    pub score: f32,
}

/// Result of comparing a selfie against one event folder. Missing folders
/// and unreachable sources are outcomes with a reason, not errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanOutcome {
    NoFace(EmptyReason),
    CategoryNotFound(String),
    FolderNotFound(String),
    NoImages(String),
    SourceUnavailable(String),
    Matches(Vec<ScanMatch>),
}

/// Counters from one [`FaceMatcher::index_folder`] run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexReport {
    pub listed: usize,
    pub already_indexed: usize,
    pub indexed_images: usize,
    pub indexed_faces: usize,
    pub without_face: usize,
    /// `(image id, reason)` for images that could not be fetched or processed.
    pub failed: Vec<(String, String)>,
    /// Set when the folder itself could not be listed.
    pub unavailable: Option<String>,
}

/// The selfie matching service: one extractor, one index namespace, one
/// cache and one policy, built once at startup and shared by reference.
pub struct FaceMatcher {
    extractor: Arc<dyn EmbeddingExtractor>,
    index: SimilarityIndex,
    cache: EmbeddingCache,
    policy: MatchPolicy,
    top_k: usize,
}

impl FaceMatcher {
    pub fn new(
        extractor: Arc<dyn EmbeddingExtractor>,
        index: SimilarityIndex,
        cache: EmbeddingCache,
        policy: MatchPolicy,
        top_k: usize,
    ) -> Self {
        Self {
            extractor,
            index,
            cache,
            policy,
            top_k,
        }
    }

    /// Load the models and open the configured index namespace.
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let pipeline = Pipeline::new(&cfg.model_paths())
            .map_err(|e| Error::ModelLoadFailure(format!("{:#}", e)))?
            .with_thresholds(cfg.score_threshold, cfg.nms_threshold);
        let index = SimilarityIndex::open(cfg.index_paths(), cfg.embedding_dim)?;
        let cache = match cfg.cache_capacity {
            Some(capacity) => EmbeddingCache::with_capacity(capacity),
            None => EmbeddingCache::new(),
        };
        info!(
            "matching with {:?} metric, threshold {}, top {}",
            cfg.metric, cfg.threshold, cfg.top_k
        );
        Ok(Self::new(Arc::new(pipeline), index, cache, cfg.policy(), cfg.top_k))
    }

    pub fn index(&self) -> &SimilarityIndex {
        &self.index
    }

    pub fn cache(&self) -> &EmbeddingCache {
        &self.cache
    }

    pub fn policy(&self) -> &MatchPolicy {
        &self.policy
    }

    pub fn extract_embeddings(&self, image: &DynamicImage) -> Extraction {
        self.extractor.extract(image)
    }

    pub fn index_insert(&self, image_id: &str, embedding: &[f32]) -> Result<usize> {
        self.index.insert(image_id, embedding)
    }

    pub fn index_search(&self, embedding: &[f32], k: usize) -> Result<Vec<String>> {
        self.index.search(embedding, k)
    }

    pub fn decide(&self, query: &[f32], candidate: &[f32]) -> bool {
        self.policy.decide(query, candidate)
    }

    pub fn score(&self, query: &[f32], candidate: &[f32]) -> Option<f32> {
        self.policy.score(query, candidate)
    }

    /// Extraction for a listed image, from the cache or by downloading it.
    /// Download failures are returned as `Err` and not cached.
    fn fetch_extraction(
        &self,
        source: &dyn PhotoSource,
        image: &RemoteImage,
    ) -> std::result::Result<Extraction, String> {
        if let Some(hit) = self.cache.get(&image.id) {
            return Ok(hit);
        }
        let bytes = source
            .download(&image.download_url)
            .map_err(|e| format!("download failed: {:#}", e))?;
        Ok(self.cache.get_or_insert_with(&image.id, || match decode_image(&bytes) {
            Ok(decoded) => self.extractor.extract(&decoded),
            Err(e) => {
                warn!("{}: {:#}", image.name, e);
                Extraction::Empty(EmptyReason::InvalidImage)
            }
        }))
    }

    /// Add every face of every image in `folder` that is not indexed yet.
    pub fn index_folder(&self, source: &dyn PhotoSource, folder: &FolderId) -> Result<IndexReport> {
        let mut report = IndexReport::default();
        let images = match source.list_folder(folder) {
            Ok(images) => images,
            Err(e) => {
                warn!("listing folder {:?} failed: {:#}", folder.0, e);
                report.unavailable = Some(format!("{:#}", e));
                return Ok(report);
            }
        };
        report.listed = images.len();

        let mut indexed = self.index.image_ids()?;
        for image in &images {
            if indexed.contains(&image.id) {
                report.already_indexed += 1;
                continue;
            }

            let extraction = match self.fetch_extraction(source, image) {
                Ok(extraction) => extraction,
                Err(reason) => {
                    warn!("{}: {}", image.name, reason);
                    report.failed.push((image.id.clone(), reason));
                    continue;
                }
            };

            match extraction.empty_reason() {
                None => {}
                Some(EmptyReason::ModelFailure(msg)) => {
                    report.failed.push((image.id.clone(), msg.clone()));
                    continue;
                }
                Some(_) => {
                    report.without_face += 1;
                    continue;
                }
            }

            let vectors: Vec<&[f32]> = extraction.embeddings().iter().map(|e| e.as_slice()).collect();
            self.index.insert_many(&image.id, &vectors)?;
            indexed.insert(image.id.clone());
            report.indexed_images += 1;
            report.indexed_faces += vectors.len();
        }

        info!(
            "indexed {} face(s) from {} of {} image(s) in {:?}",
            report.indexed_faces, report.indexed_images, report.listed, folder.0
        );
        Ok(report)
    }

    /// Find indexed images matching the selfie's canonical face.
    pub fn match_selfie(&self, selfie: &DynamicImage) -> Result<MatchOutcome> {
        let extraction = self.extractor.extract(selfie);
        let Some(query) = extraction.primary() else {
            let reason = extraction
                .empty_reason()
                .cloned()
                .unwrap_or(EmptyReason::NoFaceDetected);
            info!("selfie rejected: {}", reason);
            return Ok(MatchOutcome::NoFace(reason));
        };
        if extraction.embeddings().len() > 1 {
            info!(
                "selfie has {} faces, matching the largest",
                extraction.embeddings().len()
            );
        }
        self.match_embedding(query.as_slice()).map(MatchOutcome::Matches)
    }

    /// Search the index for `query` and keep the neighbours the policy
    /// accepts. Each image id appears once, at its nearest face.
    pub fn match_embedding(&self, query: &[f32]) -> Result<Vec<Match>> {
        let mut matches: Vec<Match> = Vec::new();
        for neighbor in self.index.neighbors(query, self.top_k)? {
            if matches.iter().any(|m| m.image_id == neighbor.image_id) {
                continue;
            }
            let Some(score) = self.policy.score(query, &neighbor.vector) else {
                continue;
            };
            if self.policy.accepts(score) {
                matches.push(Match {
                    image_id: neighbor.image_id,
                    score,
                });
            }
        }
        Ok(matches)
    }

    /// Compare the selfie against every photo of one event without the
    /// index: resolve `event` under `root`, then `"{event} {month_year}"`
    /// under that, and score each listed photo's faces.
    pub fn scan_event(
        &self,
        source: &dyn PhotoSource,
        root: &FolderId,
        event: &str,
        month_year: &str,
        selfie: &DynamicImage,
    ) -> ScanOutcome {
        let extraction = self.extractor.extract(selfie);
        let Some(query) = extraction.primary() else {
            return ScanOutcome::NoFace(
                extraction
                    .empty_reason()
                    .cloned()
                    .unwrap_or(EmptyReason::NoFaceDetected),
            );
        };

        let category = match source.resolve_folder(event, root) {
            Ok(Some(id)) => id,
            Ok(None) => return ScanOutcome::CategoryNotFound(event.to_string()),
            Err(e) => return ScanOutcome::SourceUnavailable(format!("{:#}", e)),
        };
        let album = format!("{} {}", event, month_year);
        let folder = match source.resolve_folder(&album, &category) {
            Ok(Some(id)) => id,
            Ok(None) => return ScanOutcome::FolderNotFound(album),
            Err(e) => return ScanOutcome::SourceUnavailable(format!("{:#}", e)),
        };
        let images = match source.list_folder(&folder) {
            Ok(images) if images.is_empty() => return ScanOutcome::NoImages(album),
            Ok(images) => images,
            Err(e) => return ScanOutcome::SourceUnavailable(format!("{:#}", e)),
        };

        let mut matches = Vec::new();
        for image in &images {
            let extraction = match self.fetch_extraction(source, image) {
                Ok(extraction) => extraction,
                Err(reason) => {
                    warn!("{}: {}", image.name, reason);
                    continue;
                }
            };
            let Some(score) = self.policy.best_score(query, extraction.embeddings()) else {
                continue;
            };
            if self.policy.accepts(score) {
                matches.push(ScanMatch {
                    name: image.name.clone(),
                    download_url: image.download_url.clone(),
                    score,
                });
            }
        }
        info!("{} of {} photo(s) in {:?} matched", matches.len(), images.len(), album);
        ScanOutcome::Matches(matches)
    }
}
