use std::sync::Mutex;

use anyhow::{Context, Result};
use image::{DynamicImage, GenericImageView};
use log::{debug, error, info, warn};
use ort::session::Session;

use crate::extractor::{EmbeddingExtractor, EmptyReason, Extraction};
use crate::face::{self, FaceEmbedding, ALIGNED_SIZE, EMBEDDING_DIM};
use crate::model::{self, ModelPaths};

/// Full pipeline: detect faces → align → encode → normalize.
///
/// Both ONNX sessions are loaded once in [`Pipeline::new`]. Inference needs
/// exclusive access to a session, so each sits behind its own mutex and one
/// `Pipeline` can be shared between threads.
pub struct Pipeline {
    detector: Mutex<Session>,
    encoder: Mutex<Session>,
    score_threshold: f32,
    nms_threshold: f32,
}

impl Pipeline {
    pub fn new(paths: &ModelPaths) -> Result<Self> {
        let detector = model::detector_session(paths)?;
        let encoder = model::recog_session(paths)?;
        info!(
            "loaded face models from {} and {}",
            paths.detector.display(),
            paths.recognizer.display()
        );
        Ok(Self {
            detector: Mutex::new(detector),
            encoder: Mutex::new(encoder),
            score_threshold: 0.6,
            nms_threshold: 0.3,
        })
    }

    pub fn with_thresholds(mut self, score_threshold: f32, nms_threshold: f32) -> Self {
        self.score_threshold = score_threshold;
        self.nms_threshold = nms_threshold;
        self
    }

    fn try_extract(&self, img: &DynamicImage) -> Result<Vec<FaceEmbedding>> {
        let detections = {
            let mut detector = self
                .detector
                .lock()
                .map_err(|_| anyhow::anyhow!("detector session poisoned"))?;
            face::detect_faces(&mut detector, img, self.score_threshold, self.nms_threshold)
                .context("detecting faces")?
        };

        let mut embeddings = Vec::with_capacity(detections.len());
        for (i, detection) in detections.iter().enumerate() {
            let aligned = match face::align_face(img, detection, ALIGNED_SIZE) {
                Ok(aligned) => aligned,
                Err(e) => {
                    debug!("skipping face {}: {}", i, e);
                    continue;
                }
            };

            let raw = {
                let mut encoder = self
                    .encoder
                    .lock()
                    .map_err(|_| anyhow::anyhow!("encoder session poisoned"))?;
                face::encode_face(&mut encoder, &aligned).context("encoding face")?
            };
            if raw.len() != EMBEDDING_DIM {
                anyhow::bail!(
                    "recognizer produced {} values, expected {}",
                    raw.len(),
                    EMBEDDING_DIM
                );
            }

            match FaceEmbedding::from_raw(raw) {
                Some(embedding) => embeddings.push(embedding),
                None => debug!("skipping face {}: zero descriptor", i),
            }
        }

        Ok(embeddings)
    }
}

impl EmbeddingExtractor for Pipeline {
    fn extract(&self, image: &DynamicImage) -> Extraction {
        let (w, h) = image.dimensions();
        if w == 0 || h == 0 {
            warn!("invalid image: {}x{}", w, h);
            return Extraction::Empty(EmptyReason::InvalidImage);
        }

        match self.try_extract(image) {
            Ok(faces) => {
                if faces.is_empty() {
                    info!("no face detected in {}x{} image", w, h);
                } else {
                    info!("extracted {} embedding(s) from {}x{} image", faces.len(), w, h);
                }
                Extraction::from_faces(faces)
            }
            Err(e) => {
                error!("embedding extraction failed: {:#}", e);
                Extraction::Empty(EmptyReason::ModelFailure(format!("{:#}", e)))
            }
        }
    }
}
