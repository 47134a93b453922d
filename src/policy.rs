use log::warn;
use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};

use crate::FaceEmbedding;

/// How two embeddings are compared. A deployment uses exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// Dot product of unit vectors, higher is closer. Accept when `> threshold`.
    #[default]
    Cosine,
    /// L2 distance, lower is closer. Accept when `< threshold`.
    Euclidean,
}

impl Metric {
    /// Whether score `a` is a better match than score `b`.
    pub fn is_better(self, a: f32, b: f32) -> bool {
        match self {
            Metric::Cosine => a > b,
            Metric::Euclidean => a < b,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchPolicy {
    pub metric: Metric,
    pub threshold: f32,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self::new(Metric::Cosine, 0.6)
    }
}

impl MatchPolicy {
    pub fn new(metric: Metric, threshold: f32) -> Self {
        Self { metric, threshold }
    }

    /// Similarity (cosine) or distance (euclidean) between two embeddings.
    /// `None` when either side is empty or the lengths differ.
    pub fn score(&self, query: &[f32], candidate: &[f32]) -> Option<f32> {
        if query.is_empty() || candidate.is_empty() {
            warn!("cannot compare an empty embedding");
            return None;
        }
        if query.len() != candidate.len() {
            warn!(
                "cannot compare embeddings of length {} and {}",
                query.len(),
                candidate.len()
            );
            return None;
        }

        let (q, c) = (ArrayView1::from(query), ArrayView1::from(candidate));
        Some(match self.metric {
            // both sides are unit length, so the dot product is the cosine
            Metric::Cosine => q.dot(&c).clamp(-1.0, 1.0),
            Metric::Euclidean => {
                let diff = &q - &c;
                diff.dot(&diff).sqrt()
            }
        })
    }

    /// Threshold test on an already computed score. Strict in both metrics.
    pub fn accepts(&self, score: f32) -> bool {
        match self.metric {
            Metric::Cosine => score > self.threshold,
            Metric::Euclidean => score < self.threshold,
        }
    }

    pub fn decide(&self, query: &[f32], candidate: &[f32]) -> bool {
        self.score(query, candidate)
            .is_some_and(|score| self.accepts(score))
    }

    /// Best score of `probe` against any of `candidates`, in the metric's
    /// own order.
    pub fn best_score(&self, probe: &FaceEmbedding, candidates: &[FaceEmbedding]) -> Option<f32> {
        candidates
            .iter()
            .filter_map(|c| self.score(probe.as_slice(), c.as_slice()))
            .fold(None, |best, s| match best {
                Some(b) if !self.metric.is_better(s, b) => Some(b),
                _ => Some(s),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(values: &[f32]) -> FaceEmbedding {
        FaceEmbedding::from_raw(values.to_vec()).unwrap()
    }

    #[test]
    fn cosine_threshold_is_strict() {
        let policy = MatchPolicy::new(Metric::Cosine, 0.6);
        assert!(!policy.accepts(0.6));
        assert!(policy.accepts(0.600_000_1));
        assert!(!policy.accepts(0.3));

        // exactly 0.6 in f32: [1, 0] . [0.6, 0.8]
        assert!(!policy.decide(&[1.0, 0.0], &[0.6, 0.8]));
        assert!(policy.decide(&[1.0, 0.0], &[0.61, 0.79]));
    }

    #[test]
    fn euclidean_threshold_is_strict() {
        let policy = MatchPolicy::new(Metric::Euclidean, 0.5);
        assert!(!policy.accepts(0.5));
        assert!(policy.accepts(0.499_999_97));
        assert!(policy.decide(&[1.0, 0.0], &[1.0, 0.0]));
        // distance sqrt(2)
        assert!(!policy.decide(&[1.0, 0.0], &[0.0, 1.0]));
    }

    #[test]
    fn empty_or_mismatched_never_match() {
        let policy = MatchPolicy::default();
        assert!(!policy.decide(&[], &[1.0]));
        assert!(!policy.decide(&[1.0], &[]));
        assert!(!policy.decide(&[1.0, 0.0], &[1.0, 0.0, 0.0]));
        assert_eq!(policy.score(&[], &[]), None);
    }

    #[test]
    fn scores_per_metric() {
        let cos = MatchPolicy::new(Metric::Cosine, 0.6);
        let l2 = MatchPolicy::new(Metric::Euclidean, 0.6);
        let a = [1.0, 0.0];
        let b = [0.0, 1.0];
        assert!((cos.score(&a, &b).unwrap()).abs() < 1e-6);
        assert!((l2.score(&a, &b).unwrap() - 2f32.sqrt()).abs() < 1e-6);
        assert!((cos.score(&a, &a).unwrap() - 1.0).abs() < 1e-6);
        assert_eq!(l2.score(&a, &a), Some(0.0));
    }

    #[test]
    fn best_score_follows_metric_direction() {
        let probe = unit(&[1.0, 0.0]);
        let candidates = [unit(&[0.0, 1.0]), unit(&[1.0, 1.0]), unit(&[1.0, 0.1])];

        let cos = MatchPolicy::new(Metric::Cosine, 0.6)
            .best_score(&probe, &candidates)
            .unwrap();
        assert!((cos - 1.0 / 1.01f32.sqrt()).abs() < 1e-5);

        let l2 = MatchPolicy::new(Metric::Euclidean, 0.6)
            .best_score(&probe, &candidates)
            .unwrap();
        assert!(l2 < 0.1);

        assert_eq!(MatchPolicy::default().best_score(&probe, &[]), None);
    }

    #[test]
    fn metric_parses_lowercase() {
        #[derive(Deserialize)]
        struct Wrap {
            metric: Metric,
        }
        let w: Wrap = toml::from_str("metric = \"euclidean\"").unwrap();
        assert_eq!(w.metric, Metric::Euclidean);
    }
}
