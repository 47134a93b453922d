use anyhow::{Context, Result};
use directories::ProjectDirs;
use facematch_vision::{ModelPaths, EMBEDDING_DIM};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::index::IndexPaths;
use crate::policy::{MatchPolicy, Metric};

static PROJECT_DIRS: Lazy<Option<ProjectDirs>> =
    Lazy::new(|| ProjectDirs::from("", "", "facematch"));

pub static CONFIG_PATH: Lazy<PathBuf> = Lazy::new(|| match option_env!("FACEMATCH_CONFIG_PATH") {
    Some(path) => PathBuf::from(path),
    None => PROJECT_DIRS
        .as_ref()
        .map(|dirs| dirs.config_dir().join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("facematch.toml")),
});

pub static DATA_DIR: Lazy<PathBuf> = Lazy::new(|| match option_env!("FACEMATCH_DATA_DIR") {
    Some(path) => PathBuf::from(path),
    None => PROJECT_DIRS
        .as_ref()
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("facematch-data")),
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Length of every stored and queried embedding.
    pub embedding_dim: usize,
    /// The one similarity metric this deployment decides with.
    pub metric: Metric,
    /// Cosine: accept above. Euclidean: accept below.
    pub threshold: f32,
    /// Nearest neighbours fetched per query.
    pub top_k: usize,
    /// Root directory holding one sub-directory per index namespace.
    pub index_dir: PathBuf,
    pub namespace: String,
    /// Overrides `<index_dir>/<namespace>/vectors.bin`.
    pub vectors_path: Option<PathBuf>,
    /// Overrides `<index_dir>/<namespace>/ids.bin`.
    pub ids_path: Option<PathBuf>,
    pub detector_model: PathBuf,
    pub recognizer_model: PathBuf,
    /// Minimum detector confidence for a face.
    pub score_threshold: f32,
    pub nms_threshold: f32,
    /// Upper bound on cached images, unbounded when absent.
    pub cache_capacity: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        let models = ModelPaths::in_dir(DATA_DIR.join("models"));
        Self {
            embedding_dim: EMBEDDING_DIM,
            metric: Metric::Cosine,
            threshold: 0.6,
            top_k: 5,
            index_dir: DATA_DIR.join("index"),
            namespace: "default".to_string(),
            vectors_path: None,
            ids_path: None,
            detector_model: models.detector,
            recognizer_model: models.recognizer,
            score_threshold: 0.6,
            nms_threshold: 0.3,
            cache_capacity: None,
        }
    }
}

impl Config {
    pub fn index_paths(&self) -> IndexPaths {
        let defaults = IndexPaths::in_dir(self.index_dir.join(&self.namespace));
        IndexPaths {
            vectors: self.vectors_path.clone().unwrap_or(defaults.vectors),
            ids: self.ids_path.clone().unwrap_or(defaults.ids),
        }
    }

    pub fn model_paths(&self) -> ModelPaths {
        ModelPaths {
            detector: self.detector_model.clone(),
            recognizer: self.recognizer_model.clone(),
        }
    }

    pub fn policy(&self) -> MatchPolicy {
        MatchPolicy::new(self.metric, self.threshold)
    }

    pub fn validate(&self) -> Result<()> {
        if self.embedding_dim == 0 {
            anyhow::bail!("embedding_dim must be positive");
        }
        if self.top_k == 0 {
            anyhow::bail!("top_k must be positive");
        }
        if !self.threshold.is_finite() {
            anyhow::bail!("threshold must be a finite number");
        }
        if self.namespace.is_empty() || self.namespace.contains(['/', '\\']) {
            anyhow::bail!("namespace {:?} is not a valid directory name", self.namespace);
        }
        if self.cache_capacity == Some(0) {
            anyhow::bail!("cache_capacity must be positive when set");
        }
        Ok(())
    }
}

pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = path.unwrap_or(&CONFIG_PATH);
    if !path.exists() {
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config at {}", path.display()))?;
    let cfg: Config =
        toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validating config {}", path.display()))?;
    Ok(cfg)
}

pub fn save_config(cfg: &Config, path: Option<&Path>) -> Result<()> {
    let path = path.unwrap_or(&CONFIG_PATH);
    let data = toml::to_string_pretty(cfg)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, data)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_config(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.embedding_dim, 128);
        assert_eq!(cfg.metric, Metric::Cosine);
        assert_eq!(cfg.threshold, 0.6);
        assert_eq!(cfg.top_k, 5);
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");
        let cfg = Config {
            metric: Metric::Euclidean,
            threshold: 0.45,
            top_k: 9,
            namespace: "wedding-2025".to_string(),
            cache_capacity: Some(64),
            ..Config::default()
        };
        save_config(&cfg, Some(&path)).unwrap();
        assert_eq!(load_config(Some(&path)).unwrap(), cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "metric = \"euclidean\"\ntop_k = 3\n").unwrap();
        let cfg = load_config(Some(&path)).unwrap();
        assert_eq!(cfg.metric, Metric::Euclidean);
        assert_eq!(cfg.top_k, 3);
        assert_eq!(cfg.threshold, 0.6);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "top_k = 0\n").unwrap();
        assert!(load_config(Some(&path)).is_err());
        std::fs::write(&path, "namespace = \"../escape\"\n").unwrap();
        assert!(load_config(Some(&path)).is_err());
    }

    #[test]
    fn index_paths_follow_namespace_unless_overridden() {
        let mut cfg = Config {
            index_dir: PathBuf::from("/data/index"),
            namespace: "album".to_string(),
            ..Config::default()
        };
        let paths = cfg.index_paths();
        assert_eq!(paths.vectors, PathBuf::from("/data/index/album/vectors.bin"));
        assert_eq!(paths.ids, PathBuf::from("/data/index/album/ids.bin"));

        cfg.ids_path = Some(PathBuf::from("/elsewhere/ids.bin"));
        let paths = cfg.index_paths();
        assert_eq!(paths.vectors, PathBuf::from("/data/index/album/vectors.bin"));
        assert_eq!(paths.ids, PathBuf::from("/elsewhere/ids.bin"));
    }
}
