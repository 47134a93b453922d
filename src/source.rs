//! The photo storage collaborator.
//!
//! The matching core only needs a few calls from whatever holds the photos:
//! resolve a folder by name, list what is inside it, and fetch an image. Remote
//! drives implement [`PhotoSource`] outside this crate; [`LocalDirSource`]
//! serves a directory tree so the pipeline runs without one.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Opaque folder handle issued by a [`PhotoSource`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FolderId(pub String);

/// A sub-folder as listed by the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Folder {
    pub id: FolderId,
    pub name: String,
}

/// One image as listed by the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteImage {
    /// Stable id, used as the index and cache key.
    pub id: String,
    pub name: String,
    pub download_url: String,
}

/// Synchronous, fallible access to a photo store. "Not found" is `None` or
/// an empty list, never an error.
pub trait PhotoSource: Send + Sync {
    fn resolve_folder(&self, name: &str, parent: &FolderId) -> Result<Option<FolderId>>;

    /// Direct sub-folders of `parent`, e.g. the albums of an event category.
    fn list_folders(&self, parent: &FolderId) -> Result<Vec<Folder>>;

    fn list_folder(&self, folder: &FolderId) -> Result<Vec<RemoteImage>>;

    fn download(&self, url: &str) -> Result<Vec<u8>>;
}

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Directory tree as a photo store: folders are directories relative to
/// `root`, images are jpeg/png files, and ids and urls are relative paths.
#[derive(Debug, Clone)]
pub struct LocalDirSource {
    root: PathBuf,
}

impl LocalDirSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Handle for the root directory itself.
    pub fn root_folder(&self) -> FolderId {
        FolderId(String::new())
    }

    fn resolve(&self, relative: &str) -> Result<PathBuf> {
        let rel = Path::new(relative);
        if rel.is_absolute()
            || rel
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            anyhow::bail!("path {:?} escapes the source root", relative);
        }
        Ok(self.root.join(rel))
    }
}

fn join_relative(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent, name)
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

impl PhotoSource for LocalDirSource {
    fn resolve_folder(&self, name: &str, parent: &FolderId) -> Result<Option<FolderId>> {
        if name.is_empty() || name.contains(['/', '\\']) {
            return Ok(None);
        }
        let relative = join_relative(&parent.0, name);
        let path = self.resolve(&relative)?;
        Ok(path.is_dir().then_some(FolderId(relative)))
    }

    fn list_folders(&self, parent: &FolderId) -> Result<Vec<Folder>> {
        let dir = self.resolve(&parent.0)?;
        if !dir.is_dir() {
            return Ok(vec![]);
        }

        let mut folders = Vec::new();
        for entry in fs::read_dir(&dir).with_context(|| format!("listing {}", dir.display()))? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            folders.push(Folder {
                id: FolderId(join_relative(&parent.0, name)),
                name: name.to_string(),
            });
        }
        folders.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(folders)
    }

    fn list_folder(&self, folder: &FolderId) -> Result<Vec<RemoteImage>> {
        let dir = self.resolve(&folder.0)?;
        if !dir.is_dir() {
            return Ok(vec![]);
        }

        let mut images = Vec::new();
        for entry in fs::read_dir(&dir).with_context(|| format!("listing {}", dir.display()))? {
            let path = entry?.path();
            if !path.is_file() || !is_image(&path) {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let id = join_relative(&folder.0, name);
            images.push(RemoteImage {
                download_url: id.clone(),
                id,
                name: name.to_string(),
            });
        }
        images.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(images)
    }

    fn download(&self, url: &str) -> Result<Vec<u8>> {
        let path = self.resolve(url)?;
        fs::read(&path).with_context(|| format!("reading {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let album = dir.path().join("Casamento/Casamento 02-2025");
        fs::create_dir_all(&album).unwrap();
        fs::write(album.join("b.JPG"), b"b").unwrap();
        fs::write(album.join("a.png"), b"a").unwrap();
        fs::write(album.join("notes.txt"), b"skip").unwrap();
        fs::create_dir(album.join("nested.jpg")).unwrap();
        dir
    }

    #[test]
    fn resolves_nested_folders() {
        let dir = tree();
        let source = LocalDirSource::new(dir.path());
        let category = source
            .resolve_folder("Casamento", &source.root_folder())
            .unwrap()
            .unwrap();
        let album = source
            .resolve_folder("Casamento 02-2025", &category)
            .unwrap()
            .unwrap();
        assert_eq!(album.0, "Casamento/Casamento 02-2025");
        assert_eq!(source.resolve_folder("Batizado", &category).unwrap(), None);
        assert_eq!(source.resolve_folder("../etc", &category).unwrap(), None);
    }

    #[test]
    fn lists_only_images_sorted() {
        let dir = tree();
        let source = LocalDirSource::new(dir.path());
        let images = source
            .list_folder(&FolderId("Casamento/Casamento 02-2025".into()))
            .unwrap();
        let names: Vec<_> = images.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["a.png", "b.JPG"]);
        assert_eq!(source.download(&images[0].download_url).unwrap(), b"a");
        assert!(source.list_folder(&FolderId("missing".into())).unwrap().is_empty());
    }

    #[test]
    fn lists_sub_folders_sorted() {
        let dir = tree();
        fs::create_dir_all(dir.path().join("Casamento/Casamento 01-2025")).unwrap();
        fs::create_dir_all(dir.path().join("Batizado")).unwrap();
        fs::write(dir.path().join("cover.png"), b"c").unwrap();
        let source = LocalDirSource::new(dir.path());

        let top: Vec<_> = source
            .list_folders(&source.root_folder())
            .unwrap()
            .into_iter()
            .map(|f| f.name)
            .collect();
        assert_eq!(top, vec!["Batizado", "Casamento"]);

        let albums = source.list_folders(&FolderId("Casamento".into())).unwrap();
        assert_eq!(
            albums,
            vec![
                Folder {
                    id: FolderId("Casamento/Casamento 01-2025".into()),
                    name: "Casamento 01-2025".into(),
                },
                Folder {
                    id: FolderId("Casamento/Casamento 02-2025".into()),
                    name: "Casamento 02-2025".into(),
                },
            ]
        );
        assert!(source.list_folders(&FolderId("missing".into())).unwrap().is_empty());
        assert!(source.list_folders(&FolderId("../".into())).is_err());
    }

    #[test]
    fn refuses_paths_outside_root() {
        let dir = tree();
        let source = LocalDirSource::new(dir.path().join("Casamento"));
        assert!(source.download("../secret.png").is_err());
        assert!(source.download("/etc/passwd").is_err());
    }
}
