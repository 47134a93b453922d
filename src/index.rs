//! Exact nearest-neighbour index over fixed-dimension vectors.
//!
//! The index keeps two parallel structures that always grow together: a flat
//! vector store (position `p` occupies `vectors[p * d..(p + 1) * d]`) and the
//! id mapping (`ids[p]` is the external image id stored at position `p`).
//! Both are written to disk after every mutation, each into its own file, and
//! read back together. A pair that disagrees is refused as corrupt.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const VECTORS_FILE: &str = "vectors.bin";
pub const IDS_FILE: &str = "ids.bin";

const VECTORS_MAGIC: [u8; 4] = *b"FMVS";
const IDS_MAGIC: [u8; 4] = *b"FMID";
const FORMAT_VERSION: u32 = 1;

/// Where one namespace's two artifacts live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexPaths {
    pub vectors: PathBuf,
    pub ids: PathBuf,
}

impl IndexPaths {
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            vectors: dir.join(VECTORS_FILE),
            ids: dir.join(IDS_FILE),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct VectorStoreFile {
    magic: [u8; 4],
    version: u32,
    dimension: u32,
    count: u64,
    /// Native-endian f32 values, `count * dimension` of them.
    #[serde(with = "serde_bytes")]
    data: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct IdMapFile {
    magic: [u8; 4],
    version: u32,
    dimension: u32,
    ids: Vec<String>,
}

/// One search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    /// Insertion position inside the index.
    pub position: usize,
    pub image_id: String,
    /// Squared L2 distance to the query.
    pub distance: f32,
    pub vector: Vec<f32>,
}

#[derive(Debug, Default)]
struct Entries {
    vectors: Vec<f32>,
    ids: Vec<String>,
}

impl Entries {
    fn truncate(&mut self, len: usize, dimension: usize) {
        self.vectors.truncate(len * dimension);
        self.ids.truncate(len);
    }
}

/// Persistent k-nearest-neighbour index for one namespace.
///
/// Searches share a read lock. `insert` holds the write lock until both files
/// are on disk, so a reader never sees an append that is not yet persisted.
#[derive(Debug)]
pub struct SimilarityIndex {
    dimension: usize,
    paths: IndexPaths,
    entries: RwLock<Entries>,
}

impl SimilarityIndex {
    /// Open the index stored at `paths`, or start an empty one when neither
    /// artifact exists yet.
    pub fn open(paths: IndexPaths, dimension: usize) -> Result<Self> {
        let entries = read_pair(&paths, dimension)?;
        info!(
            "opened index {} with {} entries (d={})",
            paths.vectors.display(),
            entries.ids.len(),
            dimension
        );
        Ok(Self {
            dimension,
            paths,
            entries: RwLock::new(entries),
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn paths(&self) -> &IndexPaths {
        &self.paths
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.read()?.ids.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn contains(&self, image_id: &str) -> Result<bool> {
        Ok(self.read()?.ids.iter().any(|id| id == image_id))
    }

    /// Snapshot of the distinct image ids stored so far.
    pub fn image_ids(&self) -> Result<HashSet<String>> {
        Ok(self.read()?.ids.iter().cloned().collect())
    }

    /// Append one vector for `image_id` and persist. Returns its position.
    pub fn insert(&self, image_id: &str, embedding: &[f32]) -> Result<usize> {
        self.insert_many(image_id, std::slice::from_ref(&embedding))
    }

    /// Append several vectors for the same image under a single flush.
    /// Either all of them are stored and persisted or none is. Returns the
    /// position of the first one.
    pub fn insert_many<V: AsRef<[f32]>>(&self, image_id: &str, embeddings: &[V]) -> Result<usize> {
        for embedding in embeddings {
            self.check_dimension(embedding.as_ref())?;
        }

        let mut entries = self.write()?;
        let start = entries.ids.len();
        for embedding in embeddings {
            entries.vectors.extend_from_slice(embedding.as_ref());
            entries.ids.push(image_id.to_string());
        }

        if let Err(e) = write_pair(&self.paths, self.dimension, &entries) {
            warn!("persisting index failed, rolling back {} entries: {}", embeddings.len(), e);
            entries.truncate(start, self.dimension);
            if let Err(restore) = restore_pair(&self.paths, self.dimension, &entries) {
                error!("restoring {} after a failed insert: {}", self.paths.vectors.display(), restore);
            }
            return Err(e);
        }
        debug!("inserted {} vector(s) for {} at {}", embeddings.len(), image_id, start);
        Ok(start)
    }

    /// Ids of the `k` stored vectors closest to `query`, nearest first.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<String>> {
        Ok(self
            .neighbors(query, k)?
            .into_iter()
            .map(|n| n.image_id)
            .collect())
    }

    /// The `k` nearest stored vectors by squared L2 distance. Equal distances
    /// keep insertion order.
    pub fn neighbors(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        self.check_dimension(query)?;
        let entries = self.read()?;
        if k == 0 || entries.vectors.is_empty() {
            return Ok(vec![]);
        }

        let mut scored: Vec<(usize, f32)> = entries
            .vectors
            .chunks_exact(self.dimension)
            .map(|v| squared_l2(query, v))
            .enumerate()
            .collect();

        let closer = |a: &(usize, f32), b: &(usize, f32)| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0));
        if k < scored.len() {
            scored.select_nth_unstable_by(k, closer);
            scored.truncate(k);
        }
        scored.sort_unstable_by(closer);

        Ok(scored
            .into_iter()
            .filter_map(|(position, distance)| {
                let image_id = entries.ids.get(position)?.clone();
                let start = position * self.dimension;
                Some(Neighbor {
                    position,
                    image_id,
                    distance,
                    vector: entries.vectors[start..start + self.dimension].to_vec(),
                })
            })
            .collect())
    }

    /// Replace the in-memory state with what is on disk.
    pub fn load(&self) -> Result<()> {
        let fresh = read_pair(&self.paths, self.dimension)?;
        *self.write()? = fresh;
        Ok(())
    }

    /// Write both artifacts from the in-memory state.
    pub fn persist(&self) -> Result<()> {
        let entries = self.read()?;
        write_pair(&self.paths, self.dimension, &entries)
    }

    fn check_dimension(&self, v: &[f32]) -> Result<()> {
        if v.len() != self.dimension {
            return Err(Error::DimensionMismatch {
                expected: self.dimension,
                actual: v.len(),
            });
        }
        Ok(())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Entries>> {
        self.entries
            .read()
            .map_err(|_| Error::corrupt("index lock poisoned by an interrupted write"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Entries>> {
        self.entries
            .write()
            .map_err(|_| Error::corrupt("index lock poisoned by an interrupted write"))
    }
}

pub fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

fn read_artifact(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| Error::corrupt(format!("reading {}: {}", path.display(), e)))
}

fn read_pair(paths: &IndexPaths, dimension: usize) -> Result<Entries> {
    match (paths.vectors.exists(), paths.ids.exists()) {
        (false, false) => return Ok(Entries::default()),
        (true, false) => {
            return Err(Error::corrupt(format!(
                "vector store {} has no id mapping at {}",
                paths.vectors.display(),
                paths.ids.display()
            )))
        }
        (false, true) => {
            return Err(Error::corrupt(format!(
                "id mapping {} has no vector store at {}",
                paths.ids.display(),
                paths.vectors.display()
            )))
        }
        (true, true) => {}
    }

    let store: VectorStoreFile = postcard::from_bytes(&read_artifact(&paths.vectors)?)
        .map_err(|e| Error::corrupt(format!("decoding {}: {}", paths.vectors.display(), e)))?;
    let map: IdMapFile = postcard::from_bytes(&read_artifact(&paths.ids)?)
        .map_err(|e| Error::corrupt(format!("decoding {}: {}", paths.ids.display(), e)))?;

    if store.magic != VECTORS_MAGIC || map.magic != IDS_MAGIC {
        return Err(Error::corrupt("unrecognized index file header"));
    }
    if store.version != FORMAT_VERSION || map.version != FORMAT_VERSION {
        return Err(Error::corrupt(format!(
            "unsupported format version {}/{}, expected {}",
            store.version, map.version, FORMAT_VERSION
        )));
    }
    if store.dimension as usize != dimension || map.dimension as usize != dimension {
        return Err(Error::corrupt(format!(
            "stored dimension {}/{} does not match configured {}",
            store.dimension, map.dimension, dimension
        )));
    }

    let count = usize::try_from(store.count)
        .map_err(|_| Error::corrupt(format!("entry count {} does not fit in memory", store.count)))?;
    let expected_bytes = count
        .checked_mul(dimension)
        .and_then(|n| n.checked_mul(std::mem::size_of::<f32>()))
        .ok_or_else(|| Error::corrupt(format!("entry count {} overflows the vector store", count)))?;
    if store.data.len() != expected_bytes {
        return Err(Error::corrupt(format!(
            "vector store holds {} bytes, header promises {}",
            store.data.len(),
            expected_bytes
        )));
    }
    if map.ids.len() != count {
        return Err(Error::corrupt(format!(
            "vector store has {} entries but id mapping has {}",
            count,
            map.ids.len()
        )));
    }

    Ok(Entries {
        vectors: bytemuck::pod_collect_to_vec(&store.data),
        ids: map.ids,
    })
}

fn write_pair(paths: &IndexPaths, dimension: usize, entries: &Entries) -> Result<()> {
    write_vectors(paths, dimension, entries)?;
    write_ids(paths, dimension, entries)
}

/// Put the artifacts back in line with `entries` after `write_pair` failed
/// part way. The id mapping is replaced by rename, so a failed write leaves
/// the previous one intact and only the vector store needs rewriting. An
/// empty index goes back to having no files at all.
fn restore_pair(paths: &IndexPaths, dimension: usize, entries: &Entries) -> Result<()> {
    if entries.ids.is_empty() {
        for path in [&paths.vectors, &paths.ids] {
            if path.exists() {
                fs::remove_file(path)?;
            }
        }
        return Ok(());
    }
    write_vectors(paths, dimension, entries)
}

fn write_vectors(paths: &IndexPaths, dimension: usize, entries: &Entries) -> Result<()> {
    let store = VectorStoreFile {
        magic: VECTORS_MAGIC,
        version: FORMAT_VERSION,
        dimension: dimension as u32,
        count: entries.ids.len() as u64,
        data: bytemuck::cast_slice::<f32, u8>(entries.vectors.as_slice()).to_vec(),
    };
    write_atomic(&paths.vectors, &postcard::to_allocvec(&store)?)
}

fn write_ids(paths: &IndexPaths, dimension: usize, entries: &Entries) -> Result<()> {
    let map = IdMapFile {
        magic: IDS_MAGIC,
        version: FORMAT_VERSION,
        dimension: dimension as u32,
        ids: entries.ids.clone(),
    };
    write_atomic(&paths.ids, &postcard::to_allocvec(&map)?)
}

/// Write to a unique sibling file, fsync, then rename over `path`.
fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4()));

    let result = (|| -> std::io::Result<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result.map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    const D: usize = 8;

    fn axis(i: usize) -> Vec<f32> {
        let mut v = vec![0.0; D];
        v[i] = 1.0;
        v
    }

    fn open(dir: &Path) -> SimilarityIndex {
        SimilarityIndex::open(IndexPaths::in_dir(dir), D).unwrap()
    }

    #[test]
    fn empty_index_returns_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let index = open(dir.path());
        assert!(index.is_empty().unwrap());
        assert!(index.search(&axis(0), 5).unwrap().is_empty());
        // nothing is written until the first insert
        assert!(!index.paths().vectors.exists());
    }

    #[test]
    fn wrong_dimension_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let index = open(dir.path());
        let err = index.insert("a", &[1.0; D + 1]).unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { expected: D, actual } if actual == D + 1));
        let err = index.search(&[1.0; D - 1], 3).unwrap_err();
        assert!(err.is_dimension_mismatch());
        assert!(index.search(&[], 3).unwrap_err().is_dimension_mismatch());
        assert_eq!(index.len().unwrap(), 0);
    }

    #[test]
    fn ranks_by_distance() {
        let dir = tempfile::tempdir().unwrap();
        let index = open(dir.path());
        let query = axis(0);
        for (id, d) in [("far", 0.9f32), ("near", 0.1), ("mid", 0.5)] {
            let mut v = axis(0);
            v[1] = d;
            index.insert(id, &v).unwrap();
        }
        assert_eq!(index.search(&query, 2).unwrap(), vec!["near", "mid"]);

        let hits = index.neighbors(&query, 10).unwrap();
        assert_eq!(hits.len(), 3);
        assert!((hits[0].distance - 0.01).abs() < 1e-6);
        assert!((hits[2].distance - 0.81).abs() < 1e-6);
        assert_eq!(hits[0].position, 1);
        assert_eq!(hits[0].vector[1], 0.1);
    }

    #[test]
    fn ties_keep_insertion_order() {
        let dir = tempfile::tempdir().unwrap();
        let index = open(dir.path());
        for id in ["first", "second", "third"] {
            index.insert(id, &axis(2)).unwrap();
        }
        assert_eq!(index.search(&axis(2), 2).unwrap(), vec!["first", "second"]);
        assert_eq!(index.search(&axis(0), 3).unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn k_zero_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let index = open(dir.path());
        index.insert("a", &axis(0)).unwrap();
        assert!(index.search(&axis(0), 0).unwrap().is_empty());
    }

    #[test]
    fn insert_many_shares_one_image_id() {
        let dir = tempfile::tempdir().unwrap();
        let index = open(dir.path());
        index.insert("solo", &axis(0)).unwrap();
        let start = index.insert_many("group", &[axis(1), axis(2)]).unwrap();
        assert_eq!(start, 1);
        assert_eq!(index.len().unwrap(), 3);
        assert!(index.contains("group").unwrap());
        assert!(!index.contains("missing").unwrap());

        let err = index.insert_many("bad", &[axis(3), vec![0.0; 2]]).unwrap_err();
        assert!(err.is_dimension_mismatch());
        assert_eq!(index.len().unwrap(), 3);
    }

    #[test]
    fn reopen_restores_identical_results() {
        let dir = tempfile::tempdir().unwrap();
        let query: Vec<f32> = (0..D).map(|i| i as f32 / 10.0).collect();
        let before = {
            let index = open(dir.path());
            for i in 0..D {
                index.insert(&format!("img-{}", i), &axis(i)).unwrap();
            }
            index.search(&query, 4).unwrap()
        };
        let index = open(dir.path());
        assert_eq!(index.len().unwrap(), D);
        assert_eq!(index.search(&query, 4).unwrap(), before);
    }

    #[test]
    fn load_replaces_memory_with_disk() {
        let dir = tempfile::tempdir().unwrap();
        let writer = open(dir.path());
        let reader = open(dir.path());
        writer.insert("a", &axis(0)).unwrap();
        assert_eq!(reader.len().unwrap(), 0);
        reader.load().unwrap();
        assert_eq!(reader.search(&axis(0), 1).unwrap(), vec!["a"]);
    }

    #[test]
    fn one_missing_artifact_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        open(dir.path()).insert("a", &axis(0)).unwrap();
        fs::remove_file(dir.path().join(IDS_FILE)).unwrap();
        let err = SimilarityIndex::open(IndexPaths::in_dir(dir.path()), D).unwrap_err();
        assert!(err.is_corrupt(), "{}", err);

        let dir = tempfile::tempdir().unwrap();
        open(dir.path()).insert("a", &axis(0)).unwrap();
        fs::remove_file(dir.path().join(VECTORS_FILE)).unwrap();
        assert!(SimilarityIndex::open(IndexPaths::in_dir(dir.path()), D)
            .unwrap_err()
            .is_corrupt());
    }

    #[test]
    fn count_disagreement_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let index = open(dir.path());
        index.insert("a", &axis(0)).unwrap();
        let one_entry_ids = fs::read(dir.path().join(IDS_FILE)).unwrap();
        index.insert("b", &axis(1)).unwrap();
        fs::write(dir.path().join(IDS_FILE), one_entry_ids).unwrap();

        let err = SimilarityIndex::open(IndexPaths::in_dir(dir.path()), D).unwrap_err();
        assert!(err.is_corrupt());
        assert!(err.to_string().contains("2 entries"), "{}", err);
    }

    #[test]
    fn dimension_change_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        open(dir.path()).insert("a", &axis(0)).unwrap();
        let err = SimilarityIndex::open(IndexPaths::in_dir(dir.path()), D * 2).unwrap_err();
        assert!(err.is_corrupt());
    }

    #[test]
    fn garbage_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(VECTORS_FILE), b"\xff\xff\xff").unwrap();
        fs::write(dir.path().join(IDS_FILE), b"hello").unwrap();
        assert!(SimilarityIndex::open(IndexPaths::in_dir(dir.path()), D)
            .unwrap_err()
            .is_corrupt());
    }

    #[test]
    fn failed_persist_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"not a directory").unwrap();
        let index = SimilarityIndex::open(IndexPaths::in_dir(&blocker), D).unwrap();

        assert!(matches!(index.insert("a", &axis(0)), Err(Error::Io(_))));
        assert_eq!(index.len().unwrap(), 0);
        assert!(index.search(&axis(0), 1).unwrap().is_empty());
    }

    #[test]
    fn failed_id_write_leaves_no_vector_store() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"not a directory").unwrap();
        let paths = IndexPaths {
            vectors: dir.path().join(VECTORS_FILE),
            ids: blocker.join(IDS_FILE),
        };
        let index = SimilarityIndex::open(paths.clone(), D).unwrap();

        assert!(index.insert("a", &axis(0)).is_err());
        assert_eq!(index.len().unwrap(), 0);
        assert!(!paths.vectors.exists());
        let reopened = SimilarityIndex::open(paths, D).unwrap();
        assert!(reopened.is_empty().unwrap());
    }

    #[test]
    fn restore_rewrites_vectors_to_match_ids() {
        let dir = tempfile::tempdir().unwrap();
        let paths = IndexPaths::in_dir(dir.path());
        let mut entries = Entries::default();
        for (i, id) in ["a", "b"].iter().enumerate() {
            entries.vectors.extend_from_slice(&axis(i));
            entries.ids.push(id.to_string());
        }
        write_pair(&paths, D, &entries).unwrap();

        // vectors for a third entry land, its id mapping does not
        entries.vectors.extend_from_slice(&axis(2));
        entries.ids.push("c".to_string());
        write_vectors(&paths, D, &entries).unwrap();
        assert!(SimilarityIndex::open(paths.clone(), D).unwrap_err().is_corrupt());

        entries.truncate(2, D);
        restore_pair(&paths, D, &entries).unwrap();
        let reopened = SimilarityIndex::open(paths, D).unwrap();
        assert_eq!(reopened.len().unwrap(), 2);
        assert_eq!(reopened.search(&axis(1), 1).unwrap(), vec!["b"]);
    }

    #[test]
    fn huge_count_header_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let paths = IndexPaths::in_dir(dir.path());
        let store = VectorStoreFile {
            magic: VECTORS_MAGIC,
            version: FORMAT_VERSION,
            dimension: D as u32,
            count: u64::MAX / 4,
            data: vec![],
        };
        let map = IdMapFile {
            magic: IDS_MAGIC,
            version: FORMAT_VERSION,
            dimension: D as u32,
            ids: vec![],
        };
        fs::write(&paths.vectors, postcard::to_allocvec(&store).unwrap()).unwrap();
        fs::write(&paths.ids, postcard::to_allocvec(&map).unwrap()).unwrap();

        let err = SimilarityIndex::open(paths, D).unwrap_err();
        assert!(err.is_corrupt(), "{}", err);
    }

    #[test]
    fn concurrent_inserts_stay_in_lockstep() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 10;

        fn vector(t: usize, j: usize) -> Vec<f32> {
            let mut v = vec![0.0; D];
            v[0] = t as f32;
            v[1] = j as f32;
            v[2] = 1.0;
            v
        }

        let dir = tempfile::tempdir().unwrap();
        let index = std::sync::Arc::new(open(dir.path()));
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let index = std::sync::Arc::clone(&index);
                std::thread::spawn(move || {
                    for j in 0..PER_THREAD {
                        index.insert(&format!("t{}-{}", t, j), &vector(t, j)).unwrap();
                        let hits = index.search(&vector(t, 0), 3).unwrap();
                        assert!(!hits.is_empty());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(index.len().unwrap(), THREADS * PER_THREAD);
        for t in 0..THREADS {
            for j in 0..PER_THREAD {
                let hit = &index.neighbors(&vector(t, j), 1).unwrap()[0];
                assert_eq!(hit.image_id, format!("t{}-{}", t, j));
                assert_eq!(hit.distance, 0.0);
            }
        }

        let reopened = open(dir.path());
        assert_eq!(reopened.len().unwrap(), THREADS * PER_THREAD);
        assert_eq!(reopened.image_ids().unwrap(), index.image_ids().unwrap());
    }

    #[test]
    fn no_temp_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let index = open(dir.path());
        index.insert("a", &axis(0)).unwrap();
        index.persist().unwrap();
        let mut names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec![IDS_FILE, VECTORS_FILE]);
    }
}
