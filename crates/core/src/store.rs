//! File-backed vector index.
//!
//! A collection lives in `<root>/<collection>/`:
//! - `manifest.json`: embedding model, dimensions and a checksum of the
//!   records file as of the last snapshot.
//! - `records.jsonl`: one [`IndexedChunk`] per line, appended on every upsert.
//!   A later line for the same id supersedes the earlier one.

use crate::error::StoreError;
use crate::models::{ChunkRecord, IndexConfig, IndexedChunk, MetadataFilter, NearestHit};
use crate::traits::VectorIndex;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const RECORDS_FILE: &str = "records.jsonl";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CollectionManifest {
    pub collection: String,
    pub embedding_model: String,
    pub dimensions: usize,
    pub record_count: usize,
    pub records_sha256: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct LocalIndexStore {
    dir: PathBuf,
    manifest: CollectionManifest,
    records: Vec<IndexedChunk>,
    positions: HashMap<String, usize>,
}

impl LocalIndexStore {
    /// Opens the collection under `root`, creating it when absent. Fails when
    /// the collection was built with another embedding model.
    pub fn open(root: &Path, config: &IndexConfig) -> Result<Self, StoreError> {
        let dir = root.join(&config.collection);
        fs::create_dir_all(&dir)?;

        let manifest_path = dir.join(MANIFEST_FILE);
        let manifest = if manifest_path.exists() {
            let manifest: CollectionManifest =
                serde_json::from_slice(&fs::read(&manifest_path)?)?;
            if manifest.embedding_model != config.embedding_model
                || manifest.dimensions != config.dimensions
            {
                return Err(StoreError::ModelMismatch {
                    collection: config.collection.clone(),
                    stored_model: manifest.embedding_model,
                    stored_dimensions: manifest.dimensions,
                    model: config.embedding_model.clone(),
                    dimensions: config.dimensions,
                });
            }
            manifest
        } else {
            let manifest = CollectionManifest {
                collection: config.collection.clone(),
                embedding_model: config.embedding_model.clone(),
                dimensions: config.dimensions,
                record_count: 0,
                records_sha256: None,
                updated_at: Utc::now(),
            };
            fs::write(&manifest_path, serde_json::to_vec_pretty(&manifest)?)?;
            manifest
        };

        let mut store = Self {
            dir,
            manifest,
            records: Vec::new(),
            positions: HashMap::new(),
        };
        store.load_records()?;

        debug!(
            collection = %store.manifest.collection,
            records = store.records.len(),
            "opened local index"
        );
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn manifest(&self) -> &CollectionManifest {
        &self.manifest
    }

    fn records_path(&self) -> PathBuf {
        self.dir.join(RECORDS_FILE)
    }

    fn load_records(&mut self) -> Result<(), StoreError> {
        let path = self.records_path();
        if !path.exists() {
            return Ok(());
        }

        if let Some(expected) = &self.manifest.records_sha256 {
            if *expected != digest_file(&path)? {
                warn!(path = %path.display(), "records changed since the last snapshot");
            }
        }
        drop_torn_tail(&path)?;

        let reader = BufReader::new(File::open(&path)?);
        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<IndexedChunk>(&line) {
                Ok(chunk) => self.insert_in_memory(chunk),
                Err(error) => {
                    warn!(path = %path.display(), line = line_no + 1, %error, "skipping malformed record");
                }
            }
        }
        Ok(())
    }

    fn insert_in_memory(&mut self, chunk: IndexedChunk) {
        match self.positions.get(&chunk.id) {
            Some(&position) => self.records[position] = chunk,
            None => {
                self.positions.insert(chunk.id.clone(), self.records.len());
                self.records.push(chunk);
            }
        }
    }

    /// Rewrites the manifest so it describes the current records file.
    pub fn write_manifest(&mut self) -> Result<(), StoreError> {
        let records_path = self.records_path();
        self.manifest.record_count = self.records.len();
        self.manifest.records_sha256 = if records_path.exists() {
            Some(digest_file(&records_path)?)
        } else {
            None
        };
        self.manifest.updated_at = Utc::now();
        fs::write(
            self.dir.join(MANIFEST_FILE),
            serde_json::to_vec_pretty(&self.manifest)?,
        )?;
        Ok(())
    }

    fn check_dimensions(&self, vector: &[f32]) -> Result<(), StoreError> {
        if vector.len() != self.manifest.dimensions {
            return Err(StoreError::DimensionMismatch {
                expected: self.manifest.dimensions,
                actual: vector.len(),
            });
        }
        Ok(())
    }
}

impl VectorIndex for LocalIndexStore {
    fn count(&self) -> usize {
        self.records.len()
    }

    fn contains(&self, id: &str) -> bool {
        self.positions.contains_key(id)
    }

    fn ids(&self) -> Vec<String> {
        self.records.iter().map(|record| record.id.clone()).collect()
    }

    fn upsert(&mut self, chunk: IndexedChunk) -> Result<(), StoreError> {
        self.check_dimensions(&chunk.embedding)?;

        let mut line = serde_json::to_vec(&chunk)?;
        line.push(b'\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.records_path())?;
        file.write_all(&line)?;
        file.flush()?;

        self.insert_in_memory(chunk);
        Ok(())
    }

    fn query_nearest(&self, vector: &[f32], k: usize) -> Result<Vec<NearestHit>, StoreError> {
        self.check_dimensions(vector)?;

        let mut scored: Vec<(f32, &IndexedChunk)> = self
            .records
            .iter()
            .map(|record| (cosine_distance(vector, &record.embedding), record))
            .collect();
        scored.sort_by(|left, right| left.0.total_cmp(&right.0));

        Ok(scored
            .into_iter()
            .take(k)
            .map(|(distance, record)| NearestHit {
                id: record.id.clone(),
                text: record.text.clone(),
                metadata: record.metadata.clone(),
                distance,
            })
            .collect())
    }

    fn get_where(&self, filter: &MetadataFilter) -> Result<Vec<ChunkRecord>, StoreError> {
        Ok(self
            .records
            .iter()
            .filter(|record| filter.matches(&record.metadata))
            .map(|record| ChunkRecord {
                id: record.id.clone(),
                text: record.text.clone(),
                metadata: record.metadata.clone(),
            })
            .collect())
    }
}

/// Cuts an unterminated last line so the next append starts on a fresh line.
fn drop_torn_tail(path: &Path) -> Result<(), StoreError> {
    let bytes = fs::read(path)?;
    if bytes.last().map_or(true, |last| *last == b'\n') {
        return Ok(());
    }

    let keep = bytes
        .iter()
        .rposition(|byte| *byte == b'\n')
        .map_or(0, |position| position + 1);
    warn!(path = %path.display(), dropped_bytes = bytes.len() - keep, "dropping torn trailing record");
    OpenOptions::new().write(true).open(path)?.set_len(keep as u64)?;
    Ok(())
}

/// `1 - cos(a, b)`, clamped to `[0, 2]`. A zero vector is treated as
/// orthogonal to everything.
pub fn cosine_distance(left: &[f32], right: &[f32]) -> f32 {
    let mut dot = 0f32;
    let mut left_norm = 0f32;
    let mut right_norm = 0f32;
    for (a, b) in left.iter().zip(right.iter()) {
        dot += a * b;
        left_norm += a * a;
        right_norm += b * b;
    }

    if left_norm == 0.0 || right_norm == 0.0 {
        return 1.0;
    }

    (1.0 - dot / (left_norm.sqrt() * right_norm.sqrt())).clamp(0.0, 2.0)
}

fn digest_file(path: &Path) -> Result<String, StoreError> {
    let bytes = fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChunkMetadata, UNKNOWN};
    use tempfile::tempdir;

    fn config() -> IndexConfig {
        IndexConfig::new("test-model", 3)
    }

    fn chunk(id: &str, source: &str, chunk_id: u64, embedding: [f32; 3]) -> IndexedChunk {
        IndexedChunk {
            id: id.to_string(),
            text: format!("text of {id}"),
            embedding: embedding.to_vec(),
            metadata: ChunkMetadata {
                source: source.to_string(),
                category: "dechets".to_string(),
                date: UNKNOWN.to_string(),
                chunk_id,
            },
        }
    }

    #[test]
    fn upserted_records_survive_reopen() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        {
            let mut store = LocalIndexStore::open(dir.path(), &config())?;
            store.upsert(chunk("a_chunk_0", "a", 1, [1.0, 0.0, 0.0]))?;
            store.upsert(chunk("a_chunk_1", "a", 2, [0.0, 1.0, 0.0]))?;
            store.write_manifest()?;
        }

        let store = LocalIndexStore::open(dir.path(), &config())?;
        assert_eq!(store.count(), 2);
        assert!(store.contains("a_chunk_1"));
        assert_eq!(store.ids(), vec!["a_chunk_0", "a_chunk_1"]);
        assert_eq!(store.manifest().record_count, 2);
        Ok(())
    }

    #[test]
    fn later_upsert_replaces_in_place() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let mut store = LocalIndexStore::open(dir.path(), &config())?;
        store.upsert(chunk("a_chunk_0", "a", 1, [1.0, 0.0, 0.0]))?;
        store.upsert(chunk("b_chunk_0", "b", 2, [0.0, 1.0, 0.0]))?;
        let mut replacement = chunk("a_chunk_0", "a", 1, [1.0, 0.0, 0.0]);
        replacement.text = "replaced".to_string();
        store.upsert(replacement)?;
        drop(store);

        let store = LocalIndexStore::open(dir.path(), &config())?;
        assert_eq!(store.count(), 2);
        let records = store.get_where(&MetadataFilter::SourceEq("a".to_string()))?;
        assert_eq!(records[0].text, "replaced");
        assert_eq!(store.ids(), vec!["a_chunk_0", "b_chunk_0"]);
        Ok(())
    }

    #[test]
    fn nearest_hits_are_ordered_by_distance() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let mut store = LocalIndexStore::open(dir.path(), &config())?;
        store.upsert(chunk("far", "a", 1, [0.0, 0.0, 1.0]))?;
        store.upsert(chunk("near", "a", 2, [1.0, 0.1, 0.0]))?;
        store.upsert(chunk("exact", "a", 3, [1.0, 0.0, 0.0]))?;

        let hits = store.query_nearest(&[1.0, 0.0, 0.0], 2)?;
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "exact");
        assert!(hits[0].distance.abs() < 1e-6);
        assert_eq!(hits[1].id, "near");
        Ok(())
    }

    #[test]
    fn opposite_vectors_are_at_distance_two() {
        let distance = cosine_distance(&[1.0, 0.0], &[-1.0, 0.0]);
        assert!((distance - 2.0).abs() < 1e-6);
        assert_eq!(cosine_distance(&[0.0, 0.0], &[1.0, 0.0]), 1.0);
    }

    #[test]
    fn wrong_dimension_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let mut store = LocalIndexStore::open(dir.path(), &config())?;
        let mut bad = chunk("a_chunk_0", "a", 1, [1.0, 0.0, 0.0]);
        bad.embedding.push(0.0);

        assert!(matches!(
            store.upsert(bad),
            Err(StoreError::DimensionMismatch { expected: 3, actual: 4 })
        ));
        assert!(store.query_nearest(&[1.0], 1).is_err());
        assert_eq!(store.count(), 0);
        Ok(())
    }

    #[test]
    fn other_embedding_model_is_refused() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        LocalIndexStore::open(dir.path(), &config())?;

        let other = IndexConfig::new("another-model", 3);
        assert!(matches!(
            LocalIndexStore::open(dir.path(), &other),
            Err(StoreError::ModelMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn malformed_lines_are_skipped() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        {
            let mut store = LocalIndexStore::open(dir.path(), &config())?;
            store.upsert(chunk("a_chunk_0", "a", 1, [1.0, 0.0, 0.0]))?;
        }
        let records = dir.path().join("law_text").join(RECORDS_FILE);
        let mut file = OpenOptions::new().append(true).open(&records)?;
        file.write_all(b"{\"id\": \"truncated\n")?;

        let store = LocalIndexStore::open(dir.path(), &config())?;
        assert_eq!(store.count(), 1);
        Ok(())
    }

    #[test]
    fn torn_trailing_record_does_not_swallow_the_next_upsert() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let records = {
            let mut store = LocalIndexStore::open(dir.path(), &config())?;
            store.upsert(chunk("a_chunk_0", "a", 1, [1.0, 0.0, 0.0]))?;
            store.dir().join(RECORDS_FILE)
        };
        let mut file = OpenOptions::new().append(true).open(&records)?;
        file.write_all(b"{\"id\":\"a_chunk_1\",\"te")?;
        drop(file);

        {
            let mut store = LocalIndexStore::open(dir.path(), &config())?;
            assert_eq!(store.count(), 1);
            store.upsert(chunk("b_chunk_0", "b", 2, [0.0, 1.0, 0.0]))?;
        }

        let store = LocalIndexStore::open(dir.path(), &config())?;
        assert_eq!(store.count(), 2);
        assert!(store.contains("b_chunk_0"));
        assert!(fs::read(&records)?.ends_with(b"\n"));
        Ok(())
    }

    #[test]
    fn filter_lookup_keeps_insertion_order() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let mut store = LocalIndexStore::open(dir.path(), &config())?;
        store.upsert(chunk("c", "x", 7, [1.0, 0.0, 0.0]))?;
        store.upsert(chunk("a", "x", 5, [1.0, 0.0, 0.0]))?;
        store.upsert(chunk("b", "y", 6, [1.0, 0.0, 0.0]))?;
        store.upsert(chunk("z", "y", 9, [1.0, 0.0, 0.0]))?;

        let records = store.get_where(&MetadataFilter::ChunkIdIn(vec![5, 6, 7]))?;
        let ids: Vec<_> = records.iter().map(|record| record.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
        Ok(())
    }
}
