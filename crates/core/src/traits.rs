use crate::error::{StorageError, StoreError};
use crate::models::{ChunkRecord, IndexedChunk, MetadataFilter, NearestHit};
use async_trait::async_trait;

/// Local, single-writer vector index keyed by chunk id.
pub trait VectorIndex {
    fn count(&self) -> usize;

    fn contains(&self, id: &str) -> bool;

    fn ids(&self) -> Vec<String>;

    /// Inserts or replaces the record stored under `chunk.id`.
    fn upsert(&mut self, chunk: IndexedChunk) -> Result<(), StoreError>;

    /// Closest records first, at most `k` of them.
    fn query_nearest(&self, vector: &[f32], k: usize) -> Result<Vec<NearestHit>, StoreError>;

    /// Records matching `filter`, in insertion order.
    fn get_where(&self, filter: &MetadataFilter) -> Result<Vec<ChunkRecord>, StoreError>;
}

/// Durable byte storage the index is mirrored to. Paths are `/`-separated and
/// relative to the storage root.
#[async_trait]
pub trait RemoteStorage: Send + Sync {
    fn backend(&self) -> &str;

    /// Every file path under `prefix`, recursively. A prefix that does not
    /// exist yet lists as empty.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    async fn read(&self, path: &str) -> Result<Vec<u8>, StorageError>;

    async fn write(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError>;

    async fn delete(&self, path: &str) -> Result<(), StorageError>;
}
