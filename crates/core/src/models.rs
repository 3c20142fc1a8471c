use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const UNKNOWN: &str = "unknown";

/// Metadata stored alongside every chunk.
///
/// `chunk_id` is the corpus-wide sequence number, not the position of the
/// chunk inside its document. The category is persisted under `categorie`
/// so existing collections stay readable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkMetadata {
    pub source: String,
    #[serde(rename = "categorie")]
    pub category: String,
    pub date: String,
    pub chunk_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexedChunk {
    pub id: String,
    pub text: String,
    pub embedding: Vec<f32>,
    pub metadata: ChunkMetadata,
}

/// A chunk as returned by metadata lookups, without its vector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkRecord {
    pub id: String,
    pub text: String,
    pub metadata: ChunkMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NearestHit {
    pub id: String,
    pub text: String,
    pub metadata: ChunkMetadata,
    pub distance: f32,
}

impl NearestHit {
    pub fn relevance_percent(&self) -> f64 {
        relevance_percent(self.distance)
    }
}

/// Relevance shown to end users: distance 0 is 100%, distance 2 or more is 0%.
/// Consumers read this number verbatim, keep the formula stable.
pub fn relevance_percent(distance: f32) -> f64 {
    ((2.0 - f64::from(distance)) / 2.0 * 100.0).max(0.0)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RelevanceBand {
    High,
    Medium,
    Low,
}

impl RelevanceBand {
    pub fn from_percent(percent: f64) -> Self {
        if percent >= 70.0 {
            RelevanceBand::High
        } else if percent >= 40.0 {
            RelevanceBand::Medium
        } else {
            RelevanceBand::Low
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataFilter {
    ChunkIdIn(Vec<u64>),
    SourceEq(String),
    CategoryEq(String),
    All(Vec<MetadataFilter>),
}

impl MetadataFilter {
    pub fn matches(&self, metadata: &ChunkMetadata) -> bool {
        match self {
            MetadataFilter::ChunkIdIn(ids) => ids.contains(&metadata.chunk_id),
            MetadataFilter::SourceEq(source) => metadata.source == *source,
            MetadataFilter::CategoryEq(category) => metadata.category == *category,
            MetadataFilter::All(filters) => filters.iter().all(|filter| filter.matches(metadata)),
        }
    }
}

/// Which chunks count as neighbors when widening a hit into a context window.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum NeighborScope {
    /// Adjacent sequence numbers anywhere in the corpus. Sequence numbers are
    /// global, so a window can pull in the tail of an unrelated document.
    #[default]
    Global,
    /// Adjacent sequence numbers restricted to the hit's own source.
    SameSource,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SearchQuery {
    pub text: String,
    pub top_k: usize,
    pub neighbor_scope: NeighborScope,
}

impl SearchQuery {
    pub const DEFAULT_TOP_K: usize = 3;

    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            top_k: Self::DEFAULT_TOP_K,
            neighbor_scope: NeighborScope::Global,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub query: String,
    /// One concatenated neighbor window per hit, in hit order.
    pub contexts: Vec<String>,
    pub hits: Vec<NearestHit>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexReport {
    pub file_id: String,
    pub inserted: usize,
    pub skipped_existing: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
pub struct IndexConfig {
    pub collection: String,
    pub embedding_model: String,
    pub dimensions: usize,
    /// Persistent working directory. `None` means a scratch directory that is
    /// removed when the index is closed.
    pub local_dir: Option<PathBuf>,
}

impl IndexConfig {
    pub const DEFAULT_COLLECTION: &'static str = "law_text";

    pub fn new(embedding_model: impl Into<String>, dimensions: usize) -> Self {
        Self {
            collection: Self::DEFAULT_COLLECTION.to_string(),
            embedding_model: embedding_model.into(),
            dimensions,
            local_dir: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(source: &str, chunk_id: u64) -> ChunkMetadata {
        ChunkMetadata {
            source: source.to_string(),
            category: "dechets".to_string(),
            date: UNKNOWN.to_string(),
            chunk_id,
        }
    }

    #[test]
    fn relevance_follows_distance_convention() {
        assert_eq!(relevance_percent(0.0), 100.0);
        assert_eq!(relevance_percent(2.0), 0.0);
        assert_eq!(relevance_percent(3.0), 0.0);
        assert_eq!(relevance_percent(1.0), 50.0);
    }

    #[test]
    fn relevance_bands_split_at_seventy_and_forty() {
        assert_eq!(RelevanceBand::from_percent(70.0), RelevanceBand::High);
        assert_eq!(RelevanceBand::from_percent(55.0), RelevanceBand::Medium);
        assert_eq!(RelevanceBand::from_percent(39.9), RelevanceBand::Low);
    }

    #[test]
    fn combined_filter_requires_every_clause() {
        let filter = MetadataFilter::All(vec![
            MetadataFilter::ChunkIdIn(vec![3, 4, 5]),
            MetadataFilter::SourceEq("arrete_2021".to_string()),
        ]);

        assert!(filter.matches(&metadata("arrete_2021", 4)));
        assert!(!filter.matches(&metadata("ordonnance_2012", 4)));
        assert!(!filter.matches(&metadata("arrete_2021", 9)));
    }

    #[test]
    fn metadata_serializes_category_under_legacy_key() -> Result<(), serde_json::Error> {
        let value = serde_json::to_value(metadata("arrete_2021", 1))?;
        assert_eq!(value["categorie"], "dechets");
        assert!(value.get("category").is_none());
        Ok(())
    }
}
