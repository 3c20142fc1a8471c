pub mod category;
pub mod chunking;
pub mod embeddings;
pub mod error;
pub mod ingest;
pub mod mirror;
pub mod models;
pub mod query;
pub mod store;
pub mod stores;
pub mod traits;

pub use category::{CategoryClassifier, CategoryLexicon};
pub use chunking::{chunk_text, extract_date, file_id_from_path, make_chunk_key, ChunkingConfig};
pub use embeddings::{
    CharacterNgramEmbedder, Embedder, OllamaEmbedder, DEFAULT_EMBEDDING_DIMENSIONS,
};
pub use error::{
    EmbeddingError, IngestError, LexiconError, SearchError, StorageError, StoreError,
};
pub use ingest::{discover_text_files, Indexer, IngestionReport, SkippedFile};
pub use mirror::{MirroredIndex, StorageMirror, SyncOutcome};
pub use models::{
    relevance_percent, ChunkMetadata, ChunkRecord, IndexConfig, IndexReport, IndexedChunk,
    MetadataFilter, NearestHit, NeighborScope, RelevanceBand, SearchQuery, SearchResult, UNKNOWN,
};
pub use query::QueryEngine;
pub use store::{CollectionManifest, LocalIndexStore};
pub use stores::{AzureBlobStorage, LocalDirStorage};
pub use traits::{RemoteStorage, VectorIndex};
