use crate::category::CategoryClassifier;
use crate::chunking::{chunk_text, extract_date, file_id_from_path, make_chunk_key, ChunkingConfig};
use crate::embeddings::Embedder;
use crate::error::IngestError;
use crate::models::{ChunkMetadata, IndexReport, IndexedChunk};
use crate::traits::{RemoteStorage, VectorIndex};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub fn discover_text_files(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        let is_text = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("txt"));

        if is_text {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

#[derive(Debug, Clone)]
pub struct SkippedFile {
    pub path: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct IngestionReport {
    pub documents: Vec<IndexReport>,
    pub skipped_files: Vec<SkippedFile>,
}

impl IngestionReport {
    pub fn inserted(&self) -> usize {
        self.documents.iter().map(|report| report.inserted).sum()
    }

    pub fn failed(&self) -> usize {
        self.documents.iter().map(|report| report.failed).sum()
    }
}

/// Chunk -> classify -> embed -> upsert for one document at a time.
pub struct Indexer<'a, S, E>
where
    S: VectorIndex,
    E: Embedder + ?Sized,
{
    store: &'a mut S,
    embedder: &'a E,
    classifier: &'a CategoryClassifier,
    chunking: ChunkingConfig,
}

impl<'a, S, E> Indexer<'a, S, E>
where
    S: VectorIndex,
    E: Embedder + ?Sized,
{
    pub fn new(store: &'a mut S, embedder: &'a E, classifier: &'a CategoryClassifier) -> Self {
        Self {
            store,
            embedder,
            classifier,
            chunking: ChunkingConfig::default(),
        }
    }

    pub fn with_chunking(mut self, chunking: ChunkingConfig) -> Self {
        self.chunking = chunking;
        self
    }

    /// Indexes a document. Existing ids and the sequence seed are read from
    /// the store, so re-running over the same document inserts nothing.
    pub async fn index_document(
        &mut self,
        text: &str,
        file_id: &str,
    ) -> Result<IndexReport, IngestError> {
        let chunks = chunk_text(text, self.chunking)?;
        let date = extract_date(text)?;
        let existing_ids: HashSet<String> = self.store.ids().into_iter().collect();
        let sequence_seed = self.store.count() as u64;

        let report = self
            .index_chunks(file_id, &chunks, &date, &existing_ids, sequence_seed)
            .await;

        if report.inserted > 0 || report.failed > 0 {
            info!(
                file_id,
                inserted = report.inserted,
                skipped = report.skipped_existing,
                failed = report.failed,
                "indexed document"
            );
        } else {
            debug!(file_id, skipped = report.skipped_existing, "document already indexed");
        }
        Ok(report)
    }

    /// Every chunk consumes the next sequence number in order, whether it is
    /// inserted, already present or fails, so `chunk_id` of local chunk `i` is
    /// `sequence_seed + i + 1`. A failing chunk is counted and skipped.
    pub async fn index_chunks(
        &mut self,
        file_id: &str,
        chunks: &[String],
        date: &str,
        existing_ids: &HashSet<String>,
        sequence_seed: u64,
    ) -> IndexReport {
        let mut report = IndexReport {
            file_id: file_id.to_string(),
            ..IndexReport::default()
        };
        let mut sequence = sequence_seed;

        for (local_index, text) in chunks.iter().enumerate() {
            sequence += 1;
            let id = make_chunk_key(file_id, local_index);
            if existing_ids.contains(&id) || self.store.contains(&id) {
                report.skipped_existing += 1;
                continue;
            }

            let category = self.classifier.classify(text);
            let embedding = match self.embedder.embed(text).await {
                Ok(embedding) => embedding,
                Err(error) => {
                    warn!(chunk = %id, %error, "embedding failed, chunk not indexed");
                    report.failed += 1;
                    continue;
                }
            };

            let chunk = IndexedChunk {
                id,
                text: text.clone(),
                embedding,
                metadata: ChunkMetadata {
                    source: file_id.to_string(),
                    category,
                    date: date.to_string(),
                    chunk_id: sequence,
                },
            };

            let chunk_key = chunk.id.clone();
            match self.store.upsert(chunk) {
                Ok(()) => report.inserted += 1,
                Err(error) => {
                    warn!(chunk = %chunk_key, %error, "store rejected chunk");
                    report.failed += 1;
                }
            }
        }

        report
    }

    /// Indexes every `.txt` file below `folder`. Unreadable files are
    /// reported and skipped.
    pub async fn index_folder(&mut self, folder: &Path) -> Result<IngestionReport, IngestError> {
        let files = discover_text_files(folder);

        if files.is_empty() {
            return Err(IngestError::InvalidArgument(format!(
                "no text files found in {}",
                folder.display()
            )));
        }

        let mut report = IngestionReport::default();
        for path in files {
            let loaded = file_id_from_path(&path)
                .and_then(|file_id| Ok((file_id, fs::read_to_string(&path)?)));

            match loaded {
                Ok((file_id, text)) => {
                    let document = self.index_document(&text, &file_id).await?;
                    report.documents.push(document);
                }
                Err(error) => {
                    warn!(path = %path.display(), %error, "skipping document");
                    report.skipped_files.push(SkippedFile {
                        path: path.display().to_string(),
                        reason: error.to_string(),
                    });
                }
            }
        }

        Ok(report)
    }

    /// Indexes every document stored under `prefix` on remote storage. The
    /// file id is the remote file name without extension.
    pub async fn index_remote(
        &mut self,
        storage: &dyn RemoteStorage,
        prefix: &str,
    ) -> Result<IngestionReport, IngestError> {
        let paths = storage.list(prefix).await?;
        if paths.is_empty() {
            warn!(backend = storage.backend(), prefix, "no documents found on remote storage");
        }

        let mut report = IngestionReport::default();
        for remote_path in paths {
            let loaded = match storage.read(&remote_path).await {
                Ok(bytes) => file_id_from_path(Path::new(&remote_path)).and_then(|file_id| {
                    String::from_utf8(bytes)
                        .map(|text| (file_id, text))
                        .map_err(|_| IngestError::InvalidUtf8(remote_path.clone()))
                }),
                Err(error) => Err(error.into()),
            };

            match loaded {
                Ok((file_id, text)) => {
                    let document = self.index_document(&text, &file_id).await?;
                    report.documents.push(document);
                }
                Err(error) => {
                    warn!(path = %remote_path, %error, "skipping remote document");
                    report.skipped_files.push(SkippedFile {
                        path: remote_path,
                        reason: error.to_string(),
                    });
                }
            }
        }

        Ok(report)
    }
}
