//! Whole-directory mirroring of the local index to remote storage.
//!
//! The local working copy is the source of truth while the process runs. The
//! mirror is hydrated once on open and receives a full snapshot on flush.
//! There is no locking: two processes flushing the same prefix overwrite each
//! other, last writer wins.

use crate::error::{StorageError, StoreError};
use crate::models::{ChunkRecord, IndexConfig, IndexedChunk, MetadataFilter, NearestHit};
use crate::store::LocalIndexStore;
use crate::traits::{RemoteStorage, VectorIndex};
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

const CLEANUP_ATTEMPTS: u32 = 5;
const CLEANUP_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Success {
        files: usize,
    },
    /// Some transfers failed in a way that may heal; local state stays usable.
    TransientFailure {
        files: usize,
        failed: usize,
        reason: String,
    },
    FatalFailure {
        reason: String,
    },
}

impl SyncOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SyncOutcome::Success { .. })
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncOutcome::FatalFailure { .. })
    }

    fn from_transfers(files: usize, failures: Vec<StorageError>) -> Self {
        if let Some(fatal) = failures.iter().find(|error| !error.is_transient()) {
            return SyncOutcome::FatalFailure {
                reason: fatal.to_string(),
            };
        }
        match failures.first() {
            None => SyncOutcome::Success { files },
            Some(first) => SyncOutcome::TransientFailure {
                files,
                failed: failures.len(),
                reason: first.to_string(),
            },
        }
    }

    fn from_error(error: &StorageError) -> Self {
        if error.is_transient() {
            SyncOutcome::TransientFailure {
                files: 0,
                failed: 1,
                reason: error.to_string(),
            }
        } else {
            SyncOutcome::FatalFailure {
                reason: error.to_string(),
            }
        }
    }
}

/// Bulk copy between a local directory and `prefix` on a remote storage.
#[derive(Clone)]
pub struct StorageMirror {
    remote: Arc<dyn RemoteStorage>,
    prefix: String,
}

impl StorageMirror {
    pub const DEFAULT_PREFIX: &'static str = "vector_index";

    pub fn new(remote: Arc<dyn RemoteStorage>, prefix: impl Into<String>) -> Self {
        Self {
            remote,
            prefix: prefix.into().trim_matches('/').to_string(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn remote_path(&self, relative: &str) -> String {
        if self.prefix.is_empty() {
            relative.to_string()
        } else {
            format!("{}/{}", self.prefix, relative)
        }
    }

    fn relative_path<'a>(&self, remote: &'a str) -> Option<&'a str> {
        if self.prefix.is_empty() {
            return Some(remote);
        }
        remote
            .strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|rest| !rest.is_empty())
    }

    /// Downloads every file under the prefix into `local_root`. An empty or
    /// missing prefix is a successful sync of zero files.
    pub async fn hydrate(&self, local_root: &Path) -> SyncOutcome {
        let listed = match self.remote.list(&self.prefix).await {
            Ok(listed) => listed,
            Err(error) => return SyncOutcome::from_error(&error),
        };

        let mut files = 0;
        let mut failures = Vec::new();
        for remote_path in listed {
            let Some(relative) = self.relative_path(&remote_path) else {
                continue;
            };
            let Some(target) = local_target(local_root, relative) else {
                failures.push(StorageError::InvalidPath(remote_path.clone()));
                continue;
            };

            match self.download(&remote_path, &target).await {
                Ok(()) => files += 1,
                Err(error) => {
                    warn!(backend = self.remote.backend(), path = %remote_path, %error, "mirror download failed");
                    failures.push(error);
                }
            }
        }

        SyncOutcome::from_transfers(files, failures)
    }

    async fn download(&self, remote_path: &str, target: &Path) -> Result<(), StorageError> {
        let bytes = self.remote.read(remote_path).await?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(target, bytes).await?;
        Ok(())
    }

    /// Uploads every file of `local_root`, then removes remote files under the
    /// prefix that no longer exist locally. Pruning only happens after a
    /// complete upload.
    pub async fn publish(&self, local_root: &Path) -> SyncOutcome {
        let mut uploaded = HashSet::new();
        let mut failures = Vec::new();

        for relative in local_files(local_root) {
            let remote_path = self.remote_path(&relative);
            let result = match tokio::fs::read(local_root.join(&relative)).await {
                Ok(bytes) => self.remote.write(&remote_path, &bytes).await,
                Err(error) => Err(error.into()),
            };
            match result {
                Ok(()) => {
                    uploaded.insert(remote_path);
                }
                Err(error) => {
                    warn!(backend = self.remote.backend(), path = %remote_path, %error, "mirror upload failed");
                    failures.push(error);
                }
            }
        }

        if failures.is_empty() {
            match self.remote.list(&self.prefix).await {
                Ok(existing) => {
                    for stale in existing.iter().filter(|path| !uploaded.contains(*path)) {
                        debug!(path = %stale, "pruning stale mirror file");
                        if let Err(error) = self.remote.delete(stale).await {
                            warn!(path = %stale, %error, "could not prune stale mirror file");
                        }
                    }
                }
                Err(error) => {
                    warn!(%error, "could not list mirror for pruning");
                }
            }
        }

        SyncOutcome::from_transfers(uploaded.len(), failures)
    }
}

fn local_target(root: &Path, relative: &str) -> Option<PathBuf> {
    let relative = Path::new(relative);
    relative
        .components()
        .all(|component| matches!(component, Component::Normal(_)))
        .then(|| root.join(relative))
}

fn local_files(root: &Path) -> Vec<String> {
    let mut files = WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            entry.path().strip_prefix(root).ok().map(|relative| {
                relative
                    .components()
                    .map(|component| component.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/")
            })
        })
        .collect::<Vec<_>>();
    files.sort_unstable();
    files
}

/// The index as the rest of the pipeline sees it: a local store in a working
/// directory, optionally backed by a mirror, with a dirty flag raised by every
/// successful upsert.
pub struct MirroredIndex {
    store: LocalIndexStore,
    mirror: Option<StorageMirror>,
    workdir: PathBuf,
    scratch: bool,
    dirty: bool,
    hydrated: bool,
}

impl MirroredIndex {
    /// Prepares the working directory, hydrates it from the mirror and opens
    /// the collection. Only a fatal mirror failure (bad credentials, bad
    /// config) aborts; transient failures leave an empty or partial copy that
    /// [`MirroredIndex::flush`] will not publish.
    pub async fn open(
        config: &IndexConfig,
        mirror: Option<StorageMirror>,
    ) -> Result<Self, StoreError> {
        let (workdir, scratch) = match &config.local_dir {
            Some(dir) => (dir.clone(), false),
            None => (
                std::env::temp_dir().join(format!("lawtext_index_{}", Uuid::new_v4())),
                true,
            ),
        };
        tokio::fs::create_dir_all(&workdir).await?;
        info!(workdir = %workdir.display(), scratch, "index working directory ready");

        let mut hydrated = true;
        if let Some(mirror) = &mirror {
            match mirror.hydrate(&workdir).await {
                SyncOutcome::Success { files } => {
                    info!(prefix = mirror.prefix(), files, "hydrated index from mirror");
                }
                SyncOutcome::TransientFailure {
                    files,
                    failed,
                    reason,
                } => {
                    warn!(prefix = mirror.prefix(), files, failed, %reason, "partial mirror hydration, continuing with local state");
                    hydrated = false;
                }
                SyncOutcome::FatalFailure { reason } => {
                    if scratch {
                        remove_scratch(&workdir).await;
                    }
                    return Err(StoreError::Mirror(reason));
                }
            }
        }

        let store = match LocalIndexStore::open(&workdir, config) {
            Ok(store) => store,
            Err(error) => {
                if scratch {
                    remove_scratch(&workdir).await;
                }
                return Err(error);
            }
        };

        Ok(Self {
            store,
            mirror,
            workdir,
            scratch,
            dirty: false,
            hydrated,
        })
    }

    pub fn store(&self) -> &LocalIndexStore {
        &self.store
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// False when the mirror could only be partly copied on open.
    pub fn is_hydrated(&self) -> bool {
        self.hydrated
    }

    /// Pushes pending changes to the mirror. A clean index is not uploaded,
    /// and neither is a partly hydrated one.
    pub async fn flush(&mut self) -> SyncOutcome {
        if !self.dirty {
            return SyncOutcome::Success { files: 0 };
        }
        if !self.hydrated && self.mirror.is_some() {
            warn!(workdir = %self.workdir.display(), "index was partly hydrated, not publishing");
            return SyncOutcome::TransientFailure {
                files: 0,
                failed: 0,
                reason: "working copy was only partly hydrated from the mirror".to_string(),
            };
        }
        self.force_flush().await
    }

    /// Snapshots the manifest and uploads the whole working directory, even
    /// after a partial hydration.
    pub async fn force_flush(&mut self) -> SyncOutcome {
        if let Err(error) = self.store.write_manifest() {
            warn!(%error, "could not write index manifest");
            return SyncOutcome::TransientFailure {
                files: 0,
                failed: 1,
                reason: error.to_string(),
            };
        }

        let Some(mirror) = &self.mirror else {
            self.dirty = false;
            return SyncOutcome::Success { files: 0 };
        };

        let outcome = mirror.publish(&self.workdir).await;
        match &outcome {
            SyncOutcome::Success { files } => {
                info!(prefix = mirror.prefix(), files, "index flushed to mirror");
                self.dirty = false;
                self.hydrated = true;
            }
            SyncOutcome::TransientFailure { failed, reason, .. } => {
                warn!(prefix = mirror.prefix(), failed, %reason, "index flush incomplete");
            }
            SyncOutcome::FatalFailure { reason } => {
                warn!(prefix = mirror.prefix(), %reason, "index flush failed");
            }
        }
        outcome
    }

    /// Releases the working copy. A scratch directory is removed, retrying a
    /// few times in case files are still held open.
    pub async fn close(self) {
        if self.scratch {
            let workdir = self.workdir.clone();
            drop(self.store);
            remove_scratch(&workdir).await;
        }
    }

    /// Flush then close. The scratch copy is discarded whatever the outcome.
    pub async fn shutdown(mut self) -> SyncOutcome {
        let outcome = self.flush().await;
        self.close().await;
        outcome
    }
}

async fn remove_scratch(dir: &Path) {
    for attempt in 1..=CLEANUP_ATTEMPTS {
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => return,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return,
            Err(error) if attempt == CLEANUP_ATTEMPTS => {
                warn!(path = %dir.display(), %error, attempts = attempt, "giving up on scratch directory cleanup");
            }
            Err(error) => {
                debug!(path = %dir.display(), %error, attempt, "scratch directory busy, retrying");
                tokio::time::sleep(CLEANUP_BACKOFF).await;
            }
        }
    }
}

impl VectorIndex for MirroredIndex {
    fn count(&self) -> usize {
        self.store.count()
    }

    fn contains(&self, id: &str) -> bool {
        self.store.contains(id)
    }

    fn ids(&self) -> Vec<String> {
        self.store.ids()
    }

    fn upsert(&mut self, chunk: IndexedChunk) -> Result<(), StoreError> {
        self.store.upsert(chunk)?;
        self.dirty = true;
        Ok(())
    }

    fn query_nearest(&self, vector: &[f32], k: usize) -> Result<Vec<NearestHit>, StoreError> {
        self.store.query_nearest(vector, k)
    }

    fn get_where(&self, filter: &MetadataFilter) -> Result<Vec<ChunkRecord>, StoreError> {
        self.store.get_where(filter)
    }
}
