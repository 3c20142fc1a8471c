use crate::error::StorageError;
use crate::traits::RemoteStorage;
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

/// A plain directory standing in for remote storage, e.g. a mounted share.
#[derive(Debug, Clone)]
pub struct LocalDirStorage {
    root: PathBuf,
}

impl LocalDirStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(path.trim_start_matches('/'));
        let escapes = relative
            .components()
            .any(|component| !matches!(component, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(StorageError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl RemoteStorage for LocalDirStorage {
    fn backend(&self) -> &str {
        "local-dir"
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let base = self.resolve(prefix)?;
        if !base.exists() {
            return Ok(Vec::new());
        }

        let mut paths = Vec::new();
        for entry in WalkDir::new(&base) {
            let entry = entry.map_err(std::io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let joined = relative
                .components()
                .map(|component| component.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            paths.push(joined);
        }

        paths.sort_unstable();
        Ok(paths)
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        Ok(tokio::fs::read(self.resolve(path)?).await?)
    }

    async fn write(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(target, bytes).await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        match tokio::fs::remove_file(self.resolve(path)?).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn lists_nested_files_under_prefix() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let storage = LocalDirStorage::new(dir.path());
        storage.write("vector_index/law_text/records.jsonl", b"{}\n").await?;
        storage.write("vector_index/law_text/manifest.json", b"{}").await?;
        storage.write("clean_data/arrete.txt", b"texte").await?;

        let listed = storage.list("vector_index").await?;
        assert_eq!(
            listed,
            vec![
                "vector_index/law_text/manifest.json",
                "vector_index/law_text/records.jsonl",
            ]
        );
        assert_eq!(storage.read("clean_data/arrete.txt").await?, b"texte");
        Ok(())
    }

    #[tokio::test]
    async fn missing_prefix_lists_empty() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let storage = LocalDirStorage::new(dir.path().join("never-created"));
        assert!(storage.list("vector_index").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn parent_traversal_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let storage = LocalDirStorage::new(dir.path());
        assert!(matches!(
            storage.read("../etc/passwd").await,
            Err(StorageError::InvalidPath(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn deleting_twice_is_fine() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let storage = LocalDirStorage::new(dir.path());
        storage.write("a/b.txt", b"x").await?;
        storage.delete("a/b.txt").await?;
        storage.delete("a/b.txt").await?;
        assert!(storage.list("a").await?.is_empty());
        Ok(())
    }
}
