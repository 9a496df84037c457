/// Remote object storage consumed by the shipping loop and the CLI.
///
/// The daemon only needs three calls: upload a file into a container,
/// download an object by id, and page through a container's entries.
/// Every call is slow and fallible and is made one file at a time.
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;

use crate::error::OrchestrationError;

/// Page size used when searching a container by name.
pub const LIST_PAGE_SIZE: usize = 1000;

/// One object in a remote container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteEntry {
    pub id: String,
    pub name: String,
}

#[async_trait]
pub trait RemoteStorage: Send + Sync {
    /// Uploads `local` into `container` as `remote_name`.
    async fn upload(&self, local: &Path, remote_name: &str, container: &str) -> Result<(), OrchestrationError>;

    /// Downloads object `object_id` into `dest_dir`, keeping its remote name.
    async fn download(&self, object_id: &str, dest_dir: &Path) -> Result<PathBuf, OrchestrationError>;

    /// Lists up to `limit` entries of `container`, skipping the first `offset`.
    async fn list_entries(
        &self,
        container: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<RemoteEntry>, OrchestrationError>;
}

/// Finds the entry called `name` in `container` and downloads it into `dest_dir`.
pub async fn fetch_by_name(
    storage: &dyn RemoteStorage,
    container: &str,
    name: &str,
    dest_dir: &Path,
) -> Result<PathBuf, OrchestrationError> {
    let mut offset = 0;
    loop {
        let page = storage.list_entries(container, LIST_PAGE_SIZE, offset).await?;
        if let Some(entry) = page.iter().find(|e| e.name == name) {
            return storage.download(&entry.id, dest_dir).await;
        }
        if page.len() < LIST_PAGE_SIZE {
            return Err(OrchestrationError::transfer(
                name,
                format!("no entry named {name} in container {container}"),
            ));
        }
        offset += page.len();
    }
}

/// Storage that keeps each container as a subdirectory of `root`.
///
/// Object ids are `<container>/<name>`.
#[derive(Debug, Clone)]
pub struct DirectoryStorage {
    root: PathBuf,
}

impl DirectoryStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolves an object id, rejecting ids that would escape `root`.
    fn object_path(&self, object_id: &str) -> Option<PathBuf> {
        let (container, name) = object_id.split_once('/')?;
        let is_plain = |s: &str| !s.is_empty() && s != "." && s != ".." && !s.contains(['/', '\\']);
        (is_plain(container) && is_plain(name)).then(|| self.root.join(container).join(name))
    }
}

#[async_trait]
impl RemoteStorage for DirectoryStorage {
    async fn upload(&self, local: &Path, remote_name: &str, container: &str) -> Result<(), OrchestrationError> {
        let id = format!("{container}/{remote_name}");
        let target = self
            .object_path(&id)
            .ok_or_else(|| OrchestrationError::transfer(remote_name, format!("invalid object id {id}")))?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| OrchestrationError::transfer(remote_name, e))?;
        }
        tokio::fs::copy(local, &target)
            .await
            .map_err(|e| OrchestrationError::transfer(remote_name, format!("{}: {e}", local.display())))?;
        log::debug!("[storage] Uploaded {} as {id}", local.display());
        Ok(())
    }

    async fn download(&self, object_id: &str, dest_dir: &Path) -> Result<PathBuf, OrchestrationError> {
        let source = self
            .object_path(object_id)
            .ok_or_else(|| OrchestrationError::transfer(object_id, "invalid object id"))?;
        let file_name = source
            .file_name()
            .ok_or_else(|| OrchestrationError::transfer(object_id, "invalid object id"))?;
        tokio::fs::create_dir_all(dest_dir)
            .await
            .map_err(|e| OrchestrationError::transfer(object_id, e))?;
        let target = dest_dir.join(file_name);
        tokio::fs::copy(&source, &target)
            .await
            .map_err(|e| OrchestrationError::transfer(object_id, e))?;
        Ok(target)
    }

    async fn list_entries(
        &self,
        container: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<RemoteEntry>, OrchestrationError> {
        let dir = self.root.join(container);
        let mut reader = match tokio::fs::read_dir(&dir).await {
            Ok(reader) => reader,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(OrchestrationError::transfer(container, e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| OrchestrationError::transfer(container, e))?
        {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        // Stable order so offsets page consistently.
        names.sort();

        Ok(names
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|name| RemoteEntry {
                id: format!("{container}/{name}"),
                name,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded(names: &[&str]) -> (tempfile::TempDir, DirectoryStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = DirectoryStorage::new(dir.path().join("remote"));
        let local = dir.path().join("local.bin");
        std::fs::write(&local, b"payload").unwrap();
        for name in names {
            storage.upload(&local, name, "videos").await.unwrap();
        }
        (dir, storage)
    }

    #[tokio::test]
    async fn upload_then_list_returns_sorted_entries() {
        let (_dir, storage) = seeded(&["b.mp4", "a.mp4"]).await;
        let entries = storage.list_entries("videos", 10, 0).await.unwrap();
        assert_eq!(
            entries,
            vec![
                RemoteEntry { id: "videos/a.mp4".into(), name: "a.mp4".into() },
                RemoteEntry { id: "videos/b.mp4".into(), name: "b.mp4".into() },
            ]
        );
    }

    #[tokio::test]
    async fn list_entries_honours_limit_and_offset() {
        let (_dir, storage) = seeded(&["a", "b", "c", "d"]).await;
        let page = storage.list_entries("videos", 2, 1).await.unwrap();
        let names: Vec<_> = page.into_iter().map(|e| e.name).collect();
        assert_eq!(names, ["b", "c"]);
    }

    #[tokio::test]
    async fn unknown_container_lists_nothing() {
        let (_dir, storage) = seeded(&[]).await;
        assert!(storage.list_entries("nope", 10, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn upload_of_missing_file_is_a_transfer_error() {
        let (dir, storage) = seeded(&[]).await;
        let err = storage
            .upload(&dir.path().join("missing.mp4"), "missing.mp4", "videos")
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::Transfer { .. }));
    }

    #[tokio::test]
    async fn object_ids_cannot_escape_root() {
        let (dir, storage) = seeded(&["a.mp4"]).await;
        assert!(storage.download("../remote/a.mp4", dir.path()).await.is_err());
        assert!(storage.download("videos/..", dir.path()).await.is_err());
    }

    #[tokio::test]
    async fn fetch_by_name_downloads_matching_entry() {
        let (dir, storage) = seeded(&["a.mp4", "b.mp4"]).await;
        let dest = dir.path().join("temp");
        let path = fetch_by_name(&storage, "videos", "b.mp4", &dest).await.unwrap();
        assert_eq!(path, dest.join("b.mp4"));
        assert_eq!(std::fs::read(path).unwrap(), b"payload");
    }

    #[tokio::test]
    async fn fetch_by_name_reports_missing_entry() {
        let (dir, storage) = seeded(&["a.mp4"]).await;
        let err = fetch_by_name(&storage, "videos", "zzz.mp4", dir.path()).await.unwrap_err();
        assert!(err.to_string().contains("zzz.mp4"));
    }
}
