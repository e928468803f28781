use std::collections::BTreeMap;
use std::io::Cursor;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use tokio::{io::AsyncReadExt, sync::RwLock};

use storage_driver::{BoxReader, Driver, Metadata, Reader, StorageError, StorageErrorKind};

const ENGINE: &str = "memory";

fn offset_error(path: &Utf8Path, offset: u64, size: u64) -> StorageError {
    StorageError::builder(
        ENGINE,
        StorageErrorKind::Io,
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("offset {offset} is past the end of the file ({size} bytes)"),
        ),
    )
    .path(path.as_str())
    .build()
}

#[derive(Debug, Clone)]
struct MemoryFileItem {
    created: DateTime<Utc>,
    data: Vec<u8>,
}

impl From<Vec<u8>> for MemoryFileItem {
    fn from(data: Vec<u8>) -> Self {
        Self {
            created: Utc::now(),
            data,
        }
    }
}

impl From<&MemoryFileItem> for Metadata {
    fn from(value: &MemoryFileItem) -> Self {
        Self {
            created: value.created,
            is_dir: false,
            size: value.data.len() as u64,
        }
    }
}

/// Storage driver that stores files in memory.
///
/// Directories are implicit: a directory exists while at least one file
/// lives underneath it.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    files: RwLock<BTreeMap<Utf8PathBuf, MemoryFileItem>>,
}

impl MemoryStorage {
    /// Create a new, empty `MemoryStorage` instance.
    pub fn new() -> Self {
        Self::default()
    }
}

fn is_under(candidate: &Utf8Path, dir: &Utf8Path) -> bool {
    candidate != dir && candidate.starts_with(dir)
}

#[async_trait::async_trait]
impl Driver for MemoryStorage {
    fn name(&self) -> &'static str {
        ENGINE
    }

    async fn stat(&self, path: &Utf8Path) -> Result<Metadata, StorageError> {
        let files = self.files.read().await;
        if let Some(item) = files.get(path) {
            return Ok(item.into());
        }

        files
            .iter()
            .filter(|(key, _)| is_under(key, path))
            .map(|(_, item)| item.created)
            .min()
            .map(|created| Metadata {
                size: 0,
                is_dir: true,
                created,
            })
            .ok_or_else(|| StorageError::not_found(ENGINE, path.as_str()))
    }

    async fn get_content(&self, path: &Utf8Path) -> Result<Vec<u8>, StorageError> {
        let files = self.files.read().await;
        files
            .get(path)
            .map(|item| item.data.clone())
            .ok_or_else(|| StorageError::not_found(ENGINE, path.as_str()))
    }

    async fn put_content(&self, path: &Utf8Path, content: &[u8]) -> Result<(), StorageError> {
        let mut files = self.files.write().await;
        files.insert(path.to_owned(), content.to_vec().into());
        Ok(())
    }

    async fn reader(&self, path: &Utf8Path, offset: u64) -> Result<BoxReader, StorageError> {
        let files = self.files.read().await;
        let item = files
            .get(path)
            .ok_or_else(|| StorageError::not_found(ENGINE, path.as_str()))?;

        let size = item.data.len() as u64;
        if offset > size {
            return Err(offset_error(path, offset, size));
        }

        let data = item.data[offset as usize..].to_vec();
        Ok(Box::new(Cursor::new(data)))
    }

    async fn write_stream(
        &self,
        path: &Utf8Path,
        offset: u64,
        reader: &mut Reader<'_>,
    ) -> Result<u64, StorageError> {
        let mut buf = Vec::new();
        reader
            .read_to_end(&mut buf)
            .await
            .map_err(|err| StorageError::from_io(ENGINE, path.as_str(), err))?;

        let mut files = self.files.write().await;
        let size = files.get(path).map_or(0, |item| item.data.len() as u64);
        if offset > size {
            return Err(offset_error(path, offset, size));
        }

        let item = files
            .entry(path.to_owned())
            .or_insert_with(|| Vec::new().into());
        item.data.truncate(offset as usize);
        item.data.extend_from_slice(&buf);
        Ok(buf.len() as u64)
    }

    async fn move_to(
        &self,
        source: &Utf8Path,
        destination: &Utf8Path,
    ) -> Result<(), StorageError> {
        let mut files = self.files.write().await;
        if !files.contains_key(source) {
            return Err(StorageError::not_found(ENGINE, source.as_str()));
        }
        if files.contains_key(destination) {
            return Err(StorageError::already_exists(ENGINE, destination.as_str()));
        }

        if let Some(item) = files.remove(source) {
            files.insert(destination.to_owned(), item);
        }
        Ok(())
    }

    async fn delete(&self, path: &Utf8Path) -> Result<(), StorageError> {
        let mut files = self.files.write().await;
        let doomed: Vec<Utf8PathBuf> = files
            .keys()
            .filter(|key| key.as_path() == path || is_under(key, path))
            .cloned()
            .collect();

        if doomed.is_empty() {
            return Err(StorageError::not_found(ENGINE, path.as_str()));
        }

        tracing::trace!(%path, count = doomed.len(), "delete from memory");
        for key in doomed {
            files.remove(&key);
        }
        Ok(())
    }

    async fn list(&self, prefix: &Utf8Path) -> Result<Vec<String>, StorageError> {
        tracing::trace!(%prefix, "list memory storage");

        let files = self.files.read().await;
        Ok(files
            .keys()
            .filter(|key| key.starts_with(prefix))
            .map(|key| key.to_string())
            .collect())
    }
}
