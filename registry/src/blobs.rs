//! Repository-scoped access to the blob store.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use storage::{BoxReader, Storage, StorageConfig};
use uuid::Uuid;

use crate::config::RegistryConfig;
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::layer::Layer;
use crate::paths::PathBuilder;
use crate::upload::BlobUpload;

/// Registry content over one storage backend.
///
/// The backend and the path layout are injected here and shared by every
/// repository handed out by [`Registry::repository`].
#[derive(Debug, Clone)]
pub struct Registry {
    storage: Storage,
    paths: Arc<PathBuilder>,
}

impl Registry {
    /// Create a registry over `storage`, laid out by `paths`.
    pub fn new(storage: Storage, paths: PathBuilder) -> Self {
        Self {
            storage,
            paths: Arc::new(paths),
        }
    }

    /// Create a registry from configuration, building its storage backend.
    pub fn from_config(config: RegistryConfig) -> RegistryResult<Self> {
        let storage = config.storage.build()?;
        Ok(Self::new(storage, PathBuilder::new(config.root)))
    }

    /// An in-memory registry with the default layout.
    pub fn memory() -> RegistryResult<Self> {
        let storage = StorageConfig::Memory.build()?;
        Ok(Self::new(storage, PathBuilder::default()))
    }

    /// Get the blob store for the repository called `name`.
    pub fn repository(&self, name: &str) -> RegistryResult<BlobStore> {
        validate_repository(name)?;
        Ok(BlobStore {
            registry: self.clone(),
            name: name.to_owned(),
        })
    }

    /// The storage backend.
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// The path layout.
    pub fn paths(&self) -> &PathBuilder {
        &self.paths
    }
}

/// The blobs of one repository.
///
/// Fetching by digest looks only at the shared blob namespace, so content
/// committed through any repository can be fetched through any other.
#[derive(Debug, Clone)]
pub struct BlobStore {
    registry: Registry,
    name: String,
}

impl BlobStore {
    /// The repository name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn storage(&self) -> &Storage {
        &self.registry.storage
    }

    pub(crate) fn paths(&self) -> &PathBuilder {
        &self.registry.paths
    }

    /// Resolve a committed digest to a layer.
    #[tracing::instrument(skip(self), fields(repository = %self.name))]
    pub async fn fetch(&self, digest: &Digest) -> RegistryResult<Layer> {
        let path = self.paths().blob_data_path(digest);
        let metadata = match self.storage().stat(&path).await {
            Ok(metadata) => metadata,
            Err(err) if err.is_not_found() => {
                return Err(RegistryError::BlobNotFound(digest.clone()));
            }
            Err(err) => return Err(err.into()),
        };

        Ok(Layer {
            repository: self.name.clone(),
            digest: digest.clone(),
            size: metadata.size,
            path,
            created: metadata.created,
        })
    }

    /// Whether a blob with this digest has been committed.
    pub async fn exists(&self, digest: &Digest) -> RegistryResult<bool> {
        let path = self.paths().blob_data_path(digest);
        Ok(self.storage().exists(&path).await?)
    }

    /// Whether this repository links the digest.
    pub async fn linked(&self, digest: &Digest) -> RegistryResult<bool> {
        let path = self.paths().layer_link_path(&self.name, digest);
        match self.storage().get_content(&path).await {
            Ok(content) => Ok(content == digest.as_str().as_bytes()),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Remove this repository's link to the digest. The blob itself is kept.
    #[tracing::instrument(skip(self), fields(repository = %self.name))]
    pub async fn unlink(&self, digest: &Digest) -> RegistryResult<()> {
        let path = self.paths().layer_link_path(&self.name, digest);
        match self.storage().delete(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => Err(RegistryError::BlobNotFound(digest.clone())),
            Err(err) => Err(err.into()),
        }
    }

    /// Open the content of a layer for reading.
    pub async fn open(&self, layer: &Layer) -> RegistryResult<BoxReader> {
        match self.storage().reader(&layer.path, 0).await {
            Ok(reader) => Ok(reader),
            Err(err) if err.is_not_found() => Err(RegistryError::BlobNotFound(layer.digest.clone())),
            Err(err) => Err(err.into()),
        }
    }

    /// Start a new upload session in this repository.
    #[tracing::instrument(skip(self), fields(repository = %self.name))]
    pub async fn upload(&self) -> RegistryResult<BlobUpload> {
        let id = Uuid::new_v4();
        let started_at = Utc::now();

        let path = self.paths().upload_started_at_path(&self.name, id);
        self.storage()
            .put_content(&path, started_at.to_rfc3339().as_bytes())
            .await?;

        tracing::debug!(upload.id = %id, "Started upload");
        Ok(BlobUpload::new(self.clone(), id, started_at, 0))
    }

    /// Reopen an upload session started earlier, continuing at the end of the
    /// content written so far.
    #[tracing::instrument(skip(self), fields(repository = %self.name))]
    pub async fn resume(&self, id: Uuid) -> RegistryResult<BlobUpload> {
        let path = self.paths().upload_started_at_path(&self.name, id);
        let record = match self.storage().get_content(&path).await {
            Ok(record) => record,
            Err(err) if err.is_not_found() => return Err(RegistryError::UploadUnknown(id)),
            Err(err) => return Err(err.into()),
        };

        let started_at = std::str::from_utf8(&record)
            .ok()
            .and_then(|s| DateTime::parse_from_rfc3339(s.trim()).ok())
            .map(|t| t.with_timezone(&Utc))
            .ok_or_else(|| {
                tracing::warn!(upload.id = %id, "Unreadable upload start record");
                RegistryError::UploadUnknown(id)
            })?;

        let data = self.paths().upload_data_path(&self.name, id);
        let offset = match self.storage().stat(&data).await {
            Ok(metadata) => metadata.size,
            Err(err) if err.is_not_found() => 0,
            Err(err) => return Err(err.into()),
        };

        Ok(BlobUpload::new(self.clone(), id, started_at, offset))
    }

    /// Record that this repository contains `digest`.
    pub(crate) async fn link(&self, digest: &Digest) -> RegistryResult<()> {
        let path = self.paths().layer_link_path(&self.name, digest);
        self.storage()
            .put_content(&path, digest.as_str().as_bytes())
            .await?;
        Ok(())
    }
}

/// Repository names are `/`-separated components of lowercase alphanumerics,
/// joined within a component by single `.`, `_` or `-` separators.
fn validate_repository(name: &str) -> RegistryResult<()> {
    let valid = !name.is_empty()
        && name.split('/').all(|component| {
            !component.is_empty()
                && component
                    .split(['.', '_', '-'])
                    .all(|part| {
                        !part.is_empty()
                            && part
                                .bytes()
                                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
                    })
        });

    if valid {
        Ok(())
    } else {
        Err(RegistryError::InvalidRepository(name.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repository_names() {
        for name in ["foo", "foo/bar", "library/ubuntu", "a-b.c_d/e0"] {
            assert!(validate_repository(name).is_ok(), "{name}");
        }
        for name in ["", "Foo", "foo/", "/foo", "foo//bar", "foo--bar", "-foo", "foo/../bar"] {
            assert!(
                matches!(
                    validate_repository(name),
                    Err(RegistryError::InvalidRepository(_))
                ),
                "{name}"
            );
        }
    }

    #[tokio::test]
    async fn fetch_unknown_blob() {
        let registry = Registry::memory().unwrap();
        let store = registry.repository("foo/bar").unwrap();
        let err = store.fetch(&Digest::empty_tar()).await.unwrap_err();
        assert!(matches!(err, RegistryError::BlobNotFound(_)));
        assert!(!store.exists(&Digest::empty_tar()).await.unwrap());
    }

    #[tokio::test]
    async fn link_and_unlink() {
        let registry = Registry::memory().unwrap();
        let store = registry.repository("foo").unwrap();
        let digest = Digest::empty_tar();

        assert!(!store.linked(&digest).await.unwrap());
        store.link(&digest).await.unwrap();
        assert!(store.linked(&digest).await.unwrap());

        store.unlink(&digest).await.unwrap();
        assert!(!store.linked(&digest).await.unwrap());
        assert!(matches!(
            store.unlink(&digest).await,
            Err(RegistryError::BlobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn resume_unknown_upload() {
        let registry = Registry::memory().unwrap();
        let store = registry.repository("foo").unwrap();
        let id = Uuid::new_v4();
        assert!(matches!(
            store.resume(id).await,
            Err(RegistryError::UploadUnknown(unknown)) if unknown == id
        ));
    }

    #[tokio::test]
    async fn upload_records_start_time() {
        let registry = Registry::memory().unwrap();
        let store = registry.repository("foo").unwrap();
        let upload = store.upload().await.unwrap();

        let path = registry
            .paths()
            .upload_started_at_path("foo", upload.id());
        let record = registry.storage().get_content(&path).await.unwrap();
        let parsed = DateTime::parse_from_rfc3339(std::str::from_utf8(&record).unwrap()).unwrap();
        assert_eq!(parsed, upload.started_at());

        let resumed = store.resume(upload.id()).await.unwrap();
        assert_eq!(resumed.started_at(), upload.started_at());
        assert_eq!(resumed.offset().await, 0);
    }
}
