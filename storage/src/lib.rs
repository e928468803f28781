//! # Storage backends
//!
//! Configuration and unification for the storage backends.

use std::sync::Arc;

use camino::Utf8Path;
#[cfg(feature = "local")]
use camino::Utf8PathBuf;
use serde::Deserialize;

#[cfg(feature = "local")]
pub(crate) mod local;

pub(crate) mod memory;
#[cfg(feature = "tmp")]
pub(crate) mod temp;

#[cfg(feature = "local")]
#[doc(inline)]
pub use local::LocalDriver;

#[doc(inline)]
pub use memory::MemoryStorage;

#[cfg(feature = "tmp")]
#[doc(inline)]
pub use temp::TempDriver;

#[doc(inline)]
pub use storage_driver::{
    BoxReader, Driver, Metadata, Reader, StorageError, StorageErrorKind,
};

/// Which backend to store registry content in.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum StorageConfig {
    /// Keep everything in process memory.
    Memory,

    /// Store under a directory on the local filesystem.
    #[cfg(feature = "local")]
    Local {
        /// Root directory of the store.
        path: Utf8PathBuf,
    },

    /// Store in a fresh temporary directory, removed when the storage is dropped.
    #[cfg(feature = "tmp")]
    Temp,
}

impl StorageConfig {
    /// Construct the configured backend.
    #[tracing::instrument]
    pub fn build(self) -> Result<Storage, StorageError> {
        let client: Storage = match self {
            StorageConfig::Memory => MemoryStorage::new().into(),
            #[cfg(feature = "local")]
            StorageConfig::Local { path } => LocalDriver::new(path).into(),
            #[cfg(feature = "tmp")]
            StorageConfig::Temp => TempDriver::new()
                .map_err(|err| StorageError::from_io("temp", "/", err))?
                .into(),
        };
        Ok(client)
    }
}

pub(crate) type ArcDriver = Arc<dyn Driver + Send + Sync>;

/// A cloneable, type-erased handle to a storage backend.
///
/// Every operation is traced with the driver name and path.
#[derive(Debug, Clone)]
pub struct Storage {
    driver: ArcDriver,
}

impl<D> From<D> for Storage
where
    D: Driver + Send + Sync + 'static,
{
    fn from(value: D) -> Self {
        Storage::new(value)
    }
}

impl Storage {
    /// Wrap a driver.
    pub fn new<D: Driver + Send + Sync + 'static>(driver: D) -> Self {
        Self {
            driver: Arc::new(driver),
        }
    }

    /// Wrap a driver which is already shared.
    pub fn from_arc(driver: ArcDriver) -> Self {
        Self { driver }
    }

    /// The name of the underlying driver.
    pub fn name(&self) -> &str {
        self.driver.name()
    }

    /// See [`Driver::stat`].
    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn stat(&self, path: &Utf8Path) -> Result<Metadata, StorageError> {
        self.driver.stat(path).await
    }

    /// Whether anything exists at `path`. Not-found is `Ok(false)`, not an error.
    pub async fn exists(&self, path: &Utf8Path) -> Result<bool, StorageError> {
        match self.stat(path).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// See [`Driver::get_content`].
    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn get_content(&self, path: &Utf8Path) -> Result<Vec<u8>, StorageError> {
        self.driver.get_content(path).await
    }

    /// See [`Driver::put_content`].
    #[tracing::instrument(skip(self, content), fields(driver=self.driver.name(), size=content.len()))]
    pub async fn put_content(&self, path: &Utf8Path, content: &[u8]) -> Result<(), StorageError> {
        self.driver.put_content(path, content).await
    }

    /// See [`Driver::reader`].
    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn reader(&self, path: &Utf8Path, offset: u64) -> Result<BoxReader, StorageError> {
        self.driver.reader(path, offset).await
    }

    /// See [`Driver::write_stream`].
    #[tracing::instrument(skip(self, reader), fields(driver=self.driver.name()))]
    pub async fn write_stream<'d, R>(
        &'d self,
        path: &Utf8Path,
        offset: u64,
        reader: &mut R,
    ) -> Result<u64, StorageError>
    where
        R: tokio::io::AsyncBufRead + Unpin + Send + Sync + 'd,
    {
        tracing::trace!(%path, offset, "Writing stream");
        self.driver.write_stream(path, offset, reader).await
    }

    /// See [`Driver::move_to`].
    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn move_to(
        &self,
        source: &Utf8Path,
        destination: &Utf8Path,
    ) -> Result<(), StorageError> {
        self.driver.move_to(source, destination).await
    }

    /// See [`Driver::delete`].
    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn delete(&self, path: &Utf8Path) -> Result<(), StorageError> {
        self.driver.delete(path).await
    }

    /// See [`Driver::list`].
    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn list(&self, prefix: &Utf8Path) -> Result<Vec<String>, StorageError> {
        self.driver.list(prefix).await
    }
}
