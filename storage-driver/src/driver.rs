use std::{fmt, ops::Deref, sync::Arc};

use camino::Utf8Path;
use chrono::{DateTime, Utc};
use tokio::io;

use crate::error::StorageError;

/// A reader stream for file contents.
pub type Reader<'r> = dyn io::AsyncBufRead + Unpin + Send + Sync + 'r;

/// An owned reader over stored content, returned by [`Driver::reader`].
pub type BoxReader = Box<dyn io::AsyncRead + Unpin + Send + Sync + 'static>;

/// File object metadata, which will be generically provided by the driver.
///
/// This struct only provides common metadata fields, and drivers may provide more specific
/// metadata fields directly.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Metadata {
    /// The size of the file in bytes. Directories report zero.
    pub size: u64,

    /// Whether the path names a directory rather than a file.
    pub is_dir: bool,

    /// The creation (or last modification) timestamp of the path.
    pub created: DateTime<Utc>,
}

/// A storage driver, which provides access to a key/byte-range store over
/// opaque, `/`-separated paths.
///
/// Guarantees every backend must uphold:
///
/// - `move_to` appears atomic: once it returns, the destination is fully
///   materialized and the source is gone, and concurrent `stat` calls never
///   observe a partially written destination.
/// - `move_to` never replaces an existing destination. It fails with
///   [`StorageErrorKind::AlreadyExists`](crate::StorageErrorKind::AlreadyExists)
///   and leaves the source in place.
/// - `put_content` replaces the value atomically.
/// - `delete` removes directories recursively.
/// - Missing paths are reported as [`StorageErrorKind::NotFound`](crate::StorageErrorKind::NotFound),
///   occupied move destinations as `AlreadyExists`, every other failure as
///   [`StorageErrorKind::Io`](crate::StorageErrorKind::Io).
#[async_trait::async_trait]
pub trait Driver: fmt::Debug {
    /// The name of the driver.
    fn name(&self) -> &'static str;

    /// Get the metadata for a file or directory, by path.
    async fn stat(&self, path: &Utf8Path) -> Result<Metadata, StorageError>;

    /// Read the whole value stored at a path.
    async fn get_content(&self, path: &Utf8Path) -> Result<Vec<u8>, StorageError>;

    /// Store a whole value at a path, replacing anything already there.
    async fn put_content(&self, path: &Utf8Path, content: &[u8]) -> Result<(), StorageError>;

    /// Open a streaming reader over the value at a path, starting at `offset`.
    async fn reader(&self, path: &Utf8Path, offset: u64) -> Result<BoxReader, StorageError>;

    /// Write the contents of `reader` into the file at `path`, starting at `offset`.
    ///
    /// The file is created when it does not exist. The offset must not be past the
    /// current end of the file. Returns the number of bytes written.
    async fn write_stream(
        &self,
        path: &Utf8Path,
        offset: u64,
        reader: &mut Reader<'_>,
    ) -> Result<u64, StorageError>;

    /// Atomically move the value at `source` to `destination`, unless
    /// `destination` already holds a value.
    async fn move_to(&self, source: &Utf8Path, destination: &Utf8Path)
        -> Result<(), StorageError>;

    /// Delete a file, or a directory and everything under it.
    async fn delete(&self, path: &Utf8Path) -> Result<(), StorageError>;

    /// List the files under a prefix.
    async fn list(&self, prefix: &Utf8Path) -> Result<Vec<String>, StorageError>;
}

#[async_trait::async_trait]
impl<D> Driver for Arc<D>
where
    D: ?Sized + Driver + Sync + Send + 'static,
{
    fn name(&self) -> &'static str {
        self.deref().name()
    }

    async fn stat(&self, path: &Utf8Path) -> Result<Metadata, StorageError> {
        self.deref().stat(path).await
    }

    async fn get_content(&self, path: &Utf8Path) -> Result<Vec<u8>, StorageError> {
        self.deref().get_content(path).await
    }

    async fn put_content(&self, path: &Utf8Path, content: &[u8]) -> Result<(), StorageError> {
        self.deref().put_content(path, content).await
    }

    async fn reader(&self, path: &Utf8Path, offset: u64) -> Result<BoxReader, StorageError> {
        self.deref().reader(path, offset).await
    }

    async fn write_stream(
        &self,
        path: &Utf8Path,
        offset: u64,
        reader: &mut Reader<'_>,
    ) -> Result<u64, StorageError> {
        self.deref().write_stream(path, offset, reader).await
    }

    async fn move_to(
        &self,
        source: &Utf8Path,
        destination: &Utf8Path,
    ) -> Result<(), StorageError> {
        self.deref().move_to(source, destination).await
    }

    async fn delete(&self, path: &Utf8Path) -> Result<(), StorageError> {
        self.deref().delete(path).await
    }

    async fn list(&self, prefix: &Utf8Path) -> Result<Vec<String>, StorageError> {
        self.deref().list(prefix).await
    }
}

#[async_trait::async_trait]
impl<D> Driver for &D
where
    D: ?Sized + Driver + Sync + Send + 'static,
{
    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn stat(&self, path: &Utf8Path) -> Result<Metadata, StorageError> {
        (**self).stat(path).await
    }

    async fn get_content(&self, path: &Utf8Path) -> Result<Vec<u8>, StorageError> {
        (**self).get_content(path).await
    }

    async fn put_content(&self, path: &Utf8Path, content: &[u8]) -> Result<(), StorageError> {
        (**self).put_content(path, content).await
    }

    async fn reader(&self, path: &Utf8Path, offset: u64) -> Result<BoxReader, StorageError> {
        (**self).reader(path, offset).await
    }

    async fn write_stream(
        &self,
        path: &Utf8Path,
        offset: u64,
        reader: &mut Reader<'_>,
    ) -> Result<u64, StorageError> {
        (**self).write_stream(path, offset, reader).await
    }

    async fn move_to(
        &self,
        source: &Utf8Path,
        destination: &Utf8Path,
    ) -> Result<(), StorageError> {
        (**self).move_to(source, destination).await
    }

    async fn delete(&self, path: &Utf8Path) -> Result<(), StorageError> {
        (**self).delete(path).await
    }

    async fn list(&self, prefix: &Utf8Path) -> Result<Vec<String>, StorageError> {
        (**self).list(prefix).await
    }
}
