use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::TempDir;

use crate::local::LocalDriver;
use storage_driver::{BoxReader, Driver, Metadata, Reader, StorageError};

/// A storage driver that stores files in a temporary directory, removed on drop.
#[derive(Debug)]
pub struct TempDriver {
    dir: TempDir,
    driver: LocalDriver,
}

impl TempDriver {
    /// Create a new `TempDriver` instance, storing files in a temporary directory.
    pub fn new() -> io::Result<Self> {
        let tmp = TempDir::new()?;
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_owned()).map_err(|path| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("temporary directory is not utf-8: {}", path.display()),
            )
        })?;

        Ok(Self {
            dir: tmp,
            driver: LocalDriver::new(root),
        })
    }

    /// The directory on disk backing this driver.
    pub fn root(&self) -> &std::path::Path {
        self.dir.path()
    }
}

#[async_trait::async_trait]
impl Driver for TempDriver {
    fn name(&self) -> &'static str {
        "temp"
    }

    async fn stat(&self, path: &Utf8Path) -> Result<Metadata, StorageError> {
        self.driver.stat(path).await
    }

    async fn get_content(&self, path: &Utf8Path) -> Result<Vec<u8>, StorageError> {
        self.driver.get_content(path).await
    }

    async fn put_content(&self, path: &Utf8Path, content: &[u8]) -> Result<(), StorageError> {
        self.driver.put_content(path, content).await
    }

    async fn reader(&self, path: &Utf8Path, offset: u64) -> Result<BoxReader, StorageError> {
        self.driver.reader(path, offset).await
    }

    async fn write_stream(
        &self,
        path: &Utf8Path,
        offset: u64,
        reader: &mut Reader<'_>,
    ) -> Result<u64, StorageError> {
        self.driver.write_stream(path, offset, reader).await
    }

    async fn move_to(
        &self,
        source: &Utf8Path,
        destination: &Utf8Path,
    ) -> Result<(), StorageError> {
        self.driver.move_to(source, destination).await
    }

    async fn delete(&self, path: &Utf8Path) -> Result<(), StorageError> {
        self.driver.delete(path).await
    }

    async fn list(&self, prefix: &Utf8Path) -> Result<Vec<String>, StorageError> {
        self.driver.list(prefix).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage_driver::StorageErrorKind;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn put_and_get_roundtrip_on_disk() {
        let driver = TempDriver::new().unwrap();
        let path = Utf8Path::new("/registry/blobs/ab/data");
        driver.put_content(path, b"layer").await.unwrap();

        assert_eq!(driver.get_content(path).await.unwrap(), b"layer");
        assert!(driver.root().join("registry/blobs/ab/data").exists());

        let listing = driver.list(Utf8Path::new("/registry")).await.unwrap();
        assert_eq!(listing, vec!["/registry/blobs/ab/data".to_string()]);
    }

    #[tokio::test]
    async fn write_stream_resumes_and_reads_back() {
        let driver = TempDriver::new().unwrap();
        let path = Utf8Path::new("uploads/1/data");

        driver
            .write_stream(path, 0, &mut &b"abc"[..])
            .await
            .unwrap();
        driver
            .write_stream(path, 3, &mut &b"def"[..])
            .await
            .unwrap();
        assert_eq!(driver.stat(path).await.unwrap().size, 6);

        let mut reader = driver.reader(path, 2).await.unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"cdef");

        let err = driver
            .write_stream(path, 7, &mut &b"x"[..])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::Io);
    }

    #[tokio::test]
    async fn move_and_recursive_delete() {
        let driver = TempDriver::new().unwrap();
        driver
            .put_content(Utf8Path::new("uploads/1/data"), b"x")
            .await
            .unwrap();
        driver
            .put_content(Utf8Path::new("uploads/1/startedat"), b"now")
            .await
            .unwrap();

        driver
            .move_to(Utf8Path::new("uploads/1/data"), Utf8Path::new("blobs/x/data"))
            .await
            .unwrap();
        assert_eq!(
            driver.get_content(Utf8Path::new("blobs/x/data")).await.unwrap(),
            b"x"
        );

        driver.delete(Utf8Path::new("uploads/1")).await.unwrap();
        assert!(driver
            .stat(Utf8Path::new("uploads/1"))
            .await
            .unwrap_err()
            .is_not_found());

        let err = driver
            .move_to(Utf8Path::new("uploads/1/data"), Utf8Path::new("blobs/y/data"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(driver
            .stat(Utf8Path::new("blobs/y"))
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn move_does_not_replace_destination() {
        let driver = TempDriver::new().unwrap();
        let blob = Utf8Path::new("blobs/x/data");
        let upload = Utf8Path::new("uploads/2/data");
        driver.put_content(blob, b"committed").await.unwrap();
        driver.put_content(upload, b"late").await.unwrap();

        let err = driver.move_to(upload, blob).await.unwrap_err();
        assert!(err.is_already_exists());
        assert_eq!(driver.get_content(blob).await.unwrap(), b"committed");
        assert_eq!(driver.get_content(upload).await.unwrap(), b"late");
    }

    #[tokio::test]
    async fn put_content_replaces_without_leftovers() {
        let driver = TempDriver::new().unwrap();
        let link = Utf8Path::new("repositories/foo/_layers/link");
        driver.put_content(link, b"one").await.unwrap();
        driver.put_content(link, b"two").await.unwrap();

        assert_eq!(driver.get_content(link).await.unwrap(), b"two");
        let listing = driver.list(Utf8Path::new("repositories")).await.unwrap();
        assert_eq!(listing, vec!["repositories/foo/_layers/link".to_string()]);
    }
}
