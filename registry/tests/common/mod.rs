//! Shared helpers for registry integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use camino::Utf8Path;
use registry::{PathBuilder, Registry};
use tokio::sync::Barrier;
use storage::{
    BoxReader, Driver, MemoryStorage, Metadata, Reader, Storage, StorageError, StorageErrorKind,
};

/// Build a tar archive from `(name, content)` pairs.
pub fn archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_uid(1000);
        header.set_gid(1000);
        header.set_mtime(1_420_070_400);
        builder.append_data(&mut header, name, *data).unwrap();
    }
    builder.into_inner().unwrap()
}

/// Canonical digest of an archive.
pub async fn digest_of(data: &[u8]) -> registry::Digest {
    registry::digest_tar(std::io::Cursor::new(data.to_vec()))
        .await
        .unwrap()
}

/// The same archive with a different modification time in its first
/// header. v1 ignores modification times, so both share a digest.
pub fn retouch(archive: &[u8]) -> Vec<u8> {
    let mut retouched = archive.to_vec();
    let mut header = tar::Header::from_byte_slice(&archive[..512]).clone();
    header.set_mtime(header.mtime().unwrap() + 86_400);
    header.set_cksum();
    retouched[..512].copy_from_slice(header.as_bytes());
    retouched
}

/// An in-memory driver which counts calls and can be told to fail.
#[derive(Debug, Default)]
pub struct InstrumentedDriver {
    inner: MemoryStorage,
    pub moves: AtomicUsize,
    pub commits: AtomicUsize,
    pub reads: AtomicUsize,
    pub fail_deletes: AtomicBool,
    pub fail_link_writes: AtomicBool,
    pub fail_moves: AtomicBool,
    /// Holds the first `gate_parties` blob stats until all of them arrive.
    blob_gate: Option<Barrier>,
    gate_parties: usize,
    gated_stats: AtomicUsize,
}

fn injected(path: &Utf8Path) -> StorageError {
    StorageError::builder(
        "instrumented",
        StorageErrorKind::Io,
        std::io::Error::other("injected failure"),
    )
    .path(path.as_str())
    .build()
}

impl InstrumentedDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A driver whose first `parties` stats of blob paths wait for each other.
    pub fn gated(parties: usize) -> Arc<Self> {
        Arc::new(Self {
            blob_gate: Some(Barrier::new(parties)),
            gate_parties: parties,
            ..Self::default()
        })
    }

    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn moves(&self) -> usize {
        self.moves.load(Ordering::SeqCst)
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Driver for InstrumentedDriver {
    fn name(&self) -> &'static str {
        "instrumented"
    }

    async fn stat(&self, path: &Utf8Path) -> Result<Metadata, StorageError> {
        if let Some(gate) = &self.blob_gate {
            if path.as_str().contains("/blobs/")
                && self.gated_stats.fetch_add(1, Ordering::SeqCst) < self.gate_parties
            {
                gate.wait().await;
            }
        }
        self.inner.stat(path).await
    }

    async fn get_content(&self, path: &Utf8Path) -> Result<Vec<u8>, StorageError> {
        self.inner.get_content(path).await
    }

    async fn put_content(&self, path: &Utf8Path, content: &[u8]) -> Result<(), StorageError> {
        if path.file_name() == Some("link") && self.fail_link_writes.load(Ordering::SeqCst) {
            return Err(injected(path));
        }
        self.inner.put_content(path, content).await
    }

    async fn reader(&self, path: &Utf8Path, offset: u64) -> Result<BoxReader, StorageError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.reader(path, offset).await
    }

    async fn write_stream(
        &self,
        path: &Utf8Path,
        offset: u64,
        reader: &mut Reader<'_>,
    ) -> Result<u64, StorageError> {
        self.inner.write_stream(path, offset, reader).await
    }

    async fn move_to(
        &self,
        source: &Utf8Path,
        destination: &Utf8Path,
    ) -> Result<(), StorageError> {
        if self.fail_moves.load(Ordering::SeqCst) {
            return Err(injected(source));
        }
        self.moves.fetch_add(1, Ordering::SeqCst);
        self.inner.move_to(source, destination).await?;
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, path: &Utf8Path) -> Result<(), StorageError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(injected(path));
        }
        self.inner.delete(path).await
    }

    async fn list(&self, prefix: &Utf8Path) -> Result<Vec<String>, StorageError> {
        self.inner.list(prefix).await
    }
}

/// A registry over an instrumented in-memory driver.
pub fn instrumented_registry() -> (Registry, Arc<InstrumentedDriver>) {
    registry_over(InstrumentedDriver::new())
}

/// A registry over the given instrumented driver.
pub fn registry_over(driver: Arc<InstrumentedDriver>) -> (Registry, Arc<InstrumentedDriver>) {
    let registry = Registry::new(Storage::new(driver.clone()), PathBuilder::default());
    (registry, driver)
}

/// Install a test subscriber so `RUST_LOG` shows traces from failing tests.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
