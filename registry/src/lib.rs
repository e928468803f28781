//! # Registry blob storage
//!
//! The blob-storage core of a container image registry: resumable uploads of
//! layer content, verification of that content against a claimed TarSum
//! digest, atomic commit into a content-addressed store, and links recording
//! which repositories contain which blobs.
//!
//! Storage is pluggable via the `storage` crate. The HTTP API, authentication
//! and event delivery live elsewhere; this crate produces the [`Event`]
//! records for them.
//!
//! ## Example
//!
//! ```no_run
//! use registry::{Digest, Registry};
//!
//! # async fn example(archive: &[u8]) -> Result<(), registry::RegistryError> {
//! let registry = Registry::memory()?;
//! let repository = registry.repository("library/ubuntu")?;
//!
//! let digest = registry::digest_tar(std::io::Cursor::new(archive.to_vec())).await?;
//! let upload = repository.upload().await?;
//! upload.write(archive).await?;
//! let layer = upload.finish(&digest).await?;
//!
//! assert_eq!(layer.size, archive.len() as u64);
//! # Ok(())
//! # }
//! ```

mod blobs;
mod config;
mod digest;
mod error;
mod layer;
pub mod notifications;
mod paths;
mod tarsum;
mod upload;
mod verify;

pub use blobs::{BlobStore, Registry};
pub use config::{EventsConfig, RegistryConfig};
pub use digest::{Digest, DigestError, EMPTY_TAR, HashAlgorithm, Hasher, TarSumAlgorithm};
pub use error::{RegistryError, RegistryResult};
pub use layer::Layer;
pub use notifications::Event;
pub use paths::{DEFAULT_ROOT, PathBuilder};
pub use tarsum::{TarSum, TarSumError, TarSumVersion, read_archive};
pub use upload::{BlobUpload, UploadState};
pub use verify::{DigestVerifier, digest_tar};
