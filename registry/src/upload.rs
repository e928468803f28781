//! Resumable layer uploads.

use std::fmt;

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use storage::BoxReader;
use tokio::io::{AsyncRead, BufReader};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::blobs::BlobStore;
use crate::digest::{Digest, DigestError};
use crate::error::{RegistryError, RegistryResult};
use crate::layer::Layer;
use crate::tarsum::TarSumVersion;
use crate::verify;

/// Where an upload session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UploadState {
    /// Started, nothing written through this handle yet.
    Created,
    /// Content has been appended.
    Writing,
    /// `finish` is running, or was abandoned part way through.
    Finishing,
    /// Content was committed and linked.
    Finished,
    /// Content was committed, but linking it into the repository failed.
    Committed,
    /// The session was cancelled and its scratch content removed.
    Cancelled,
}

impl UploadState {
    /// Whether the session accepts no further operations.
    pub fn is_closed(&self) -> bool {
        !matches!(self, UploadState::Created | UploadState::Writing)
    }
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UploadState::Created => "created",
            UploadState::Writing => "writing",
            UploadState::Finishing => "finishing",
            UploadState::Finished => "finished",
            UploadState::Committed => "committed",
            UploadState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
struct Session {
    state: UploadState,
    offset: u64,
}

/// One in-progress upload of layer content to a repository.
///
/// Content is appended to a scratch file with [`BlobUpload::write`] and is not
/// checked until [`BlobUpload::finish`], which verifies it against the claimed
/// digest, commits it to the blob store and links it into the repository.
///
/// Operations on one handle are serialized. Once the session is finished or
/// cancelled every further operation fails with
/// [`RegistryError::SessionClosed`].
#[derive(Debug)]
pub struct BlobUpload {
    store: BlobStore,
    id: Uuid,
    started_at: DateTime<Utc>,
    session: Mutex<Session>,
}

impl BlobUpload {
    pub(crate) fn new(store: BlobStore, id: Uuid, started_at: DateTime<Utc>, offset: u64) -> Self {
        let state = if offset == 0 {
            UploadState::Created
        } else {
            UploadState::Writing
        };
        Self {
            store,
            id,
            started_at,
            session: Mutex::new(Session { state, offset }),
        }
    }

    /// The session id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// When the session was started.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// The repository this upload belongs to.
    pub fn repository(&self) -> &str {
        self.store.name()
    }

    /// Number of bytes written so far.
    pub async fn offset(&self) -> u64 {
        self.session.lock().await.offset
    }

    /// The current lifecycle state.
    pub async fn state(&self) -> UploadState {
        self.session.lock().await.state
    }

    fn data_path(&self) -> Utf8PathBuf {
        self.store
            .paths()
            .upload_data_path(self.store.name(), self.id)
    }

    /// Append `data` to the upload, returning the new offset.
    pub async fn write(&self, data: &[u8]) -> RegistryResult<u64> {
        let mut reader = data;
        self.append(&mut reader).await
    }

    /// Append everything `reader` produces to the upload, returning the new offset.
    pub async fn copy_from<R>(&self, reader: R) -> RegistryResult<u64>
    where
        R: AsyncRead + Unpin + Send + Sync,
    {
        let mut reader = BufReader::new(reader);
        self.append(&mut reader).await
    }

    #[tracing::instrument(skip_all, fields(upload.id = %self.id, repository = %self.store.name()))]
    async fn append<R>(&self, reader: &mut R) -> RegistryResult<u64>
    where
        R: tokio::io::AsyncBufRead + Unpin + Send + Sync,
    {
        let mut session = self.session.lock().await;
        if session.state.is_closed() {
            return Err(RegistryError::SessionClosed(self.id));
        }

        let written = self
            .store
            .storage()
            .write_stream(&self.data_path(), session.offset, reader)
            .await?;

        session.offset += written;
        session.state = UploadState::Writing;
        tracing::trace!(written, offset = session.offset, "Appended to upload");
        Ok(session.offset)
    }

    /// Complete the upload, verifying its content against `claimed`.
    ///
    /// The content is validated, moved to its content-addressed location
    /// (unless an identical blob is already there), linked into the repository
    /// under its canonical digest, and the session's scratch files removed.
    ///
    /// A failure while validating or moving leaves the session open so the
    /// call can be retried. Once the content has been moved the session is
    /// closed, even if linking it fails. Failing to remove the scratch files
    /// is logged and does not fail the upload.
    #[tracing::instrument(skip(self), fields(upload.id = %self.id, repository = %self.store.name()))]
    pub async fn finish(&self, claimed: &Digest) -> RegistryResult<Layer> {
        let mut session = self.session.lock().await;
        if session.state.is_closed() {
            return Err(RegistryError::SessionClosed(self.id));
        }
        let previous = session.state;
        session.state = UploadState::Finishing;

        let canonical = match self.validate(claimed).await {
            Ok(canonical) => canonical,
            Err(err) => {
                session.state = previous;
                return Err(err);
            }
        };

        if let Err(err) = self.move_blob(&canonical).await {
            session.state = previous;
            return Err(err);
        }

        if let Err(err) = self.store.link(&canonical).await {
            tracing::error!(digest = %canonical, "Committed blob could not be linked: {err}");
            session.state = UploadState::Committed;
            return Err(err);
        }

        if let Err(err) = self.remove_resources().await {
            tracing::error!(digest = %canonical, "Unable to remove upload resources: {err}");
        }

        session.state = UploadState::Finished;
        drop(session);

        tracing::debug!(digest = %canonical, "Finished upload");
        self.store.fetch(&canonical).await
    }

    /// Abandon the upload, removing everything written to it.
    ///
    /// Committed blobs and repository links are never touched.
    #[tracing::instrument(skip(self), fields(upload.id = %self.id, repository = %self.store.name()))]
    pub async fn cancel(&self) -> RegistryResult<()> {
        let mut session = self.session.lock().await;
        if session.state.is_closed() {
            return Err(RegistryError::SessionClosed(self.id));
        }

        self.remove_resources().await?;
        session.state = UploadState::Cancelled;
        tracing::debug!("Cancelled upload");
        Ok(())
    }

    /// Check the scratch content against `claimed` and return its canonical
    /// digest.
    async fn validate(&self, claimed: &Digest) -> RegistryResult<Digest> {
        if !claimed.is_tarsum() {
            return Err(RegistryError::invalid_digest(claimed, DigestError::NotTarSum));
        }
        match claimed.tarsum_algorithm() {
            Ok(algorithm) if algorithm.version == TarSumVersion::V1 => {}
            Ok(_) | Err(DigestError::UnknownVersion(_)) => {
                return Err(RegistryError::UnsupportedDigestVersion(claimed.clone()));
            }
            Err(err) => return Err(RegistryError::invalid_digest(claimed, err)),
        }

        let reader: BoxReader = match self.store.storage().reader(&self.data_path(), 0).await {
            Ok(reader) => reader,
            Err(err) if err.is_not_found() => Box::new(tokio::io::empty()),
            Err(err) => return Err(err.into()),
        };

        verify::validate(claimed, reader).await
    }

    /// Move the scratch content to the blob path for `canonical`.
    async fn move_blob(&self, canonical: &Digest) -> RegistryResult<()> {
        let storage = self.store.storage();
        let blob = self.store.paths().blob_data_path(canonical);

        match storage.stat(&blob).await {
            Ok(_) => {
                tracing::debug!(digest = %canonical, "Blob already present");
                return Ok(());
            }
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err.into()),
        }

        let data = self.data_path();
        match storage.stat(&data).await {
            Ok(_) => {}
            Err(err) if err.is_not_found() => {
                if canonical.is_empty_tar() {
                    storage.put_content(&blob, &[]).await?;
                    return Ok(());
                }
                tracing::warn!(
                    upload.id = %self.id,
                    digest = %canonical,
                    "Moving missing upload content with a non-empty digest"
                );
            }
            Err(err) => return Err(err.into()),
        }

        match storage.move_to(&data, &blob).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_already_exists() => {
                tracing::debug!(digest = %canonical, "Blob committed by another upload");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Delete the session's upload directory, if it still exists.
    async fn remove_resources(&self) -> RegistryResult<()> {
        let dir = self.store.paths().upload_dir(self.store.name(), self.id);
        match self.store.storage().delete(&dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
