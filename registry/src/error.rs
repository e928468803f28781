//! Error types for the registry

use http::StatusCode;
use uuid::Uuid;

use crate::digest::{Digest, DigestError};
use crate::tarsum::TarSumError;

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Error types for registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// No blob exists at the digest's content-addressed path.
    #[error("blob not found: {0}")]
    BlobNotFound(Digest),

    /// No upload session with this id exists in the repository.
    #[error("blob upload unknown: {0}")]
    UploadUnknown(Uuid),

    /// The digest is malformed, or of a kind that cannot identify a layer.
    #[error("invalid digest {digest}: {reason}")]
    InvalidDigest {
        /// The offending digest, as given.
        digest: String,
        /// Why it was rejected.
        reason: DigestError,
    },

    /// The claimed digest uses a tarsum version other than `tarsum.v1`.
    #[error("unsupported tarsum version: {0}")]
    UnsupportedDigestVersion(Digest),

    /// The uploaded content does not match the claimed digest.
    #[error("content does not match digest: expected {expected}, got {actual}")]
    ContentMismatch {
        /// The digest the uploader claimed.
        expected: Digest,
        /// The canonical digest of the content actually uploaded.
        actual: Digest,
    },

    /// The uploaded content is not a readable tar archive.
    #[error("uploaded content is not a valid archive: {0}")]
    InvalidArchive(#[source] TarSumError),

    /// Invalid repository name
    #[error("invalid repository name: {0}")]
    InvalidRepository(String),

    /// The upload session was already finished or cancelled.
    #[error("blob upload {0} is closed")]
    SessionClosed(Uuid),

    /// Storage error
    #[error("storage error: {0}")]
    Storage(#[from] storage::StorageError),

    /// IO error while streaming content
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<TarSumError> for RegistryError {
    fn from(err: TarSumError) -> Self {
        match err {
            TarSumError::Read(err) => RegistryError::Io(err),
            err => RegistryError::InvalidArchive(err),
        }
    }
}

impl RegistryError {
    pub(crate) fn invalid_digest(digest: impl ToString, reason: DigestError) -> Self {
        RegistryError::InvalidDigest {
            digest: digest.to_string(),
            reason,
        }
    }

    /// Whether retrying the same operation could succeed.
    ///
    /// Storage and I/O failures may be transient. Every other error is a
    /// permanent property of the request: a mismatched upload has to be
    /// uploaded again, not finished again.
    pub fn is_retryable(&self) -> bool {
        match self {
            RegistryError::Storage(err) => err.is_retryable(),
            RegistryError::Io(_) => true,
            _ => false,
        }
    }

    /// Whether this is one of the not-found conditions.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RegistryError::BlobNotFound(_) | RegistryError::UploadUnknown(_)
        )
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            RegistryError::BlobNotFound(_)
            | RegistryError::UploadUnknown(_)
            | RegistryError::SessionClosed(_) => StatusCode::NOT_FOUND,
            RegistryError::InvalidDigest { .. }
            | RegistryError::UnsupportedDigestVersion(_)
            | RegistryError::ContentMismatch { .. }
            | RegistryError::InvalidArchive(_)
            | RegistryError::InvalidRepository(_) => StatusCode::BAD_REQUEST,
            RegistryError::Storage(_) | RegistryError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code for distribution API error responses
    pub fn error_code(&self) -> &'static str {
        match self {
            RegistryError::BlobNotFound(_) => "BLOB_UNKNOWN",
            RegistryError::UploadUnknown(_) | RegistryError::SessionClosed(_) => {
                "BLOB_UPLOAD_UNKNOWN"
            }
            RegistryError::InvalidDigest { .. }
            | RegistryError::UnsupportedDigestVersion(_)
            | RegistryError::ContentMismatch { .. } => "DIGEST_INVALID",
            RegistryError::InvalidArchive(_) => "BLOB_UPLOAD_INVALID",
            RegistryError::InvalidRepository(_) => "NAME_INVALID",
            RegistryError::Storage(_) | RegistryError::Io(_) => "UNKNOWN",
        }
    }
}
