use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::digest::Digest;
use crate::notifications::{Descriptor, LAYER_MEDIA_TYPE};

/// A committed blob, resolved through a repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Layer {
    /// The repository the layer was resolved through.
    pub repository: String,

    /// The canonical digest of the layer content.
    pub digest: Digest,

    /// Size of the content in bytes.
    pub size: u64,

    /// Where the content lives in the storage backend.
    pub path: Utf8PathBuf,

    /// When the content was committed.
    pub created: DateTime<Utc>,
}

impl Layer {
    /// Describe this layer for an event.
    pub fn descriptor(&self) -> Descriptor {
        Descriptor {
            media_type: LAYER_MEDIA_TYPE.to_owned(),
            length: self.size,
            digest: self.digest.clone(),
        }
    }
}
