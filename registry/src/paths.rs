//! Layout of registry content in the storage backend.
//!
//! ```text
//! <root>/blobs/tarsum/<version>/<hash>/<hex[..2]>/<hex>/data
//! <root>/blobs/<algorithm>/<hex[..2]>/<hex>/data
//! <root>/repositories/<name>/_layers/<digest components>/link
//! <root>/repositories/<name>/_uploads/<id>/data
//! <root>/repositories/<name>/_uploads/<id>/startedat
//! ```

use camino::{Utf8Path, Utf8PathBuf};
use uuid::Uuid;

use crate::digest::Digest;

/// The default root of registry content.
pub const DEFAULT_ROOT: &str = "/docker/registry/v2";

/// Maps digests, repository names and upload ids to storage paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathBuilder {
    root: Utf8PathBuf,
}

impl Default for PathBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_ROOT)
    }
}

impl PathBuilder {
    /// Build paths under `root`.
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root every path is built under.
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Where the content of the blob with `digest` lives.
    pub fn blob_data_path(&self, digest: &Digest) -> Utf8PathBuf {
        let mut path = self.root.join("blobs");
        for component in digest_components(digest, true) {
            path.push(component);
        }
        path.push("data");
        path
    }

    /// The link recording that `repository` contains `digest`.
    pub fn layer_link_path(&self, repository: &str, digest: &Digest) -> Utf8PathBuf {
        let mut path = self.repository_path(repository).join("_layers");
        for component in digest_components(digest, false) {
            path.push(component);
        }
        path.push("link");
        path
    }

    /// The directory holding everything belonging to one upload session.
    pub fn upload_dir(&self, repository: &str, id: Uuid) -> Utf8PathBuf {
        self.repository_path(repository)
            .join("_uploads")
            .join(id.to_string())
    }

    /// The scratch file an upload session appends to.
    pub fn upload_data_path(&self, repository: &str, id: Uuid) -> Utf8PathBuf {
        self.upload_dir(repository, id).join("data")
    }

    /// The record of when an upload session was started.
    pub fn upload_started_at_path(&self, repository: &str, id: Uuid) -> Utf8PathBuf {
        self.upload_dir(repository, id).join("startedat")
    }

    fn repository_path(&self, repository: &str) -> Utf8PathBuf {
        self.root.join("repositories").join(repository)
    }
}

/// Path components for a digest. Tarsum algorithms are split into their
/// version and hash so each gets its own directory level.
fn digest_components(digest: &Digest, prefixed: bool) -> Vec<String> {
    let hex = digest.hex();
    let mut components = Vec::with_capacity(5);

    if digest.is_tarsum() {
        components.push("tarsum".to_owned());
        let version = match digest.tarsum_label() {
            Some("") | None => "v0",
            Some(label) => label,
        };
        components.push(version.to_owned());
        components.push(digest.hash_name().to_owned());
    } else {
        components.push(digest.algorithm().to_owned());
    }

    if prefixed {
        components.push(hex[..2].to_owned());
    }
    components.push(hex.to_owned());
    components
}
