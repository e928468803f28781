//! Content digests: `<algorithm>:<hex>`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::Digest as _;

use crate::tarsum::TarSumVersion;

/// The TarSum of an archive with no entries, `tarsum.v1+sha256` of nothing.
pub const EMPTY_TAR: &str =
    "tarsum.v1+sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

const TARSUM: &str = "tarsum";

/// Reasons a digest string is rejected, or cannot be used for a purpose.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DigestError {
    /// The string is not `<algorithm>:<hex>`.
    #[error("malformed digest: {0}")]
    Format(&'static str),

    /// The hash function is not one we can compute.
    #[error("unsupported hash algorithm: {0}")]
    UnsupportedHash(String),

    /// The hex part has the wrong length for the hash function.
    #[error("digest is {actual} hex characters, {algorithm} requires {expected}")]
    Length {
        /// The hash function named by the digest.
        algorithm: HashAlgorithm,
        /// Required number of hex characters.
        expected: usize,
        /// Number of hex characters present.
        actual: usize,
    },

    /// The digest is not a tarsum digest.
    #[error("not a tarsum digest")]
    NotTarSum,

    /// The digest is a tarsum digest of a version we do not know.
    #[error("unknown tarsum version: {0}")]
    UnknownVersion(String),
}

/// The hash functions digests may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    /// SHA-1
    Sha1,
    /// SHA-256
    Sha256,
    /// SHA-384
    Sha384,
    /// SHA-512
    Sha512,
}

impl HashAlgorithm {
    /// The name used in digest strings.
    pub fn name(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha1 => "sha1",
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha384 => "sha384",
            HashAlgorithm::Sha512 => "sha512",
        }
    }

    /// Number of hex characters in a digest of this algorithm.
    pub fn hex_len(&self) -> usize {
        match self {
            HashAlgorithm::Sha1 => 40,
            HashAlgorithm::Sha256 => 64,
            HashAlgorithm::Sha384 => 96,
            HashAlgorithm::Sha512 => 128,
        }
    }

    /// A fresh incremental hasher.
    pub fn hasher(&self) -> Hasher {
        match self {
            HashAlgorithm::Sha1 => Hasher::Sha1(sha1::Sha1::new()),
            HashAlgorithm::Sha256 => Hasher::Sha256(sha2::Sha256::new()),
            HashAlgorithm::Sha384 => Hasher::Sha384(sha2::Sha384::new()),
            HashAlgorithm::Sha512 => Hasher::Sha512(sha2::Sha512::new()),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HashAlgorithm {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sha1" => Ok(HashAlgorithm::Sha1),
            "sha256" => Ok(HashAlgorithm::Sha256),
            "sha384" => Ok(HashAlgorithm::Sha384),
            "sha512" => Ok(HashAlgorithm::Sha512),
            other => Err(DigestError::UnsupportedHash(other.to_owned())),
        }
    }
}

/// An incremental hasher for any [`HashAlgorithm`].
#[derive(Debug, Clone)]
pub enum Hasher {
    /// SHA-1
    Sha1(sha1::Sha1),
    /// SHA-256
    Sha256(sha2::Sha256),
    /// SHA-384
    Sha384(sha2::Sha384),
    /// SHA-512
    Sha512(sha2::Sha512),
}

impl Hasher {
    /// Feed bytes into the hash.
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Sha1(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha384(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
    }

    /// Consume the hasher, returning the lowercase hex digest.
    pub fn finalize_hex(self) -> String {
        match self {
            Hasher::Sha1(h) => hex::encode(h.finalize()),
            Hasher::Sha256(h) => hex::encode(h.finalize()),
            Hasher::Sha384(h) => hex::encode(h.finalize()),
            Hasher::Sha512(h) => hex::encode(h.finalize()),
        }
    }
}

/// The algorithm part of a tarsum digest, e.g. `tarsum.v1+sha256`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TarSumAlgorithm {
    /// TarSum version.
    pub version: TarSumVersion,
    /// Hash used for entries and the final sum.
    pub hash: HashAlgorithm,
}

impl fmt::Display for TarSumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}", self.version, self.hash)
    }
}

/// A content digest, `<algorithm>:<hex>`.
///
/// Digests are compared by exact string equality. The only normalization
/// applied when parsing is that the explicit `tarsum.v0` label is rewritten to
/// `tarsum`, its canonical spelling.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    /// Parse and validate a digest string.
    pub fn parse(s: &str) -> Result<Self, DigestError> {
        let (algorithm, hex) = s
            .split_once(':')
            .ok_or(DigestError::Format("missing ':' separator"))?;

        if hex.contains(':') {
            return Err(DigestError::Format("more than one ':' separator"));
        }
        if hex.len() < 2 || !hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(DigestError::Format("hex part must be lowercase hex"));
        }

        let algorithm = match algorithm.strip_prefix("tarsum.v0+") {
            Some(hash) => format!("{TARSUM}+{hash}"),
            None => algorithm.to_owned(),
        };

        let hash = if is_tarsum(&algorithm) {
            let (label, hash) = split_tarsum(&algorithm)
                .ok_or(DigestError::Format("tarsum algorithm has no hash"))?;
            let labelled = algorithm.starts_with("tarsum.");
            if labelled && !is_component(label) {
                return Err(DigestError::Format("invalid tarsum version label"));
            }
            if !is_component(hash) {
                return Err(DigestError::Format("invalid hash name"));
            }
            hash
        } else {
            if !is_component(&algorithm) || algorithm == TARSUM {
                return Err(DigestError::Format("invalid algorithm name"));
            }
            algorithm.as_str()
        };

        if let Ok(known) = hash.parse::<HashAlgorithm>() {
            if hex.len() != known.hex_len() {
                return Err(DigestError::Length {
                    algorithm: known,
                    expected: known.hex_len(),
                    actual: hex.len(),
                });
            }
        }

        Ok(Digest(format!("{algorithm}:{hex}")))
    }

    /// Digest of `data` under a plain hash algorithm, e.g. `sha256:…`.
    pub fn from_bytes(algorithm: HashAlgorithm, data: &[u8]) -> Self {
        let mut hasher = algorithm.hasher();
        hasher.update(data);
        Digest(format!("{}:{}", algorithm, hasher.finalize_hex()))
    }

    pub(crate) fn from_parts(algorithm: impl fmt::Display, hex: &str) -> Self {
        Digest(format!("{algorithm}:{hex}"))
    }

    /// The digest of an archive with no entries.
    pub fn empty_tar() -> Self {
        Digest(EMPTY_TAR.to_owned())
    }

    /// Whether this is the digest of an archive with no entries.
    pub fn is_empty_tar(&self) -> bool {
        self.0 == EMPTY_TAR
    }

    /// The full digest string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The algorithm part, before the `:`.
    pub fn algorithm(&self) -> &str {
        self.split().0
    }

    /// The hex part, after the `:`.
    pub fn hex(&self) -> &str {
        self.split().1
    }

    fn split(&self) -> (&str, &str) {
        // Parsing guarantees exactly one separator.
        self.0.split_once(':').unwrap_or((self.0.as_str(), ""))
    }

    /// Whether the algorithm is a tarsum algorithm, of any version.
    pub fn is_tarsum(&self) -> bool {
        is_tarsum(self.algorithm())
    }

    /// The tarsum version label without the `tarsum` prefix (`"v1"`, `"dev"`,
    /// or `""` for the original version), if this is a tarsum digest.
    pub fn tarsum_label(&self) -> Option<&str> {
        split_tarsum(self.algorithm()).map(|(label, _)| label)
    }

    /// The hash name of the digest: the whole algorithm for plain digests, the
    /// part after `+` for tarsum digests.
    pub fn hash_name(&self) -> &str {
        let algorithm = self.algorithm();
        split_tarsum(algorithm).map_or(algorithm, |(_, hash)| hash)
    }

    /// Resolve the tarsum version and hash of this digest.
    pub fn tarsum_algorithm(&self) -> Result<TarSumAlgorithm, DigestError> {
        let label = self.tarsum_label().ok_or(DigestError::NotTarSum)?;
        let version = TarSumVersion::from_label(label)
            .ok_or_else(|| DigestError::UnknownVersion(self.algorithm().to_owned()))?;
        let hash = self.hash_name().parse()?;
        Ok(TarSumAlgorithm { version, hash })
    }

    /// Resolve the hash of a plain (non-tarsum) digest.
    pub fn hash_algorithm(&self) -> Result<HashAlgorithm, DigestError> {
        self.hash_name().parse()
    }
}

fn is_tarsum(algorithm: &str) -> bool {
    algorithm
        .strip_prefix(TARSUM)
        .is_some_and(|rest| rest.starts_with('+') || rest.starts_with('.'))
}

/// Split `tarsum+<hash>` or `tarsum.<label>+<hash>` into its label (empty for
/// the unlabelled form) and hash name.
fn split_tarsum(algorithm: &str) -> Option<(&str, &str)> {
    let rest = algorithm.strip_prefix(TARSUM)?;
    let (label, hash) = rest.split_once('+')?;
    match label.strip_prefix('.') {
        Some(label) => Some((label, hash)),
        None if label.is_empty() => Some(("", hash)),
        None => None,
    }
}

fn is_component(s: &str) -> bool {
    !s.is_empty()
        && s
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Digest {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for Digest {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Digest::parse(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = DigestError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Digest::parse(&value)
    }
}

impl From<Digest> for String {
    fn from(value: Digest) -> Self {
        value.0
    }
}
