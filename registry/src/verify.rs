//! Streaming verification of uploaded content against a claimed digest.

use std::io::{self, Read};

use tokio::io::AsyncRead;
use tokio_util::io::SyncIoBridge;
use tracing::Instrument;

use crate::digest::{Digest, DigestError, Hasher};
use crate::error::{RegistryError, RegistryResult};
use crate::tarsum::{TarSum, read_archive};

#[derive(Debug)]
enum Accumulator {
    /// Archive entries go to `sum`. Bytes fed through `update` wait in
    /// `pending` until the verifier is queried.
    Archive { sum: TarSum, pending: Vec<u8> },
    Plain(Hasher),
}

/// Checks that content matches one expected digest.
///
/// Feed the whole content with [`DigestVerifier::update`] or
/// [`DigestVerifier::update_reader`], then ask [`DigestVerifier::verified`].
/// The answer is only meaningful once every byte has been fed, which is why
/// the query consumes the verifier.
///
/// A tarsum digest covers whole archive entries, so chunks given to `update`
/// are held until the query. Prefer `update_reader` for large archives.
#[derive(Debug)]
pub struct DigestVerifier {
    expected: Digest,
    accumulator: Accumulator,
}

impl DigestVerifier {
    /// Bind a verifier to `expected`.
    ///
    /// Fails when the digest names a hash (or tarsum version) that cannot be
    /// computed.
    pub fn new(expected: &Digest) -> Result<Self, DigestError> {
        let accumulator = if expected.is_tarsum() {
            Accumulator::Archive {
                sum: TarSum::with_algorithm(expected.tarsum_algorithm()?),
                pending: Vec::new(),
            }
        } else {
            Accumulator::Plain(expected.hash_algorithm()?.hasher())
        };

        Ok(Self {
            expected: expected.clone(),
            accumulator,
        })
    }

    /// The digest this verifier checks against.
    pub fn expected(&self) -> &Digest {
        &self.expected
    }

    /// Feed the next chunk of content.
    pub fn update(&mut self, data: &[u8]) {
        match &mut self.accumulator {
            Accumulator::Archive { pending, .. } => pending.extend_from_slice(data),
            Accumulator::Plain(hasher) => hasher.update(data),
        }
    }

    /// Feed everything `reader` produces. Blocks on the reader.
    pub fn update_reader<R: Read>(&mut self, reader: R) -> RegistryResult<()> {
        self.read_with(reader, None)
    }

    /// Read `reader` once, feeding this verifier and, when given, the
    /// `canonical` sum of the same archive.
    fn read_with<R: Read>(
        &mut self,
        reader: R,
        canonical: Option<&mut TarSum>,
    ) -> RegistryResult<()> {
        match (&mut self.accumulator, canonical) {
            (Accumulator::Archive { sum, .. }, Some(canonical)) => {
                read_archive(reader, &mut [sum, canonical])?
            }
            (Accumulator::Archive { sum, .. }, None) => read_archive(reader, &mut [sum])?,
            (Accumulator::Plain(hasher), canonical) => {
                let mut tee = Tee {
                    inner: reader,
                    hasher,
                };
                if let Some(canonical) = canonical {
                    read_archive(&mut tee, &mut [canonical])?;
                }
                // Bytes past the end-of-archive marker still count.
                io::copy(&mut tee, &mut io::sink())?;
            }
        }
        Ok(())
    }

    /// Whether the content fed so far has exactly the expected digest.
    ///
    /// Content which is not a readable archive never verifies a tarsum digest.
    pub fn verified(self) -> bool {
        let actual = match self.accumulator {
            Accumulator::Archive { mut sum, pending } => {
                if !pending.is_empty() && read_archive(&pending[..], &mut [&mut sum]).is_err() {
                    return false;
                }
                sum.finish()
            }
            Accumulator::Plain(hasher) => {
                Digest::from_parts(self.expected.algorithm(), &hasher.finalize_hex())
            }
        };
        actual == self.expected
    }
}

/// Hashes every byte read through it.
struct Tee<'h, R> {
    inner: R,
    hasher: &'h mut Hasher,
}

impl<R: Read> Read for Tee<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

/// Read `reader` to the end once, checking it against `claimed` and computing
/// the canonical digest of what was actually read.
///
/// Returns the canonical digest when the content verifies.
pub(crate) async fn validate<R>(claimed: &Digest, reader: R) -> RegistryResult<Digest>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut verifier =
        DigestVerifier::new(claimed).map_err(|err| RegistryError::invalid_digest(claimed, err))?;
    let source = SyncIoBridge::new(reader);

    let (verified, actual) = tokio::task::spawn_blocking(move || {
        let mut canonical = TarSum::canonical();
        verifier.read_with(source, Some(&mut canonical))?;
        Ok::<_, RegistryError>((verifier.verified(), canonical.finish()))
    })
    .in_current_span()
    .await
    .map_err(io::Error::other)??;

    if !verified {
        return Err(RegistryError::ContentMismatch {
            expected: claimed.clone(),
            actual,
        });
    }
    Ok(actual)
}

/// Compute the canonical `tarsum.v1+sha256` digest of an archive stream.
pub async fn digest_tar<R>(reader: R) -> RegistryResult<Digest>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let source = SyncIoBridge::new(reader);
    let digest = tokio::task::spawn_blocking(move || TarSum::canonical().digest_reader(source))
        .in_current_span()
        .await
        .map_err(io::Error::other)??;
    Ok(digest)
}
