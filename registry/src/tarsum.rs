//! TarSum: a content digest of a tar archive that depends on the entries'
//! headers and contents, not on the byte layout of the archive.
//!
//! Each entry is hashed on its own (selected header fields, then the entry
//! data). The per-entry hex sums are sorted and hashed again to give the
//! archive digest, so entry order does not matter.
//!
//! Archives are parsed with the `tar` crate. [`read_archive`] walks the entries
//! once and feeds every entry to each [`TarSum`] it is given, so several
//! versions or hashes of one archive come out of a single read.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Read};

use crate::digest::{Digest, HashAlgorithm, Hasher, TarSumAlgorithm};

const CHUNK: usize = 32 * 1024;

/// Versions of the TarSum header selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TarSumVersion {
    /// The original selection, which includes the modification time.
    V0,
    /// Drops the modification time, adds extended attributes.
    V1,
    /// Development version; currently selects the same headers as `V1`.
    Dev,
}

impl TarSumVersion {
    /// Resolve the label after `tarsum.` (empty for `V0`).
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "" => Some(TarSumVersion::V0),
            "v1" => Some(TarSumVersion::V1),
            "dev" => Some(TarSumVersion::Dev),
            _ => None,
        }
    }

    /// The algorithm prefix for this version, e.g. `tarsum.v1`.
    pub fn as_str(&self) -> &'static str {
        match self {
            TarSumVersion::V0 => "tarsum",
            TarSumVersion::V1 => "tarsum.v1",
            TarSumVersion::Dev => "tarsum.dev",
        }
    }
}

impl fmt::Display for TarSumVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from reading an archive.
#[derive(Debug, thiserror::Error)]
pub enum TarSumError {
    /// The content is not a well-formed tar archive.
    #[error("invalid tar archive: {0}")]
    Archive(#[source] io::Error),

    /// The underlying reader failed.
    #[error("unable to read archive: {0}")]
    Read(#[source] io::Error),
}

/// Header fields of one entry, after extended headers are applied.
#[derive(Debug, Default)]
struct EntryHeader {
    name: String,
    mode: u64,
    uid: u64,
    gid: u64,
    size: u64,
    mtime: u64,
    typeflag: u8,
    linkname: String,
    uname: String,
    gname: String,
    devmajor: u64,
    devminor: u64,
    xattrs: BTreeMap<String, String>,
}

impl EntryHeader {
    fn read<R: Read>(entry: &mut tar::Entry<'_, R>) -> io::Result<Self> {
        let header = entry.header();
        let name = lossy(&entry.path_bytes());
        let typeflag = match header.entry_type().as_byte() {
            0 if name.ends_with('/') => b'5',
            0 => b'0',
            other => other,
        };

        let raw = header.as_old();
        let block = header.as_bytes();

        let mut fields = EntryHeader {
            mode: number(&raw.mode, || header.mode().map(u64::from))?,
            uid: number(&raw.uid, || header.uid())?,
            gid: number(&raw.gid, || header.gid())?,
            size: entry.size(),
            mtime: number(&raw.mtime, || header.mtime())?,
            typeflag,
            linkname: entry
                .link_name_bytes()
                .map(|link| lossy(&link))
                .unwrap_or_default(),
            uname: header.username_bytes().map(lossy).unwrap_or_default(),
            gname: header.groupname_bytes().map(lossy).unwrap_or_default(),
            devmajor: number(&block[329..337], || {
                Ok(header.device_major()?.unwrap_or(0).into())
            })?,
            devminor: number(&block[337..345], || {
                Ok(header.device_minor()?.unwrap_or(0).into())
            })?,
            name,
            xattrs: BTreeMap::new(),
        };

        if let Some(extensions) = entry.pax_extensions()? {
            for extension in extensions {
                let extension = extension?;
                let value = lossy(extension.value_bytes());
                match extension.key_bytes() {
                    b"uname" => fields.uname = value,
                    b"gname" => fields.gname = value,
                    b"mtime" => {
                        if let Some(seconds) = value.split('.').next().and_then(|s| s.parse().ok()) {
                            fields.mtime = seconds;
                        }
                    }
                    key => {
                        if let Some(attr) = key.strip_prefix(b"SCHILY.xattr.") {
                            fields.xattrs.insert(lossy(attr), value);
                        }
                    }
                }
            }
        }
        Ok(fields)
    }

    /// Header fields hashed for each entry, in order.
    fn selected(&self, version: TarSumVersion) -> Vec<(&str, String)> {
        let mut fields = vec![
            ("name", self.name.clone()),
            ("mode", self.mode.to_string()),
            ("uid", self.uid.to_string()),
            ("gid", self.gid.to_string()),
            ("size", self.size.to_string()),
        ];
        if version == TarSumVersion::V0 {
            fields.push(("mtime", self.mtime.to_string()));
        }
        fields.extend([
            ("typeflag", char::from(self.typeflag).to_string()),
            ("linkname", self.linkname.clone()),
            ("uname", self.uname.clone()),
            ("gname", self.gname.clone()),
            ("devmajor", self.devmajor.to_string()),
            ("devminor", self.devminor.to_string()),
        ]);
        if version != TarSumVersion::V0 {
            fields.extend(
                self.xattrs
                    .iter()
                    .map(|(key, value)| (key.as_str(), value.clone())),
            );
        }
        fields
    }
}

/// A numeric header field; blank fields read as zero.
fn number(raw: &[u8], parse: impl FnOnce() -> io::Result<u64>) -> io::Result<u64> {
    if raw.iter().all(|&b| b == 0 || b == b' ') {
        Ok(0)
    } else {
        parse()
    }
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// The TarSum of one archive, under one version and hash.
///
/// A sum is filled by [`read_archive`] (or [`TarSum::digest_reader`]) and
/// turned into a digest with [`TarSum::finish`].
#[derive(Debug)]
pub struct TarSum {
    algorithm: TarSumAlgorithm,
    sums: Vec<String>,
}

impl TarSum {
    /// Start a TarSum with the given version and hash.
    pub fn new(version: TarSumVersion, hash: HashAlgorithm) -> Self {
        Self::with_algorithm(TarSumAlgorithm { version, hash })
    }

    /// Start a TarSum for a resolved algorithm.
    pub fn with_algorithm(algorithm: TarSumAlgorithm) -> Self {
        Self {
            algorithm,
            sums: Vec::new(),
        }
    }

    /// The canonical algorithm: version 1 over sha256.
    pub fn canonical() -> Self {
        Self::new(TarSumVersion::V1, HashAlgorithm::Sha256)
    }

    /// The algorithm this sum computes.
    pub fn algorithm(&self) -> TarSumAlgorithm {
        self.algorithm
    }

    /// Read a whole archive from `reader` and return its digest.
    pub fn digest_reader<R: Read>(mut self, reader: R) -> Result<Digest, TarSumError> {
        read_archive(reader, &mut [&mut self])?;
        Ok(self.finish())
    }

    fn begin_entry(&self, header: &EntryHeader) -> Hasher {
        let mut hasher = self.algorithm.hash.hasher();
        for (key, value) in header.selected(self.algorithm.version) {
            hasher.update(key.as_bytes());
            hasher.update(value.as_bytes());
        }
        hasher
    }

    /// Sort the entry sums and hash them into the archive digest.
    pub fn finish(mut self) -> Digest {
        self.sums.sort();
        let mut hasher = self.algorithm.hash.hasher();
        for sum in &self.sums {
            hasher.update(sum.as_bytes());
        }
        Digest::from_parts(self.algorithm, &hasher.finalize_hex())
    }
}

/// Walk every entry of the archive in `reader` once, adding each entry to all
/// of `sums`.
///
/// An empty stream is an archive with no entries.
pub fn read_archive<R: Read>(reader: R, sums: &mut [&mut TarSum]) -> Result<(), TarSumError> {
    let mut source = Source {
        inner: reader,
        failure: None,
    };
    let walked = walk(&mut tar::Archive::new(&mut source), sums);
    walked.map_err(|err| match source.failure.take() {
        Some(failure) => TarSumError::Read(failure),
        None => TarSumError::Archive(err),
    })
}

fn walk<R: Read>(archive: &mut tar::Archive<R>, sums: &mut [&mut TarSum]) -> io::Result<()> {
    let mut buf = vec![0u8; CHUNK];
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.header().entry_type().is_pax_global_extensions() {
            continue;
        }

        let header = EntryHeader::read(&mut entry)?;
        let mut hashers: Vec<Hasher> = sums.iter().map(|sum| sum.begin_entry(&header)).collect();
        loop {
            let n = entry.read(&mut buf)?;
            if n == 0 {
                break;
            }
            for hasher in &mut hashers {
                hasher.update(&buf[..n]);
            }
        }

        for (sum, hasher) in sums.iter_mut().zip(hashers) {
            sum.sums.push(hasher.finalize_hex());
        }
    }
    Ok(())
}

/// Keeps the error returned by the underlying reader, which the archive parser
/// would otherwise report like any malformed header.
struct Source<R> {
    inner: R,
    failure: Option<io::Error>,
}

impl<R: Read> Read for Source<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf).map_err(|err| {
            let reported = io::Error::new(err.kind(), "archive source failed");
            self.failure = Some(err);
            reported
        })
    }
}
