use std::io::SeekFrom;

use camino::{Utf8Path, Utf8PathBuf};
use eyre::Context;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::Instrument;

use storage_driver::{BoxReader, Driver, Metadata, Reader, StorageError, StorageErrorKind};

const ENGINE: &str = "local";

/// Storage driver backed by a directory on the local filesystem.
#[derive(Debug)]
pub struct LocalDriver {
    root: Utf8PathBuf,
}

impl LocalDriver {
    /// Create a driver storing everything underneath `root`.
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    fn path(&self, remote: &Utf8Path) -> Utf8PathBuf {
        self.root.join(remote.as_str().trim_start_matches('/'))
    }

    async fn create_parent(&self, remote: &Utf8Path, local: &Utf8Path) -> Result<(), StorageError> {
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| StorageError::from_io(ENGINE, remote.as_str(), err))?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Driver for LocalDriver {
    fn name(&self) -> &'static str {
        ENGINE
    }

    async fn stat(&self, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        let local = self.path(remote);
        let metadata = tokio::fs::metadata(&local)
            .await
            .map_err(|err| StorageError::from_io(ENGINE, remote.as_str(), err))?;
        let modified = metadata
            .modified()
            .map_err(|err| StorageError::from_io(ENGINE, remote.as_str(), err))?;

        Ok(Metadata {
            size: if metadata.is_dir() { 0 } else { metadata.len() },
            is_dir: metadata.is_dir(),
            created: modified.into(),
        })
    }

    async fn get_content(&self, remote: &Utf8Path) -> Result<Vec<u8>, StorageError> {
        tokio::fs::read(self.path(remote))
            .await
            .map_err(|err| StorageError::from_io(ENGINE, remote.as_str(), err))
    }

    async fn put_content(&self, remote: &Utf8Path, content: &[u8]) -> Result<(), StorageError> {
        let local = self.path(remote);
        self.create_parent(remote, &local).await?;

        let content = content.to_vec();
        tokio::task::spawn_blocking(move || replace_file(&local, &content))
            .in_current_span()
            .await
            .map_err(StorageError::with(ENGINE, StorageErrorKind::Io))?
            .map_err(|err| StorageError::from_io(ENGINE, remote.as_str(), err))
    }

    async fn reader(&self, remote: &Utf8Path, offset: u64) -> Result<BoxReader, StorageError> {
        let mut file = tokio::fs::File::open(self.path(remote))
            .await
            .map_err(|err| StorageError::from_io(ENGINE, remote.as_str(), err))?;

        let size = file
            .metadata()
            .await
            .map_err(|err| StorageError::from_io(ENGINE, remote.as_str(), err))?
            .len();
        if offset > size {
            return Err(StorageError::builder(
                ENGINE,
                StorageErrorKind::Io,
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("offset {offset} is past the end of the file ({size} bytes)"),
                ),
            )
            .path(remote.as_str())
            .build());
        }

        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|err| StorageError::from_io(ENGINE, remote.as_str(), err))?;
        Ok(Box::new(tokio::io::BufReader::new(file)))
    }

    async fn write_stream(
        &self,
        remote: &Utf8Path,
        offset: u64,
        reader: &mut Reader<'_>,
    ) -> Result<u64, StorageError> {
        let local = self.path(remote);
        self.create_parent(remote, &local).await?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&local)
            .await
            .map_err(|err| StorageError::from_io(ENGINE, remote.as_str(), err))?;

        let size = file
            .metadata()
            .await
            .map_err(|err| StorageError::from_io(ENGINE, remote.as_str(), err))?
            .len();
        if offset > size {
            return Err(StorageError::builder(
                ENGINE,
                StorageErrorKind::Io,
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("offset {offset} is past the end of the file ({size} bytes)"),
                ),
            )
            .path(remote.as_str())
            .context("write_stream")
            .build());
        }

        file.set_len(offset)
            .await
            .map_err(|err| StorageError::from_io(ENGINE, remote.as_str(), err))?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|err| StorageError::from_io(ENGINE, remote.as_str(), err))?;

        let mut writer = tokio::io::BufWriter::new(file);
        let written = tokio::io::copy(reader, &mut writer)
            .await
            .map_err(|err| StorageError::from_io(ENGINE, remote.as_str(), err))?;

        writer
            .shutdown()
            .await
            .map_err(|err| StorageError::from_io(ENGINE, remote.as_str(), err))?;
        Ok(written)
    }

    async fn move_to(
        &self,
        source: &Utf8Path,
        destination: &Utf8Path,
    ) -> Result<(), StorageError> {
        let from = self.path(source);
        let to = self.path(destination);

        // Surface a missing source before creating any destination directories.
        tokio::fs::metadata(&from)
            .await
            .map_err(|err| StorageError::from_io(ENGINE, source.as_str(), err))?;

        self.create_parent(destination, &to).await?;

        // Linking fails on an occupied destination, where a rename would replace it.
        tokio::fs::hard_link(&from, &to)
            .await
            .map_err(|err| StorageError::from_io(ENGINE, destination.as_str(), err))?;
        tokio::fs::remove_file(&from)
            .await
            .map_err(|err| StorageError::from_io(ENGINE, source.as_str(), err))
    }

    async fn delete(&self, remote: &Utf8Path) -> Result<(), StorageError> {
        let local = self.path(remote);
        let metadata = tokio::fs::symlink_metadata(&local)
            .await
            .map_err(|err| StorageError::from_io(ENGINE, remote.as_str(), err))?;

        let removed = if metadata.is_dir() {
            tokio::fs::remove_dir_all(&local).await
        } else {
            tokio::fs::remove_file(&local).await
        };
        removed.map_err(|err| StorageError::from_io(ENGINE, remote.as_str(), err))
    }

    async fn list(&self, prefix: &Utf8Path) -> Result<Vec<String>, StorageError> {
        let path = self.path(prefix);

        let items = tokio::task::spawn_blocking(move || collect_list(&path))
            .in_current_span()
            .await
            .wrap_err("local driver")
            .map_err(StorageError::with(ENGINE, StorageErrorKind::Io))?
            .map_err(StorageError::with(ENGINE, StorageErrorKind::Io))?;

        tracing::debug!("Found {} entries", items.len());

        Ok(items
            .into_iter()
            .map(|p| prefix.join(p).to_string())
            .collect())
    }
}

/// Stage `content` in a temporary file beside `local`, then rename it into place.
fn replace_file(local: &Utf8Path, content: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    let parent = local.parent().unwrap_or(Utf8Path::new("."));
    let mut staged = tempfile::NamedTempFile::new_in(parent)?;
    staged.write_all(content)?;
    staged.as_file().sync_all()?;
    staged.persist(local).map_err(|err| err.error)?;
    Ok(())
}

#[tracing::instrument]
fn collect_list(path: &Utf8Path) -> eyre::Result<Vec<Utf8PathBuf>> {
    let mut files = Vec::new();

    match path.symlink_metadata() {
        Ok(metadata) if metadata.is_dir() => visit(path, &mut files)?,
        Ok(_) => files.push(path.to_owned()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).wrap_err_with(|| format!("stat {path}")),
    }

    Ok(files
        .into_iter()
        .filter_map(|p| p.strip_prefix(path).ok().map(|p| p.to_owned()))
        .collect())
}

fn visit(path: &Utf8Path, files: &mut Vec<Utf8PathBuf>) -> eyre::Result<()> {
    for entry in path.read_dir_utf8()? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            visit(entry.path(), files)?;
        } else {
            files.push(entry.path().to_owned())
        }
    }

    Ok(())
}
