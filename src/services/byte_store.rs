//! src/services/byte_store.rs
//!
//! ByteStore: raw byte I/O for a single object file. Every write returns the
//! MD5 of the resulting file so the caller never has to hash bytes itself and
//! the stored hash cannot drift from what is on disk.

use crate::errors::{StorageError, StorageResult};
use bytes::Bytes;
use md5::Context;
use std::{
    io::SeekFrom,
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};
use tracing::debug;
use uuid::Uuid;

/// Size of each read/write step when streaming bytes.
pub const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Clone, Debug, Default)]
pub struct ByteStore;

impl ByteStore {
    pub fn new() -> Self {
        Self
    }

    /// Stream exactly `length` bytes from `source` into a new file at `path`.
    ///
    /// Bytes land in a temporary sibling first and are renamed into place once
    /// fully written and synced; on any failure the temporary file is removed.
    pub async fn write<R>(&self, path: &Path, length: u64, mut source: R) -> StorageResult<String>
    where
        R: AsyncRead + Unpin,
    {
        let parent = parent_dir(path)?;
        fs::create_dir_all(&parent)
            .await
            .map_err(|e| StorageError::from_io(parent.display(), e))?;

        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let result = async {
            let mut file = File::create(&tmp_path)
                .await
                .map_err(|e| StorageError::from_io(tmp_path.display(), e))?;
            let mut digest = Context::new();
            copy_exact(&mut source, &mut file, length, Some(&mut digest), &tmp_path).await?;
            file.flush()
                .await
                .map_err(|e| StorageError::from_io(tmp_path.display(), e))?;
            file.sync_all()
                .await
                .map_err(|e| StorageError::from_io(tmp_path.display(), e))?;
            Ok::<_, StorageError>(format!("{:x}", digest.compute()))
        }
        .await;

        let md5 = match result {
            Ok(md5) => md5,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(err);
            }
        };

        if let Err(err) = fs::rename(&tmp_path, path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::from_io(path.display(), err));
        }

        debug!("wrote {} bytes to {} (md5 {})", length, path.display(), md5);
        Ok(md5)
    }

    /// Write `length` bytes at `position`, creating the file if needed, and
    /// return the MD5 of the entire file afterwards.
    pub async fn write_range<R>(
        &self,
        path: &Path,
        position: u64,
        length: u64,
        mut source: R,
    ) -> StorageResult<String>
    where
        R: AsyncRead + Unpin,
    {
        let parent = parent_dir(path)?;
        fs::create_dir_all(&parent)
            .await
            .map_err(|e| StorageError::from_io(parent.display(), e))?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .await
            .map_err(|e| StorageError::from_io(path.display(), e))?;

        file.seek(SeekFrom::Start(position))
            .await
            .map_err(|e| StorageError::from_io(path.display(), e))?;
        copy_exact(&mut source, &mut file, length, None, path).await?;
        file.flush()
            .await
            .map_err(|e| StorageError::from_io(path.display(), e))?;
        file.sync_all()
            .await
            .map_err(|e| StorageError::from_io(path.display(), e))?;

        // Anything in the file may have changed relative to the old hash.
        file.seek(SeekFrom::Start(0))
            .await
            .map_err(|e| StorageError::from_io(path.display(), e))?;
        let md5 = hash_reader(&mut file, path).await?;
        debug!(
            "wrote {} bytes at offset {} to {} (md5 {})",
            length,
            position,
            path.display(),
            md5
        );
        Ok(md5)
    }

    /// Open a file for sequential reading. Returns its length and the handle.
    pub async fn read(&self, path: &Path) -> StorageResult<(u64, File)> {
        let file = File::open(path)
            .await
            .map_err(|e| StorageError::from_io(path.display(), e))?;
        let len = file
            .metadata()
            .await
            .map_err(|e| StorageError::from_io(path.display(), e))?
            .len();
        Ok((len, file))
    }

    /// Read exactly `count` bytes starting at `position` into memory.
    pub async fn read_range(&self, path: &Path, position: u64, count: u64) -> StorageResult<Bytes> {
        let (length, mut file) = self.read(path).await?;
        let end = position.checked_add(count);
        if end.is_none_or(|end| end > length) {
            return Err(StorageError::OutOfRange {
                position,
                count,
                length,
            });
        }

        file.seek(SeekFrom::Start(position))
            .await
            .map_err(|e| StorageError::from_io(path.display(), e))?;
        let mut buf = vec![0u8; count as usize];
        file.read_exact(&mut buf)
            .await
            .map_err(|e| StorageError::from_io(path.display(), e))?;
        Ok(Bytes::from(buf))
    }

    pub async fn delete(&self, path: &Path) -> StorageResult<()> {
        fs::remove_file(path)
            .await
            .map_err(|e| StorageError::from_io(path.display(), e))?;
        debug!("removed physical file {}", path.display());
        Ok(())
    }

    pub async fn rename(&self, old_path: &Path, new_path: &Path) -> StorageResult<()> {
        if !self.exists(old_path).await {
            return Err(StorageError::NotFound(old_path.display().to_string()));
        }
        if self.exists(new_path).await {
            return Err(StorageError::AlreadyExists(new_path.display().to_string()));
        }
        fs::rename(old_path, new_path)
            .await
            .map_err(|e| StorageError::from_io(old_path.display(), e))
    }

    pub async fn size(&self, path: &Path) -> StorageResult<u64> {
        let meta = fs::metadata(path)
            .await
            .map_err(|e| StorageError::from_io(path.display(), e))?;
        Ok(meta.len())
    }

    pub async fn exists(&self, path: &Path) -> bool {
        matches!(fs::metadata(path).await, Ok(meta) if meta.is_file())
    }

    /// MD5 of the whole file at `path`.
    pub async fn hash(&self, path: &Path) -> StorageResult<String> {
        let (_, mut file) = self.read(path).await?;
        hash_reader(&mut file, path).await
    }
}

fn parent_dir(path: &Path) -> StorageResult<PathBuf> {
    path.parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| StorageError::Server(format!("{} has no parent directory", path.display())))
}

/// Copy exactly `length` bytes from `source` to `file` in `CHUNK_SIZE` steps.
async fn copy_exact<R>(
    source: &mut R,
    file: &mut File,
    length: u64,
    mut digest: Option<&mut Context>,
    path: &Path,
) -> StorageResult<()>
where
    R: AsyncRead + Unpin,
{
    let mut remaining = length;
    let mut buf = vec![0u8; CHUNK_SIZE.min(length.max(1) as usize)];
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let read = source
            .read(&mut buf[..want])
            .await
            .map_err(|e| StorageError::Stream(e.to_string()))?;
        if read == 0 {
            return Err(StorageError::Stream(format!(
                "source ended with {} of {} bytes outstanding",
                remaining, length
            )));
        }
        if let Some(digest) = digest.as_deref_mut() {
            digest.consume(&buf[..read]);
        }
        file.write_all(&buf[..read])
            .await
            .map_err(|e| StorageError::from_io(path.display(), e))?;
        remaining -= read as u64;
    }
    Ok(())
}

async fn hash_reader(file: &mut File, path: &Path) -> StorageResult<String> {
    let mut digest = Context::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let read = file
            .read(&mut buf)
            .await
            .map_err(|e| StorageError::from_io(path.display(), e))?;
        if read == 0 {
            break;
        }
        digest.consume(&buf[..read]);
    }
    Ok(format!("{:x}", digest.compute()))
}
