//! Random-access read handle over a cached object

use super::{CacheDir, NameMutex};
use crate::error::{BlobdirError, BlobdirResult};
use std::fs::File as StdFile;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Bytes fetched per positional read when the request is smaller
const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Read handle bound to one cache file
///
/// Each handle owns its own descriptor and cursor. Reads are positional, so
/// a handle and its clones never disturb each other. Handles are not
/// internally synchronized; share one across tasks only behind external
/// locking.
///
/// The length is fixed when the handle opens. A later repopulation replaces
/// the cache file by rename, so an open handle and every clone of it keep
/// reading the bytes it opened.
#[derive(Debug)]
pub struct CachedInput {
    name: String,
    path: PathBuf,
    mutex: NameMutex,
    length: u64,
    position: u64,
    file: Option<Arc<StdFile>>,
    buffer: Vec<u8>,
    buffer_start: u64,
}

#[cfg(unix)]
fn read_at(file: &StdFile, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::read_at(file, buf, offset)
}

#[cfg(windows)]
fn read_at(file: &StdFile, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_read(file, buf, offset)
}

/// Read up to `want` bytes at `offset`, stopping early only at end of file
fn read_span(file: &StdFile, offset: u64, want: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; want];
    let mut filled = 0;
    while filled < want {
        match read_at(file, &mut buf[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    buf.truncate(filled);
    Ok(buf)
}

impl CachedInput {
    /// Open the cached copy of `name`
    ///
    /// Callers populate the entry first and hold the name's mutex while
    /// opening.
    pub async fn open(cache: &CacheDir, name: &str, mutex: NameMutex) -> BlobdirResult<Self> {
        let path = cache.path_of(name)?;
        let file = cache.open_for_read(name).await?;
        let length = file
            .metadata()
            .await
            .map_err(|e| BlobdirError::io(format!("reading metadata of {}", path.display()), e))?
            .len();

        debug!(name = %name, length, "opened cached input");
        Ok(Self {
            name: name.to_string(),
            path,
            mutex,
            length,
            position: 0,
            file: Some(Arc::new(file.into_std().await)),
            buffer: Vec::new(),
            buffer_start: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Location of the backing cache file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Byte length of the cached content
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Current cursor position
    pub fn file_pointer(&self) -> u64 {
        self.position
    }

    pub fn is_closed(&self) -> bool {
        self.file.is_none()
    }

    fn open_file(&self) -> BlobdirResult<&Arc<StdFile>> {
        self.file.as_ref().ok_or_else(|| BlobdirError::UseAfterClose {
            name: self.name.clone(),
        })
    }

    fn buffered(&self, requested: u64) -> bool {
        let end = self.buffer_start + self.buffer.len() as u64;
        self.position >= self.buffer_start && self.position + requested <= end
    }

    /// Read one byte and advance the cursor
    pub async fn read_byte(&mut self) -> BlobdirResult<u8> {
        let mut byte = [0u8; 1];
        self.read_bytes(&mut byte).await?;
        Ok(byte[0])
    }

    /// Fill `buf` completely from the cursor and advance past it
    ///
    /// Fails with `EndOfInput` when the cursor is at or past the end and with
    /// `Truncated` when fewer than `buf.len()` bytes remain. The cursor does
    /// not move on failure.
    pub async fn read_bytes(&mut self, buf: &mut [u8]) -> BlobdirResult<()> {
        let file = Arc::clone(self.open_file()?);
        if buf.is_empty() {
            return Ok(());
        }
        if self.position >= self.length {
            return Err(BlobdirError::EndOfInput {
                name: self.name.clone(),
                position: self.position,
            });
        }

        let available = self.length - self.position;
        let requested = buf.len() as u64;
        if requested > available {
            return Err(BlobdirError::Truncated {
                name: self.name.clone(),
                requested,
                available,
            });
        }

        if !self.buffered(requested) {
            let offset = self.position;
            let want = requested.max(READ_BUFFER_SIZE as u64).min(available) as usize;
            let span = tokio::task::spawn_blocking(move || read_span(&file, offset, want))
                .await
                .map_err(io::Error::other)
                .and_then(|read| read)
                .map_err(|e| BlobdirError::io(format!("reading {}", self.path.display()), e))?;

            if (span.len() as u64) < requested {
                return Err(BlobdirError::Truncated {
                    name: self.name.clone(),
                    requested,
                    available: span.len() as u64,
                });
            }
            self.buffer = span;
            self.buffer_start = offset;
        }

        let start = (self.position - self.buffer_start) as usize;
        buf.copy_from_slice(&self.buffer[start..start + buf.len()]);
        self.position += requested;
        Ok(())
    }

    /// Move the cursor to an absolute offset
    ///
    /// Offsets past the end are accepted; the next read fails.
    pub async fn seek(&mut self, position: u64) -> BlobdirResult<()> {
        self.open_file()?;
        self.position = position;
        Ok(())
    }

    /// Open an independent handle over the same bytes
    ///
    /// The clone duplicates this handle's descriptor, so it reads the file
    /// this handle opened even if the entry has since been replaced. It has
    /// its own cursor, starting at this handle's current position. The name
    /// mutex is held only while the descriptor is duplicated.
    pub async fn try_clone(&self) -> BlobdirResult<Self> {
        let file = self.open_file()?;

        let _guard = self.mutex.lock().await;
        let duplicate = file.try_clone().map_err(|source| BlobdirError::Clone {
            name: self.name.clone(),
            source,
        })?;

        Ok(Self {
            name: self.name.clone(),
            path: self.path.clone(),
            mutex: self.mutex.clone(),
            length: self.length,
            position: self.position,
            file: Some(Arc::new(duplicate)),
            buffer: Vec::new(),
            buffer_start: 0,
        })
    }

    /// Release the underlying file
    pub async fn close(&mut self) -> BlobdirResult<()> {
        let _guard = self.mutex.lock().await;
        match self.file.take() {
            Some(file) => {
                drop(file);
                self.buffer = Vec::new();
                debug!(name = %self.name, "closed cached input");
                Ok(())
            }
            None => Err(BlobdirError::UseAfterClose {
                name: self.name.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::NameMutexRegistry;
    use tempfile::TempDir;

    async fn cached(content: &[u8]) -> (TempDir, CacheDir, NameMutexRegistry) {
        let temp = TempDir::new().unwrap();
        let cache = CacheDir::open(temp.path()).await.unwrap();
        tokio::fs::write(cache.path_of("_0.cfs").unwrap(), content)
            .await
            .unwrap();
        (temp, cache, NameMutexRegistry::new())
    }

    #[tokio::test]
    async fn sequential_and_point_reads() {
        let (_temp, cache, registry) = cached(b"0123456789").await;
        let mut input = CachedInput::open(&cache, "_0.cfs", registry.grab("_0.cfs"))
            .await
            .unwrap();

        assert_eq!(input.length(), 10);
        assert_eq!(input.read_byte().await.unwrap(), b'0');

        let mut buf = [0u8; 4];
        input.read_bytes(&mut buf).await.unwrap();
        assert_eq!(&buf, b"1234");
        assert_eq!(input.file_pointer(), 5);

        input.seek(8).await.unwrap();
        assert_eq!(input.read_byte().await.unwrap(), b'8');
        input.seek(2).await.unwrap();
        assert_eq!(input.read_byte().await.unwrap(), b'2');
    }

    #[tokio::test]
    async fn reads_past_end_fail() {
        let (_temp, cache, registry) = cached(b"abc").await;
        let mut input = CachedInput::open(&cache, "_0.cfs", registry.grab("_0.cfs"))
            .await
            .unwrap();

        let mut buf = [0u8; 5];
        let err = input.read_bytes(&mut buf).await.unwrap_err();
        assert!(matches!(err, BlobdirError::Truncated { requested: 5, available: 3, .. }));
        assert_eq!(input.file_pointer(), 0);

        input.seek(3).await.unwrap();
        let err = input.read_byte().await.unwrap_err();
        assert!(matches!(err, BlobdirError::EndOfInput { position: 3, .. }));

        input.seek(100).await.unwrap();
        assert!(input.read_byte().await.is_err());
    }

    #[tokio::test]
    async fn clone_starts_at_source_position_and_moves_independently() {
        let (_temp, cache, registry) = cached(b"abcdef").await;
        let mut source = CachedInput::open(&cache, "_0.cfs", registry.grab("_0.cfs"))
            .await
            .unwrap();
        source.seek(2).await.unwrap();

        let mut clone = source.try_clone().await.unwrap();
        assert_eq!(clone.file_pointer(), 2);
        assert_eq!(clone.read_byte().await.unwrap(), b'c');
        assert_eq!(clone.read_byte().await.unwrap(), b'd');

        assert_eq!(source.file_pointer(), 2);
        assert_eq!(source.read_byte().await.unwrap(), b'c');

        clone.close().await.unwrap();
        assert_eq!(source.read_byte().await.unwrap(), b'd');
    }

    #[tokio::test]
    async fn clone_keeps_reading_original_bytes_after_replacement() {
        let (temp, cache, registry) = cached(b"abcdef").await;
        let mut source = CachedInput::open(&cache, "_0.cfs", registry.grab("_0.cfs"))
            .await
            .unwrap();
        source.seek(1).await.unwrap();

        // Same length, swapped in by rename the way populate commits
        let replacement = temp.path().join("replacement");
        tokio::fs::write(&replacement, b"ABCDEF").await.unwrap();
        tokio::fs::rename(&replacement, cache.path_of("_0.cfs").unwrap())
            .await
            .unwrap();

        let mut clone = source.try_clone().await.unwrap();
        let mut buf = [0u8; 3];
        clone.read_bytes(&mut buf).await.unwrap();
        assert_eq!(&buf, b"bcd");
        assert_eq!(source.read_byte().await.unwrap(), b'b');
    }

    #[tokio::test]
    async fn failed_read_leaves_cursor_in_place() {
        let (_temp, cache, registry) = cached(b"0123456789").await;
        let mut input = CachedInput::open(&cache, "_0.cfs", registry.grab("_0.cfs"))
            .await
            .unwrap();

        // Shrink the open file underneath the handle
        std::fs::OpenOptions::new()
            .write(true)
            .open(cache.path_of("_0.cfs").unwrap())
            .unwrap()
            .set_len(3)
            .unwrap();

        let mut buf = [0u8; 5];
        let err = input.read_bytes(&mut buf).await.unwrap_err();
        assert!(matches!(err, BlobdirError::Truncated { requested: 5, available: 3, .. }));
        assert_eq!(input.file_pointer(), 0);
        assert_eq!(input.read_byte().await.unwrap(), b'0');
        assert_eq!(input.file_pointer(), 1);
    }

    #[tokio::test]
    async fn use_after_close_fails() {
        let (_temp, cache, registry) = cached(b"abc").await;
        let mut input = CachedInput::open(&cache, "_0.cfs", registry.grab("_0.cfs"))
            .await
            .unwrap();

        input.close().await.unwrap();
        assert!(input.is_closed());

        assert!(matches!(
            input.read_byte().await.unwrap_err(),
            BlobdirError::UseAfterClose { .. }
        ));
        assert!(matches!(
            input.seek(0).await.unwrap_err(),
            BlobdirError::UseAfterClose { .. }
        ));
        assert!(matches!(
            input.try_clone().await.unwrap_err(),
            BlobdirError::UseAfterClose { .. }
        ));
        assert!(matches!(
            input.close().await.unwrap_err(),
            BlobdirError::UseAfterClose { .. }
        ));
    }
}
