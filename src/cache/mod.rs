//! Local read-through cache for remote objects
//!
//! Each remote object is mirrored as one file in the cache directory.
//! Opening an object goes through three steps under the object's name mutex:
//!
//! | Step | Module | Outcome |
//! |------|--------|---------|
//! | Evaluate | `freshness` | fresh, or stale with a reason |
//! | Populate | `populate` | download (and inflate) into the cache |
//! | Open | `input` | random-access handle over the cached file |
//!
//! Population writes a hidden temporary file and renames it into place, so a
//! crash mid-download never leaves a truncated entry under the real name and
//! handles that are already open keep reading the bytes they opened.

pub mod freshness;
pub mod input;
pub mod mutex;
pub mod populate;

pub use freshness::{Freshness, FreshnessMetadata, StaleReason};
pub use input::CachedInput;
pub use mutex::{NameMutex, NameMutexRegistry};

use crate::error::{BlobdirError, BlobdirResult};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

/// Prefix marking in-progress cache files
const PARTIAL_PREFIX: &str = ".partial-";

/// Check that a name is a single, non-hidden path component
pub fn validate_name(name: &str) -> BlobdirResult<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && !name.contains(['/', '\\'])
        && !name.contains('\0');
    if valid {
        Ok(())
    } else {
        Err(BlobdirError::InvalidName(name.to_string()))
    }
}

/// Directory holding cached copies of remote objects
#[derive(Debug, Clone)]
pub struct CacheDir {
    root: PathBuf,
}

impl CacheDir {
    /// Open a cache directory, creating it if needed
    pub async fn open(root: impl Into<PathBuf>) -> BlobdirResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await.map_err(|e| {
            BlobdirError::io(format!("creating cache directory {}", root.display()), e)
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the cached copy of `name`
    pub fn path_of(&self, name: &str) -> BlobdirResult<PathBuf> {
        validate_name(name)?;
        Ok(self.root.join(name))
    }

    pub async fn file_exists(&self, name: &str) -> BlobdirResult<bool> {
        let path = self.path_of(name)?;
        fs::try_exists(&path)
            .await
            .map_err(|e| BlobdirError::io(format!("checking {}", path.display()), e))
    }

    pub async fn file_length(&self, name: &str) -> BlobdirResult<u64> {
        Ok(self.stat(name).await?.len())
    }

    /// Modification time of the cached copy in milliseconds since the Unix epoch
    pub async fn file_modified_millis(&self, name: &str) -> BlobdirResult<i64> {
        Ok(self.file_modified(name).await?.timestamp_millis())
    }

    pub async fn file_modified(&self, name: &str) -> BlobdirResult<DateTime<Utc>> {
        let path = self.path_of(name)?;
        let modified = self
            .stat(name)
            .await?
            .modified()
            .map_err(|e| BlobdirError::io(format!("reading mtime of {}", path.display()), e))?;
        Ok(DateTime::<Utc>::from(modified))
    }

    pub async fn open_for_read(&self, name: &str) -> BlobdirResult<File> {
        let path = self.path_of(name)?;
        File::open(&path)
            .await
            .map_err(|e| BlobdirError::io(format!("opening {}", path.display()), e))
    }

    /// Start writing a new copy of `name`; nothing is visible under the real
    /// name until [`CacheWriter::commit`]
    pub async fn create_for_write(&self, name: &str) -> BlobdirResult<CacheWriter> {
        let final_path = self.path_of(name)?;
        let temp_path = self.root.join(format!(
            "{}{}-{}",
            PARTIAL_PREFIX,
            Uuid::new_v4().simple(),
            name
        ));
        let file = File::create(&temp_path)
            .await
            .map_err(|e| BlobdirError::io(format!("creating {}", temp_path.display()), e))?;

        Ok(CacheWriter {
            file,
            temp: TempFileGuard {
                path: Some(temp_path),
            },
            final_path,
        })
    }

    /// Remove leftovers of interrupted populations
    pub async fn remove_partials(&self) -> BlobdirResult<usize> {
        let mut entries = fs::read_dir(&self.root)
            .await
            .map_err(|e| BlobdirError::io(format!("listing {}", self.root.display()), e))?;
        let mut removed = 0;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| BlobdirError::io(format!("listing {}", self.root.display()), e))?
        {
            if entry.file_name().to_string_lossy().starts_with(PARTIAL_PREFIX) {
                fs::remove_file(entry.path())
                    .await
                    .map_err(|e| BlobdirError::io("removing partial cache file", e))?;
                removed += 1;
            }
        }

        if removed > 0 {
            debug!(removed, "removed partial cache files");
        }
        Ok(removed)
    }

    async fn stat(&self, name: &str) -> BlobdirResult<std::fs::Metadata> {
        let path = self.path_of(name)?;
        fs::metadata(&path)
            .await
            .map_err(|e| BlobdirError::io(format!("reading metadata of {}", path.display()), e))
    }
}

/// Removes a temporary file on drop unless disarmed
#[derive(Debug)]
struct TempFileGuard {
    path: Option<PathBuf>,
}

impl TempFileGuard {
    fn path(&self) -> &Path {
        self.path.as_deref().unwrap_or_else(|| Path::new(""))
    }

    fn disarm(&mut self) {
        self.path = None;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// In-progress cache entry backed by a hidden temporary file
///
/// Dropping a writer without committing removes the temporary file.
#[derive(Debug)]
pub struct CacheWriter {
    file: File,
    temp: TempFileGuard,
    final_path: PathBuf,
}

impl CacheWriter {
    /// The temporary file being written
    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    /// Flush, optionally stamp the modification time, and move into place
    pub async fn commit(self, modified: Option<SystemTime>) -> BlobdirResult<()> {
        let Self {
            mut file,
            mut temp,
            final_path,
        } = self;

        file.flush()
            .await
            .map_err(|e| BlobdirError::io(format!("flushing {}", temp.path().display()), e))?;

        let file = file.into_std().await;
        if let Some(modified) = modified {
            file.set_modified(modified).map_err(|e| {
                BlobdirError::io(format!("stamping mtime on {}", temp.path().display()), e)
            })?;
        }
        drop(file);

        fs::rename(temp.path(), &final_path).await.map_err(|e| {
            BlobdirError::io(format!("moving cache entry to {}", final_path.display()), e)
        })?;
        temp.disarm();
        Ok(())
    }
}
