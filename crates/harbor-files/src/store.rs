//! File operations scoped to one library root.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use filetime::FileTime;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use harbor_core::checksum::{self, digests_match, is_valid_digest};
use harbor_core::error::{Error, Result};
use harbor_core::path::relative_display;
use harbor_core::proto::FileInfo;
use harbor_core::TEMP_FILE_PREFIX;

/// Filesystem backend bound to one library root.
///
/// All paths passed in are absolute and already validated against the
/// root by the path validator; the store trusts them.
pub struct FileStore {
    root: PathBuf,
}

/// EXDEV errno: rename across filesystems, triggers the copy fallback
const EXDEV: i32 = 18;

impl FileStore {
    /// Create a store over a library root
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// The library root this store serves
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Shadow file path for an upload target
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPath`] when the target has no file name,
    /// i.e. the library root itself.
    pub fn temp_path_for(&self, final_path: &Path) -> Result<PathBuf> {
        let name = final_path
            .file_name()
            .ok_or_else(|| Error::InvalidPath("upload target has no file name".to_string()))?;
        let parent = final_path.parent().unwrap_or(&self.root);
        let mut temp_name = std::ffi::OsString::from(TEMP_FILE_PREFIX);
        temp_name.push(name);
        Ok(parent.join(temp_name))
    }

    /// Begin or resume an upload.
    ///
    /// Returns the shadow file path and the offset the client should
    /// resume from. A resumable shadow no larger than the expected size is
    /// continued; anything else starts from zero. A fresh upload over an
    /// existing target fails with [`Error::FileExists`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidMessage`] for a malformed checksum,
    /// [`Error::FileExists`], [`Error::DiskFull`], or an I/O error.
    pub async fn start_upload(
        &self,
        final_path: &Path,
        file_size: u64,
        expected_checksum: &str,
        resume: bool,
    ) -> Result<(PathBuf, u64)> {
        if !is_valid_digest(expected_checksum) {
            return Err(Error::InvalidMessage(format!(
                "malformed upload checksum: {expected_checksum:?}"
            )));
        }

        let temp_path = self.temp_path_for(final_path)?;

        if resume {
            if let Ok(meta) = fs::metadata(&temp_path).await {
                let existing = meta.len();
                if existing <= file_size {
                    tracing::debug!(temp = %temp_path.display(), offset = existing, "resuming upload");
                    return Ok((temp_path, existing));
                }
                // Shadow outgrew the advertised size; it cannot belong to
                // this upload.
                fs::remove_file(&temp_path).await?;
            }
        } else if fs::try_exists(final_path).await? {
            return Err(Error::FileExists(final_path.display().to_string()));
        }

        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        fs::File::create(&temp_path).await?;
        Ok((temp_path, 0))
    }

    /// Write one chunk at `offset` and make it durable before returning.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileNotFound`] when the shadow file is missing and
    /// [`Error::DiskFull`] when the filesystem is out of space.
    pub async fn write_chunk(&self, temp_path: &Path, offset: u64, data: &[u8]) -> Result<u64> {
        let mut file = OpenOptions::new().write(true).open(temp_path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        file.sync_data().await?;
        Ok(data.len() as u64)
    }

    /// Verify a finished upload and promote it atomically.
    ///
    /// The shadow file is re-hashed end to end; a digest mismatch removes
    /// it and fails. Promotion is a rename, falling back to copy-and-delete
    /// across filesystems. The carried timestamps are applied after
    /// promotion.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChecksumMismatch`] (the shadow is gone afterwards)
    /// or an I/O error from the rename.
    pub async fn complete_upload(
        &self,
        temp_path: &Path,
        final_path: &Path,
        expected_checksum: &str,
        modified_time: Option<f64>,
        created_time: Option<f64>,
    ) -> Result<()> {
        let actual = checksum::hash_file(temp_path).await?;
        if !digests_match(&actual, expected_checksum) {
            let _ = fs::remove_file(temp_path).await;
            return Err(Error::ChecksumMismatch {
                expected: expected_checksum.to_lowercase(),
                actual,
            });
        }

        rename_or_copy(temp_path, final_path).await?;
        apply_file_times(final_path, modified_time, created_time)
    }

    /// Open a file for download: its size and whole-file digest.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileNotFound`] or [`Error::InvalidPath`] for a
    /// directory.
    pub async fn start_download(&self, path: &Path) -> Result<(u64, String)> {
        let meta = fs::metadata(path)
            .await
            .map_err(|_| Error::FileNotFound(self.display(path)))?;
        if !meta.is_file() {
            return Err(Error::InvalidPath(format!(
                "not a file: {}",
                self.display(path)
            )));
        }
        let digest = checksum::hash_file(path).await?;
        Ok((meta.len(), digest))
    }

    /// Read up to `len` bytes at `offset`; short at end of file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileNotFound`] when the file is missing.
    pub async fn read_chunk(&self, path: &Path, offset: u64, len: u64) -> Result<Vec<u8>> {
        let mut file = fs::File::open(path)
            .await
            .map_err(|_| Error::FileNotFound(self.display(path)))?;
        file.seek(SeekFrom::Start(offset)).await?;

        let mut buf = vec![0u8; len as usize];
        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    /// Delete a file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileNotFound`] when missing and
    /// [`Error::InvalidPath`] for directories.
    pub async fn delete(&self, path: &Path) -> Result<()> {
        let meta = fs::metadata(path)
            .await
            .map_err(|_| Error::FileNotFound(self.display(path)))?;
        if meta.is_dir() {
            return Err(Error::InvalidPath(format!(
                "cannot delete a directory: {}",
                self.display(path)
            )));
        }
        fs::remove_file(path).await?;
        Ok(())
    }

    /// Rename or move a file within the library.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileNotFound`] for a missing source and
    /// [`Error::FileExists`] for an occupied destination.
    pub async fn rename(&self, old_path: &Path, new_path: &Path) -> Result<()> {
        if !fs::try_exists(old_path).await? {
            return Err(Error::FileNotFound(self.display(old_path)));
        }
        if fs::try_exists(new_path).await? {
            return Err(Error::FileExists(self.display(new_path)));
        }
        if let Some(parent) = new_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        rename_or_copy(old_path, new_path).await
    }

    /// Create a directory (and any missing parents).
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileExists`] when the path is already occupied.
    pub async fn mkdir(&self, path: &Path) -> Result<()> {
        if fs::try_exists(path).await? {
            return Err(Error::FileExists(self.display(path)));
        }
        fs::create_dir_all(path).await?;
        Ok(())
    }

    /// Remove a directory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileNotFound`], [`Error::InvalidPath`] for a
    /// non-directory, and [`Error::DirectoryNotEmpty`] without `recursive`.
    pub async fn rmdir(&self, path: &Path, recursive: bool) -> Result<()> {
        let meta = fs::metadata(path)
            .await
            .map_err(|_| Error::FileNotFound(self.display(path)))?;
        if !meta.is_dir() {
            return Err(Error::InvalidPath(format!(
                "not a directory: {}",
                self.display(path)
            )));
        }

        let mut entries = fs::read_dir(path).await?;
        let empty = entries.next_entry().await?.is_none();

        if empty {
            fs::remove_dir(path).await?;
        } else if recursive {
            fs::remove_dir_all(path).await?;
        } else {
            return Err(Error::DirectoryNotEmpty(self.display(path)));
        }
        Ok(())
    }

    /// List a directory, optionally descending into subdirectories.
    ///
    /// Checksums are left empty; use [`FileStore::manifest`] when digests
    /// are needed. Entries come back directories-first, then by path.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileNotFound`] or [`Error::InvalidPath`] for a
    /// non-directory.
    pub async fn list(&self, path: &Path, recursive: bool) -> Result<Vec<FileInfo>> {
        let meta = fs::metadata(path)
            .await
            .map_err(|_| Error::FileNotFound(self.display(path)))?;
        if !meta.is_dir() {
            return Err(Error::InvalidPath(format!(
                "not a directory: {}",
                self.display(path)
            )));
        }

        let mut out = Vec::new();
        let mut pending = vec![path.to_path_buf()];

        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let entry_path = entry.path();
                let info = self.file_info(&entry_path).await?;
                if info.is_directory && recursive {
                    pending.push(entry_path);
                }
                out.push(info);
            }
        }

        out.sort_by(|a, b| {
            (!a.is_directory, a.path.as_str()).cmp(&(!b.is_directory, b.path.as_str()))
        });
        Ok(out)
    }

    /// Recursive listing with per-file checksums filled in
    ///
    /// # Errors
    ///
    /// Returns the same errors as [`FileStore::list`].
    pub async fn manifest(&self, path: &Path) -> Result<Vec<FileInfo>> {
        let mut entries = self.list(path, true).await?;
        for entry in &mut entries {
            if !entry.is_directory {
                let abs = self.root.join(&entry.path);
                // Entries may vanish mid-walk; skip rather than fail the
                // whole manifest.
                if let Ok(digest) = checksum::hash_file(&abs).await {
                    entry.checksum = digest;
                }
            }
        }
        Ok(entries)
    }

    /// Metadata for one path, with the checksum filled for files
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileNotFound`] when missing.
    pub async fn stat(&self, path: &Path) -> Result<FileInfo> {
        if !fs::try_exists(path).await? {
            return Err(Error::FileNotFound(self.display(path)));
        }
        let mut info = self.file_info(path).await?;
        if !info.is_directory {
            info.checksum = checksum::hash_file(path).await?;
        }
        Ok(info)
    }

    /// Whether a path exists
    pub async fn exists(&self, path: &Path) -> bool {
        fs::try_exists(path).await.unwrap_or(false)
    }

    /// Whole-file SHA-256 digest
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileNotFound`] when missing.
    pub async fn file_checksum(&self, path: &Path) -> Result<String> {
        if !fs::try_exists(path).await? {
            return Err(Error::FileNotFound(self.display(path)));
        }
        checksum::hash_file(path).await
    }

    async fn file_info(&self, path: &Path) -> Result<FileInfo> {
        let meta = fs::metadata(path).await?;
        let is_directory = meta.is_dir();

        let modified_time = meta
            .modified()
            .ok()
            .and_then(epoch_secs)
            .unwrap_or_default();
        let created_time = meta
            .created()
            .ok()
            .and_then(epoch_secs)
            .unwrap_or(modified_time);

        Ok(FileInfo {
            path: relative_display(&self.root, path),
            size: if is_directory { 0 } else { meta.len() },
            checksum: String::new(),
            is_directory,
            modified_time,
            created_time,
        })
    }

    fn display(&self, path: &Path) -> String {
        relative_display(&self.root, path)
    }
}

fn file_time(epoch: f64) -> FileTime {
    FileTime::from_unix_time(epoch as i64, (epoch.fract() * 1e9) as u32)
}

/// Apply timestamps an uploader carried with the file.
///
/// No syscall rewrites a birth time directly. Filesystems that track one
/// clamp it down to the lowest modification time ever observed, so the
/// carried creation time goes in first and the real modification time
/// second; both land where the platform supports a birth time, and the
/// extra utimens is harmless where it does not.
fn apply_file_times(
    path: &Path,
    modified_time: Option<f64>,
    created_time: Option<f64>,
) -> Result<()> {
    if let Some(ctime) = created_time {
        filetime::set_file_mtime(path, file_time(ctime))
            .map_err(|e| Error::Internal(format!("set created time: {e}")))?;
    }
    if let Some(mtime) = modified_time {
        filetime::set_file_mtime(path, file_time(mtime))
            .map_err(|e| Error::Internal(format!("set mtime: {e}")))?;
    }
    Ok(())
}

/// Rename, falling back to copy-and-delete across filesystems
async fn rename_or_copy(from: &Path, to: &Path) -> Result<()> {
    match fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(EXDEV) => {
            fs::copy(from, to).await?;
            fs::remove_file(from).await?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn epoch_secs(time: SystemTime) -> Option<f64> {
    time.duration_since(UNIX_EPOCH).ok().map(|d| d.as_secs_f64())
}
