use std::io;
use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::TransferError;

/// The served directory plus the server-wide upload switch.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
    allow_upload: bool,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>, allow_upload: bool) -> Self {
        Self {
            root: root.into(),
            allow_upload,
        }
    }

    /// Open `filename` for a read transfer.
    pub async fn open_for_read(&self, filename: &str) -> Result<BlockReader, TransferError> {
        let path = sanitize_path(&self.root, filename)?;
        let file = File::open(&path).await.map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => TransferError::FileNotFound(path.clone()),
            io::ErrorKind::PermissionDenied => {
                TransferError::AccessViolation(format!("cannot read {}", path.display()))
            }
            _ => TransferError::Io(e),
        })?;
        let metadata = file.metadata().await?;
        if !metadata.is_file() {
            return Err(TransferError::FileNotFound(path));
        }
        Ok(BlockReader {
            file,
            len: metadata.len(),
        })
    }

    /// Create `filename` for a write transfer. Never overwrites.
    pub async fn open_for_write(&self, filename: &str) -> Result<BlockWriter, TransferError> {
        if !self.allow_upload {
            return Err(TransferError::AccessViolation(
                "uploads are disabled".to_string(),
            ));
        }
        let path = sanitize_path(&self.root, filename)?;
        if tokio::fs::try_exists(&path).await? {
            return Err(TransferError::FileAlreadyExists(path));
        }

        // Ensure parent directories exist for subdirectory uploads.
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|e| match e.kind() {
                io::ErrorKind::AlreadyExists => TransferError::FileAlreadyExists(path.clone()),
                io::ErrorKind::PermissionDenied => {
                    TransferError::AccessViolation(format!("cannot create {}", path.display()))
                }
                _ => TransferError::Io(e),
            })?;

        Ok(BlockWriter {
            file,
            path,
            written: 0,
        })
    }
}

/// Streams a file in fixed-size blocks.
#[derive(Debug)]
pub struct BlockReader {
    file: File,
    len: u64,
}

impl BlockReader {
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Fill `buf` completely unless the file ends first. A return value
    /// shorter than `buf.len()` means this was the last block.
    pub async fn read_block(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }
}

/// Appends received blocks to a newly created file.
#[derive(Debug)]
pub struct BlockWriter {
    file: File,
    path: PathBuf,
    written: u64,
}

impl BlockWriter {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn write_block(&mut self, data: &[u8]) -> Result<(), TransferError> {
        self.file
            .write_all(data)
            .await
            .map_err(|e| classify_write_error(e, &self.path))?;
        self.written += data.len() as u64;
        Ok(())
    }

    /// Flush everything to disk and return the number of bytes written.
    pub async fn finish(&mut self) -> Result<u64, TransferError> {
        self.file
            .flush()
            .await
            .map_err(|e| classify_write_error(e, &self.path))?;
        self.file
            .sync_all()
            .await
            .map_err(|e| classify_write_error(e, &self.path))?;
        Ok(self.written)
    }

    /// Drop the partially written file.
    pub async fn discard(self) {
        let BlockWriter { file, path, .. } = self;
        drop(file);
        if let Err(e) = tokio::fs::remove_file(&path).await {
            tracing::warn!("cannot remove partial upload {}: {e}", path.display());
        }
    }
}

fn classify_write_error(e: io::Error, path: &Path) -> TransferError {
    match e.kind() {
        io::ErrorKind::StorageFull | io::ErrorKind::FileTooLarge => {
            TransferError::DiskFull(path.to_path_buf())
        }
        _ => TransferError::Io(e),
    }
}

/// Ensure the requested filename stays inside the served directory.
/// Supports subdirectory paths (e.g. `ios/config/router.cfg`) while
/// rejecting any traversal attempt (`..`) or absolute paths.
pub fn sanitize_path(dir: &Path, filename: &str) -> Result<PathBuf, TransferError> {
    let violation = |msg: &str| TransferError::AccessViolation(format!("{msg}: {filename}"));
    let normalized = filename.replace('\\', "/");

    if normalized.starts_with('/') {
        return Err(violation("absolute paths are not allowed"));
    }

    if normalized.split('/').any(|component| component == "..") {
        return Err(violation("path traversal is not allowed"));
    }

    // Filter out empty segments and `.` components.
    let clean: PathBuf = normalized
        .split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .collect();

    if clean.as_os_str().is_empty() {
        return Err(violation("invalid filename"));
    }

    let candidate = dir.join(&clean);
    let canonical_dir = dir.canonicalize()?;

    if candidate.exists() {
        let canonical = candidate.canonicalize()?;
        if !canonical.starts_with(&canonical_dir) {
            return Err(violation("path escapes served directory"));
        }
        Ok(canonical)
    } else {
        // New file (WRQ) or missing file (RRQ): the deepest existing
        // ancestor must be inside the served directory.
        let mut ancestor = candidate.parent();
        while let Some(a) = ancestor {
            if a.exists() {
                if !a.canonicalize()?.starts_with(&canonical_dir) {
                    return Err(violation("path escapes served directory"));
                }
                return Ok(candidate);
            }
            ancestor = a.parent();
        }
        Err(violation("path escapes served directory"))
    }
}
