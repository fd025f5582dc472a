//! Temporary on-disk copies of uploaded audio.
//!
//! Every upload is streamed into its own `upload-<uuid>` file inside the
//! staging directory and removed when the request ends, whichever way it ends.

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::warn;
use uuid::Uuid;

/// RAII guard for one staged upload.
///
/// Call [`StagedUpload::remove`] on the normal path. If the guard is dropped
/// instead (early `?` return, panic, client disconnect cancelling the
/// handler future) the file is removed synchronously in `Drop`.
#[derive(Debug)]
pub struct StagedUpload {
    path: PathBuf,
    file: Option<File>,
    len: u64,
    removed: bool,
}

impl StagedUpload {
    /// Create a fresh, uniquely named file in `dir` (created if missing).
    pub async fn create(dir: &Path) -> io::Result<Self> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!("upload-{}", Uuid::new_v4()));
        let file = File::create(&path).await?;
        Ok(Self { path, file: Some(file), len: 0, removed: false })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes written so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub async fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "staged upload already closed"))?;
        file.write_all(chunk).await?;
        self.len += chunk.len() as u64;
        Ok(())
    }

    /// Flush and close the file so it can be read back.
    pub async fn finish(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        Ok(())
    }

    /// Delete the staged file. Failures are logged, never returned.
    pub async fn remove(mut self) {
        self.removed = true;
        drop(self.file.take());
        if let Err(e) = tokio::fs::remove_file(&self.path).await {
            log_cleanup_failure(&self.path, &e);
        }
    }
}

impl Drop for StagedUpload {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        drop(self.file.take());
        if let Err(e) = std::fs::remove_file(&self.path) {
            log_cleanup_failure(&self.path, &e);
        }
    }
}

fn log_cleanup_failure(path: &Path, err: &io::Error) {
    if err.kind() != io::ErrorKind::NotFound {
        warn!(path = %path.display(), "Failed to remove staged upload: {}", err);
    }
}
