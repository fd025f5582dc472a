//! # Download Progress Estimation
//!
//! The engine's download call reports nothing until it returns, so progress is
//! inferred by watching the filesystem while it runs.
//!
//! ## What is counted on every tick:
//! 1. The final target file, if it already exists
//! 2. Every regular file under the installation directory (partial blobs,
//!    download caches). Symlinks are skipped so snapshot links pointing at
//!    blobs are not counted twice, and the target file is not counted again.
//! 3. Files directly inside the system temp directory at or above a size
//!    threshold, for transfer libraries that stage there first
//!
//! ## Accuracy:
//! This is a best-effort estimate. Unrelated large files in the temp
//! directory inflate it and compressed transfers deflate it. The published
//! fraction is therefore capped at [`MAX_ESTIMATED_FRACTION`] and never goes
//! backwards; only the lifecycle controller reports 1.0, after the download
//! has actually been confirmed.

use crate::events::{DownloadProgress, MAX_ESTIMATED_FRACTION};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Where to look for bytes while a download runs.
#[derive(Debug, Clone)]
pub struct ScanSources {
    pub target_file: Option<PathBuf>,
    pub install_dir: PathBuf,
    pub temp_dir: Option<PathBuf>,
    pub min_temp_file_bytes: u64,
}

impl ScanSources {
    /// Total bytes currently observed. Unreadable entries count as zero.
    pub fn scan(&self) -> u64 {
        let mut total = 0;

        if let Some(target) = &self.target_file {
            total += regular_file_len(target).unwrap_or(0);
        }

        total += walk_dir(&self.install_dir, self.target_file.as_deref());

        if let Some(temp_dir) = &self.temp_dir {
            total += large_temp_files(temp_dir, self.min_temp_file_bytes);
        }

        total
    }
}

fn regular_file_len(path: &Path) -> Option<u64> {
    let meta = std::fs::symlink_metadata(path).ok()?;
    meta.is_file().then(|| meta.len())
}

fn walk_dir(dir: &Path, skip: Option<&Path>) -> u64 {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return 0,
    };

    let mut total = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        // DirEntry::file_type does not follow symlinks
        let file_type = match entry.file_type() {
            Ok(file_type) => file_type,
            Err(_) => continue,
        };

        if file_type.is_symlink() {
            continue;
        }
        if file_type.is_dir() {
            total += walk_dir(&path, skip);
        } else if file_type.is_file() && Some(path.as_path()) != skip {
            total += entry.metadata().map(|meta| meta.len()).unwrap_or(0);
        }
    }
    total
}

fn large_temp_files(dir: &Path, min_bytes: u64) -> u64 {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return 0,
    };

    entries
        .flatten()
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .filter(|&len| len >= min_bytes)
        .sum()
}

/// Turns raw byte counts into a fraction that only moves forward.
#[derive(Debug, Default, Clone)]
pub struct MonotonicProgress {
    best: f64,
}

impl MonotonicProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an observation. Returns the new fraction if it moved forward.
    pub fn observe(&mut self, observed_bytes: u64, expected_bytes: u64) -> Option<f64> {
        if expected_bytes == 0 {
            return None;
        }
        let fraction = (observed_bytes as f64 / expected_bytes as f64).min(MAX_ESTIMATED_FRACTION);
        if fraction > self.best {
            self.best = fraction;
            Some(fraction)
        } else {
            None
        }
    }

    pub fn current(&self) -> f64 {
        self.best
    }
}

/// Spawns the polling task for one download.
pub struct ProgressEstimator {
    sources: ScanSources,
    expected_bytes: u64,
    interval: Duration,
}

impl ProgressEstimator {
    pub fn new(sources: ScanSources, expected_bytes: u64, interval: Duration) -> Self {
        Self { sources, expected_bytes, interval }
    }

    /// Start polling. `on_update` is called with every forward step.
    ///
    /// The returned [`ProgressTask`] must be stopped when the download ends;
    /// dropping it aborts the poller.
    pub fn spawn<F>(self, mut on_update: F) -> ProgressTask
    where
        F: FnMut(DownloadProgress) + Send + 'static,
    {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let ProgressEstimator { sources, expected_bytes, interval } = self;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut progress = MonotonicProgress::new();

            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        let sources = sources.clone();
                        let observed = match tokio::task::spawn_blocking(move || sources.scan()).await {
                            Ok(bytes) => bytes,
                            Err(e) => {
                                warn!("Progress scan failed: {}", e);
                                continue;
                            }
                        };
                        if let Some(fraction) = progress.observe(observed, expected_bytes) {
                            debug!(observed, expected_bytes, fraction, "download progress");
                            on_update(DownloadProgress::estimated(fraction));
                        }
                    }
                }
            }
        });

        ProgressTask { stop: Some(stop_tx), handle: Some(handle) }
    }
}

/// Handle to a running poller.
pub struct ProgressTask {
    stop: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressTask {
    /// Stop polling and wait for the task to finish.
    ///
    /// After this returns no further update is delivered.
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!("Progress task ended abnormally: {}", e);
                }
            }
        }
    }
}

impl Drop for ProgressTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn sources(install_dir: &Path) -> ScanSources {
        ScanSources {
            target_file: Some(install_dir.join("model.safetensors")),
            install_dir: install_dir.to_path_buf(),
            temp_dir: None,
            min_temp_file_bytes: 1024,
        }
    }

    #[test]
    fn test_scan_counts_target_once_and_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("model.safetensors"), vec![0u8; 300]).unwrap();
        std::fs::create_dir_all(dir.path().join(".download-cache/blobs")).unwrap();
        std::fs::write(dir.path().join(".download-cache/blobs/abc.part"), vec![0u8; 200]).unwrap();

        assert_eq!(sources(dir.path()).scan(), 500);
    }

    #[test]
    fn test_scan_applies_temp_threshold() {
        let install = tempfile::tempdir().unwrap();
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(temp.path().join("small"), vec![0u8; 100]).unwrap();
        std::fs::write(temp.path().join("big"), vec![0u8; 2048]).unwrap();

        let mut sources = sources(install.path());
        sources.temp_dir = Some(temp.path().to_path_buf());
        assert_eq!(sources.scan(), 2048);
    }

    #[cfg(unix)]
    #[test]
    fn test_scan_skips_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let blob = dir.path().join("blob");
        std::fs::write(&blob, vec![0u8; 400]).unwrap();
        std::os::unix::fs::symlink(&blob, dir.path().join("snapshot-link")).unwrap();

        assert_eq!(sources(dir.path()).scan(), 400);
    }

    #[test]
    fn test_missing_install_dir_scans_as_zero() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(sources(&dir.path().join("nope")).scan(), 0);
    }

    #[test]
    fn test_progress_is_monotonic_and_capped() {
        let mut progress = MonotonicProgress::new();
        assert_eq!(progress.observe(50, 100), Some(0.5));
        assert_eq!(progress.observe(30, 100), None);
        assert_eq!(progress.observe(50, 100), None);
        assert_eq!(progress.observe(500, 100), Some(MAX_ESTIMATED_FRACTION));
        assert_eq!(progress.observe(1000, 100), None);
        assert_eq!(progress.current(), MAX_ESTIMATED_FRACTION);
        assert_eq!(progress.observe(10, 0), None);
    }

    #[tokio::test]
    async fn test_no_updates_after_stop() {
        let dir = tempfile::tempdir().unwrap();
        let updates = Arc::new(Mutex::new(Vec::new()));

        let sink = updates.clone();
        let task = ProgressEstimator::new(sources(dir.path()), 1000, Duration::from_millis(10))
            .spawn(move |progress| sink.lock().unwrap().push(progress.fraction));

        std::fs::write(dir.path().join("model.safetensors"), vec![0u8; 250]).unwrap();
        for _ in 0..200 {
            if !updates.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        std::fs::write(dir.path().join("model.safetensors"), vec![0u8; 5000]).unwrap();
        task.stop().await;
        let seen = updates.lock().unwrap().clone();

        std::fs::write(dir.path().join("extra"), vec![0u8; 500]).unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(*updates.lock().unwrap(), seen);
        assert!(!seen.is_empty());
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        assert!(seen.iter().all(|&f| f <= MAX_ESTIMATED_FRACTION));
    }
}
