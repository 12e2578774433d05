//! Per-descriptor download pipeline: pre-check, lock, transfer, verify,
//! retry, and shared-store symlink publication.

mod options;
mod transfer;

pub use options::{FetcherOptions, ProxyConfig, TlsConfig, VerifyOptions};

use std::path::Path;
use std::sync::Arc;

use crate::checksum;
use crate::control::CancelToken;
use crate::descriptor::{FetchDescriptor, FetchOutcome, FetchStatus};
use crate::lock::{LockState, PathLock};
use crate::progress::ProgressTracker;
use crate::storage::{make_dir_safe, publish_symlink, PartialWriter};

use self::transfer::TransferError;

/// HTTP codes accepted as a successful transfer. 0 covers `file:` URLs,
/// 206/226 are partial-content and IM-used responses.
const OK_HTTP_CODES: [u32; 4] = [0, 200, 206, 226];

/// Where transfer progress lands. The pool feeds a `ProgressTracker`; a
/// subprocess-hosted fetch forwards events to the parent instead.
pub trait FetchProgress: Send + Sync {
    fn update(&self, url: &str, total: u64, downloaded: u64);
    /// Forget partial progress ahead of a retry.
    fn reset(&self, url: &str);
}

/// Tracker-backed progress implementation used for in-process fetches.
pub struct TrackerProgress(pub Arc<ProgressTracker>);

impl FetchProgress for TrackerProgress {
    fn update(&self, url: &str, total: u64, downloaded: u64) {
        self.0.update_progress_download(url, total, downloaded);
    }

    fn reset(&self, url: &str) {
        self.0.reset_progress(url);
    }
}

/// Progress sink that drops everything; for callers that only want outcomes.
pub struct NullProgress;

impl FetchProgress for NullProgress {
    fn update(&self, _url: &str, _total: u64, _downloaded: u64) {}
    fn reset(&self, _url: &str) {}
}

/// Downloads a single descriptor. Stateless across calls; safe to share
/// between workers.
pub struct Fetcher {
    opts: FetcherOptions,
}

impl Fetcher {
    pub fn new(opts: FetcherOptions) -> Self {
        Fetcher { opts }
    }

    pub fn options(&self) -> &FetcherOptions {
        &self.opts
    }

    /// Fetch one descriptor to its final on-disk location.
    ///
    /// Never panics for per-descriptor failures; every failure mode maps to a
    /// `FetchStatus` so the pool can account for it.
    pub fn fetch(
        &self,
        desc: &FetchDescriptor,
        progress: &dyn FetchProgress,
        cancel: &CancelToken,
    ) -> FetchOutcome {
        match self.fetch_inner(desc, progress, cancel) {
            Ok(outcome) => outcome,
            Err(e) => FetchOutcome::with_detail(FetchStatus::Error, format!("{:#}", e)),
        }
    }

    fn fetch_inner(
        &self,
        desc: &FetchDescriptor,
        progress: &dyn FetchProgress,
        cancel: &CancelToken,
    ) -> anyhow::Result<FetchOutcome> {
        let final_path = desc.content_path();
        let repo_path = desc.repo_path();

        if let Some(dir) = final_path.parent() {
            make_dir_safe(dir)?;
        }
        if desc.shared_store_path.is_some() {
            if let Some(dir) = repo_path.parent() {
                make_dir_safe(dir)?;
            }
        }

        if !self.opts.force && final_path.exists() && self.verify_existing(desc, &final_path)? {
            tracing::info!(path = %final_path.display(), "exists with correct size and checksum, no need to fetch");
            if desc.shared_store_path.is_some() {
                publish_symlink(&final_path, &repo_path)?;
            }
            return Ok(FetchOutcome::new(FetchStatus::Noop));
        }

        let _lock = match PathLock::acquire(&final_path)? {
            LockState::Acquired(lock) => lock,
            LockState::HeldBy(pid) => {
                return Ok(FetchOutcome::with_detail(
                    FetchStatus::Requeue,
                    format!("{} is being fetched by process {}", final_path.display(), pid),
                ));
            }
        };

        let mut retries_left = self.opts.retries;
        loop {
            let outcome = self.attempt(desc, &final_path, progress, cancel)?;
            let retryable = matches!(
                outcome.status,
                FetchStatus::Error | FetchStatus::SizeMismatch | FetchStatus::ChecksumMismatch
            );
            if retryable && retries_left > 0 && !is_file_url(&desc.download_url) {
                if cancel.is_cancelled() {
                    return Ok(outcome);
                }
                retries_left -= 1;
                tracing::warn!(
                    file = %desc.file_name,
                    status = %outcome.status,
                    retries_left,
                    "retrying fetch"
                );
                cleanup_paths(&final_path);
                progress.reset(&desc.download_url);
                continue;
            }
            if outcome.status.is_success() && desc.shared_store_path.is_some() {
                publish_symlink(&final_path, &repo_path)?;
            }
            return Ok(outcome);
        }
    }

    /// One transfer attempt plus post-transfer verification.
    fn attempt(
        &self,
        desc: &FetchDescriptor,
        final_path: &Path,
        progress: &dyn FetchProgress,
        cancel: &CancelToken,
    ) -> anyhow::Result<FetchOutcome> {
        let mut writer = PartialWriter::open(final_path)?;
        tracing::info!(
            size = desc.size_or_zero(),
            offset = writer.offset(),
            url = %desc.download_url,
            "fetching {}",
            desc.file_name
        );

        let result = transfer::download(
            &desc.download_url,
            desc.size_or_zero(),
            &mut writer,
            &self.opts,
            progress,
            cancel,
        );

        let http_code = match result {
            Ok(r) => r.http_code,
            // A broken or stopped transfer keeps its .part: the staged bytes
            // are genuine content and a later run resumes from them.
            Err(TransferError::Cancelled) => {
                return Ok(FetchOutcome::with_detail(
                    FetchStatus::Error,
                    "transfer stopped by caller",
                ));
            }
            Err(e) => {
                return Ok(FetchOutcome::with_detail(
                    FetchStatus::Error,
                    format!("{} fetching {}", e, desc.download_url),
                ));
            }
        };

        if http_code == 401 {
            tracing::error!(url = %desc.download_url, "unauthorized request");
            writer.discard()?;
            return Ok(FetchOutcome::with_detail(
                FetchStatus::Unauthorized,
                format!("HTTP status code 401 received for {}", desc.download_url),
            ));
        }
        if !OK_HTTP_CODES.contains(&http_code) {
            writer.discard()?;
            return Ok(FetchOutcome::with_detail(
                FetchStatus::Error,
                format!(
                    "HTTP status code {} received for {}",
                    http_code, desc.download_url
                ),
            ));
        }

        writer.commit()?;
        Ok(self.verify_downloaded(desc, final_path)?)
    }

    /// Full verification after a completed transfer.
    fn verify_downloaded(
        &self,
        desc: &FetchDescriptor,
        path: &Path,
    ) -> anyhow::Result<FetchOutcome> {
        let expected_size = desc.size_or_zero();
        let has_checksum = desc.checksum.is_some() && desc.checksum_type.is_some();
        if expected_size == 0 && !has_checksum {
            return Ok(FetchOutcome::new(FetchStatus::SkipValidate));
        }

        let actual_size = std::fs::metadata(path)?.len();
        if expected_size > 0 && actual_size != expected_size {
            tracing::error!(
                file = %desc.file_name,
                actual_size,
                expected_size,
                "size mismatch"
            );
            std::fs::remove_file(path).ok();
            return Ok(FetchOutcome::with_detail(
                FetchStatus::SizeMismatch,
                format!(
                    "read {} bytes, was expecting {} bytes",
                    actual_size, expected_size
                ),
            ));
        }

        if let (Some(hashtype), Some(expected)) = (desc.checksum_type, &desc.checksum) {
            let actual = checksum::file_checksum(hashtype, path)?;
            if !actual.eq_ignore_ascii_case(expected) {
                tracing::error!(
                    file = %desc.file_name,
                    %actual,
                    %expected,
                    "checksum mismatch"
                );
                std::fs::remove_file(path).ok();
                return Ok(FetchOutcome::with_detail(
                    FetchStatus::ChecksumMismatch,
                    format!("computed {} of {}, expected {}", hashtype, actual, expected),
                ));
            }
        }

        tracing::debug!(file = %desc.file_name, "fetched content is valid");
        Ok(FetchOutcome::new(FetchStatus::Downloaded))
    }

    /// Pre-download check of a file already on disk, honoring
    /// `VerifyOptions`. Returns false when no applicable check exists so the
    /// file is fetched again rather than trusted blindly.
    fn verify_existing(&self, desc: &FetchDescriptor, path: &Path) -> anyhow::Result<bool> {
        let mut checked = false;
        if self.opts.verify.size {
            if let Some(expected) = desc.expected_size.filter(|s| *s > 0) {
                if std::fs::metadata(path)?.len() != expected {
                    return Ok(false);
                }
                checked = true;
            }
        }
        if self.opts.verify.checksum {
            if let (Some(hashtype), Some(expected)) = (desc.checksum_type, &desc.checksum) {
                if !checksum::verify_file(hashtype, path, expected)? {
                    return Ok(false);
                }
                checked = true;
            }
        }
        Ok(checked)
    }
}

fn is_file_url(url: &str) -> bool {
    url::Url::parse(url)
        .map(|u| u.scheme() == "file")
        .unwrap_or(false)
}

fn cleanup_paths(final_path: &Path) {
    for path in [
        crate::storage::part_path_for(final_path),
        final_path.to_path_buf(),
    ] {
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), "cleanup failed: {}", e);
            }
        }
    }
}
