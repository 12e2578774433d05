//! Sync driver: wires a metadata source to the pool, finalizes staged
//! metadata, and runs post-sync cleanup.

use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::child::HostCommand;
use crate::cleanup;
use crate::control::CancelToken;
use crate::descriptor::{FetchDescriptor, ItemType};
use crate::error::SyncError;
use crate::fetcher::{Fetcher, FetcherOptions};
use crate::pool::{FetchBackend, ParallelFetch, ReportCallback};
use crate::progress::{SyncReport, SyncStep};

/// Staged metadata directory name; finalization swaps it over `repodata`.
pub const STAGED_METADATA_DIR: &str = "repodata.new";
pub const METADATA_DIR: &str = "repodata";

/// Producer of fetch descriptors. Implementations download and parse
/// whatever repository metadata they understand; the driver only consumes
/// the descriptor list.
pub trait MetadataSource {
    fn descriptors(&mut self, fetcher: &Fetcher) -> Result<Vec<FetchDescriptor>>;
}

pub struct DriverOptions {
    pub fetcher: FetcherOptions,
    pub parallelism: usize,
    pub callback: Option<ReportCallback>,
    /// Host command for per-worker fetch isolation; in-process when absent.
    pub isolate: Option<HostCommand>,
    pub purge_orphaned: bool,
    /// Keep the newest plus this many older versions per package.
    pub remove_old: Option<u64>,
    /// Caller-held stop token; cancel it to wind the sync down.
    pub cancel: CancelToken,
}

impl Default for DriverOptions {
    fn default() -> Self {
        DriverOptions {
            fetcher: FetcherOptions::default(),
            parallelism: 5,
            callback: None,
            isolate: None,
            purge_orphaned: true,
            remove_old: None,
            cancel: CancelToken::new(),
        }
    }
}

/// Drives one repository sync end to end.
pub struct SyncDriver {
    basedir: PathBuf,
    repo_label: String,
    opts: DriverOptions,
}

impl SyncDriver {
    pub fn new(
        basedir: impl Into<PathBuf>,
        repo_label: impl Into<String>,
        opts: DriverOptions,
    ) -> Self {
        SyncDriver {
            basedir: basedir.into(),
            repo_label: repo_label.into(),
            opts,
        }
    }

    pub fn repo_dir(&self) -> PathBuf {
        self.basedir.join(&self.repo_label)
    }

    /// Run the sync: metadata, parallel fetch, finalize, cleanup.
    ///
    /// Configuration problems and metadata-source failures are fatal;
    /// per-descriptor failures land in the report instead.
    pub fn sync(&self, source: &mut dyn MetadataSource) -> Result<SyncReport, SyncError> {
        self.opts.fetcher.validate()?;
        let repo_dir = self.repo_dir();
        tracing::info!(repo = %self.repo_label, dir = %repo_dir.display(), "starting sync");

        let backend = match &self.opts.isolate {
            Some(host) => FetchBackend::Isolated {
                host: host.clone(),
                opts: self.opts.fetcher.clone(),
            },
            None => FetchBackend::InProcess(std::sync::Arc::new(Fetcher::new(
                self.opts.fetcher.clone(),
            ))),
        };
        let mut pool = ParallelFetch::with_backend(
            backend,
            self.opts.parallelism,
            self.opts.callback.clone(),
            self.opts.cancel.clone(),
        );

        pool.process_step(SyncStep::DownloadMetadata);
        let meta_fetcher = Fetcher::new(self.opts.fetcher.clone());
        let descriptors = source
            .descriptors(&meta_fetcher)
            .map_err(SyncError::Fatal)?;
        tracing::info!("{} items have been marked to be fetched", descriptors.len());

        let rpm_dirs = rpm_keep_sets(&descriptors);
        pool.add_items(descriptors)?;
        pool.start();

        // Relay a caller-side cancel into the pool so in-flight child
        // processes are aborted rather than run to completion.
        let stop_handle = pool.stop_handle();
        let cancel = self.opts.cancel.clone();
        let finished = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let watcher_done = std::sync::Arc::clone(&finished);
        let watcher = std::thread::spawn(move || {
            while !watcher_done.load(std::sync::atomic::Ordering::SeqCst) {
                if cancel.is_cancelled() {
                    stop_handle.stop();
                    break;
                }
                std::thread::sleep(std::time::Duration::from_millis(100));
            }
        });

        let report = pool.wait_for_finish();
        finished.store(true, std::sync::atomic::Ordering::SeqCst);
        let _ = watcher.join();
        if self.opts.cancel.is_cancelled() {
            tracing::info!(repo = %self.repo_label, "sync stopped before completion");
            return Ok(report);
        }

        if let Err(e) = finalize_metadata(&repo_dir) {
            tracing::error!("an error occurred while finalizing metadata: {:#}", e);
        }

        if self.opts.purge_orphaned && !rpm_dirs.is_empty() {
            pool.process_step(SyncStep::PurgeOrphanedPackages);
            for (dir, keep) in &rpm_dirs {
                match cleanup::purge_orphaned(dir, keep) {
                    Ok(n) if n > 0 => tracing::info!(dir = %dir.display(), removed = n, "purged orphans"),
                    Ok(_) => {}
                    Err(e) => tracing::warn!(dir = %dir.display(), "orphan purge failed: {:#}", e),
                }
            }
        }
        if let Some(num_old) = self.opts.remove_old {
            pool.process_step(SyncStep::RemoveOldPackages);
            for dir in rpm_dirs.keys() {
                if let Err(e) = cleanup::remove_old_packages(dir, num_old) {
                    tracing::warn!(dir = %dir.display(), "old-package pruning failed: {:#}", e);
                }
            }
        }

        tracing::info!(repo = %self.repo_label, "{}", report);
        Ok(report)
    }
}

/// Package file names grouped by their destination directory, for purging.
fn rpm_keep_sets(descriptors: &[FetchDescriptor]) -> HashMap<PathBuf, HashSet<String>> {
    let mut dirs: HashMap<PathBuf, HashSet<String>> = HashMap::new();
    for desc in descriptors {
        if desc.item_type == ItemType::Rpm {
            dirs.entry(desc.save_path.clone())
                .or_default()
                .insert(desc.file_name.clone());
        }
    }
    dirs
}

/// Replace `repodata/` with the staged `repodata.new/` tree.
pub fn finalize_metadata(repo_dir: &Path) -> Result<()> {
    let staged = repo_dir.join(STAGED_METADATA_DIR);
    let live = repo_dir.join(METADATA_DIR);
    if !staged.exists() {
        tracing::info!("no new metadata to finalize");
        return Ok(());
    }
    tracing::info!(
        "finalizing metadata, moving {} to {}",
        staged.display(),
        live.display()
    );
    if live.exists() {
        std::fs::remove_dir_all(&live)
            .with_context(|| format!("remove {}", live.display()))?;
    }
    std::fs::rename(&staged, &live)
        .with_context(|| format!("rename {} to {}", staged.display(), live.display()))?;
    Ok(())
}
