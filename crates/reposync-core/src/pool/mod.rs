//! Parallel fetch pool: N worker threads draining a shared descriptor queue,
//! with status bookkeeping, progress reports, and cooperative stop.

mod worker;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::child::HostCommand;
use crate::control::CancelToken;
use crate::descriptor::{FetchDescriptor, FetchStatus};
use crate::fetcher::{Fetcher, FetcherOptions};
use crate::progress::{
    ErrorRecord, ProgressReport, ProgressTracker, ReportStatus, SyncReport, SyncStep,
};

use self::worker::run_worker;

/// Caller's progress callback.
pub type ReportCallback = Arc<dyn Fn(&ProgressReport) + Send + Sync>;

/// Requeue budget per descriptor; an uncapped requeue loop can spin forever
/// when two processes race over the same paths.
const MAX_REQUEUES: u32 = 10;
/// Pause before handing a contended descriptor back to the queue.
const REQUEUE_BACKOFF: std::time::Duration = std::time::Duration::from_millis(250);

pub(crate) struct QueuedItem {
    pub desc: FetchDescriptor,
    pub requeues: u32,
}

/// Bookkeeping shared between the pool facade and its workers. Workers
/// observe the pool only through this handle.
pub(crate) struct PoolShared {
    pub queue: Mutex<VecDeque<QueuedItem>>,
    pub completions: Mutex<Vec<FetchDescriptor>>,
    pub errors: Mutex<Vec<FetchDescriptor>>,
    pub status: Mutex<StatusBook>,
    pub tracker: Arc<ProgressTracker>,
    pub cancel: CancelToken,
    pub callback: Option<ReportCallback>,
    /// Abort hooks for in-flight child processes, registered by workers.
    pub child_aborts: Mutex<Vec<Arc<dyn Fn() + Send + Sync>>>,
}

/// Mutexed status counters and error details.
#[derive(Default)]
pub(crate) struct StatusBook {
    pub counts: HashMap<FetchStatus, u64>,
    pub error_details: Vec<ErrorRecord>,
    pub step: Option<SyncStep>,
    pub items_total: u64,
}

impl PoolShared {
    /// Pop the next descriptor, unless a stop was requested.
    pub fn next_item(&self) -> Option<QueuedItem> {
        if self.cancel.is_cancelled() {
            return None;
        }
        self.queue.lock().unwrap().pop_front()
    }

    /// Give a contended descriptor back to the queue, bypassing `add_item`
    /// bookkeeping. Returns false once the requeue budget is spent.
    pub fn requeue(&self, mut item: QueuedItem) -> bool {
        if item.requeues >= MAX_REQUEUES {
            return false;
        }
        item.requeues += 1;
        std::thread::sleep(REQUEUE_BACKOFF);
        self.queue.lock().unwrap().push_back(item);
        true
    }

    /// Record a terminal outcome for a descriptor and emit a report.
    pub fn mark_status(
        &self,
        desc: &FetchDescriptor,
        status: FetchStatus,
        detail: Option<String>,
        error_repr: Option<String>,
    ) {
        {
            let mut book = self.status.lock().unwrap();
            *book.counts.entry(status).or_insert(0) += 1;
            if status.is_success() {
                self.completions.lock().unwrap().push(desc.clone());
            } else {
                self.errors.lock().unwrap().push(desc.clone());
                book.error_details.push(ErrorRecord {
                    descriptor: desc.clone(),
                    status,
                    message: detail.clone(),
                    error_repr,
                });
            }
        }
        self.tracker
            .item_complete(&desc.download_url, status.is_success());
        tracing::debug!(
            file = %desc.file_name,
            status = %status,
            detail = detail.as_deref().unwrap_or(""),
            "descriptor finished"
        );
        self.emit_report(
            Some(SyncStep::DownloadItems),
            Some(ReportStatus::Item(status)),
            Some(desc),
        );
    }

    /// Form a report from the tracker snapshot plus the status book and push
    /// it to the callback, if any.
    pub fn emit_report(
        &self,
        step: Option<SyncStep>,
        status: Option<ReportStatus>,
        item: Option<&FetchDescriptor>,
    ) {
        let callback = match &self.callback {
            Some(cb) => Arc::clone(cb),
            None => return,
        };
        let report = self.form_report(step, status, item);
        callback(&report);
    }

    pub fn form_report(
        &self,
        step: Option<SyncStep>,
        status: Option<ReportStatus>,
        item: Option<&FetchDescriptor>,
    ) -> ProgressReport {
        let progress = self.tracker.get_progress();
        let mut book = self.status.lock().unwrap();
        if step.is_some() {
            book.step = step;
        }
        let count = |s: FetchStatus| book.counts.get(&s).copied().unwrap_or(0);
        let num_error = count(FetchStatus::Error)
            + count(FetchStatus::Unauthorized)
            + count(FetchStatus::SizeMismatch)
            + count(FetchStatus::ChecksumMismatch);
        let num_success =
            count(FetchStatus::Downloaded) + count(FetchStatus::Noop) + count(FetchStatus::SkipValidate);
        ProgressReport {
            step: book.step,
            status,
            items_total: book.items_total,
            items_left: progress.remaining_num_items,
            size_total: progress.total_size_bytes,
            size_left: progress.remaining_bytes,
            item_name: item.map(|d| d.file_name.clone()),
            item_type: item.map(|d| d.item_type),
            num_success,
            num_error,
            num_download: count(FetchStatus::Downloaded),
            details: progress.details,
            error_details: book.error_details.clone(),
        }
    }
}

/// How workers execute a fetch: in this process, or dispatched to a host
/// subprocess per worker.
#[derive(Clone)]
pub enum FetchBackend {
    InProcess(Arc<Fetcher>),
    Isolated {
        host: HostCommand,
        opts: FetcherOptions,
    },
}

/// Stops a running pool from outside the owning thread.
#[derive(Clone)]
pub struct StopHandle {
    shared: Arc<PoolShared>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.shared.cancel.cancel();
        for abort in self.shared.child_aborts.lock().unwrap().iter() {
            abort();
        }
    }
}

/// Dispatches descriptors to N workers and collects outcomes.
pub struct ParallelFetch {
    shared: Arc<PoolShared>,
    backend: FetchBackend,
    parallelism: usize,
    handles: Vec<JoinHandle<()>>,
    started: bool,
}

impl ParallelFetch {
    pub fn new(fetcher: Fetcher, parallelism: usize, callback: Option<ReportCallback>) -> Self {
        Self::with_backend(
            FetchBackend::InProcess(Arc::new(fetcher)),
            parallelism,
            callback,
            CancelToken::new(),
        )
    }

    /// Pool whose workers run each fetch inside a spawned host process.
    pub fn isolated(
        opts: FetcherOptions,
        host: HostCommand,
        parallelism: usize,
        callback: Option<ReportCallback>,
    ) -> Self {
        Self::with_backend(
            FetchBackend::Isolated { host, opts },
            parallelism,
            callback,
            CancelToken::new(),
        )
    }

    pub fn with_backend(
        backend: FetchBackend,
        parallelism: usize,
        callback: Option<ReportCallback>,
        cancel: CancelToken,
    ) -> Self {
        ParallelFetch {
            shared: Arc::new(PoolShared {
                queue: Mutex::new(VecDeque::new()),
                completions: Mutex::new(Vec::new()),
                errors: Mutex::new(Vec::new()),
                status: Mutex::new(StatusBook::default()),
                tracker: Arc::new(ProgressTracker::new()),
                cancel,
                callback,
                child_aborts: Mutex::new(Vec::new()),
            }),
            backend,
            parallelism: parallelism.max(1),
            handles: Vec::new(),
            started: false,
        }
    }

    pub fn tracker(&self) -> Arc<ProgressTracker> {
        Arc::clone(&self.shared.tracker)
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.shared.cancel.clone()
    }

    /// Register a descriptor. Call any number of times before `start`.
    pub fn add_item(&self, desc: FetchDescriptor) -> Result<(), crate::error::SyncError> {
        desc.validate()?;
        self.shared.tracker.add_item(
            &desc.download_url,
            desc.size_or_zero() as i64,
            desc.item_type,
        );
        self.shared
            .queue
            .lock()
            .unwrap()
            .push_back(QueuedItem { desc, requeues: 0 });
        Ok(())
    }

    pub fn add_items(
        &self,
        descs: impl IntoIterator<Item = FetchDescriptor>,
    ) -> Result<(), crate::error::SyncError> {
        for desc in descs {
            self.add_item(desc)?;
        }
        Ok(())
    }

    /// Emit a bare step report (metadata download, cleanup phases).
    pub fn process_step(&self, step: SyncStep) {
        self.shared.emit_report(Some(step), None, None);
    }

    /// Snapshot the queue size, emit `STARTED`, and launch the workers.
    pub fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        {
            let mut book = self.shared.status.lock().unwrap();
            book.items_total = self.shared.queue.lock().unwrap().len() as u64;
        }
        self.shared
            .emit_report(Some(SyncStep::DownloadItems), Some(ReportStatus::Started), None);
        for n in 0..self.parallelism {
            let shared = Arc::clone(&self.shared);
            let backend = self.backend.clone();
            let handle = std::thread::Builder::new()
                .name(format!("fetch-worker-{}", n))
                .spawn(move || run_worker(shared, backend))
                .expect("spawn fetch worker");
            self.handles.push(handle);
        }
        tracing::info!(workers = self.parallelism, "parallel fetch started");
    }

    /// Block until all workers exit, then assemble the final report.
    pub fn wait_for_finish(&mut self) -> SyncReport {
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                tracing::error!("a fetch worker panicked");
            }
        }
        tracing::info!("all fetch workers have finished");

        let book = self.shared.status.lock().unwrap();
        let count = |s: FetchStatus| book.counts.get(&s).copied().unwrap_or(0);
        let successes =
            count(FetchStatus::Downloaded) + count(FetchStatus::Noop) + count(FetchStatus::SkipValidate);
        let downloads = count(FetchStatus::Downloaded);
        let errors = count(FetchStatus::Error)
            + count(FetchStatus::Unauthorized)
            + count(FetchStatus::SizeMismatch)
            + count(FetchStatus::ChecksumMismatch);
        let error_details = book.error_details.clone();
        drop(book);

        let last = self.shared.form_report(
            Some(SyncStep::DownloadItems),
            Some(ReportStatus::Finished),
            None,
        );
        if let Some(cb) = &self.shared.callback {
            cb(&last);
        }
        let report = SyncReport {
            successes,
            downloads,
            errors,
            error_details,
            last_progress: Some(last),
        };
        tracing::info!(
            "{} items successfully processed, {} downloaded, {} items had errors",
            report.successes,
            report.downloads,
            report.errors
        );
        report
    }

    /// Signal workers to exit at the next descriptor boundary and abort any
    /// in-flight child process. Idempotent, non-blocking.
    pub fn stop(&self) {
        self.stop_handle().stop();
    }

    /// Detached handle for stopping the pool from another thread while the
    /// owner blocks in `wait_for_finish`.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// `stop`, then wait for workers to exit.
    pub fn stop_blocking(&mut self) {
        self.stop();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }

    /// Descriptors that completed successfully (drained copy).
    pub fn completions(&self) -> Vec<FetchDescriptor> {
        self.shared.completions.lock().unwrap().clone()
    }

    /// Descriptors that failed (drained copy).
    pub fn failures(&self) -> Vec<FetchDescriptor> {
        self.shared.errors.lock().unwrap().clone()
    }
}
