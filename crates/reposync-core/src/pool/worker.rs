//! Worker loop: pop descriptors, dispatch to the fetcher (in-process or via
//! a host subprocess), translate outcomes into pool bookkeeping.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use crate::child::{ChildError, ChildProcess, FetchCall, FetchEvent, FetchService, ProcessTransport};
use crate::descriptor::{FetchDescriptor, FetchOutcome, FetchStatus};
use crate::fetcher::{Fetcher, TrackerProgress};
use crate::progress::{ProgressTracker, ReportStatus, SyncStep};

use super::{FetchBackend, PoolShared, QueuedItem};

enum Dispatcher {
    Local(Arc<Fetcher>),
    Child(Arc<ChildProcess<FetchService>>),
}

pub(super) fn run_worker(shared: Arc<PoolShared>, backend: FetchBackend) {
    let dispatcher = match backend {
        FetchBackend::InProcess(fetcher) => Dispatcher::Local(fetcher),
        FetchBackend::Isolated { host, opts } => {
            let tracker = Arc::clone(&shared.tracker);
            let client = Arc::new(ChildProcess::new(
                FetchService::new(opts),
                Box::new(ProcessTransport::new(host)),
                move |event: &FetchEvent| apply_event(&tracker, event),
            ));
            let abort_client = Arc::clone(&client);
            shared
                .child_aborts
                .lock()
                .unwrap()
                .push(Arc::new(move || abort_client.abort()));
            Dispatcher::Child(client)
        }
    };

    tracing::debug!("fetch worker started");
    while let Some(item) = shared.next_item() {
        let QueuedItem { desc, requeues } = item;
        match dispatch(&dispatcher, &shared, &desc) {
            Ok(outcome) if outcome.status == FetchStatus::Requeue => {
                shared.emit_report(
                    Some(SyncStep::DownloadItems),
                    Some(ReportStatus::Item(FetchStatus::Requeue)),
                    Some(&desc),
                );
                let item = QueuedItem {
                    desc: desc.clone(),
                    requeues,
                };
                if !shared.requeue(item) {
                    shared.mark_status(
                        &desc,
                        FetchStatus::Error,
                        Some(format!(
                            "requeue budget exhausted after {} attempts",
                            requeues
                        )),
                        None,
                    );
                }
            }
            Ok(outcome) => {
                shared.mark_status(&desc, outcome.status, outcome.detail, None);
            }
            Err(repr) => {
                shared.mark_status(
                    &desc,
                    FetchStatus::Error,
                    Some(format!("unexpected failure fetching {}", desc.download_url)),
                    Some(repr),
                );
            }
        }
    }
    tracing::debug!("fetch worker ending");
}

/// Run one fetch; a panic or a dead child comes back as `Err(repr)`.
fn dispatch(
    dispatcher: &Dispatcher,
    shared: &PoolShared,
    desc: &FetchDescriptor,
) -> Result<FetchOutcome, String> {
    match dispatcher {
        Dispatcher::Local(fetcher) => {
            let progress = TrackerProgress(Arc::clone(&shared.tracker));
            let cancel = shared.cancel.clone();
            std::panic::catch_unwind(AssertUnwindSafe(|| {
                fetcher.fetch(desc, &progress, &cancel)
            }))
            .map_err(|panic| panic_repr(&panic))
        }
        Dispatcher::Child(client) => client
            .call(FetchCall::Fetch(desc.clone()))
            .map_err(|e| match e {
                ChildError::Aborted => "fetch aborted by stop request".to_string(),
                other => format!("{}", other),
            }),
    }
}

fn apply_event(tracker: &ProgressTracker, event: &FetchEvent) {
    match event {
        FetchEvent::Progress {
            url,
            total,
            downloaded,
        } => tracker.update_progress_download(url, *total, *downloaded),
        FetchEvent::Reset { url } => tracker.reset_progress(url),
    }
}

fn panic_repr(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("worker panic: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("worker panic: {}", s)
    } else {
        "worker panic".to_string()
    }
}
