//! The fetcher as a `RemoteObject`, so workers can run transfers in an
//! isolated host process with progress flowing back as events.

use serde::{Deserialize, Serialize};

use crate::control::CancelToken;
use crate::descriptor::{FetchDescriptor, FetchOutcome};
use crate::fetcher::{Fetcher, FetcherOptions, FetchProgress};

use super::host::Outbox;
use super::proto::LogLevel;
use super::RemoteObject;

/// Host-side fetch capability. The options are the mirrored state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchService {
    pub opts: FetcherOptions,
}

impl FetchService {
    pub fn new(opts: FetcherOptions) -> Self {
        FetchService { opts }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FetchCall {
    Fetch(FetchDescriptor),
}

/// Progress callbacks forwarded from the host to the parent's tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FetchEvent {
    Progress {
        url: String,
        total: u64,
        downloaded: u64,
    },
    Reset {
        url: String,
    },
}

impl RemoteObject for FetchService {
    type Call = FetchCall;
    type Value = FetchOutcome;
    type Event = FetchEvent;

    fn dispatch(
        &mut self,
        call: FetchCall,
        outbox: &Outbox<FetchEvent>,
    ) -> Result<FetchOutcome, String> {
        let FetchCall::Fetch(desc) = call;
        let fetcher = Fetcher::new(self.opts.clone());
        let progress = OutboxProgress { outbox };
        // Cancellation of an isolated fetch arrives as a kill, not a token.
        let outcome = fetcher.fetch(&desc, &progress, &CancelToken::new());
        outbox.log(
            LogLevel::Debug,
            "reposync_core::fetcher",
            format!("{} finished with status {}", desc.file_name, outcome.status),
        );
        Ok(outcome)
    }
}

struct OutboxProgress<'a> {
    outbox: &'a Outbox<FetchEvent>,
}

impl FetchProgress for OutboxProgress<'_> {
    fn update(&self, url: &str, total: u64, downloaded: u64) {
        self.outbox.event(FetchEvent::Progress {
            url: url.to_string(),
            total,
            downloaded,
        });
    }

    fn reset(&self, url: &str) {
        self.outbox.event(FetchEvent::Reset {
            url: url.to_string(),
        });
    }
}
