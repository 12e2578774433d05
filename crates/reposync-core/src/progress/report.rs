//! Progress reports pushed to the caller and the final sync report.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::descriptor::{FetchDescriptor, FetchStatus, ItemType};

use super::TypeAggregate;

/// Coarse phase label reported to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStep {
    DownloadMetadata,
    DownloadItems,
    PurgeOrphanedPackages,
    RemoveOldPackages,
}

impl SyncStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStep::DownloadMetadata => "Downloading Metadata",
            SyncStep::DownloadItems => "Downloading Items or Verifying",
            SyncStep::PurgeOrphanedPackages => "Purging Orphaned Packages",
            SyncStep::RemoveOldPackages => "Removing Old Packages",
        }
    }
}

impl fmt::Display for SyncStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status carried on a report: the pool lifecycle brackets or a per-item
/// fetch status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportStatus {
    Started,
    Finished,
    Item(FetchStatus),
}

impl fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportStatus::Started => f.write_str("STARTED"),
            ReportStatus::Finished => f.write_str("FINISHED"),
            ReportStatus::Item(s) => f.write_str(s.as_str()),
        }
    }
}

/// One error captured for the report: the descriptor, how it failed, and any
/// detail the failure carried.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub descriptor: FetchDescriptor,
    pub status: FetchStatus,
    pub message: Option<String>,
    /// Debug representation of an unexpected error, when one was caught.
    pub error_repr: Option<String>,
}

/// Snapshot pushed to the caller's progress callback.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgressReport {
    pub step: Option<SyncStep>,
    pub status: Option<ReportStatus>,
    pub items_total: u64,
    pub items_left: u64,
    pub size_total: u64,
    pub size_left: u64,
    /// Name of the last item worked on.
    pub item_name: Option<String>,
    pub item_type: Option<ItemType>,
    pub num_success: u64,
    pub num_error: u64,
    /// Actual downloads (NOOPs excluded).
    pub num_download: u64,
    pub details: BTreeMap<ItemType, TypeAggregate>,
    pub error_details: Vec<ErrorRecord>,
}

impl fmt::Display for ProgressReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "step: {}, {}/{} items remaining, {}/{} bytes remaining, {} errors",
            self.step.map(|s| s.as_str()).unwrap_or("-"),
            self.items_left,
            self.items_total,
            self.size_left,
            self.size_total,
            self.num_error
        )
    }
}

/// Final aggregate returned by `wait_for_finish`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncReport {
    pub successes: u64,
    pub downloads: u64,
    pub errors: u64,
    pub error_details: Vec<ErrorRecord>,
    pub last_progress: Option<ProgressReport>,
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} successes, {} downloads, {} errors",
            self.successes, self.downloads, self.errors
        )
    }
}
