//! Fetch descriptors: the unit of work handed to the pool, and the outcome
//! a fetch produces.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::error::SyncError;

/// Kind of content object a descriptor points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    Rpm,
    DeltaRpm,
    TreeFile,
    File,
}

impl ItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemType::Rpm => "rpm",
            ItemType::DeltaRpm => "delta_rpm",
            ItemType::TreeFile => "tree_file",
            ItemType::File => "file",
        }
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One thing to download: where from, where to, and what to verify against.
///
/// Produced by metadata readers; owned by the pool for the duration of a sync.
/// `metadata` is opaque and flows through unchanged for the caller's benefit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchDescriptor {
    pub file_name: String,
    pub download_url: String,
    /// Repo-local destination directory.
    pub save_path: PathBuf,
    /// Expected size in bytes; `None` or 0 means unknown.
    pub expected_size: Option<u64>,
    pub checksum_type: Option<crate::checksum::ChecksumType>,
    /// Expected digest in lowercase hex.
    pub checksum: Option<String>,
    /// When set, content lands here and `save_path` gets a relative symlink.
    pub shared_store_path: Option<PathBuf>,
    pub item_type: ItemType,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl FetchDescriptor {
    pub fn new(
        file_name: impl Into<String>,
        download_url: impl Into<String>,
        save_path: impl Into<PathBuf>,
        item_type: ItemType,
    ) -> Self {
        FetchDescriptor {
            file_name: file_name.into(),
            download_url: download_url.into(),
            save_path: save_path.into(),
            expected_size: None,
            checksum_type: None,
            checksum: None,
            shared_store_path: None,
            item_type,
            metadata: serde_json::Value::Null,
        }
    }

    /// Size used for progress bookkeeping: unknown sizes count as 0.
    pub fn size_or_zero(&self) -> u64 {
        self.expected_size.unwrap_or(0)
    }

    /// Final on-disk location of the content: the shared store when one is
    /// configured, the repo directory otherwise.
    pub fn content_path(&self) -> PathBuf {
        match &self.shared_store_path {
            Some(store) => store.join(&self.file_name),
            None => self.save_path.join(&self.file_name),
        }
    }

    /// Repo-local path; equals `content_path()` unless a shared store is set,
    /// in which case this is where the symlink is published.
    pub fn repo_path(&self) -> PathBuf {
        self.save_path.join(&self.file_name)
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.download_url.is_empty() {
            return Err(SyncError::Config(format!(
                "descriptor {:?} has an empty download URL",
                self.file_name
            )));
        }
        if self.checksum.is_some() && self.checksum_type.is_none() {
            return Err(SyncError::Config(format!(
                "descriptor {:?} has a checksum but no checksum type",
                self.file_name
            )));
        }
        Ok(())
    }
}

/// Terminal status of one fetch attempt chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStatus {
    /// Already correct on disk; nothing was transferred.
    Noop,
    Downloaded,
    /// Nothing to verify against (no size, no checksum).
    SkipValidate,
    SizeMismatch,
    ChecksumMismatch,
    Error,
    Unauthorized,
    /// Another live process holds the path lock; try again later.
    Requeue,
}

impl FetchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchStatus::Noop => "noop",
            FetchStatus::Downloaded => "downloaded",
            FetchStatus::SkipValidate => "skip_validate",
            FetchStatus::SizeMismatch => "size_mismatch",
            FetchStatus::ChecksumMismatch => "checksum_mismatch",
            FetchStatus::Error => "error",
            FetchStatus::Unauthorized => "unauthorized",
            FetchStatus::Requeue => "requeue",
        }
    }

    /// True for statuses counted on the completion side of the pool
    /// (everything except hard errors).
    pub fn is_success(&self) -> bool {
        !matches!(
            self,
            FetchStatus::Error
                | FetchStatus::Unauthorized
                | FetchStatus::SizeMismatch
                | FetchStatus::ChecksumMismatch
        )
    }
}

impl fmt::Display for FetchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status plus an optional human-readable detail message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchOutcome {
    pub status: FetchStatus,
    pub detail: Option<String>,
}

impl FetchOutcome {
    pub fn new(status: FetchStatus) -> Self {
        FetchOutcome {
            status,
            detail: None,
        }
    }

    pub fn with_detail(status: FetchStatus, detail: impl Into<String>) -> Self {
        FetchOutcome {
            status,
            detail: Some(detail.into()),
        }
    }
}
