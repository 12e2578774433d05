//! Thread-safe accounting of bytes and items across all in-flight fetches.
//!
//! One mutex protects all tracker state; every public operation takes it.
//! Sink callbacks are invoked after the lock is released, on a snapshot
//! copied while it was held.

mod report;

pub use report::{ErrorRecord, ProgressReport, ReportStatus, SyncReport, SyncStep};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use crate::descriptor::ItemType;

/// Receiver of tracker snapshots, passed at construction.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, progress: &GlobalProgress);
}

impl<F: Fn(&GlobalProgress) + Send + Sync> ProgressSink for F {
    fn on_progress(&self, progress: &GlobalProgress) {
        self(progress)
    }
}

/// Per-type aggregate counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeAggregate {
    pub total_size_bytes: u64,
    pub size_left: u64,
    pub total_count: u64,
    pub items_left: u64,
    pub num_success: u64,
    pub num_error: u64,
}

/// Deep-copied snapshot of the tracker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalProgress {
    pub total_size_bytes: u64,
    pub remaining_bytes: u64,
    pub total_num_items: u64,
    pub remaining_num_items: u64,
    pub details: BTreeMap<ItemType, TypeAggregate>,
}

#[derive(Debug, Clone)]
struct ItemProgress {
    item_type: ItemType,
    total_size_bytes: u64,
    remaining_bytes: u64,
}

#[derive(Default)]
struct TrackerState {
    items: HashMap<String, ItemProgress>,
    total_size_bytes: u64,
    remaining_bytes: u64,
    total_num_items: u64,
    remaining_num_items: u64,
    details: BTreeMap<ItemType, TypeAggregate>,
}

impl TrackerState {
    fn snapshot(&self) -> GlobalProgress {
        GlobalProgress {
            total_size_bytes: self.total_size_bytes,
            remaining_bytes: self.remaining_bytes,
            total_num_items: self.total_num_items,
            remaining_num_items: self.remaining_num_items,
            details: self.details.clone(),
        }
    }
}

/// Tracks total versus remaining bytes and items, per type and globally.
pub struct ProgressTracker {
    state: Mutex<TrackerState>,
    sink: Option<Arc<dyn ProgressSink>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        ProgressTracker {
            state: Mutex::new(TrackerState::default()),
            sink: None,
        }
    }

    pub fn with_sink(sink: Arc<dyn ProgressSink>) -> Self {
        ProgressTracker {
            state: Mutex::new(TrackerState::default()),
            sink: Some(sink),
        }
    }

    /// Register an item. A negative advertised size is coerced to 0 with a
    /// warning; re-registering a URL overwrites its entry.
    pub fn add_item(&self, url: &str, size: i64, item_type: ItemType) {
        let size = if size < 0 {
            tracing::warn!(url, size, "negative item size, using 0 instead");
            0
        } else {
            size as u64
        };
        let mut state = self.state.lock().unwrap();
        state.total_size_bytes += size;
        state.remaining_bytes = state.total_size_bytes;
        state.total_num_items += 1;
        state.remaining_num_items += 1;

        let agg = state.details.entry(item_type).or_default();
        agg.total_size_bytes += size;
        agg.size_left += size;
        agg.total_count += 1;
        agg.items_left += 1;

        state.items.insert(
            url.to_string(),
            ItemProgress {
                item_type,
                total_size_bytes: size,
                remaining_bytes: size,
            },
        );
    }

    /// Record transfer progress for `url`.
    ///
    /// The initial `(0, 0)` invocation curl emits is ignored, as are updates
    /// for unknown URLs. A changed `total` is routed through
    /// `modify_item_size` first; a negative delta (non-monotonic callback) is
    /// logged and dropped.
    pub fn update_progress_download(&self, url: &str, download_total: u64, downloaded: u64) {
        let snapshot = {
            let mut state = self.state.lock().unwrap();
            if download_total == 0 || downloaded == 0 {
                return;
            }
            let recorded_total = match state.items.get(url) {
                Some(item) => item.total_size_bytes,
                None => return,
            };
            if recorded_total != download_total {
                Self::apply_size_change(&mut state, url, download_total);
            }
            let remaining = download_total.saturating_sub(downloaded);
            let (delta, item_type) = match state.items.get_mut(url) {
                Some(item) => {
                    if remaining > item.remaining_bytes {
                        tracing::warn!(
                            url,
                            download_total,
                            downloaded,
                            prev_remaining = item.remaining_bytes,
                            "negative progress delta, ignoring update"
                        );
                        return;
                    }
                    let delta = item.remaining_bytes - remaining;
                    item.remaining_bytes = remaining;
                    (delta, item.item_type)
                }
                None => return,
            };
            state.remaining_bytes = state.remaining_bytes.saturating_sub(delta);
            if let Some(agg) = state.details.get_mut(&item_type) {
                agg.size_left = agg.size_left.saturating_sub(delta);
            }
            self.sink.as_ref().map(|_| state.snapshot())
        };
        if let (Some(sink), Some(progress)) = (self.sink.as_ref(), snapshot) {
            sink.on_progress(&progress);
        }
    }

    /// Adjust an item's advertised total by the signed difference, cascading
    /// into the per-type and global totals and remainders.
    pub fn modify_item_size(&self, url: &str, new_total: u64) {
        let mut state = self.state.lock().unwrap();
        if !state.items.contains_key(url) {
            return;
        }
        Self::apply_size_change(&mut state, url, new_total);
    }

    fn apply_size_change(state: &mut TrackerState, url: &str, new_total: u64) {
        let item = match state.items.get_mut(url) {
            Some(i) => i,
            None => return,
        };
        let old_total = item.total_size_bytes;
        let item_type = item.item_type;
        if new_total >= old_total {
            let diff = new_total - old_total;
            item.total_size_bytes += diff;
            item.remaining_bytes += diff;
            state.total_size_bytes += diff;
            state.remaining_bytes += diff;
            if let Some(agg) = state.details.get_mut(&item_type) {
                agg.total_size_bytes += diff;
                agg.size_left += diff;
            }
        } else {
            let diff = old_total - new_total;
            item.total_size_bytes -= diff;
            item.remaining_bytes = item.remaining_bytes.saturating_sub(diff);
            state.total_size_bytes = state.total_size_bytes.saturating_sub(diff);
            state.remaining_bytes = state.remaining_bytes.saturating_sub(diff);
            if let Some(agg) = state.details.get_mut(&item_type) {
                agg.total_size_bytes = agg.total_size_bytes.saturating_sub(diff);
                agg.size_left = agg.size_left.saturating_sub(diff);
            }
        }
    }

    /// Mark an item finished. Residual remaining bytes (short or aborted
    /// transfers) are flushed from the remainders, the per-type success or
    /// error count is bumped, and the item entry is deleted.
    pub fn item_complete(&self, url: &str, success: bool) {
        let mut state = self.state.lock().unwrap();
        let item = match state.items.remove(url) {
            Some(i) => i,
            None => return,
        };
        if item.remaining_bytes > 0 {
            state.remaining_bytes = state.remaining_bytes.saturating_sub(item.remaining_bytes);
            if let Some(agg) = state.details.get_mut(&item.item_type) {
                agg.size_left = agg.size_left.saturating_sub(item.remaining_bytes);
            }
        }
        if let Some(agg) = state.details.get_mut(&item.item_type) {
            agg.items_left = agg.items_left.saturating_sub(1);
            if success {
                agg.num_success += 1;
            } else {
                agg.num_error += 1;
            }
        }
        state.remaining_num_items = state.remaining_num_items.saturating_sub(1);
    }

    /// Reinstate an item's full size as its remainder, ahead of a retry.
    pub fn reset_progress(&self, url: &str) {
        let mut state = self.state.lock().unwrap();
        let item = match state.items.get_mut(url) {
            Some(i) => i,
            None => return,
        };
        let consumed = item.total_size_bytes.saturating_sub(item.remaining_bytes);
        let item_type = item.item_type;
        item.remaining_bytes = item.total_size_bytes;
        state.remaining_bytes += consumed;
        if let Some(agg) = state.details.get_mut(&item_type) {
            agg.size_left += consumed;
        }
    }

    pub fn get_progress(&self) -> GlobalProgress {
        self.state.lock().unwrap().snapshot()
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}
