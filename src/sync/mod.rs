//! Synchronization engines and their shared surface.

pub mod metadata;
pub mod one_way;
pub mod two_way;

pub use metadata::{ItemState, SyncMetadata};
pub use one_way::OneWaySync;
pub use two_way::TwoWaySync;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::item::{CheckRegistry, ItemIndex, PimItem};
use crate::storage::{Storage, StorageError, StorageResult, StreamStatus};

/// Outcome of a synchronization run, delivered through
/// [`SyncCallback::sync_finished`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncResult {
    /// Completed and both sides were already identical.
    OkNoChange,
    /// Completed and at least one item was written.
    OkWithChange,
    Cancelled,
    /// A run was already active on this engine; no new run started.
    AlreadyInProgress,
    Fail,
}

/// Aggregate counters of a run. One-way syncs only populate the local
/// side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub locally_added: u32,
    pub locally_modified: u32,
    pub locally_removed: u32,
    pub remotely_added: u32,
    pub remotely_modified: u32,
    pub remotely_removed: u32,
}

impl SyncStats {
    pub fn clear(&mut self) {
        *self = SyncStats::default();
    }

    pub fn has_changes(&self) -> bool {
        *self != SyncStats::default()
    }
}

/// Receiver of engine events. All methods have empty defaults so hosts
/// implement only what they render.
pub trait SyncCallback: Send + Sync {
    fn print(&self, _msg: &str) {}
    fn sync_finished(&self, _result: SyncResult) {}
    /// Throttled by the engine's `sync_progress_frequency`; `progress` is
    /// in `[0, 1]`.
    fn sync_progress(&self, _phase: &str, _progress: f32, _processed: usize) {}
    fn sync_phase_started(&self, _name: &str) {}
    fn sync_phase_finished(&self, _name: &str) {}
    /// Fresh metadata JSON to persist for the next two-way run.
    fn metadata_updated(&self, _json: &str) {}
}

/// One pass of a one-way sync with a specific set of ignored fields.
#[derive(Debug, Clone)]
pub struct SyncPhase {
    pub name: String,
    pub ignored_fields: Vec<String>,
}

impl SyncPhase {
    pub fn new(name: impl Into<String>, ignored_fields: Vec<String>) -> Self {
        Self {
            name: name.into(),
            ignored_fields,
        }
    }
}

/// Engine configuration.
pub struct SyncOptions {
    /// Name of the remote Storage factory in the registry.
    pub remote_plugin: String,
    /// Parameters forwarded verbatim to the remote factory.
    pub remote_plugin_params: Value,
    /// Name of the local Storage factory in the registry.
    pub local_plugin: String,
    pub local_plugin_params: Value,
    pub callback: Option<Arc<dyn SyncCallback>>,
    /// Minimum interval between `sync_progress` emissions.
    pub sync_progress_frequency: Duration,
    /// Maximum items per Storage batch.
    pub batch_size: usize,
    /// Previous run's metadata JSON; empty triggers an initial two-way
    /// sync.
    pub metadata: String,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            remote_plugin: String::new(),
            remote_plugin_params: Value::Null,
            local_plugin: String::new(),
            local_plugin_params: Value::Null,
            callback: None,
            sync_progress_frequency: Duration::from_millis(200),
            batch_size: 100,
            metadata: String::new(),
        }
    }
}

/// Rate limiter for progress callbacks.
pub(crate) struct ProgressThrottle {
    min_interval: Duration,
    last: Option<Instant>,
}

impl ProgressThrottle {
    pub(crate) fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: None,
        }
    }

    pub(crate) fn ready(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.min_interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

/// Initialize a storage with the engine's start-up back-off: five attempts
/// with 100 ms gaps. All later failures are reported, not retried.
pub(crate) async fn init_with_retries(storage: &mut dyn Storage) -> StorageResult<()> {
    let mut attempts_left = 5u32;
    loop {
        match storage.init().await {
            Ok(()) => return Ok(()),
            Err(err) if attempts_left > 1 => {
                tracing::debug!("storage init failed, retrying: {err}");
                attempts_left -= 1;
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Status of one reference entry while a phase runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RefStatus {
    NotFound,
    Found,
    Added,
    Modified,
    Removed,
}

/// One known item of the destination store.
pub(crate) struct RefEntry {
    pub id: String,
    pub revision: String,
    /// Body kept only when the engine may need to copy it to the other
    /// side (two-way); one-way drops it to keep the map small.
    pub item: Option<PimItem>,
    pub index: ItemIndex,
    pub status: RefStatus,
}

/// Identity index → entries sharing that key.
pub(crate) type RefMap = HashMap<String, Vec<RefEntry>>;

/// Iterate the destination store and build the reference map used to
/// classify incoming items.
pub(crate) async fn build_reference_map(
    storage: &mut dyn Storage,
    checks: &CheckRegistry,
    keep_items: bool,
    cancelled: &AtomicBool,
) -> StorageResult<RefMap> {
    let stream = storage.item_stream().await?;
    let mut map: RefMap = HashMap::new();
    while let Some(item) = stream.next_item().await {
        if cancelled.load(std::sync::atomic::Ordering::Acquire) {
            return Ok(map);
        }
        let index = item.index(checks);
        let entry = RefEntry {
            id: item.id().to_string(),
            revision: item.revision().to_string(),
            item: keep_items.then_some(item),
            index: index.clone(),
            status: RefStatus::NotFound,
        };
        map.entry(index.key_string().to_string()).or_default().push(entry);
    }
    if stream.status() == StreamStatus::Error {
        return Err(StorageError::Fail(
            "destination iteration failed".to_string(),
        ));
    }
    Ok(map)
}
