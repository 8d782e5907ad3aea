//! One-way synchronization: mirror a remote source into a local storage.
//!
//! A run consists of one or more phases. Each phase re-enables all checks,
//! disables the phase's ignored fields, rebuilds a reference map of the
//! local store and classifies every streamed source item as found,
//! modified or added; items never seen from the source are swept out of
//! the local store at the end.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::item::{CheckRegistry, PimItem};
use crate::storage::{ItemStream, Storage, StorageError, StorageResult, StreamStatus};
use crate::sync::{
    ProgressThrottle, RefMap, RefStatus, SyncCallback, SyncOptions, SyncPhase, SyncResult,
    SyncStats, build_reference_map, init_with_retries,
};

pub struct OneWaySync {
    inner: Arc<Inner>,
}

struct Inner {
    options: SyncOptions,
    phases: Vec<SyncPhase>,
    registry: crate::storage::StorageRegistry,
    checks: Arc<CheckRegistry>,
    running: std::sync::Mutex<bool>,
    cancelled: AtomicBool,
    source_stream: std::sync::Mutex<Option<ItemStream>>,
    stats: std::sync::Mutex<SyncStats>,
}

impl OneWaySync {
    /// Build an engine over the given phases. `checks` is the registry for
    /// the synchronized item kind; the engine mutates it only between
    /// phases and leaves every check enabled when the run finishes.
    pub fn new(
        options: SyncOptions,
        phases: Vec<SyncPhase>,
        registry: crate::storage::StorageRegistry,
        checks: Arc<CheckRegistry>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                options,
                phases,
                registry,
                checks,
                running: std::sync::Mutex::new(false),
                cancelled: AtomicBool::new(false),
                source_stream: std::sync::Mutex::new(None),
                stats: std::sync::Mutex::new(SyncStats::default()),
            }),
        }
    }

    /// Start a run on a background worker and return immediately.
    ///
    /// A second call while a run is active reports
    /// [`SyncResult::AlreadyInProgress`] through the callback and does not
    /// start a new run.
    pub fn synchronize(&self) {
        {
            let mut running = self.inner.running.lock().unwrap();
            if *running {
                drop(running);
                self.inner.notify_finished(SyncResult::AlreadyInProgress);
                return;
            }
            *running = true;
        }
        self.inner.cancelled.store(false, Ordering::Release);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let result = run(&inner).await;
            *inner.source_stream.lock().unwrap() = None;
            *inner.running.lock().unwrap() = false;
            inner.notify_finished(result);
        });
    }

    /// Request cooperative cancellation: the flag is observed between
    /// items and between phases, and the source stream is cancelled.
    pub fn cancel(&self) -> StorageResult<()> {
        if !*self.inner.running.lock().unwrap() {
            return Err(StorageError::NotInProgress);
        }
        self.inner.cancelled.store(true, Ordering::Release);
        if let Some(stream) = self.inner.source_stream.lock().unwrap().as_ref() {
            stream.cancel();
        }
        Ok(())
    }

    pub fn suspend(&self) -> StorageResult<()> {
        if !*self.inner.running.lock().unwrap() {
            return Err(StorageError::NotInProgress);
        }
        match self.inner.source_stream.lock().unwrap().as_ref() {
            Some(stream) => {
                stream.suspend();
                Ok(())
            }
            None => Err(StorageError::NotInProgress),
        }
    }

    pub fn resume(&self) -> StorageResult<()> {
        if !*self.inner.running.lock().unwrap() {
            return Err(StorageError::NotInProgress);
        }
        match self.inner.source_stream.lock().unwrap().as_ref() {
            Some(stream) => {
                stream.resume();
                Ok(())
            }
            None => Err(StorageError::NotInProgress),
        }
    }

    /// Counters accumulated across all phases of the last (or current)
    /// run. Remote counters stay zero for one-way syncs.
    pub fn stats(&self) -> SyncStats {
        *self.inner.stats.lock().unwrap()
    }

    pub fn is_running(&self) -> bool {
        *self.inner.running.lock().unwrap()
    }
}

impl Inner {
    fn notify_finished(&self, result: SyncResult) {
        if let Some(cb) = &self.options.callback {
            cb.sync_finished(result);
        }
    }

    fn callback(&self) -> Option<&Arc<dyn SyncCallback>> {
        self.options.callback.as_ref()
    }

    fn bump(&self, f: impl FnOnce(&mut SyncStats)) {
        f(&mut self.stats.lock().unwrap());
    }
}

async fn run(inner: &Arc<Inner>) -> SyncResult {
    inner.stats.lock().unwrap().clear();

    let mut local = match inner
        .registry
        .create(&inner.options.local_plugin, &inner.options.local_plugin_params)
    {
        Ok(storage) => storage,
        Err(err) => {
            tracing::warn!("cannot create local storage: {err}");
            return SyncResult::Fail;
        }
    };
    if let Err(err) = local.init().await {
        tracing::warn!("local storage init failed: {err}");
        return SyncResult::Fail;
    }

    let phase_count = inner.phases.len();
    for (phase_num, phase) in inner.phases.iter().enumerate() {
        inner.checks.enable_all();
        for field in &phase.ignored_fields {
            inner.checks.disable(field);
        }

        let mut source = match inner
            .registry
            .create(&inner.options.remote_plugin, &inner.options.remote_plugin_params)
        {
            Ok(storage) => storage,
            Err(err) => {
                tracing::warn!("cannot create source storage: {err}");
                return SyncResult::Fail;
            }
        };
        source.set_ignored_fields(&phase.ignored_fields);
        if let Err(err) = init_with_retries(source.as_mut()).await {
            tracing::warn!("source init failed: {err}");
            return SyncResult::Fail;
        }

        if let Some(cb) = inner.callback() {
            cb.sync_phase_started(&phase.name);
        }

        let result = run_phase(inner, local.as_mut(), source.as_mut(), phase, phase_num, phase_count).await;
        match result {
            Ok(()) => {}
            Err(PhaseFailure::Cancelled) => return SyncResult::Cancelled,
            Err(PhaseFailure::Storage(err)) => {
                tracing::warn!("phase '{}' failed: {err}", phase.name);
                return SyncResult::Fail;
            }
        }

        if let Some(cb) = inner.callback() {
            cb.sync_phase_finished(&phase.name);
        }
        if inner.cancelled.load(Ordering::Acquire) {
            return SyncResult::Cancelled;
        }
    }

    inner.checks.enable_all();

    if inner.stats.lock().unwrap().has_changes() {
        SyncResult::OkWithChange
    } else {
        SyncResult::OkNoChange
    }
}

enum PhaseFailure {
    Cancelled,
    Storage(StorageError),
}

impl From<StorageError> for PhaseFailure {
    fn from(err: StorageError) -> Self {
        PhaseFailure::Storage(err)
    }
}

async fn run_phase(
    inner: &Arc<Inner>,
    local: &mut dyn Storage,
    source: &mut dyn Storage,
    phase: &SyncPhase,
    phase_num: usize,
    phase_count: usize,
) -> Result<(), PhaseFailure> {
    let mut reference =
        build_reference_map(local, &inner.checks, false, &inner.cancelled).await?;
    if inner.cancelled.load(Ordering::Acquire) {
        return Err(PhaseFailure::Cancelled);
    }

    let stream = source.item_stream().await?;
    *inner.source_stream.lock().unwrap() = Some(stream.clone());

    let total = stream.total() * phase_count;
    let mut processed = phase_num * stream.total();
    let mut throttle = ProgressThrottle::new(inner.options.sync_progress_frequency);
    if let Some(cb) = inner.callback() {
        let progress = if total != 0 {
            processed as f32 / total as f32
        } else {
            0.0
        };
        cb.sync_progress(&phase.name, progress, processed);
    }

    let mut pending_adds: Vec<PimItem> = Vec::new();
    let mut pending_mods: Vec<(String, PimItem)> = Vec::new();

    while let Some(item) = stream.next_item().await {
        if inner.cancelled.load(Ordering::Acquire) {
            return Err(PhaseFailure::Cancelled);
        }
        processed += 1;

        if throttle.ready()
            && let Some(cb) = inner.callback()
        {
            let progress = if total != 0 {
                processed as f32 / total as f32
            } else {
                0.0
            };
            cb.sync_progress(&phase.name, progress, processed);
        }

        classify_item(inner, &mut reference, item, &mut pending_adds, &mut pending_mods);

        if pending_adds.len() >= inner.options.batch_size {
            flush_additions(local, &mut pending_adds).await?;
        }
        if pending_mods.len() >= inner.options.batch_size {
            flush_modifications(local, &mut pending_mods).await?;
        }
    }

    if stream.status() == StreamStatus::Error {
        return Err(PhaseFailure::Storage(StorageError::Fail(
            "source stream failed".to_string(),
        )));
    }
    if inner.cancelled.load(Ordering::Acquire) {
        return Err(PhaseFailure::Cancelled);
    }

    flush_additions(local, &mut pending_adds).await?;
    flush_modifications(local, &mut pending_mods).await?;

    sweep_removals(inner, local, &mut reference).await?;
    Ok(())
}

/// Probe the reference map for the incoming item: a full match marks the
/// entry found; a key-only match reuses the first unclaimed entry as a
/// modification; everything else is an addition.
fn classify_item(
    inner: &Arc<Inner>,
    reference: &mut RefMap,
    item: PimItem,
    pending_adds: &mut Vec<PimItem>,
    pending_mods: &mut Vec<(String, PimItem)>,
) {
    let index = item.index(&inner.checks);
    let bucket = reference.entry(index.key_string().to_string()).or_default();

    let mut first_not_found = None;
    for (pos, entry) in bucket.iter_mut().enumerate() {
        if entry.status != RefStatus::NotFound {
            continue;
        }
        if index.equals(&entry.index, &inner.checks) {
            entry.status = RefStatus::Found;
            return;
        }
        if first_not_found.is_none() {
            first_not_found = Some(pos);
        }
    }

    match first_not_found {
        Some(pos) => {
            bucket[pos].status = RefStatus::Modified;
            inner.bump(|s| s.locally_modified += 1);
            pending_mods.push((bucket[pos].id.clone(), item));
        }
        None => {
            inner.bump(|s| s.locally_added += 1);
            bucket.push(crate::sync::RefEntry {
                id: String::new(),
                revision: String::new(),
                item: None,
                index,
                status: RefStatus::Added,
            });
            pending_adds.push(item);
        }
    }
}

async fn flush_additions(
    local: &mut dyn Storage,
    pending: &mut Vec<PimItem>,
) -> StorageResult<()> {
    if pending.is_empty() {
        return Ok(());
    }
    local.add_items(pending).await?;
    pending.clear();
    Ok(())
}

async fn flush_modifications(
    local: &mut dyn Storage,
    pending: &mut Vec<(String, PimItem)>,
) -> StorageResult<()> {
    if pending.is_empty() {
        return Ok(());
    }
    let ids: Vec<String> = pending.iter().map(|(id, _)| id.clone()).collect();
    let items: Vec<PimItem> = pending.iter().map(|(_, item)| item.clone()).collect();
    local.modify_items(&ids, &items).await?;
    pending.clear();
    Ok(())
}

/// Remove every local item the source stream never matched.
async fn sweep_removals(
    inner: &Arc<Inner>,
    local: &mut dyn Storage,
    reference: &mut RefMap,
) -> StorageResult<()> {
    let mut pending: Vec<String> = Vec::new();
    for bucket in reference.values_mut() {
        for entry in bucket.iter_mut() {
            if entry.status == RefStatus::NotFound {
                entry.status = RefStatus::Removed;
                inner.bump(|s| s.locally_removed += 1);
                pending.push(entry.id.clone());
                if pending.len() >= inner.options.batch_size {
                    local.remove_items(&pending).await?;
                    pending.clear();
                }
            }
        }
    }
    if !pending.is_empty() {
        local.remove_items(&pending).await?;
    }
    Ok(())
}
