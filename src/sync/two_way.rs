//! Two-way synchronization between a local and a remote storage with
//! persisted metadata.
//!
//! Without metadata the engine seeds pairings by content matching; with
//! metadata it classifies both sides into not-present/not-changed/modified
//! and reconciles the state matrix, duplicating both versions of an item
//! that changed on both sides so the user can merge manually.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::item::{CheckRegistry, PimItem};
use crate::storage::{ItemStream, Storage, StorageError, StorageResult, StreamStatus};
use crate::sync::metadata::{ItemState, SyncMetadata};
use crate::sync::{
    ProgressThrottle, RefStatus, SyncCallback, SyncOptions, SyncResult, SyncStats,
    build_reference_map, init_with_retries,
};

/// Suffix appended to the id and UID of the surviving local version when a
/// conflict is duplicated to the remote side.
const CONFLICT_SUFFIX: &str = "(conflicted)";

pub struct TwoWaySync {
    inner: Arc<Inner>,
}

struct Inner {
    options: SyncOptions,
    registry: crate::storage::StorageRegistry,
    checks: Arc<CheckRegistry>,
    running: std::sync::Mutex<bool>,
    cancelled: AtomicBool,
    remote_stream: std::sync::Mutex<Option<ItemStream>>,
    stats: std::sync::Mutex<SyncStats>,
    last_metadata: std::sync::Mutex<String>,
}

impl TwoWaySync {
    pub fn new(
        options: SyncOptions,
        registry: crate::storage::StorageRegistry,
        checks: Arc<CheckRegistry>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                options,
                registry,
                checks,
                running: std::sync::Mutex::new(false),
                cancelled: AtomicBool::new(false),
                remote_stream: std::sync::Mutex::new(None),
                stats: std::sync::Mutex::new(SyncStats::default()),
                last_metadata: std::sync::Mutex::new(String::new()),
            }),
        }
    }

    /// Start a run on a background worker and return immediately. A second
    /// call while a run is active reports
    /// [`SyncResult::AlreadyInProgress`] and does not start a new run.
    pub fn synchronize(&self) {
        {
            let mut running = self.inner.running.lock().unwrap();
            if *running {
                drop(running);
                if let Some(cb) = &self.inner.options.callback {
                    cb.sync_finished(SyncResult::AlreadyInProgress);
                }
                return;
            }
            *running = true;
        }
        self.inner.cancelled.store(false, Ordering::Release);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let result = run(&inner).await;
            *inner.remote_stream.lock().unwrap() = None;
            *inner.running.lock().unwrap() = false;
            if let Some(cb) = &inner.options.callback {
                cb.sync_finished(result);
            }
        });
    }

    pub fn cancel(&self) -> StorageResult<()> {
        if !*self.inner.running.lock().unwrap() {
            return Err(StorageError::NotInProgress);
        }
        self.inner.cancelled.store(true, Ordering::Release);
        if let Some(stream) = self.inner.remote_stream.lock().unwrap().as_ref() {
            stream.cancel();
        }
        Ok(())
    }

    pub fn suspend(&self) -> StorageResult<()> {
        if !*self.inner.running.lock().unwrap() {
            return Err(StorageError::NotInProgress);
        }
        match self.inner.remote_stream.lock().unwrap().as_ref() {
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
        match self.inner.remote_stream.lock().unwrap().as_ref() {
            Some(stream) => {
                stream.resume();
                Ok(())
            }
            None => Err(StorageError::NotInProgress),
        }
    }

    pub fn stats(&self) -> SyncStats {
        *self.inner.stats.lock().unwrap()
    }

    pub fn is_running(&self) -> bool {
        *self.inner.running.lock().unwrap()
    }

    /// Metadata JSON of the last completed run, also delivered through
    /// [`SyncCallback::metadata_updated`].
    pub fn metadata_json(&self) -> String {
        self.inner.last_metadata.lock().unwrap().clone()
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
    let mut remote = match inner
        .registry
        .create(&inner.options.remote_plugin, &inner.options.remote_plugin_params)
    {
        Ok(storage) => storage,
        Err(err) => {
            tracing::warn!("cannot create remote storage: {err}");
            return SyncResult::Fail;
        }
    };
    if let Err(err) = init_with_retries(local.as_mut()).await {
        tracing::warn!("local storage init failed: {err}");
        return SyncResult::Fail;
    }
    if let Err(err) = init_with_retries(remote.as_mut()).await {
        tracing::warn!("remote storage init failed: {err}");
        return SyncResult::Fail;
    }

    let metadata = if inner.options.metadata.is_empty() {
        None
    } else {
        match SyncMetadata::from_json(&inner.options.metadata) {
            Ok(metadata) => Some(metadata),
            Err(err) => {
                tracing::warn!("invalid sync metadata, running initial sync: {err}");
                None
            }
        }
    };

    let mut sync = TwoWayRun {
        inner: Arc::clone(inner),
        local,
        remote,
        metadata: metadata.clone().unwrap_or_default(),
        pending_local_adds: Vec::new(),
        pending_local_mods: Vec::new(),
        pending_local_removes: Vec::new(),
        pending_remote_adds: Vec::new(),
        pending_remote_mods: Vec::new(),
        pending_remote_removes: Vec::new(),
        pair_on_local_modify: metadata.is_none(),
    };

    let result = if metadata.is_none() {
        sync.first_time_sync().await
    } else {
        sync.incremental_sync().await
    };

    match result {
        Ok(()) => {
            let json = sync.metadata.to_json();
            *inner.last_metadata.lock().unwrap() = json.clone();
            if let Some(cb) = &inner.options.callback {
                cb.metadata_updated(&json);
            }
            if inner.stats.lock().unwrap().has_changes() {
                SyncResult::OkWithChange
            } else {
                SyncResult::OkNoChange
            }
        }
        Err(RunFailure::Cancelled) => SyncResult::Cancelled,
        Err(RunFailure::Storage(err)) => {
            tracing::warn!("two-way sync failed: {err}");
            SyncResult::Fail
        }
    }
}

enum RunFailure {
    Cancelled,
    Storage(StorageError),
}

impl From<StorageError> for RunFailure {
    fn from(err: StorageError) -> Self {
        RunFailure::Storage(err)
    }
}

struct TwoWayRun {
    inner: Arc<Inner>,
    local: Box<dyn Storage>,
    remote: Box<dyn Storage>,
    metadata: SyncMetadata,
    pending_local_adds: Vec<PimItem>,
    pending_local_mods: Vec<(String, PimItem)>,
    pending_local_removes: Vec<String>,
    pending_remote_adds: Vec<PimItem>,
    pending_remote_mods: Vec<(String, PimItem)>,
    pending_remote_removes: Vec<String>,
    /// Initial seeding records a pairing when a local modify flushes; on
    /// incremental runs the pairing already exists and only the revision
    /// moves.
    pair_on_local_modify: bool,
}

impl TwoWayRun {
    fn callback(&self) -> Option<&Arc<dyn SyncCallback>> {
        self.inner.options.callback.as_ref()
    }

    fn cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    fn bump(&self, f: impl FnOnce(&mut SyncStats)) {
        f(&mut self.inner.stats.lock().unwrap());
    }

    fn progress(&self, phase: &str, progress: f32, processed: usize) {
        if let Some(cb) = self.callback() {
            cb.sync_progress(phase, progress, processed);
        }
    }

    // ----------- initial sync -----------

    /// No metadata yet: match both stores by content, seed the pairing
    /// table, copy what only one side has.
    async fn first_time_sync(&mut self) -> Result<(), RunFailure> {
        self.progress("checking remote changes", 0.0, 0);

        let mut reference =
            build_reference_map(self.local.as_mut(), &self.inner.checks, true, &self.inner.cancelled)
                .await?;
        if self.cancelled() {
            return Err(RunFailure::Cancelled);
        }

        let stream = self.remote.item_stream().await?;
        *self.inner.remote_stream.lock().unwrap() = Some(stream.clone());

        let total = stream.total();
        let mut processed = 0usize;
        let mut throttle = ProgressThrottle::new(self.inner.options.sync_progress_frequency);

        while let Some(item) = stream.next_item().await {
            if self.cancelled() {
                return Err(RunFailure::Cancelled);
            }
            processed += 1;
            if throttle.ready() {
                let progress = if total != 0 {
                    processed as f32 / total as f32
                } else {
                    0.0
                };
                self.progress("checking remote changes", progress, processed);
            }

            let index = item.index(&self.inner.checks);
            let bucket = reference.entry(index.key_string().to_string()).or_default();

            let mut matched = false;
            let mut first_not_found = None;
            for (pos, entry) in bucket.iter_mut().enumerate() {
                if entry.status != RefStatus::NotFound {
                    continue;
                }
                if index.equals(&entry.index, &self.inner.checks) {
                    entry.status = RefStatus::Found;
                    self.metadata
                        .add_item(item.id(), item.revision(), &entry.id, &entry.revision);
                    matched = true;
                    break;
                }
                if first_not_found.is_none() {
                    first_not_found = Some(pos);
                }
            }
            if matched {
                continue;
            }

            match first_not_found {
                Some(pos) => {
                    // Same identity, different content: the remote body
                    // wins during initial seeding.
                    bucket[pos].status = RefStatus::Modified;
                    let local_id = bucket[pos].id.clone();
                    self.modify_local_item(local_id, item).await?;
                }
                None => {
                    bucket.push(crate::sync::RefEntry {
                        id: String::new(),
                        revision: String::new(),
                        item: None,
                        index,
                        status: RefStatus::Added,
                    });
                    self.add_local_item(item).await?;
                }
            }
        }
        if stream.status() == StreamStatus::Error {
            return Err(StorageError::Fail("remote stream failed".to_string()).into());
        }
        if self.cancelled() {
            return Err(RunFailure::Cancelled);
        }

        self.progress("saving local changes", 0.0, 0);
        self.flush_local_insertions().await?;
        self.flush_local_modifications().await?;
        self.progress("saving local changes", 1.0, 0);

        // Everything the remote never matched goes up to the server.
        let leftovers: Vec<PimItem> = reference
            .values_mut()
            .flat_map(|bucket| bucket.iter_mut())
            .filter(|entry| entry.status == RefStatus::NotFound)
            .filter_map(|entry| entry.item.take())
            .collect();
        for item in leftovers {
            if self.cancelled() {
                return Err(RunFailure::Cancelled);
            }
            self.add_remote_item(item).await?;
        }

        self.progress("saving remote changes", 0.0, 0);
        self.flush_remote_insertions().await?;
        self.flush_remote_modifications().await?;
        self.progress("saving remote changes", 1.0, 0);

        self.refresh_sync_tokens().await;
        Ok(())
    }

    // ----------- incremental sync -----------

    async fn incremental_sync(&mut self) -> Result<(), RunFailure> {
        self.metadata.reset_local_state(ItemState::NotPresent);
        self.metadata.reset_remote_state(ItemState::NotPresent);

        let (locally_added_ids, locally_modified_ids) = self.detect_local_changes().await?;
        let (remotely_added_ids, remotely_modified_ids) = self.detect_remote_changes().await?;
        if self.cancelled() {
            return Err(RunFailure::Cancelled);
        }

        // Materialize the bodies the reconciliation may need to copy.
        let locally_added = self.fetch_local(&locally_added_ids).await?;
        let locally_modified = self.fetch_local_map(&locally_modified_ids).await?;
        let remotely_added = self.fetch_remote(&remotely_added_ids).await?;
        let remotely_modified = self.fetch_remote_map(&remotely_modified_ids).await?;
        if self.cancelled() {
            return Err(RunFailure::Cancelled);
        }

        self.reconcile_matrix(&locally_modified, &remotely_modified)
            .await?;
        self.reconcile_additions(locally_added, remotely_added).await?;

        self.flush_local_insertions().await?;
        self.flush_local_modifications().await?;
        self.flush_local_removals().await?;
        self.flush_remote_insertions().await?;
        self.flush_remote_modifications().await?;
        self.flush_remote_removals().await?;

        self.refresh_sync_tokens().await;
        Ok(())
    }

    /// Classify the local side. Returns the ids of added and modified
    /// items.
    async fn detect_local_changes(&mut self) -> Result<(Vec<String>, Vec<String>), RunFailure> {
        let token = self.metadata.local_sync_token().to_string();
        let revisions = match self.local.get_changed_revisions(&token).await {
            Ok((revisions, removed)) => {
                tracing::debug!(count = revisions.len(), "local incremental changes");
                self.metadata.reset_local_state(ItemState::NotChanged);
                for id in &removed {
                    self.metadata.set_local_state(id, ItemState::NotPresent);
                }
                revisions
            }
            // No server-side change tracking (or a stale token): fall back
            // to a full revision listing.
            Err(_) => self.local.get_revisions().await?,
        };

        let mut added = Vec::new();
        let mut modified = Vec::new();
        for (id, revision) in &revisions {
            if self.metadata.has_local_id(id) {
                if self.metadata.local_revision(id) != Some(revision.as_str()) {
                    modified.push(id.clone());
                    self.metadata.set_local_state(id, ItemState::Modified);
                } else {
                    self.metadata.set_local_state(id, ItemState::NotChanged);
                }
            } else {
                added.push(id.clone());
            }
        }
        Ok((added, modified))
    }

    async fn detect_remote_changes(&mut self) -> Result<(Vec<String>, Vec<String>), RunFailure> {
        let token = self.metadata.remote_sync_token().to_string();
        let revisions = match self.remote.get_changed_revisions(&token).await {
            Ok((revisions, removed)) => {
                tracing::debug!(count = revisions.len(), "remote incremental changes");
                self.metadata.reset_remote_state(ItemState::NotChanged);
                for id in &removed {
                    self.metadata.set_remote_state(id, ItemState::NotPresent);
                }
                revisions
            }
            Err(_) => self.remote.get_revisions().await?,
        };

        let mut added = Vec::new();
        let mut modified = Vec::new();
        for (id, revision) in &revisions {
            if self.metadata.has_remote_id(id) {
                if self.metadata.remote_revision(id) != Some(revision.as_str()) {
                    modified.push(id.clone());
                    self.metadata.set_remote_state(id, ItemState::Modified);
                } else {
                    self.metadata.set_remote_state(id, ItemState::NotChanged);
                }
            } else {
                added.push(id.clone());
            }
        }
        Ok((added, modified))
    }

    async fn fetch_local(&mut self, ids: &[String]) -> Result<Vec<PimItem>, RunFailure> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.local.get_items(ids).await?)
    }

    async fn fetch_local_map(
        &mut self,
        ids: &[String],
    ) -> Result<HashMap<String, PimItem>, RunFailure> {
        let items = self.fetch_local(ids).await?;
        Ok(ids.iter().cloned().zip(items).collect())
    }

    async fn fetch_remote(&mut self, ids: &[String]) -> Result<Vec<PimItem>, RunFailure> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.remote.get_items(ids).await?)
    }

    async fn fetch_remote_map(
        &mut self,
        ids: &[String],
    ) -> Result<HashMap<String, PimItem>, RunFailure> {
        let items = self.fetch_remote(ids).await?;
        Ok(ids.iter().cloned().zip(items).collect())
    }

    /// Walk the remote × local state matrix over all pairings.
    async fn reconcile_matrix(
        &mut self,
        locally_modified: &HashMap<String, PimItem>,
        remotely_modified: &HashMap<String, PimItem>,
    ) -> Result<(), RunFailure> {
        use ItemState::{Modified, NotChanged, NotPresent};

        // Gone on both sides: only the pairing remains to drop.
        for (remote_id, local_id) in self.metadata.items_with_state(NotPresent, NotPresent) {
            self.metadata.remove_item(&remote_id, &local_id);
        }

        // Removed remotely: propagate the deletion.
        for (remote_id, local_id) in self.metadata.items_with_state(NotPresent, NotChanged) {
            self.remove_local_item(local_id.clone()).await?;
            self.metadata.remove_item(&remote_id, &local_id);
        }

        // Removed locally: propagate the deletion.
        for (remote_id, local_id) in self.metadata.items_with_state(NotChanged, NotPresent) {
            self.remove_remote_item(remote_id.clone()).await?;
            self.metadata.remove_item(&remote_id, &local_id);
        }

        // Removed remotely but edited locally: the edit wins, re-create it.
        for (remote_id, local_id) in self.metadata.items_with_state(NotPresent, Modified) {
            self.metadata.remove_item(&remote_id, &local_id);
            if let Some(item) = locally_modified.get(&local_id) {
                self.add_remote_item(item.clone()).await?;
            }
        }

        // Removed locally but edited remotely: re-create the edit locally.
        for (remote_id, local_id) in self.metadata.items_with_state(Modified, NotPresent) {
            self.metadata.remove_item(&remote_id, &local_id);
            if let Some(item) = remotely_modified.get(&remote_id) {
                self.add_local_item(item.clone()).await?;
            }
        }

        // Edited locally only: push to remote.
        for (remote_id, local_id) in self.metadata.items_with_state(NotChanged, Modified) {
            if let Some(item) = locally_modified.get(&local_id) {
                self.metadata.update_local_revision(&local_id, item.revision());
                self.modify_remote_item(remote_id, item.clone()).await?;
            }
        }

        // Edited remotely only: pull to local.
        for (remote_id, local_id) in self.metadata.items_with_state(Modified, NotChanged) {
            if let Some(item) = remotely_modified.get(&remote_id) {
                self.metadata.update_remote_revision(&remote_id, item.revision());
                self.modify_local_item(local_id, item.clone()).await?;
            }
        }

        // Edited on both sides: keep both versions, one copy per side, and
        // leave the merge to the user.
        for (remote_id, local_id) in self.metadata.items_with_state(Modified, Modified) {
            let (Some(local_item), Some(remote_item)) = (
                locally_modified.get(&local_id).cloned(),
                remotely_modified.get(&remote_id).cloned(),
            ) else {
                continue;
            };
            self.duplicate_conflict(remote_id, local_id, local_item, remote_item)
                .await?;
        }

        Ok(())
    }

    async fn duplicate_conflict(
        &mut self,
        remote_id: String,
        local_id: String,
        mut local_item: PimItem,
        remote_item: PimItem,
    ) -> Result<(), RunFailure> {
        let conflicted_id = format!("{}{}", local_item.id(), CONFLICT_SUFFIX);
        local_item.set_id(conflicted_id, true);

        let (new_local_id, new_local_revision) = self.local.add_item(&remote_item).await?;
        let (new_remote_id, new_remote_revision) = self.remote.add_item(&local_item).await?;

        self.metadata.remove_item(&remote_id, &local_id);
        self.metadata.add_item(
            &remote_id,
            remote_item.revision(),
            &new_local_id,
            &new_local_revision,
        );
        self.metadata.add_item(
            &new_remote_id,
            &new_remote_revision,
            &local_id,
            local_item.revision(),
        );

        self.bump(|s| {
            s.locally_added += 1;
            s.remotely_added += 1;
        });
        tracing::debug!(remote_id, local_id, "duplicated conflicting item");
        Ok(())
    }

    /// Cross-check items added on both sides since the last run: a full
    /// content match only needs a new pairing, everything else is copied
    /// to the opposite side.
    async fn reconcile_additions(
        &mut self,
        locally_added: Vec<PimItem>,
        mut remotely_added: Vec<PimItem>,
    ) -> Result<(), RunFailure> {
        for local_item in locally_added {
            let local_index = local_item.index(&self.inner.checks);
            let mut matched = None;
            for (pos, remote_item) in remotely_added.iter().enumerate() {
                let remote_index = remote_item.index(&self.inner.checks);
                if local_index.matches(&remote_index)
                    && local_index.equals(&remote_index, &self.inner.checks)
                {
                    matched = Some(pos);
                    break;
                }
            }
            match matched {
                Some(pos) => {
                    let remote_item = remotely_added.remove(pos);
                    self.metadata.add_item(
                        remote_item.id(),
                        remote_item.revision(),
                        local_item.id(),
                        local_item.revision(),
                    );
                }
                None => self.add_remote_item(local_item).await?,
            }
        }

        for remote_item in remotely_added {
            self.add_local_item(remote_item).await?;
        }
        Ok(())
    }

    // ----------- batched mutations -----------

    async fn add_local_item(&mut self, item: PimItem) -> StorageResult<()> {
        self.bump(|s| s.locally_added += 1);
        self.pending_local_adds.push(item);
        if self.pending_local_adds.len() >= self.inner.options.batch_size {
            self.flush_local_insertions().await?;
        }
        Ok(())
    }

    async fn modify_local_item(&mut self, id: String, item: PimItem) -> StorageResult<()> {
        self.bump(|s| s.locally_modified += 1);
        self.pending_local_mods.push((id, item));
        if self.pending_local_mods.len() >= self.inner.options.batch_size {
            self.flush_local_modifications().await?;
        }
        Ok(())
    }

    async fn remove_local_item(&mut self, id: String) -> StorageResult<()> {
        self.bump(|s| s.locally_removed += 1);
        self.pending_local_removes.push(id);
        if self.pending_local_removes.len() >= self.inner.options.batch_size {
            self.flush_local_removals().await?;
        }
        Ok(())
    }

    async fn add_remote_item(&mut self, item: PimItem) -> StorageResult<()> {
        self.bump(|s| s.remotely_added += 1);
        self.pending_remote_adds.push(item);
        if self.pending_remote_adds.len() >= self.inner.options.batch_size {
            self.flush_remote_insertions().await?;
        }
        Ok(())
    }

    async fn modify_remote_item(&mut self, id: String, item: PimItem) -> StorageResult<()> {
        self.bump(|s| s.remotely_modified += 1);
        self.pending_remote_mods.push((id, item));
        if self.pending_remote_mods.len() >= self.inner.options.batch_size {
            self.flush_remote_modifications().await?;
        }
        Ok(())
    }

    async fn remove_remote_item(&mut self, id: String) -> StorageResult<()> {
        self.bump(|s| s.remotely_removed += 1);
        self.pending_remote_removes.push(id);
        if self.pending_remote_removes.len() >= self.inner.options.batch_size {
            self.flush_remote_removals().await?;
        }
        Ok(())
    }

    /// Write queued local additions; the pairing records the new local
    /// identity next to the originating remote one.
    async fn flush_local_insertions(&mut self) -> StorageResult<()> {
        if self.pending_local_adds.is_empty() {
            return Ok(());
        }
        let identities = self.local.add_items(&self.pending_local_adds).await?;
        for (item, (new_id, new_revision)) in self.pending_local_adds.iter().zip(&identities) {
            self.metadata
                .add_item(item.id(), item.revision(), new_id, new_revision);
        }
        self.pending_local_adds.clear();
        Ok(())
    }

    async fn flush_local_modifications(&mut self) -> StorageResult<()> {
        if self.pending_local_mods.is_empty() {
            return Ok(());
        }
        let ids: Vec<String> = self.pending_local_mods.iter().map(|(id, _)| id.clone()).collect();
        let items: Vec<PimItem> = self
            .pending_local_mods
            .iter()
            .map(|(_, item)| item.clone())
            .collect();
        let revisions = self.local.modify_items(&ids, &items).await?;
        for ((id, item), revision) in self.pending_local_mods.iter().zip(&revisions) {
            if self.pair_on_local_modify {
                self.metadata.add_item(item.id(), item.revision(), id, revision);
            } else {
                self.metadata.update_local_revision(id, revision);
            }
        }
        self.pending_local_mods.clear();
        Ok(())
    }

    async fn flush_local_removals(&mut self) -> StorageResult<()> {
        if self.pending_local_removes.is_empty() {
            return Ok(());
        }
        self.local.remove_items(&self.pending_local_removes).await?;
        self.pending_local_removes.clear();
        Ok(())
    }

    async fn flush_remote_insertions(&mut self) -> StorageResult<()> {
        if self.pending_remote_adds.is_empty() {
            return Ok(());
        }
        let identities = self.remote.add_items(&self.pending_remote_adds).await?;
        for (item, (new_id, new_revision)) in self.pending_remote_adds.iter().zip(&identities) {
            self.metadata
                .add_item(new_id, new_revision, item.id(), item.revision());
        }
        self.pending_remote_adds.clear();
        Ok(())
    }

    async fn flush_remote_modifications(&mut self) -> StorageResult<()> {
        if self.pending_remote_mods.is_empty() {
            return Ok(());
        }
        let ids: Vec<String> = self.pending_remote_mods.iter().map(|(id, _)| id.clone()).collect();
        let items: Vec<PimItem> = self
            .pending_remote_mods
            .iter()
            .map(|(_, item)| item.clone())
            .collect();
        let revisions = self.remote.modify_items(&ids, &items).await?;
        for ((id, _), revision) in self.pending_remote_mods.iter().zip(&revisions) {
            self.metadata.update_remote_revision(id, revision);
        }
        self.pending_remote_mods.clear();
        Ok(())
    }

    async fn flush_remote_removals(&mut self) -> StorageResult<()> {
        if self.pending_remote_removes.is_empty() {
            return Ok(());
        }
        self.remote.remove_items(&self.pending_remote_removes).await?;
        self.pending_remote_removes.clear();
        Ok(())
    }

    /// Capture fresh baselines for the next incremental run; a side that
    /// cannot produce a token gets an empty one, forcing a full listing
    /// next time.
    async fn refresh_sync_tokens(&mut self) {
        match self.local.get_latest_sync_token().await {
            Ok(token) => self.metadata.set_local_sync_token(token),
            Err(_) => self.metadata.set_local_sync_token(""),
        }
        match self.remote.get_latest_sync_token().await {
            Ok(token) => self.metadata.set_remote_sync_token(token),
            Err(_) => self.metadata.set_remote_sync_token(""),
        }
    }
}
