//! Shared fixtures: an in-memory storage, a channel-backed callback and
//! vCard builders.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use pim_dav_sync::item::{ItemKind, PimItem};
use pim_dav_sync::storage::{ItemStream, Storage, StorageError, StorageRegistry, StorageResult};
use pim_dav_sync::sync::{SyncCallback, SyncOptions, SyncResult};

pub fn vcard(family: &str, given: &str, tel: &str) -> String {
    format!(
        "BEGIN:VCARD\r\nVERSION:3.0\r\nUID:{given}-{family}\r\nN:{family};{given};;;\r\nFN:{given} {family}\r\nTEL;TYPE=HOME:{tel}\r\nEND:VCARD\r\n"
    )
}

pub fn contact(family: &str, given: &str, tel: &str) -> PimItem {
    PimItem::parse_contact(&vcard(family, given, tel)).expect("fixture vcard parses")
}

/// Backing state of a [`MemoryStorage`], shared with the test body so it
/// can seed and inspect items while the engine owns the storage.
#[derive(Default)]
pub struct MemState {
    pub items: HashMap<String, PimItem>,
    pub next_id: u64,
    pub next_revision: u64,
    pub next_token: u64,
    /// Revision snapshots keyed by issued sync token.
    pub snapshots: HashMap<String, HashMap<String, String>>,
    pub supports_incremental: bool,
    /// Artificial `init` latency, for tests that need a run to stay
    /// active while they interact with the engine.
    pub init_delay_ms: u64,
}

impl MemState {
    pub fn new_shared(supports_incremental: bool) -> Arc<Mutex<MemState>> {
        Arc::new(Mutex::new(MemState {
            supports_incremental,
            ..MemState::default()
        }))
    }

    pub fn revisions(&self) -> HashMap<String, String> {
        self.items
            .iter()
            .map(|(id, item)| (id.clone(), item.revision().to_string()))
            .collect()
    }

    fn assign(&mut self, prefix: &str, item: &PimItem) -> (String, String) {
        self.next_id += 1;
        self.next_revision += 1;
        let id = format!("{prefix}-{}", self.next_id);
        let revision = format!("rev-{}", self.next_revision);
        let mut stored = item.clone();
        stored.set_id(id.clone(), false);
        stored.set_revision(revision.clone());
        self.items.insert(id.clone(), stored);
        (id, revision)
    }

    /// Insert items as if they had always been there; returns their ids.
    pub fn seed(&mut self, prefix: &str, items: Vec<PimItem>) -> Vec<String> {
        items
            .into_iter()
            .map(|item| self.assign(prefix, &item).0)
            .collect()
    }

    /// Replace an item's body in place, bumping its revision.
    pub fn mutate(&mut self, id: &str, item: PimItem) -> String {
        self.next_revision += 1;
        let revision = format!("rev-{}", self.next_revision);
        let mut stored = item;
        stored.set_id(id.to_string(), false);
        stored.set_revision(revision.clone());
        self.items.insert(id.to_string(), stored);
        revision
    }
}

pub struct MemoryStorage {
    kind: ItemKind,
    prefix: String,
    state: Arc<Mutex<MemState>>,
    stream: Option<ItemStream>,
}

impl MemoryStorage {
    pub fn new(kind: ItemKind, prefix: &str, state: Arc<Mutex<MemState>>) -> Self {
        Self {
            kind,
            prefix: prefix.to_string(),
            state,
            stream: None,
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    fn kind(&self) -> ItemKind {
        self.kind
    }

    async fn init(&mut self) -> StorageResult<()> {
        let delay = self.state.lock().unwrap().init_delay_ms;
        if delay > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
        }
        Ok(())
    }

    async fn get_items(&mut self, ids: &[String]) -> StorageResult<Vec<PimItem>> {
        let state = self.state.lock().unwrap();
        ids.iter()
            .map(|id| {
                state
                    .items
                    .get(id)
                    .cloned()
                    .ok_or_else(|| StorageError::Fail(format!("no item {id}")))
            })
            .collect()
    }

    async fn add_items(&mut self, items: &[PimItem]) -> StorageResult<Vec<(String, String)>> {
        let mut state = self.state.lock().unwrap();
        let prefix = self.prefix.clone();
        Ok(items.iter().map(|item| state.assign(&prefix, item)).collect())
    }

    async fn modify_items(
        &mut self,
        ids: &[String],
        items: &[PimItem],
    ) -> StorageResult<Vec<String>> {
        let mut state = self.state.lock().unwrap();
        let mut out = Vec::with_capacity(ids.len());
        for (id, item) in ids.iter().zip(items) {
            if !state.items.contains_key(id) {
                return Err(StorageError::Fail(format!("no item {id} to modify")));
            }
            out.push(state.mutate(id, item.clone()));
        }
        Ok(out)
    }

    async fn remove_items(&mut self, ids: &[String]) -> StorageResult<()> {
        let mut state = self.state.lock().unwrap();
        for id in ids {
            if state.items.remove(id).is_none() {
                return Err(StorageError::Fail(format!("no item {id} to remove")));
            }
        }
        Ok(())
    }

    async fn get_revisions(&mut self) -> StorageResult<HashMap<String, String>> {
        Ok(self.state.lock().unwrap().revisions())
    }

    async fn get_changed_revisions(
        &mut self,
        sync_token: &str,
    ) -> StorageResult<(HashMap<String, String>, Vec<String>)> {
        let state = self.state.lock().unwrap();
        if !state.supports_incremental {
            return Err(StorageError::NotSupported);
        }
        let Some(snapshot) = state.snapshots.get(sync_token) else {
            return Err(StorageError::NotSupported);
        };
        let current = state.revisions();
        let changed: HashMap<String, String> = current
            .iter()
            .filter(|(id, rev)| snapshot.get(*id) != Some(rev))
            .map(|(id, rev)| (id.clone(), rev.clone()))
            .collect();
        let removed: Vec<String> = snapshot
            .keys()
            .filter(|id| !current.contains_key(*id))
            .cloned()
            .collect();
        Ok((changed, removed))
    }

    async fn get_latest_sync_token(&mut self) -> StorageResult<String> {
        let mut state = self.state.lock().unwrap();
        state.next_token += 1;
        let token = format!("token-{}", state.next_token);
        let snapshot = state.revisions();
        state.snapshots.insert(token.clone(), snapshot);
        Ok(token)
    }

    async fn item_stream(&mut self) -> StorageResult<ItemStream> {
        let state = self.state.lock().unwrap();
        let mut ids: Vec<&String> = state.items.keys().collect();
        ids.sort();
        let items: Vec<PimItem> = ids
            .into_iter()
            .map(|id| state.items[id].clone())
            .collect();
        let stream = ItemStream::from_items(items);
        drop(state);
        self.stream = Some(stream.clone());
        Ok(stream)
    }

    fn total_count(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }

    fn suspend(&self) -> StorageResult<()> {
        match &self.stream {
            Some(stream) if !stream.is_finished() => {
                stream.suspend();
                Ok(())
            }
            _ => Err(StorageError::NotInProgress),
        }
    }

    fn resume(&self) -> StorageResult<()> {
        match &self.stream {
            Some(stream) if !stream.is_finished() => {
                stream.resume();
                Ok(())
            }
            _ => Err(StorageError::NotInProgress),
        }
    }

    fn cancel(&self) -> StorageResult<()> {
        match &self.stream {
            Some(stream) => {
                stream.cancel();
                Ok(())
            }
            None => Err(StorageError::NotInProgress),
        }
    }
}

/// Registry wiring two shared memory states under the plugin names the
/// option helpers use.
pub fn memory_registry(
    remote: Arc<Mutex<MemState>>,
    local: Arc<Mutex<MemState>>,
) -> StorageRegistry {
    let registry = StorageRegistry::new();
    registry.register("memory-remote", move |_params| {
        Ok(Box::new(MemoryStorage::new(ItemKind::Contact, "r", remote.clone())) as Box<dyn Storage>)
    });
    registry.register("memory-local", move |_params| {
        Ok(Box::new(MemoryStorage::new(ItemKind::Contact, "l", local.clone())) as Box<dyn Storage>)
    });
    registry
}

/// Callback that records events and forwards the final result over a
/// channel the test can await.
pub struct TestCallback {
    tx: tokio::sync::mpsc::UnboundedSender<SyncResult>,
    pub events: Mutex<Vec<String>>,
    pub metadata: Mutex<String>,
}

impl TestCallback {
    pub fn new() -> (Arc<Self>, tokio::sync::mpsc::UnboundedReceiver<SyncResult>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (
            Arc::new(Self {
                tx,
                events: Mutex::new(Vec::new()),
                metadata: Mutex::new(String::new()),
            }),
            rx,
        )
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn metadata_json(&self) -> String {
        self.metadata.lock().unwrap().clone()
    }
}

impl SyncCallback for TestCallback {
    fn sync_finished(&self, result: SyncResult) {
        self.events
            .lock()
            .unwrap()
            .push(format!("finished:{result:?}"));
        self.tx.send(result).ok();
    }

    fn sync_phase_started(&self, name: &str) {
        self.events
            .lock()
            .unwrap()
            .push(format!("phase_started:{name}"));
    }

    fn sync_phase_finished(&self, name: &str) {
        self.events
            .lock()
            .unwrap()
            .push(format!("phase_finished:{name}"));
    }

    fn metadata_updated(&self, json: &str) {
        *self.metadata.lock().unwrap() = json.to_string();
        self.events.lock().unwrap().push("metadata_updated".to_string());
    }
}

/// Engine options pointing at the memory plugins.
pub fn memory_options(callback: Arc<TestCallback>, metadata: String) -> SyncOptions {
    SyncOptions {
        remote_plugin: "memory-remote".to_string(),
        local_plugin: "memory-local".to_string(),
        callback: Some(callback),
        metadata,
        ..SyncOptions::default()
    }
}
