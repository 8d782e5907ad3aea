use std::sync::Arc;

use pim_dav_sync::item::{CheckRegistry, ItemKind};
use pim_dav_sync::sync::{SyncMetadata, SyncResult, TwoWaySync};
use tokio::time::{Duration, timeout};

use crate::support::{MemState, TestCallback, contact, memory_options, memory_registry};

async fn await_result(
    rx: &mut tokio::sync::mpsc::UnboundedReceiver<SyncResult>,
) -> SyncResult {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("engine finishes in time")
        .expect("callback delivered a result")
}

fn engine_for(
    remote: &Arc<std::sync::Mutex<MemState>>,
    local: &Arc<std::sync::Mutex<MemState>>,
    metadata: String,
) -> (TwoWaySync, Arc<TestCallback>, tokio::sync::mpsc::UnboundedReceiver<SyncResult>) {
    let registry = memory_registry(Arc::clone(remote), Arc::clone(local));
    let (callback, rx) = TestCallback::new();
    let checks = Arc::new(CheckRegistry::defaults_for(ItemKind::Contact));
    let engine = TwoWaySync::new(
        memory_options(Arc::clone(&callback), metadata),
        registry,
        checks,
    );
    (engine, callback, rx)
}

#[tokio::test]
async fn initial_sync_of_empty_stores_yields_fresh_tokens() {
    let remote = MemState::new_shared(true);
    let local = MemState::new_shared(true);
    let (engine, callback, mut rx) = engine_for(&remote, &local, String::new());

    engine.synchronize();
    assert_eq!(await_result(&mut rx).await, SyncResult::OkNoChange);

    let metadata = SyncMetadata::from_json(&callback.metadata_json()).expect("metadata emitted");
    assert!(metadata.is_empty());
    assert!(!metadata.local_sync_token().is_empty());
    assert!(!metadata.remote_sync_token().is_empty());
}

#[tokio::test]
async fn initial_sync_copies_both_directions_and_pairs_matches() {
    let remote = MemState::new_shared(true);
    let local = MemState::new_shared(true);
    remote.lock().unwrap().seed(
        "r",
        vec![contact("Shared", "Person", "111"), contact("Remote", "Only", "222")],
    );
    local.lock().unwrap().seed(
        "l",
        vec![contact("Shared", "Person", "111"), contact("Local", "Only", "333")],
    );

    let (engine, callback, mut rx) = engine_for(&remote, &local, String::new());
    engine.synchronize();
    assert_eq!(await_result(&mut rx).await, SyncResult::OkWithChange);

    let stats = engine.stats();
    assert_eq!(stats.locally_added, 1);
    assert_eq!(stats.remotely_added, 1);

    assert_eq!(remote.lock().unwrap().items.len(), 2);
    assert_eq!(local.lock().unwrap().items.len(), 2);

    let metadata = SyncMetadata::from_json(&callback.metadata_json()).expect("metadata emitted");
    assert_eq!(metadata.pairings().count(), 3);
    // the pre-existing identical pair was bound without a body transfer
    assert_eq!(metadata.local_id_for("r-1"), Some("l-1"));
}

#[tokio::test]
async fn metadata_revisions_track_storage_revisions_after_a_run() {
    let remote = MemState::new_shared(true);
    let local = MemState::new_shared(true);
    remote
        .lock()
        .unwrap()
        .seed("r", vec![contact("Doe", "John", "111")]);

    let (engine, callback, mut rx) = engine_for(&remote, &local, String::new());
    engine.synchronize();
    assert_eq!(await_result(&mut rx).await, SyncResult::OkWithChange);

    let metadata = SyncMetadata::from_json(&callback.metadata_json()).expect("metadata emitted");
    for (remote_id, local_id) in metadata.pairings() {
        let remote_state = remote.lock().unwrap();
        let local_state = local.lock().unwrap();
        assert_eq!(
            metadata.remote_revision(remote_id),
            remote_state.items[remote_id].revision().into()
        );
        assert_eq!(
            metadata.local_revision(local_id),
            local_state.items[local_id].revision().into()
        );
    }
}

#[tokio::test]
async fn local_deletion_propagates_to_the_remote() {
    let remote = MemState::new_shared(true);
    let local = MemState::new_shared(true);
    remote
        .lock()
        .unwrap()
        .seed("r", vec![contact("Doe", "John", "111")]);

    let (engine, callback, mut rx) = engine_for(&remote, &local, String::new());
    engine.synchronize();
    assert_eq!(await_result(&mut rx).await, SyncResult::OkWithChange);
    let seeded = callback.metadata_json();

    // the user deletes the contact on the local device
    local.lock().unwrap().items.clear();

    let (engine, callback, mut rx) = engine_for(&remote, &local, seeded);
    engine.synchronize();
    assert_eq!(await_result(&mut rx).await, SyncResult::OkWithChange);

    let stats = engine.stats();
    assert_eq!(stats.remotely_removed, 1);
    assert!(remote.lock().unwrap().items.is_empty());

    let metadata = SyncMetadata::from_json(&callback.metadata_json()).expect("metadata emitted");
    assert!(metadata.is_empty());
}

#[tokio::test]
async fn remote_modification_updates_the_local_copy() {
    let remote = MemState::new_shared(true);
    let local = MemState::new_shared(true);
    remote
        .lock()
        .unwrap()
        .seed("r", vec![contact("Doe", "John", "111")]);

    let (engine, callback, mut rx) = engine_for(&remote, &local, String::new());
    engine.synchronize();
    assert_eq!(await_result(&mut rx).await, SyncResult::OkWithChange);
    let seeded = callback.metadata_json();

    remote
        .lock()
        .unwrap()
        .mutate("r-1", contact("Doe", "John", "999"));

    let (engine, callback, mut rx) = engine_for(&remote, &local, seeded);
    engine.synchronize();
    assert_eq!(await_result(&mut rx).await, SyncResult::OkWithChange);

    let stats = engine.stats();
    assert_eq!(stats.locally_modified, 1);
    assert_eq!(stats.remotely_modified, 0);

    let local_state = local.lock().unwrap();
    let local_item = local_state.items.values().next().expect("local item");
    assert!(local_item.raw().contains("999"));

    let metadata = SyncMetadata::from_json(&callback.metadata_json()).expect("metadata emitted");
    assert_eq!(
        metadata.local_revision(local_item.id()),
        Some(local_item.revision())
    );
}

#[tokio::test]
async fn concurrent_modification_duplicates_both_versions() {
    let remote = MemState::new_shared(true);
    let local = MemState::new_shared(true);
    remote
        .lock()
        .unwrap()
        .seed("r", vec![contact("Doe", "John", "111")]);

    let (engine, callback, mut rx) = engine_for(&remote, &local, String::new());
    engine.synchronize();
    assert_eq!(await_result(&mut rx).await, SyncResult::OkWithChange);
    let seeded = callback.metadata_json();

    remote
        .lock()
        .unwrap()
        .mutate("r-1", contact("Doe", "John", "222"));
    local
        .lock()
        .unwrap()
        .mutate("l-1", contact("Doe", "John", "333"));

    let (engine, callback, mut rx) = engine_for(&remote, &local, seeded);
    engine.synchronize();
    assert_eq!(await_result(&mut rx).await, SyncResult::OkWithChange);

    let stats = engine.stats();
    assert_eq!(stats.locally_added, 1);
    assert_eq!(stats.remotely_added, 1);

    // both stores now hold both versions
    assert_eq!(remote.lock().unwrap().items.len(), 2);
    assert_eq!(local.lock().unwrap().items.len(), 2);

    // the copy pushed to the remote carries the conflict marker in its UID
    let remote_state = remote.lock().unwrap();
    assert!(
        remote_state
            .items
            .values()
            .any(|item| item.raw().contains("(conflicted)"))
    );
    drop(remote_state);

    // the old pairing is gone, two fresh pairings exist
    let metadata = SyncMetadata::from_json(&callback.metadata_json()).expect("metadata emitted");
    assert_eq!(metadata.pairings().count(), 2);
    let new_local = metadata.local_id_for("r-1").expect("r-1 still paired");
    assert_ne!(new_local, "l-1");
    assert!(
        metadata
            .pairings()
            .any(|(remote_id, local_id)| remote_id != "r-1" && local_id == "l-1")
    );
}

#[tokio::test]
async fn additions_on_both_sides_cross_check_by_content() {
    let remote = MemState::new_shared(true);
    let local = MemState::new_shared(true);

    let (engine, callback, mut rx) = engine_for(&remote, &local, String::new());
    engine.synchronize();
    assert_eq!(await_result(&mut rx).await, SyncResult::OkNoChange);
    let seeded = callback.metadata_json();

    // the same person appears on both sides between runs
    remote
        .lock()
        .unwrap()
        .seed("r", vec![contact("Doe", "John", "111")]);
    local
        .lock()
        .unwrap()
        .seed("l", vec![contact("Doe", "John", "111")]);

    let (engine, callback, mut rx) = engine_for(&remote, &local, seeded);
    engine.synchronize();
    assert_eq!(await_result(&mut rx).await, SyncResult::OkNoChange);

    // bound by content, no copies created
    assert_eq!(remote.lock().unwrap().items.len(), 1);
    assert_eq!(local.lock().unwrap().items.len(), 1);
    let metadata = SyncMetadata::from_json(&callback.metadata_json()).expect("metadata emitted");
    assert_eq!(metadata.pairings().count(), 1);
}

#[tokio::test]
async fn stores_without_change_tracking_fall_back_to_full_listings() {
    let remote = MemState::new_shared(false);
    let local = MemState::new_shared(false);
    remote
        .lock()
        .unwrap()
        .seed("r", vec![contact("Doe", "John", "111")]);

    let (engine, callback, mut rx) = engine_for(&remote, &local, String::new());
    engine.synchronize();
    assert_eq!(await_result(&mut rx).await, SyncResult::OkWithChange);
    let seeded = callback.metadata_json();

    remote
        .lock()
        .unwrap()
        .mutate("r-1", contact("Doe", "John", "999"));

    let (engine, _callback, mut rx) = engine_for(&remote, &local, seeded);
    engine.synchronize();
    assert_eq!(await_result(&mut rx).await, SyncResult::OkWithChange);
    assert_eq!(engine.stats().locally_modified, 1);
}
