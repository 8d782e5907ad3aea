use std::sync::Arc;

use pim_dav_sync::item::{CheckRegistry, ItemKind};
use pim_dav_sync::storage::StorageError;
use pim_dav_sync::sync::{OneWaySync, SyncPhase, SyncResult};
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

fn seeded_states(count: usize) -> (Arc<std::sync::Mutex<MemState>>, Arc<std::sync::Mutex<MemState>>) {
    let remote = MemState::new_shared(false);
    let local = MemState::new_shared(false);
    let items = (0..count)
        .map(|i| contact(&format!("Family{i}"), &format!("Given{i}"), &format!("{i:03}")))
        .collect();
    remote.lock().unwrap().seed("r", items);
    (remote, local)
}

#[tokio::test]
async fn first_run_mirrors_everything_then_converges() {
    let (remote, local) = seeded_states(10);
    let registry = memory_registry(Arc::clone(&remote), Arc::clone(&local));
    let (callback, mut rx) = TestCallback::new();
    let checks = Arc::new(CheckRegistry::defaults_for(ItemKind::Contact));

    let engine = OneWaySync::new(
        memory_options(Arc::clone(&callback), String::new()),
        vec![SyncPhase::new("TestPhase", vec![])],
        registry,
        checks,
    );

    engine.synchronize();
    assert_eq!(await_result(&mut rx).await, SyncResult::OkWithChange);

    let stats = engine.stats();
    assert_eq!(stats.locally_added, 10);
    assert_eq!(stats.locally_modified, 0);
    assert_eq!(stats.locally_removed, 0);
    assert_eq!(stats.remotely_added, 0);
    assert_eq!(local.lock().unwrap().items.len(), 10);

    let events = callback.events();
    assert_eq!(
        events.iter().filter(|e| *e == "phase_started:TestPhase").count(),
        1
    );
    assert_eq!(
        events.iter().filter(|e| *e == "phase_finished:TestPhase").count(),
        1
    );

    // a second run over identical content is a no-op
    engine.synchronize();
    assert_eq!(await_result(&mut rx).await, SyncResult::OkNoChange);
    let stats = engine.stats();
    assert_eq!(
        (stats.locally_added, stats.locally_modified, stats.locally_removed),
        (0, 0, 0)
    );
}

#[tokio::test]
async fn changed_phone_number_counts_as_one_modification() {
    let (remote, local) = seeded_states(10);
    let registry = memory_registry(Arc::clone(&remote), Arc::clone(&local));
    let (callback, mut rx) = TestCallback::new();
    let checks = Arc::new(CheckRegistry::defaults_for(ItemKind::Contact));

    let engine = OneWaySync::new(
        memory_options(callback, String::new()),
        vec![SyncPhase::new("TestPhase", vec![])],
        registry,
        checks,
    );

    engine.synchronize();
    assert_eq!(await_result(&mut rx).await, SyncResult::OkWithChange);

    // same person, new phone number
    remote
        .lock()
        .unwrap()
        .mutate("r-3", contact("Family2", "Given2", "999"));

    engine.synchronize();
    assert_eq!(await_result(&mut rx).await, SyncResult::OkWithChange);
    let stats = engine.stats();
    assert_eq!(
        (stats.locally_added, stats.locally_modified, stats.locally_removed),
        (0, 1, 0)
    );
}

#[tokio::test]
async fn removing_the_tel_check_hides_phone_changes() {
    let (remote, local) = seeded_states(10);
    let registry = memory_registry(Arc::clone(&remote), Arc::clone(&local));
    let (callback, mut rx) = TestCallback::new();
    let checks = Arc::new(CheckRegistry::defaults_for(ItemKind::Contact));
    checks.remove("tel");

    let engine = OneWaySync::new(
        memory_options(callback, String::new()),
        vec![SyncPhase::new("TestPhase", vec![])],
        registry,
        checks,
    );

    engine.synchronize();
    assert_eq!(await_result(&mut rx).await, SyncResult::OkWithChange);

    remote
        .lock()
        .unwrap()
        .mutate("r-3", contact("Family2", "Given2", "999"));

    engine.synchronize();
    assert_eq!(await_result(&mut rx).await, SyncResult::OkNoChange);
    let stats = engine.stats();
    assert_eq!(
        (stats.locally_added, stats.locally_modified, stats.locally_removed),
        (0, 0, 0)
    );
}

#[tokio::test]
async fn items_gone_from_the_source_are_swept() {
    let (remote, local) = seeded_states(3);
    let registry = memory_registry(Arc::clone(&remote), Arc::clone(&local));
    let (callback, mut rx) = TestCallback::new();
    let checks = Arc::new(CheckRegistry::defaults_for(ItemKind::Contact));

    let engine = OneWaySync::new(
        memory_options(callback, String::new()),
        vec![SyncPhase::new("TestPhase", vec![])],
        registry,
        checks,
    );

    engine.synchronize();
    assert_eq!(await_result(&mut rx).await, SyncResult::OkWithChange);

    remote.lock().unwrap().items.remove("r-1");

    engine.synchronize();
    assert_eq!(await_result(&mut rx).await, SyncResult::OkWithChange);
    let stats = engine.stats();
    assert_eq!(
        (stats.locally_added, stats.locally_modified, stats.locally_removed),
        (0, 0, 1)
    );
    assert_eq!(local.lock().unwrap().items.len(), 2);
}

#[tokio::test]
async fn phase_scoped_ignored_fields_suppress_differences() {
    let (remote, local) = seeded_states(5);
    // local already holds the same people with different numbers
    {
        let local_items: Vec<_> = (0..5)
            .map(|i| contact(&format!("Family{i}"), &format!("Given{i}"), "000"))
            .collect();
        local.lock().unwrap().seed("l", local_items);
    }
    let registry = memory_registry(Arc::clone(&remote), Arc::clone(&local));
    let (callback, mut rx) = TestCallback::new();
    let checks = Arc::new(CheckRegistry::defaults_for(ItemKind::Contact));

    let engine = OneWaySync::new(
        memory_options(callback, String::new()),
        vec![SyncPhase::new("NoPhones", vec!["tel".to_string()])],
        registry,
        Arc::clone(&checks),
    );

    engine.synchronize();
    assert_eq!(await_result(&mut rx).await, SyncResult::OkNoChange);

    // the run re-enables every check on the way out
    assert!(!checks.any_disabled());
}

#[tokio::test]
async fn second_synchronize_while_running_is_rejected() {
    let (remote, local) = seeded_states(1);
    remote.lock().unwrap().init_delay_ms = 200;
    let registry = memory_registry(Arc::clone(&remote), Arc::clone(&local));
    let (callback, mut rx) = TestCallback::new();
    let checks = Arc::new(CheckRegistry::defaults_for(ItemKind::Contact));

    let engine = OneWaySync::new(
        memory_options(callback, String::new()),
        vec![SyncPhase::new("TestPhase", vec![])],
        registry,
        checks,
    );

    engine.synchronize();
    engine.synchronize();
    assert_eq!(await_result(&mut rx).await, SyncResult::AlreadyInProgress);
    assert_eq!(await_result(&mut rx).await, SyncResult::OkWithChange);
}

#[tokio::test]
async fn control_calls_without_a_run_report_not_in_progress() {
    let (remote, local) = seeded_states(0);
    let registry = memory_registry(remote, local);
    let (callback, _rx) = TestCallback::new();
    let checks = Arc::new(CheckRegistry::defaults_for(ItemKind::Contact));

    let engine = OneWaySync::new(
        memory_options(callback, String::new()),
        vec![SyncPhase::new("TestPhase", vec![])],
        registry,
        checks,
    );

    assert!(matches!(engine.cancel(), Err(StorageError::NotInProgress)));
    assert!(matches!(engine.suspend(), Err(StorageError::NotInProgress)));
    assert!(matches!(engine.resume(), Err(StorageError::NotInProgress)));
}
