use pim_dav_sync::sync::{ItemState, SyncMetadata};

fn sample() -> SyncMetadata {
    let mut metadata = SyncMetadata::new();
    metadata.set_local_sync_token("lt-1");
    metadata.set_remote_sync_token("rt-1");
    metadata.add_item("r1", "rrev1", "l1", "lrev1");
    metadata.add_item("r2", "rrev2", "l2", "lrev2");
    metadata
}

#[test]
fn json_round_trip_preserves_everything() {
    let metadata = sample();
    let json = metadata.to_json();
    let parsed = SyncMetadata::from_json(&json).expect("json parses");
    assert_eq!(metadata, parsed);
}

#[test]
fn serialized_form_uses_the_stable_field_names() {
    let json = sample().to_json();
    for key in [
        "LocalSyncToken",
        "RemoteSyncToken",
        "LocalRevisions",
        "RemoteRevisions",
        "RemoteToLocalMapping",
    ] {
        assert!(json.contains(key), "missing {key} in {json}");
    }
}

#[test]
fn unknown_keys_are_ignored_and_missing_keys_default() {
    let parsed = SyncMetadata::from_json(
        r#"{"LocalSyncToken":"x","FutureExtension":{"a":1}}"#,
    )
    .expect("json parses");
    assert_eq!(parsed.local_sync_token(), "x");
    assert_eq!(parsed.remote_sync_token(), "");
    assert!(parsed.is_empty());
}

#[test]
fn garbage_input_is_rejected() {
    assert!(SyncMetadata::from_json("not json").is_err());
}

#[test]
fn removal_is_atomic_across_all_three_maps() {
    let mut metadata = sample();
    metadata.remove_item("r1", "l1");
    assert!(!metadata.has_remote_id("r1"));
    assert!(!metadata.has_local_id("l1"));
    assert!(metadata.local_id_for("r1").is_none());
    assert!(metadata.has_remote_id("r2"));
}

#[test]
fn revision_lookups_and_updates() {
    let mut metadata = sample();
    assert_eq!(metadata.remote_revision("r1"), Some("rrev1"));
    assert_eq!(metadata.local_revision("l1"), Some("lrev1"));
    metadata.update_remote_revision("r1", "rrev1b");
    metadata.update_local_revision("l1", "lrev1b");
    assert_eq!(metadata.remote_revision("r1"), Some("rrev1b"));
    assert_eq!(metadata.local_revision("l1"), Some("lrev1b"));
}

#[test]
fn state_matrix_queries_pair_both_sides() {
    let mut metadata = sample();
    metadata.reset_remote_state(ItemState::NotChanged);
    metadata.reset_local_state(ItemState::NotChanged);
    metadata.set_remote_state("r1", ItemState::Modified);
    metadata.set_local_state("l2", ItemState::NotPresent);

    assert_eq!(
        metadata.items_with_state(ItemState::Modified, ItemState::NotChanged),
        vec![("r1".to_string(), "l1".to_string())]
    );
    assert_eq!(
        metadata.items_with_state(ItemState::NotChanged, ItemState::NotPresent),
        vec![("r2".to_string(), "l2".to_string())]
    );
    assert!(
        metadata
            .items_with_state(ItemState::Modified, ItemState::Modified)
            .is_empty()
    );
}

#[test]
fn states_for_unknown_ids_are_ignored() {
    let mut metadata = sample();
    metadata.reset_remote_state(ItemState::NotChanged);
    metadata.reset_local_state(ItemState::NotChanged);
    metadata.set_remote_state("stranger", ItemState::Modified);
    assert!(
        metadata
            .items_with_state(ItemState::Modified, ItemState::NotChanged)
            .is_empty()
    );
}
