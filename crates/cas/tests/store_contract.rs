//! Object-store invariants checked against both backends.

use jobcache_cas::{
    CasId, InMemoryObjectStore, ObjectStore, OnDiskObjectStore, TrieConfig,
};
use std::sync::Arc;
use tempfile::TempDir;

fn backends() -> Vec<(Arc<dyn ObjectStore>, Option<TempDir>)> {
    let dir = TempDir::new().unwrap();
    let disk = OnDiskObjectStore::create(
        dir.path(),
        &TrieConfig {
            min_file_size: 4096,
            max_file_size: 64 * 1024 * 1024,
        },
    )
    .unwrap();
    vec![
        (Arc::new(InMemoryObjectStore::new()) as Arc<dyn ObjectStore>, None),
        (Arc::new(disk) as Arc<dyn ObjectStore>, Some(dir)),
    ]
}

#[test]
fn test_round_trip_and_idempotence() {
    for (store, _dir) in backends() {
        let leaf = store.store(&[], b"leaf").unwrap();
        let node = store.store(&[leaf], b"node").unwrap();

        // store ∘ store = store
        assert_eq!(store.store(&[], b"leaf").unwrap(), leaf);
        assert_eq!(store.store(&[leaf], b"node").unwrap(), node);

        // load(store(refs, data)) = (refs, data)
        let handle = store.load(node).unwrap();
        assert_eq!(handle.data(), b"node");
        assert_eq!(handle.num_refs(), 1);
        assert_eq!(handle.ref_at(0), Some(leaf));
    }
}

#[test]
fn test_store_then_get_reference_sees_the_object() {
    for (store, _dir) in backends() {
        let reference = store.store(&[], b"visible").unwrap();
        let id = store.get_id(reference).unwrap();
        assert_eq!(store.get_reference(&id).unwrap(), Some(reference));
        store.validate(&id).unwrap();
    }
}

#[test]
fn test_id_text_round_trip() {
    for (store, _dir) in backends() {
        let reference = store.store(&[], b"textual").unwrap();
        let id = store.get_id(reference).unwrap();
        let printed = store.print_id(&id);
        assert_eq!(store.parse_id(&printed).unwrap(), id);
        assert_eq!(printed, printed.to_ascii_lowercase());
    }
}

#[test]
fn test_backends_agree_on_identity() {
    let mut ids: Vec<CasId> = Vec::new();
    for (store, _dir) in backends() {
        let leaf = store.store(&[], b"agreed leaf").unwrap();
        let node = store.store(&[leaf, leaf], b"agreed node").unwrap();
        ids.push(store.get_id(node).unwrap());
    }
    assert!(ids.windows(2).all(|w| w[0] == w[1]));
}

#[test]
fn test_for_each_ref_visits_in_order() {
    for (store, _dir) in backends() {
        let a = store.store(&[], b"a").unwrap();
        let b = store.store(&[], b"b").unwrap();
        let node = store.store(&[a, b, a], b"").unwrap();

        let mut seen = Vec::new();
        store
            .load(node)
            .unwrap()
            .for_each_ref(|r| {
                seen.push(r);
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, vec![a, b, a]);
    }
}
