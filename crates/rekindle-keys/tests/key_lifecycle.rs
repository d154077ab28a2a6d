//! End-to-end tests for the key lifecycle against a real `SQLite` file.
//!
//! Stores live in temp directories.

use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;

use chrono::Duration;
use rekindle_keys::entities::{NewPreKey, NewSignedPreKey};
use rekindle_keys::{
    KeyBundleAssembler, KeyError, KeyPolicy, KeyRotationManager, KeyService, KeyStore,
    MemoryKeyStore, PreKeyDto, SchedulerConfig, SignedPreKeyDto, SqliteKeyStore,
};

const SIG: &str = "c2lnbmF0dXJlLW92ZXItdGhlLXNpZ25lZC1wcmVrZXk=";

/// Fresh file-backed store. The `TempDir` must outlive the store.
fn sqlite_store() -> (tempfile::TempDir, Arc<SqliteKeyStore>) {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("keys.db");
    let store = SqliteKeyStore::open(path.to_str().unwrap()).expect("open key db");
    (dir, Arc::new(store))
}

fn register_device(store: &dyn KeyStore, user: &str, device: &str, prekeys: &[(u32, &str)]) {
    store.upsert_identity_key(user, device, "ID1").unwrap();
    let spk = NewSignedPreKey {
        key_id: 1,
        public_key: "SPK1".into(),
        signature: "SIG1".into(),
    };
    store
        .create_signed_prekey(user, device, &spk, Duration::days(7))
        .unwrap();
    let keys: Vec<NewPreKey> = prekeys
        .iter()
        .map(|(key_id, public_key)| NewPreKey {
            key_id: *key_id,
            public_key: (*public_key).to_string(),
        })
        .collect();
    if !keys.is_empty() {
        store.create_prekeys(user, device, &keys, 200).unwrap();
    }
}

fn base64_key(seed: u32) -> String {
    format!("{seed:A>44}")
}

// ── Bundle assembly ──────────────────────────────────────────────────

#[test]
fn bundle_assembly_end_to_end() {
    let (_dir, store) = sqlite_store();
    register_device(store.as_ref(), "U", "D", &[(1, "PK1"), (2, "PK2")]);
    let assembler = KeyBundleAssembler::new(store.clone(), KeyPolicy::default());

    let first = assembler.get_bundle("U", "D").unwrap();
    assert_eq!(first.identity_key, "ID1");
    assert_eq!(first.signed_pre_key.key_id, 1);
    assert_eq!(first.signed_pre_key.public_key, "SPK1");
    assert_eq!(first.signed_pre_key.signature, "SIG1");
    let first_pk = first.pre_key.expect("first bundle carries a prekey");

    let second = assembler.get_bundle("U", "D").unwrap();
    let second_pk = second.pre_key.expect("second bundle carries a prekey");

    let mut handed_out = vec![
        (first_pk.key_id, first_pk.public_key),
        (second_pk.key_id, second_pk.public_key),
    ];
    handed_out.sort();
    assert_eq!(
        handed_out,
        vec![(1, "PK1".to_string()), (2, "PK2".to_string())]
    );

    let third = assembler.get_bundle("U", "D").unwrap();
    assert!(third.pre_key.is_none());
    assert_eq!(third.identity_key, "ID1");
}

// ── At-most-once consumption ─────────────────────────────────────────

fn race_for_last_prekey(store: Arc<dyn KeyStore>) {
    const CALLERS: usize = 16;

    register_device(store.as_ref(), "U", "D", &[(7, "PK7")]);
    let assembler = Arc::new(KeyBundleAssembler::new(store, KeyPolicy::default()));
    let barrier = Arc::new(Barrier::new(CALLERS));

    let handles: Vec<_> = (0..CALLERS)
        .map(|_| {
            let assembler = Arc::clone(&assembler);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                assembler.get_bundle("U", "D")
            })
        })
        .collect();

    let bundles: Vec<_> = handles
        .into_iter()
        .map(|h| h.join().unwrap().expect("bundle request must not fail"))
        .collect();

    let winners: Vec<_> = bundles.iter().filter_map(|b| b.pre_key.as_ref()).collect();
    assert_eq!(winners.len(), 1, "exactly one caller gets the last prekey");
    assert_eq!(winners[0].key_id, 7);
}

#[test]
fn concurrent_claims_hand_out_last_prekey_once_sqlite() {
    let (_dir, store) = sqlite_store();
    race_for_last_prekey(store);
}

#[test]
fn concurrent_claims_hand_out_last_prekey_once_memory() {
    race_for_last_prekey(Arc::new(MemoryKeyStore::new()));
}

#[test]
fn concurrent_claims_drain_pool_without_duplicates() {
    const CALLERS: usize = 8;
    const PER_CALLER: usize = 10;

    let (_dir, store) = sqlite_store();
    let keys: Vec<(u32, String)> = (0..50).map(|i| (i, format!("PK{i}"))).collect();
    let refs: Vec<(u32, &str)> = keys.iter().map(|(i, k)| (*i, k.as_str())).collect();
    register_device(store.as_ref(), "U", "D", &refs);

    let barrier = Arc::new(Barrier::new(CALLERS));
    let handles: Vec<_> = (0..CALLERS)
        .map(|_| {
            let store = Arc::clone(&store);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                (0..PER_CALLER)
                    .filter_map(|_| store.claim_unused_prekey("U", "D").unwrap())
                    .map(|k| k.key_id)
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let claimed: Vec<u32> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    let unique: HashSet<u32> = claimed.iter().copied().collect();

    assert_eq!(claimed.len(), 50, "80 attempts against 50 keys claim all 50");
    assert_eq!(unique.len(), claimed.len(), "no prekey claimed twice");
    assert_eq!(store.count_unused("U", "D").unwrap(), 0);
}

// ── Uniqueness under racing rotations ────────────────────────────────

#[test]
fn racing_rotations_with_same_key_id_store_one_row() {
    const CALLERS: usize = 8;

    let (dir, store) = sqlite_store();
    let manager = Arc::new(KeyRotationManager::new(store.clone(), KeyPolicy::default()));
    let barrier = Arc::new(Barrier::new(CALLERS));

    let handles: Vec<_> = (0..CALLERS)
        .map(|_| {
            let manager = Arc::clone(&manager);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                manager.rotate_signed_prekey(
                    "U",
                    "D",
                    &SignedPreKeyDto {
                        key_id: 42,
                        public_key: base64_key(42),
                        signature: SIG.into(),
                    },
                )
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let ok = results.iter().filter(|r| r.is_ok()).count();
    let conflicts = results
        .iter()
        .filter(|r| matches!(r, Err(KeyError::Conflict(_))))
        .count();
    assert_eq!(ok, 1);
    assert_eq!(conflicts, CALLERS - 1);
    assert_eq!(store.find_expired_signed_prekeys().unwrap().len(), 0);

    let conn = rusqlite::Connection::open(dir.path().join("keys.db")).unwrap();
    let rows: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM signed_prekeys
             WHERE user_id = 'U' AND device_id = 'D' AND key_id = 42",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(rows, 1, "racing rotations stored exactly one row");
}

// ── Service-level properties ─────────────────────────────────────────

fn service_over(store: Arc<dyn KeyStore>) -> KeyService {
    KeyService::new(store, KeyPolicy::default(), SchedulerConfig::default())
}

fn prekey_batch(ids: std::ops::Range<i64>) -> Vec<PreKeyDto> {
    ids.map(|key_id| PreKeyDto {
        key_id,
        public_key: base64_key(u32::try_from(key_id).unwrap()),
    })
    .collect()
}

#[test]
fn capacity_bound_through_service() {
    let (_dir, store) = sqlite_store();
    let service = service_over(store.clone());

    let stored = service
        .upload_prekeys("U", "D", &prekey_batch(0..150))
        .unwrap();
    assert_eq!(stored, 150);

    let err = service
        .upload_prekeys("U", "D", &prekey_batch(150..210))
        .unwrap_err();
    assert_eq!(err.code(), "capacity_exceeded");
    assert_eq!(store.count_unused("U", "D").unwrap(), 150);

    service
        .upload_prekeys("U", "D", &prekey_batch(150..200))
        .unwrap();
    assert_eq!(store.count_unused("U", "D").unwrap(), 200);
}

/// Two uploads of 150 race against a cap of 200. Only one may land.
fn race_two_replenishments(store: &Arc<dyn KeyStore>) {
    let service = Arc::new(service_over(Arc::clone(store)));
    let barrier = Arc::new(Barrier::new(2));

    let handles: Vec<_> = [0..150, 1000..1150]
        .into_iter()
        .map(|ids| {
            let service = Arc::clone(&service);
            let barrier = Arc::clone(&barrier);
            let batch = prekey_batch(ids);
            thread::spawn(move || {
                barrier.wait();
                service.upload_prekeys("U", "D", &batch)
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let ok = results.iter().filter(|r| r.is_ok()).count();
    let rejected = results
        .iter()
        .filter(|r| matches!(r, Err(KeyError::Capacity { max: 200, .. })))
        .count();
    assert_eq!((ok, rejected), (1, 1), "{results:?}");
    assert_eq!(store.count_unused("U", "D").unwrap(), 150);
}

#[test]
fn concurrent_replenishment_respects_cap_sqlite() {
    for _ in 0..10 {
        let (_dir, store) = sqlite_store();
        let store: Arc<dyn KeyStore> = store;
        race_two_replenishments(&store);
    }
}

#[test]
fn concurrent_replenishment_respects_cap_memory() {
    for _ in 0..10 {
        let store: Arc<dyn KeyStore> = Arc::new(MemoryKeyStore::new());
        race_two_replenishments(&store);
    }
}

#[test]
fn duplicate_prekey_ids_conflict_across_uploads() {
    let (_dir, store) = sqlite_store();
    let service = service_over(store.clone());
    service.upload_prekeys("U", "D", &prekey_batch(0..10)).unwrap();
    let err = service
        .upload_prekeys("U", "D", &prekey_batch(5..15))
        .unwrap_err();
    assert!(matches!(err, KeyError::Conflict(_)));
    assert_eq!(store.count_unused("U", "D").unwrap(), 10);
}

#[test]
fn used_prekeys_stay_used() {
    let (_dir, store) = sqlite_store();
    register_device(store.as_ref(), "U", "D", &[(1, "PK1")]);
    let service = service_over(store.clone());

    assert!(service.get_key_bundle("U", "D").unwrap().pre_key.is_some());
    // Nothing an owner can do through the service revives a used key.
    service.upload_prekeys("U", "D", &prekey_batch(2..4)).unwrap();
    service.trigger_manual_cleanup();
    for _ in 0..2 {
        let bundle = service.get_key_bundle("U", "D").unwrap();
        assert_ne!(bundle.pre_key.map(|k| k.key_id), Some(1));
    }
    assert!(service.get_key_bundle("U", "D").unwrap().pre_key.is_none());
}

#[test]
fn device_deletion_is_idempotent() {
    let (_dir, store) = sqlite_store();
    register_device(store.as_ref(), "U", "D", &[(1, "PK1"), (2, "PK2")]);
    let service = service_over(store.clone());

    let first = service.delete_device_keys("U", "D").unwrap();
    assert_eq!(first.total(), 4);
    let second = service.delete_device_keys("U", "D").unwrap();
    assert_eq!(second.total(), 0);

    assert!(store.find_identity_key("U", "D").unwrap().is_none());
    assert!(store.find_active_signed_prekey("U", "D").unwrap().is_none());
    assert_eq!(store.count_unused("U", "D").unwrap(), 0);
}

#[test]
fn grace_period_cleanup_on_sqlite() {
    let (_dir, store) = sqlite_store();
    for (key_id, days) in [(1, -40), (2, -10)] {
        let spk = NewSignedPreKey {
            key_id,
            public_key: format!("SPK{key_id}"),
            signature: format!("SIG{key_id}"),
        };
        store
            .create_signed_prekey("U", "D", &spk, Duration::days(days))
            .unwrap();
    }
    let manager = KeyRotationManager::new(store.clone(), KeyPolicy::default());
    assert_eq!(manager.cleanup_expired_signed_prekeys(30).unwrap(), 1);
    assert!(!store.signed_prekey_exists("U", "D", 1).unwrap());
    assert!(store.signed_prekey_exists("U", "D", 2).unwrap());
}
