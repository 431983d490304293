//! End-to-end pool lifecycle scenarios (spec.md §8).

use poolmesh_access::AccessState;
use poolmesh_core::{Bandwidth, CacheSection, Clock, Config, DiagnosticsLog, LocalStore, PoolSection, SnowflakeGenerator};
use poolmesh_crypto::Identity;
use poolmesh_invite::{decode, encode};
use poolmesh::{Globals, Pool};
use std::sync::Arc;

fn globals_for(identity: Identity, cache_root: &std::path::Path) -> Globals {
    let clock = Clock::unsynced();
    clock.record_offset(0);
    Globals {
        identity: Arc::new(identity),
        local: Arc::new(LocalStore::in_memory().unwrap()),
        clock: Arc::new(clock),
        ids: Arc::new(SnowflakeGenerator::new(1)),
        diagnostics: Arc::new(DiagnosticsLog::new()),
        cache_root: cache_root.to_path_buf(),
    }
}

fn config_for(name: &str, backend: &std::path::Path, lifespan_hours: u64) -> Config {
    Config {
        pool: PoolSection {
            name: name.to_string(),
            public: vec![format!("file:{}", backend.display())],
            private: Vec::new(),
            apps: Vec::new(),
            life_span_hours: lifespan_hours,
        },
        cache: CacheSection { size_mb: 4 },
        bandwidth: Bandwidth::Low,
    }
}

/// S1: single-member round trip. Seed, nickname, and payload are taken
/// verbatim from spec.md §8.
#[test]
fn s1_single_member_round_trip() {
    let store_dir = tempfile::tempdir().unwrap();
    let cache_dir = tempfile::tempdir().unwrap();
    let alice = Identity::from_seed([0x01; 32], "alice");
    let globals = globals_for(alice, cache_dir.path());
    let config = config_for("t/public", store_dir.path(), 720);

    let pool = Pool::create(&config, globals, false).unwrap();
    pool.send("hello.txt", b"just a simple test", Vec::new()).unwrap();

    let discovered = pool.sync(true).unwrap();
    assert_eq!(discovered.len(), 1);
    assert_eq!(discovered[0].size, 18);
    assert_eq!(discovered[0].name, "hello.txt");

    let body = pool.receive(discovered[0].id, None).unwrap();
    assert_eq!(body, b"just a simple test");

    use blake2::{digest::consts::U32, Blake2b, Digest};
    let expected: [u8; 32] = Blake2b::<U32>::digest(b"just a simple test").into();
    assert_eq!(discovered[0].hash, expected);

    pool.close().unwrap();
}

/// spec.md §4.8 "Create": refuses to stomp an existing access file unless
/// forced.
#[test]
fn create_refuses_without_force_when_access_already_exists() {
    let store_dir = tempfile::tempdir().unwrap();
    let cache_dir = tempfile::tempdir().unwrap();
    let alice = Identity::from_seed([0x01; 32], "alice");
    let config = config_for("t/public", store_dir.path(), 720);

    let first = Pool::create(&config, globals_for(alice, cache_dir.path()), false).unwrap();
    first.export_access().unwrap();
    first.close().unwrap();

    let bob = Identity::from_seed([0x02; 32], "bob");
    let err = Pool::create(&config, globals_for(bob, cache_dir.path()), false).unwrap_err();
    assert!(matches!(err, poolmesh_core::PoolError::NotAuthorized { .. }));

    let forced = Pool::create(&config, globals_for(Identity::from_seed([0x02; 32], "bob"), cache_dir.path()), true).unwrap();
    forced.close().unwrap();
}

/// spec.md §4.8 "Leave": wipes local state, not remote content.
#[test]
fn leave_wipes_local_state_but_not_remote_content() {
    let store_dir = tempfile::tempdir().unwrap();
    let cache_dir = tempfile::tempdir().unwrap();
    let alice = Identity::from_seed([0x01; 32], "alice");
    let config = config_for("t/public", store_dir.path(), 720);

    let pool = Pool::create(&config, globals_for(alice, cache_dir.path()), false).unwrap();
    pool.send("note.txt", b"remembered", Vec::new()).unwrap();
    pool.leave().unwrap();

    assert!(
        walkdir(store_dir.path()).iter().any(|p| p.extension().and_then(|e| e.to_str()) == Some("body")),
        "remote feed objects must survive leave"
    );
}

/// spec.md §4.8 "Sub-pool": flattens a chain so there is only one `/@/`.
#[test]
fn sub_pool_flattens_existing_chain() {
    let store_dir = tempfile::tempdir().unwrap();
    let cache_dir = tempfile::tempdir().unwrap();
    let alice = Identity::from_seed([0x01; 32], "alice");
    let config = config_for("team/@/finance", store_dir.path(), 720);

    let parent = Pool::create(&config, globals_for(alice, cache_dir.path()), false).unwrap();
    let child = parent.sub_pool("audit", globals_for(Identity::from_seed([0x01; 32], "alice"), cache_dir.path()), false).unwrap();

    assert_eq!(child.name(), "team/@/audit");
    assert_ne!(child.pool_id(), parent.pool_id());
    child.close().unwrap();
    parent.close().unwrap();
}

/// spec.md §4.5, S3-adjacent: revoking a member strictly increases the
/// master-key-id on the next export.
#[test]
fn revocation_strictly_increases_master_key_id() {
    let store_dir = tempfile::tempdir().unwrap();
    let cache_dir = tempfile::tempdir().unwrap();
    let alice = Identity::from_seed([0x01; 32], "alice");
    let bob = Identity::from_seed([0x02; 32], "bob");
    let config = config_for("t/public", store_dir.path(), 720);

    let pool = Pool::create(&config, globals_for(alice, cache_dir.path()), false).unwrap();
    let before = pool.dump().unwrap().master_key_id;

    pool.set_access(bob.user_id(), AccessState::Active).unwrap();
    pool.export_access().unwrap();
    pool.set_access(bob.user_id(), AccessState::Disabled).unwrap();
    pool.export_access().unwrap();

    let after = pool.dump().unwrap().master_key_id;
    assert!(after > before, "revocation must strictly increase the master key id");
    pool.close().unwrap();
}

/// S5: an invite only discloses backends to the intended recipient.
#[test]
fn s5_invite_recovers_backends_only_for_recipient() {
    let alice = Identity::from_seed([0x01; 32], "alice");
    let bob = Identity::from_seed([0x02; 32], "bob");
    let charlie = Identity::from_seed([0x03; 32], "charlie");

    let backends = vec!["sftp://host-a/pool".to_string(), "s3://bucket/pool".to_string()];
    let token = encode(&alice, "join our pool", "t/public", &backends, &[bob.public()]).unwrap();

    let bob_view = decode(&bob, &token).unwrap();
    let (pool_name, exchanges) = bob_view.join().unwrap();
    assert_eq!(pool_name, "t/public");
    assert_eq!(exchanges, backends);

    let charlie_view = decode(&charlie, &token).unwrap();
    assert!(charlie_view.join().is_err());
}

/// S6: a corrupted body blob surfaces as an integrity error without
/// poisoning the local index or later fetches.
#[test]
fn s6_corrupted_body_yields_integrity_error() {
    let store_dir = tempfile::tempdir().unwrap();
    let cache_dir = tempfile::tempdir().unwrap();
    let alice = Identity::from_seed([0x01; 32], "alice");
    let config = config_for("t/public", store_dir.path(), 720);

    let pool = Pool::create(&config, globals_for(alice, cache_dir.path()), false).unwrap();
    let head = pool.send("doc.txt", b"integrity matters here", Vec::new()).unwrap();

    let body_path = find_body_file(store_dir.path());
    let mut bytes = std::fs::read(&body_path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    std::fs::write(&body_path, &bytes).unwrap();

    let err = pool.receive(head.id, None).unwrap_err();
    assert!(matches!(err, poolmesh_core::PoolError::IntegrityError { .. }));

    // Cached state was never poisoned, so restoring the bytes and fetching
    // again succeeds.
    bytes[last] ^= 0xFF;
    std::fs::write(&body_path, &bytes).unwrap();
    let body = pool.receive(head.id, None).unwrap();
    assert_eq!(body, b"integrity matters here");

    pool.close().unwrap();
}

fn find_body_file(root: &std::path::Path) -> std::path::PathBuf {
    for entry in walkdir(root) {
        if entry.extension().and_then(|e| e.to_str()) == Some("body") {
            return entry;
        }
    }
    panic!("no .body file found under {}", root.display());
}

fn walkdir(dir: &std::path::Path) -> Vec<std::path::PathBuf> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir).unwrap() {
        let entry = entry.unwrap();
        let path = entry.path();
        if path.is_dir() {
            out.extend(walkdir(&path));
        } else {
            out.push(path);
        }
    }
    out
}
