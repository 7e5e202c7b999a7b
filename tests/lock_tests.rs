use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dav_lockd::cachels::{CacheLs, MemCache};
use dav_lockd::conditional;
use dav_lockd::davpath::DavPath;
use dav_lockd::filels::FileLs;
use dav_lockd::lockmanager::DEFAULT_MAX_TIMEOUT;
use dav_lockd::ls::*;
use dav_lockd::memls::MemLs;
use dav_lockd::{DavLockManager, LockError, LockManagerConfig};

// A lock manager for every storage backend. The TempDir keeps the
// file backend's directory alive for the duration of the test.
fn managers() -> Vec<(&'static str, DavLockManager, ManualClock, Option<tempfile::TempDir>)> {
    let mut v = Vec::new();
    let start = SystemTime::now();

    let clock = ManualClock::new(start);
    let lm = DavLockManager::with_clock(MemLs::new(), LockManagerConfig::default(), Arc::new(clock.clone()));
    v.push(("memory", lm, clock, None));

    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(start);
    let storage = FileLs::open(dir.path()).unwrap();
    let lm = DavLockManager::with_clock(storage, LockManagerConfig::default(), Arc::new(clock.clone()));
    v.push(("file", lm, clock, Some(dir)));

    let clock = ManualClock::new(start);
    let storage = CacheLs::new(MemCache::new(), "test");
    let lm = DavLockManager::with_clock(storage, LockManagerConfig::default(), Arc::new(clock.clone()));
    v.push(("cache", lm, clock, None));

    v
}

fn p(s: &str) -> DavPath {
    DavPath::new(s).unwrap()
}

fn acquire(lm: &DavLockManager, path: &str, scope: LockScope, depth: LockDepth, principal: Option<&str>) -> Result<DavLock, LockError> {
    lm.acquire_lock(&p(path), scope, depth, None, Some(DavTimeout::Seconds(600)), principal, None)
}

#[test]
fn deep_exclusive_lock_blocks_descendants() {
    for (name, lm, _clock, _dir) in managers() {
        let l = acquire(&lm, "/docs", LockScope::Exclusive, LockDepth::Infinity, None).unwrap();

        let err = lm.check_write_allowed(&p("/docs/readme.txt"), &[], None).unwrap_err();
        match err {
            LockError::Locked(locks) => assert_eq!(locks[0].token, l.token, "{}", name),
            e => panic!("{}: unexpected {:?}", name, e),
        }
        lm.check_write_allowed(&p("/docs/readme.txt"), &[l.token], None).unwrap();
        lm.check_write_allowed(&p("/other"), &[], None).unwrap();

        let err = acquire(&lm, "/docs/sub", LockScope::Shared, LockDepth::Zero, None).unwrap_err();
        assert!(matches!(err, LockError::Conflict(_)), "{}", name);
    }
}

#[test]
fn release_then_find_is_empty() {
    for (name, lm, _clock, _dir) in managers() {
        let l = acquire(&lm, "/a/b", LockScope::Exclusive, LockDepth::Zero, None).unwrap();
        assert_eq!(lm.find_locks_for_path(&p("/a")).unwrap().len(), 1, "{}", name);
        lm.release_lock(&l.token, None).unwrap();
        assert!(lm.find_locks_for_path(&p("/a/b")).unwrap().is_empty(), "{}", name);
        assert!(lm.find_locks_for_path(&p("/a")).unwrap().is_empty(), "{}", name);

        // a second release finds nothing.
        assert!(matches!(lm.release_lock(&l.token, None), Err(LockError::NotFound)), "{}", name);
    }
}

#[test]
fn refresh_keeps_token_and_never_shortens() {
    for (name, lm, clock, _dir) in managers() {
        let l = lm
            .acquire_lock(&p("/f"), LockScope::Exclusive, LockDepth::Zero, None, Some(DavTimeout::Seconds(3600)), None, None)
            .unwrap();

        clock.advance(Duration::from_secs(10));
        let r = lm
            .acquire_lock(&p("/f"), LockScope::Exclusive, LockDepth::Zero, None, Some(DavTimeout::Seconds(60)), None, Some(&l.token))
            .unwrap();
        assert_eq!(r.token, l.token, "{}", name);
        assert_eq!(r.expire_time, l.expire_time, "{}: refresh shortened the lock", name);

        let r = lm.refresh_lock(&p("/f"), &l.token, Some(DavTimeout::Seconds(7200))).unwrap();
        assert_eq!(r.expire_time, clock.now() + Duration::from_secs(7200), "{}", name);
        assert_eq!(lm.lookup(&l.token).unwrap().unwrap().expire_time, r.expire_time, "{}", name);
    }
}

#[test]
fn shared_and_exclusive() {
    for (name, lm, _clock, _dir) in managers() {
        let alice = acquire(&lm, "/f", LockScope::Shared, LockDepth::Zero, Some("alice")).unwrap();
        let bob = acquire(&lm, "/f", LockScope::Shared, LockDepth::Zero, Some("bob")).unwrap();
        assert_ne!(alice.token, bob.token);

        let locks = lm.discover(&p("/f")).unwrap();
        assert_eq!(locks.len(), 2, "{}", name);
        let mut principals: Vec<_> = locks.iter().filter_map(|l| l.principal.clone()).collect();
        principals.sort();
        assert_eq!(principals, vec!["alice".to_string(), "bob".to_string()], "{}", name);

        match acquire(&lm, "/f", LockScope::Exclusive, LockDepth::Zero, None) {
            Err(LockError::Conflict(locks)) => assert_eq!(locks.len(), 2, "{}", name),
            other => panic!("{}: unexpected {:?}", name, other),
        }

        // every governing lock needs its token, shared or not.
        lm.check_write_allowed(&p("/f"), &[bob.token], Some("bob")).unwrap_err();
        assert!(matches!(lm.release_lock(&alice.token, Some("bob")), Err(LockError::Forbidden)), "{}", name);
        lm.release_lock(&alice.token, Some("alice")).unwrap();
        lm.check_write_allowed(&p("/f"), &[bob.token], Some("bob")).unwrap();
    }
}

#[test]
fn infinite_timeout_is_capped() {
    for (name, lm, clock, _dir) in managers() {
        let l = lm
            .acquire_lock(&p("/f"), LockScope::Exclusive, LockDepth::Zero, None, Some(DavTimeout::Infinite), None, None)
            .unwrap();
        assert_eq!(
            l.expire_time,
            clock.now() + Duration::from_secs(DEFAULT_MAX_TIMEOUT as u64),
            "{}",
            name
        );
    }
}

#[test]
fn locks_expire() {
    for (name, lm, clock, _dir) in managers() {
        let l = acquire(&lm, "/docs", LockScope::Exclusive, LockDepth::Infinity, None).unwrap();
        clock.advance(Duration::from_secs(599));
        assert!(lm.lookup(&l.token).unwrap().is_some(), "{}", name);
        clock.advance(Duration::from_secs(1));
        assert!(lm.lookup(&l.token).unwrap().is_none(), "{}", name);
        lm.check_write_allowed(&p("/docs/x"), &[], None).unwrap();

        assert_eq!(lm.purge_expired().unwrap(), 1, "{}", name);
        assert_eq!(lm.purge_expired().unwrap(), 0, "{}", name);
        acquire(&lm, "/docs", LockScope::Exclusive, LockDepth::Infinity, None).unwrap();
    }
}

#[test]
fn if_header_with_token_passes() {
    for (name, lm, _clock, _dir) in managers() {
        let l = acquire(&lm, "/docs", LockScope::Exclusive, LockDepth::Infinity, None).unwrap();
        let path = p("/docs/readme.txt");
        let held: Vec<LockToken> = lm.discover(&path).unwrap().into_iter().map(|l| l.token).collect();

        let hdr = conditional::parse(&format!("(<{}>)", l.token)).unwrap();
        assert!(hdr.evaluate(&path, None, &held), "{}", name);
        let reparsed = conditional::parse(&hdr.to_string()).unwrap();
        assert_eq!(reparsed.lock_tokens(), vec![l.token], "{}", name);

        let other = conditional::parse(&format!("(<{}>)", LockToken::new())).unwrap();
        assert!(!other.evaluate(&path, None, &held), "{}", name);
    }
}

#[test]
fn file_storage_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let token = {
        let lm = DavLockManager::new(FileLs::open(dir.path()).unwrap());
        acquire(&lm, "/persist", LockScope::Exclusive, LockDepth::Infinity, Some("alice")).unwrap().token
    };
    let lm = DavLockManager::new(FileLs::open(dir.path()).unwrap());
    let l = lm.lookup(&token).unwrap().unwrap();
    assert_eq!(l.path, p("/persist"));
    assert_eq!(l.principal.as_deref(), Some("alice"));
    assert!(matches!(lm.check_write_allowed(&p("/persist/x"), &[], None), Err(LockError::Locked(_))));
}

#[test]
fn racing_lock_requests() {
    let lm = DavLockManager::new(MemLs::new());
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let lm = lm.clone();
            std::thread::spawn(move || acquire(&lm, "/race", LockScope::Exclusive, LockDepth::Zero, None).is_ok())
        })
        .collect();
    let won = handles.into_iter().map(|h| h.join().unwrap()).filter(|ok| *ok).count();
    assert_eq!(won, 1);
}

// Two lock managers sharing one cache, as two server processes would.
fn shared_cache_managers() -> (DavLockManager, DavLockManager) {
    let cache = MemCache::new();
    let lm1 = DavLockManager::new(CacheLs::new(cache.clone(), "shared"));
    let lm2 = DavLockManager::new(CacheLs::new(cache, "shared"));
    (lm1, lm2)
}

#[test]
fn racing_lock_requests_across_managers() {
    for _ in 0..10 {
        let (lm1, lm2) = shared_cache_managers();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let lm = if i % 2 == 0 { lm1.clone() } else { lm2.clone() };
                std::thread::spawn(move || acquire(&lm, "/race", LockScope::Exclusive, LockDepth::Zero, None).is_ok())
            })
            .collect();
        let won = handles.into_iter().map(|h| h.join().unwrap()).filter(|ok| *ok).count();
        assert_eq!(won, 1);
        assert_eq!(lm2.find_locks_for_path(&p("/race")).unwrap().len(), 1);
    }
}

#[test]
fn shared_locks_across_managers_are_all_indexed() {
    let (lm1, lm2) = shared_cache_managers();
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let lm = if i % 2 == 0 { lm1.clone() } else { lm2.clone() };
            std::thread::spawn(move || acquire(&lm, "/shared", LockScope::Shared, LockDepth::Zero, None).unwrap().token)
        })
        .collect();
    let mut tokens: Vec<LockToken> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    tokens.sort();
    let mut found: Vec<LockToken> = lm1.discover(&p("/shared")).unwrap().into_iter().map(|l| l.token).collect();
    found.sort();
    assert_eq!(found, tokens);
}
