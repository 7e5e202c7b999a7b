//! The lock manager implements the WebDAV locking rules on top of a
//! [`DavLockStorage`] backend.
//!
//! All mutations (new locks, refreshes, releases, moves) are committed
//! while holding a single mutex plus the storage's own commit guard, so of
//! two conflicting requests that race for the same resource, the first one
//! to commit wins and the other sees its lock, even when they run in
//! different processes sharing one backend. Write checks only read from
//! the storage.
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::{Mutex, MutexGuard};
use serde::Deserialize;
use xmltree::Element;

use crate::davpath::DavPath;
use crate::errors::{LockError, LockResult};
use crate::ls::*;

/// Largest lock lifetime we hand out, in seconds.
pub const DEFAULT_MAX_TIMEOUT: u32 = 86400;

/// Lock manager configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LockManagerConfig {
    /// Upper bound for the lifetime of a lock, in seconds. Also used for
    /// `Timeout: Infinite`.
    pub max_timeout: u32,
    /// Lifetime when the client did not send a `Timeout` header. When not
    /// set, `max_timeout` is used.
    pub default_timeout: Option<u32>,
    /// This principal may release any lock.
    pub admin_principal: Option<String>,
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        LockManagerConfig {
            max_timeout: DEFAULT_MAX_TIMEOUT,
            default_timeout: None,
            admin_principal: None,
        }
    }
}

impl LockManagerConfig {
    /// Lifetime of a lock requested with `timeout`, after capping.
    pub fn effective_timeout(&self, timeout: Option<DavTimeout>) -> Duration {
        let secs = match timeout {
            None => self.default_timeout.unwrap_or(self.max_timeout),
            Some(DavTimeout::Seconds(s)) => s,
            Some(DavTimeout::Infinite) => self.max_timeout,
        };
        // a lock that is already dead when granted is of no use to anyone.
        Duration::from_secs(secs.min(self.max_timeout).max(1) as u64)
    }
}

// Held while committing. The fields drop in order, so the storage guard
// is released before the in-process mutex.
struct Commit<'a> {
    _storage: CommitGuard<'a>,
    _local: MutexGuard<'a, ()>,
}

struct Inner {
    storage: Box<dyn DavLockStorage>,
    clock: Arc<dyn Clock>,
    config: LockManagerConfig,
    commit: Mutex<()>,
}

/// Handle to the lock manager. Cloning is cheap.
#[derive(Clone)]
pub struct DavLockManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DavLockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("DavLockManager")
            .field("storage", &self.inner.storage)
            .field("config", &self.inner.config)
            .finish()
    }
}

impl DavLockManager {
    /// Lock manager with default configuration and the system clock.
    pub fn new(storage: Box<dyn DavLockStorage>) -> DavLockManager {
        DavLockManager::with_config(storage, LockManagerConfig::default())
    }

    pub fn with_config(storage: Box<dyn DavLockStorage>, config: LockManagerConfig) -> DavLockManager {
        DavLockManager::with_clock(storage, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        storage: Box<dyn DavLockStorage>,
        config: LockManagerConfig,
        clock: Arc<dyn Clock>,
    ) -> DavLockManager {
        DavLockManager {
            inner: Arc::new(Inner {
                storage,
                clock,
                config,
                commit: Mutex::new(()),
            }),
        }
    }

    pub fn config(&self) -> &LockManagerConfig {
        &self.inner.config
    }

    /// Current time according to the manager's clock.
    pub fn now(&self) -> SystemTime {
        self.inner.clock.now()
    }

    fn commit(&self) -> LockResult<Commit<'_>> {
        let local = self.inner.commit.lock();
        let storage = self.inner.storage.commit_guard()?;
        Ok(Commit {
            _storage: storage,
            _local: local,
        })
    }

    /// Create a new lock, or refresh `existing_token`.
    ///
    /// A refresh fails with `PreconditionFailed` if the token is unknown,
    /// expired, or not rooted at `path`. A new lock fails with `Conflict`
    /// if it collides with existing locks; two shared locks never collide.
    #[allow(clippy::too_many_arguments)]
    pub fn acquire_lock(
        &self,
        path: &DavPath,
        scope: LockScope,
        depth: LockDepth,
        owner: Option<&Element>,
        timeout: Option<DavTimeout>,
        principal: Option<&str>,
        existing_token: Option<&LockToken>,
    ) -> LockResult<DavLock> {
        if let Some(token) = existing_token {
            return self.refresh_lock(path, token, timeout);
        }

        let storage = &self.inner.storage;
        let _guard = self.commit()?;
        let now = self.now();
        storage.purge_expired(now)?;

        let conflicts: Vec<DavLock> = storage
            .find_locks_for_path(path, now)?
            .into_iter()
            .filter(|l| l.conflicts_with(path, scope, depth))
            .collect();
        if !conflicts.is_empty() {
            debug!("acquire_lock {}: {} conflicting lock(s)", path, conflicts.len());
            return Err(LockError::Conflict(conflicts));
        }

        let mut lock = DavLock {
            token: LockToken::new(),
            path: path.clone(),
            depth,
            scope,
            owner: owner.cloned(),
            timeout: timeout.unwrap_or(DavTimeout::Seconds(self.config().effective_timeout(None).as_secs() as u32)),
            expire_time: now + self.config().effective_timeout(timeout),
            principal: principal.map(|s| s.to_string()),
        };
        match storage.create(lock.clone(), now) {
            Err(LockError::DuplicateToken) => {
                warn!("acquire_lock: duplicate token {}, retrying", lock.token);
                lock.token = LockToken::new();
                storage.create(lock.clone(), now)?;
            }
            other => {
                other?;
            }
        }
        debug!("acquire_lock {}: {} ({:?}, {:?})", path, lock.token, scope, depth);
        Ok(lock)
    }

    /// Extend the lifetime of an existing lock rooted at `path`.
    pub fn refresh_lock(
        &self,
        path: &DavPath,
        token: &LockToken,
        timeout: Option<DavTimeout>,
    ) -> LockResult<DavLock> {
        let storage = &self.inner.storage;
        let _guard = self.commit()?;
        let now = self.now();
        let lock = storage.lookup(token, now)?.ok_or(LockError::PreconditionFailed)?;
        if lock.path.as_bytes() != path.as_bytes() {
            debug!("refresh_lock: {} is rooted at {}, not {}", token, lock.path, path);
            return Err(LockError::PreconditionFailed);
        }
        let expire_time = now + self.config().effective_timeout(timeout);
        match storage.refresh(token, expire_time, now) {
            Err(LockError::NotFound) => Err(LockError::PreconditionFailed),
            other => other,
        }
    }

    /// Release a lock. Only the principal that created it, or the admin
    /// principal, may do so.
    pub fn release_lock(&self, token: &LockToken, principal: Option<&str>) -> LockResult<()> {
        let storage = &self.inner.storage;
        let _guard = self.commit()?;
        let lock = storage.lookup(token, self.now())?.ok_or(LockError::NotFound)?;
        if !self.may_use(&lock, principal) {
            debug!("release_lock: {} not released, wrong principal {:?}", token, principal);
            return Err(LockError::Forbidden);
        }
        storage.delete(token)?;
        debug!("release_lock: {} released", token);
        Ok(())
    }

    // May `principal` release `lock`, or write with its token.
    fn may_use(&self, lock: &DavLock, principal: Option<&str>) -> bool {
        let admin = self.config().admin_principal.as_deref();
        match (lock.principal.as_deref(), principal) {
            (None, _) => true,
            (Some(_), Some(p)) if admin == Some(p) => true,
            (Some(owner), Some(p)) => owner == p,
            (Some(_), None) => false,
        }
    }

    /// Fails with `Locked` if `path` is governed by a lock whose token was
    /// not submitted. A submitted token only counts if `principal` may use
    /// the lock, the same rule as for releasing it.
    pub fn check_write_allowed(&self, path: &DavPath, tokens: &[LockToken], principal: Option<&str>) -> LockResult<()> {
        self.check(path, tokens, principal, false)
    }

    /// Like `check_write_allowed`, but also for locks anywhere below `path`.
    /// Used for operations that touch a whole tree (DELETE, MOVE, ...).
    pub fn check_tree_write_allowed(
        &self,
        path: &DavPath,
        tokens: &[LockToken],
        principal: Option<&str>,
    ) -> LockResult<()> {
        self.check(path, tokens, principal, true)
    }

    fn check(&self, path: &DavPath, tokens: &[LockToken], principal: Option<&str>, deep: bool) -> LockResult<()> {
        let locked: Vec<DavLock> = self
            .inner
            .storage
            .find_locks_for_path(path, self.now())?
            .into_iter()
            .filter(|l| l.governs(path) || (deep && path.is_ancestor_of(&l.path)))
            .filter(|l| !(tokens.contains(&l.token) && self.may_use(l, principal)))
            .collect();
        if locked.is_empty() {
            Ok(())
        } else {
            trace!("check {}: locked by {:?}", path, locked.iter().map(|l| l.token).collect::<Vec<_>>());
            Err(LockError::Locked(locked))
        }
    }

    // The locks at or below `old_path`, with where they end up.
    fn locks_to_move(&self, old_path: &DavPath, new_path: &DavPath, now: SystemTime) -> LockResult<Vec<(DavLock, DavPath)>> {
        Ok(self
            .inner
            .storage
            .find_locks_for_path(old_path, now)?
            .into_iter()
            .filter_map(|l| l.path.rebase(old_path, new_path).map(|dest| (l, dest)))
            .collect())
    }

    // Locks that `lock` would conflict with once re-rooted at `dest`. Locks
    // that move along, and locks at or below `new_path` that go away with
    // the replaced destination, do not count.
    fn transfer_conflicts(
        &self,
        lock: &DavLock,
        dest: &DavPath,
        new_path: &DavPath,
        moving: &[LockToken],
        now: SystemTime,
    ) -> LockResult<Vec<DavLock>> {
        Ok(self
            .inner
            .storage
            .find_locks_for_path(dest, now)?
            .into_iter()
            .filter(|l| !moving.contains(&l.token) && !new_path.is_ancestor_or_self(&l.path))
            .filter(|l| l.conflicts_with(dest, lock.scope, lock.depth))
            .collect())
    }

    /// Before a MOVE: fails with `Conflict` if a lock at or below
    /// `old_path` would collide with a lock at its new position below
    /// `new_path`, such as an exclusive depth-infinity lock on the target
    /// collection.
    pub fn check_lock_transfer(&self, old_path: &DavPath, new_path: &DavPath) -> LockResult<()> {
        let now = self.now();
        let moving = self.locks_to_move(old_path, new_path, now)?;
        let tokens: Vec<LockToken> = moving.iter().map(|(l, _)| l.token).collect();
        let mut conflicts: Vec<DavLock> = Vec::new();
        for (lock, dest) in &moving {
            for c in self.transfer_conflicts(lock, dest, new_path, &tokens, now)? {
                if !conflicts.iter().any(|l| l.token == c.token) {
                    conflicts.push(c);
                }
            }
        }
        if conflicts.is_empty() {
            Ok(())
        } else {
            debug!("check_lock_transfer {} -> {}: {} conflicting lock(s)", old_path, new_path, conflicts.len());
            Err(LockError::Conflict(conflicts))
        }
    }

    /// After a successful MOVE: re-root the locks at or below `old_path`
    /// to the same relative position below `new_path`. A lock that would
    /// collide with a lock at its new position (one that appeared after
    /// `check_lock_transfer`) is dropped instead.
    pub fn transfer_lock_on_move(&self, old_path: &DavPath, new_path: &DavPath) -> LockResult<Vec<DavLock>> {
        let storage = &self.inner.storage;
        let _guard = self.commit()?;
        let now = self.now();
        let moving = self.locks_to_move(old_path, new_path, now)?;
        let tokens: Vec<LockToken> = moving.iter().map(|(l, _)| l.token).collect();
        let mut moved = Vec::new();
        for (lock, dest) in moving {
            if !self.transfer_conflicts(&lock, &dest, new_path, &tokens, now)?.is_empty() {
                warn!("transfer_lock_on_move: {} conflicts at {}, dropped", lock.token, dest);
                storage.delete(&lock.token)?;
                continue;
            }
            debug!("transfer_lock_on_move: {} {} -> {}", lock.token, lock.path, dest);
            moved.push(storage.move_lock(&lock.token, &dest, now)?);
        }
        Ok(moved)
    }

    /// After a successful DELETE: drop the locks at or below `path`.
    pub fn remove_locks(&self, path: &DavPath) -> LockResult<usize> {
        let storage = &self.inner.storage;
        let _guard = self.commit()?;
        let mut count = 0;
        for lock in storage.find_locks_for_path(path, self.now())? {
            if path.is_ancestor_or_self(&lock.path) {
                storage.delete(&lock.token)?;
                count += 1;
            }
        }
        if count > 0 {
            debug!("remove_locks: {} lock(s) removed at {}", count, path);
        }
        Ok(count)
    }

    /// Every live lock rooted at `path`, above it, or below it.
    pub fn find_locks_for_path(&self, path: &DavPath) -> LockResult<Vec<DavLock>> {
        self.inner.storage.find_locks_for_path(path, self.now())
    }

    /// The live locks that govern `path` (for `lockdiscovery`).
    pub fn discover(&self, path: &DavPath) -> LockResult<Vec<DavLock>> {
        let mut locks = self.find_locks_for_path(path)?;
        locks.retain(|l| l.governs(path));
        Ok(locks)
    }

    pub fn lookup(&self, token: &LockToken) -> LockResult<Option<DavLock>> {
        self.inner.storage.lookup(token, self.now())
    }

    pub fn purge_expired(&self) -> LockResult<usize> {
        let _guard = self.commit()?;
        self.inner.storage.purge_expired(self.now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memls::MemLs;

    fn manager() -> (DavLockManager, ManualClock) {
        let clock = ManualClock::new(SystemTime::now());
        let lm = DavLockManager::with_clock(MemLs::new(), LockManagerConfig::default(), Arc::new(clock.clone()));
        (lm, clock)
    }

    fn p(s: &str) -> DavPath {
        DavPath::new(s).unwrap()
    }

    fn lock(lm: &DavLockManager, path: &str, scope: LockScope, depth: LockDepth) -> LockResult<DavLock> {
        lm.acquire_lock(&p(path), scope, depth, None, Some(DavTimeout::Seconds(60)), None, None)
    }

    #[test]
    fn depth_zero_parent_does_not_conflict() {
        let (lm, _) = manager();
        lock(&lm, "/a", LockScope::Exclusive, LockDepth::Zero).unwrap();
        lock(&lm, "/a/b", LockScope::Exclusive, LockDepth::Zero).unwrap();
        assert!(lock(&lm, "/a", LockScope::Exclusive, LockDepth::Zero).is_err());
    }

    #[test]
    fn deep_lock_sees_children() {
        let (lm, _) = manager();
        lock(&lm, "/a/b/c", LockScope::Shared, LockDepth::Zero).unwrap();
        lock(&lm, "/a", LockScope::Shared, LockDepth::Infinity).unwrap();
        let err = lock(&lm, "/a", LockScope::Exclusive, LockDepth::Infinity).unwrap_err();
        assert_eq!(err.locks().len(), 2);
        // a depth 0 exclusive lock on /a conflicts only with the lock on /a itself.
        let err = lock(&lm, "/a", LockScope::Exclusive, LockDepth::Zero).unwrap_err();
        assert_eq!(err.locks().len(), 1);
    }

    #[test]
    fn refresh_rules() {
        let (lm, clock) = manager();
        let l = lock(&lm, "/a", LockScope::Exclusive, LockDepth::Infinity).unwrap();
        let err = lm.refresh_lock(&p("/a/b"), &l.token, None).unwrap_err();
        assert!(matches!(err, LockError::PreconditionFailed));
        clock.advance(Duration::from_secs(30));
        let r = lm.refresh_lock(&p("/a"), &l.token, Some(DavTimeout::Seconds(60))).unwrap();
        assert_eq!(r.token, l.token);
        assert!(r.expire_time > l.expire_time);
        clock.advance(Duration::from_secs(61));
        let err = lm.refresh_lock(&p("/a"), &l.token, None).unwrap_err();
        assert!(matches!(err, LockError::PreconditionFailed));
    }

    #[test]
    fn release_principals() {
        let clock = ManualClock::new(SystemTime::now());
        let config = LockManagerConfig {
            admin_principal: Some("root".to_string()),
            ..LockManagerConfig::default()
        };
        let lm = DavLockManager::with_clock(MemLs::new(), config, Arc::new(clock));
        let l = lm
            .acquire_lock(&p("/a"), LockScope::Exclusive, LockDepth::Zero, None, None, Some("alice"), None)
            .unwrap();
        assert!(matches!(lm.release_lock(&l.token, Some("bob")), Err(LockError::Forbidden)));
        assert!(matches!(lm.release_lock(&l.token, None), Err(LockError::Forbidden)));
        lm.release_lock(&l.token, Some("root")).unwrap();
        assert!(matches!(lm.release_lock(&l.token, Some("root")), Err(LockError::NotFound)));
    }

    #[test]
    fn default_timeout() {
        let (lm, clock) = manager();
        let now = clock.now();
        let l = lm
            .acquire_lock(&p("/a"), LockScope::Shared, LockDepth::Zero, None, None, None, None)
            .unwrap();
        assert_eq!(l.expire_time, now + Duration::from_secs(DEFAULT_MAX_TIMEOUT as u64));
        let l = lm
            .acquire_lock(&p("/b"), LockScope::Shared, LockDepth::Zero, None, Some(DavTimeout::Seconds(u32::MAX)), None, None)
            .unwrap();
        assert_eq!(l.expire_time, now + Duration::from_secs(DEFAULT_MAX_TIMEOUT as u64));
    }

    #[test]
    fn zero_timeout_still_grants_a_live_lock() {
        let (lm, clock) = manager();
        let now = clock.now();
        let l = lm
            .acquire_lock(&p("/a"), LockScope::Exclusive, LockDepth::Zero, None, Some(DavTimeout::Seconds(0)), None, None)
            .unwrap();
        assert_eq!(l.expire_time, now + Duration::from_secs(1));
        assert_eq!(lm.lookup(&l.token).unwrap().unwrap().token, l.token);
        assert!(matches!(lm.check_write_allowed(&p("/a"), &[], None), Err(LockError::Locked(_))));
    }

    #[test]
    fn refresh_ignores_url_prefix() {
        let (lm, _) = manager();
        let prefixed = DavPath::from_str_and_prefix("/dav/a", "/dav").unwrap();
        let l = lm
            .acquire_lock(&prefixed, LockScope::Exclusive, LockDepth::Zero, None, None, None, None)
            .unwrap();
        lm.refresh_lock(&p("/a"), &l.token, None).unwrap();
        assert!(matches!(lm.check_write_allowed(&p("/a"), &[], None), Err(LockError::Locked(_))));
    }

    #[test]
    fn write_checks() {
        let (lm, _) = manager();
        let l = lock(&lm, "/a/b", LockScope::Exclusive, LockDepth::Zero).unwrap();
        lm.check_write_allowed(&p("/a"), &[], None).unwrap();
        lm.check_write_allowed(&p("/a/b/c"), &[], None).unwrap();
        assert!(matches!(lm.check_write_allowed(&p("/a/b"), &[], None), Err(LockError::Locked(_))));
        assert!(matches!(lm.check_tree_write_allowed(&p("/a"), &[], None), Err(LockError::Locked(_))));
        lm.check_tree_write_allowed(&p("/a"), &[l.token], None).unwrap();
    }

    #[test]
    fn token_of_another_principal_does_not_unlock() {
        let clock = ManualClock::new(SystemTime::now());
        let config = LockManagerConfig {
            admin_principal: Some("root".to_string()),
            ..LockManagerConfig::default()
        };
        let lm = DavLockManager::with_clock(MemLs::new(), config, Arc::new(clock));
        let l = lm
            .acquire_lock(&p("/a"), LockScope::Exclusive, LockDepth::Infinity, None, None, Some("alice"), None)
            .unwrap();
        let err = lm.check_write_allowed(&p("/a/f"), &[l.token], Some("bob")).unwrap_err();
        assert_eq!(err.locks()[0].token, l.token);
        assert!(matches!(lm.check_tree_write_allowed(&p("/a"), &[l.token], None), Err(LockError::Locked(_))));
        lm.check_write_allowed(&p("/a/f"), &[l.token], Some("alice")).unwrap();
        lm.check_tree_write_allowed(&p("/a"), &[l.token], Some("root")).unwrap();
    }

    #[test]
    fn move_into_exclusively_locked_collection() {
        let (lm, _) = manager();
        let target = lock(&lm, "/dst", LockScope::Exclusive, LockDepth::Infinity).unwrap();
        let moving = lock(&lm, "/src/f", LockScope::Exclusive, LockDepth::Zero).unwrap();
        let err = lm.check_lock_transfer(&p("/src/f"), &p("/dst/f")).unwrap_err();
        match err {
            LockError::Conflict(locks) => {
                assert_eq!(locks.len(), 1);
                assert_eq!(locks[0].token, target.token);
            }
            e => panic!("unexpected {:?}", e),
        }
        // unlocked resources, and locks that go away with the replaced
        // destination, do not block the move.
        lm.check_lock_transfer(&p("/src/g"), &p("/dst/g")).unwrap();
        lock(&lm, "/other/f", LockScope::Exclusive, LockDepth::Zero).unwrap();
        lm.check_lock_transfer(&p("/src/f"), &p("/other/f")).unwrap();

        // a transfer that still collides drops the moved lock.
        let moved = lm.transfer_lock_on_move(&p("/src/f"), &p("/dst/f")).unwrap();
        assert!(moved.is_empty());
        assert!(lm.lookup(&moving.token).unwrap().is_none());
        assert_eq!(lm.discover(&p("/dst/f")).unwrap()[0].token, target.token);
    }

    #[test]
    fn move_and_delete() {
        let (lm, _) = manager();
        let l1 = lock(&lm, "/src", LockScope::Shared, LockDepth::Infinity).unwrap();
        let l2 = lock(&lm, "/src/x/y", LockScope::Shared, LockDepth::Zero).unwrap();
        let moved = lm.transfer_lock_on_move(&p("/src"), &p("/dst")).unwrap();
        assert_eq!(moved.len(), 2);
        assert_eq!(lm.lookup(&l1.token).unwrap().unwrap().path, p("/dst"));
        assert_eq!(lm.lookup(&l2.token).unwrap().unwrap().path, p("/dst/x/y"));
        assert_eq!(lm.remove_locks(&p("/dst/x")).unwrap(), 1);
        assert_eq!(lm.discover(&p("/dst/x/y")).unwrap().len(), 1);
    }
}
