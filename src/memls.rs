//! Simple in-memory lock storage.
//!
//! This implementation has state - if you create a
//! new instance in a handler(), it will be empty every time.
//!
//! This means you have to create the instance once, using `MemLs::new`, store
//! it in your handler struct, and clone() it every time you pass
//! it to the DavLockManager. As a MemLs struct is just a handle, cloning is cheap.
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;

use crate::davpath::DavPath;
use crate::errors::{LockError, LockResult};
use crate::ls::*;

/// Lock records keyed by token, plus an index from root path to tokens.
///
/// Used by `MemLs` directly, and by `FileLs` as its in-memory view.
#[derive(Debug, Default)]
pub(crate) struct LockTable {
    locks: HashMap<LockToken, DavLock>,
    index: BTreeMap<Vec<u8>, Vec<LockToken>>,
}

impl LockTable {
    pub(crate) fn new() -> LockTable {
        LockTable::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.locks.len()
    }

    pub(crate) fn contains(&self, token: &LockToken) -> bool {
        self.locks.contains_key(token)
    }

    pub(crate) fn insert(&mut self, lock: DavLock) -> LockResult<()> {
        if self.locks.contains_key(&lock.token) {
            return Err(LockError::DuplicateToken);
        }
        self.index
            .entry(lock.path.as_bytes().to_vec())
            .or_default()
            .push(lock.token);
        self.locks.insert(lock.token, lock);
        Ok(())
    }

    pub(crate) fn remove(&mut self, token: &LockToken) -> Option<DavLock> {
        let lock = self.locks.remove(token)?;
        let key = lock.path.as_bytes();
        if let Some(tokens) = self.index.get_mut(key) {
            tokens.retain(|t| t != token);
            if tokens.is_empty() {
                self.index.remove(key);
            }
        }
        Some(lock)
    }

    /// Live lock by token.
    pub(crate) fn get(&self, token: &LockToken, now: SystemTime) -> Option<&DavLock> {
        self.locks.get(token).filter(|l| !l.is_expired(now))
    }

    /// Extend the expiry time of a live lock. Never shortens it.
    pub(crate) fn refresh(
        &mut self,
        token: &LockToken,
        expire_time: SystemTime,
        now: SystemTime,
    ) -> LockResult<DavLock> {
        match self.locks.get_mut(token) {
            Some(lock) if !lock.is_expired(now) => {
                if expire_time > lock.expire_time {
                    lock.expire_time = expire_time;
                }
                Ok(lock.clone())
            }
            _ => Err(LockError::NotFound),
        }
    }

    /// Move a live lock to a new root path.
    pub(crate) fn reroot(&mut self, token: &LockToken, new_path: &DavPath, now: SystemTime) -> LockResult<DavLock> {
        if self.get(token, now).is_none() {
            return Err(LockError::NotFound);
        }
        let mut lock = self.remove(token).ok_or(LockError::NotFound)?;
        lock.path = new_path.clone();
        self.insert(lock.clone())?;
        Ok(lock)
    }

    /// Live locks rooted at `path`, at an ancestor, or at a descendant.
    pub(crate) fn find(&self, path: &DavPath, now: SystemTime) -> Vec<DavLock> {
        let mut tokens: Vec<&LockToken> = Vec::new();

        // self and ancestors.
        if let Some(t) = self.index.get(path.as_bytes()) {
            tokens.extend(t);
        }
        for anc in path.ancestors() {
            if let Some(t) = self.index.get(anc.as_bytes()) {
                tokens.extend(t);
            }
        }

        // descendants.
        let mut prefix = path.as_bytes().to_vec();
        if !path.is_root() {
            prefix.push(b'/');
        }
        for (key, t) in self.index.range(prefix.clone()..) {
            if !key.starts_with(&prefix) {
                break;
            }
            if key.as_slice() != path.as_bytes() {
                tokens.extend(t);
            }
        }

        tokens
            .into_iter()
            .filter_map(|t| self.get(t, now))
            .cloned()
            .collect()
    }

    pub(crate) fn expired(&self, now: SystemTime) -> Vec<LockToken> {
        self.locks
            .values()
            .filter(|l| l.is_expired(now))
            .map(|l| l.token)
            .collect()
    }

    pub(crate) fn purge(&mut self, now: SystemTime) -> usize {
        let expired = self.expired(now);
        for token in &expired {
            self.remove(token);
        }
        expired.len()
    }
}

/// Ephemeral in-memory lock storage.
#[derive(Debug, Clone)]
pub struct MemLs(Arc<RwLock<LockTable>>);

impl MemLs {
    /// Create a new "memls" lock storage.
    pub fn new() -> Box<MemLs> {
        Box::new(MemLs(Arc::new(RwLock::new(LockTable::new()))))
    }
}

impl DavLockStorage for MemLs {
    fn create(&self, lock: DavLock, _now: SystemTime) -> LockResult<LockToken> {
        let token = lock.token;
        self.0.write().insert(lock)?;
        trace!("lock {} created", token);
        Ok(token)
    }

    fn refresh(&self, token: &LockToken, expire_time: SystemTime, now: SystemTime) -> LockResult<DavLock> {
        self.0.write().refresh(token, expire_time, now)
    }

    fn move_lock(&self, token: &LockToken, new_path: &DavPath, now: SystemTime) -> LockResult<DavLock> {
        self.0.write().reroot(token, new_path, now)
    }

    fn delete(&self, token: &LockToken) -> LockResult<()> {
        if self.0.write().remove(token).is_some() {
            trace!("lock {} deleted", token);
        }
        Ok(())
    }

    fn lookup(&self, token: &LockToken, now: SystemTime) -> LockResult<Option<DavLock>> {
        Ok(self.0.read().get(token, now).cloned())
    }

    fn find_locks_for_path(&self, path: &DavPath, now: SystemTime) -> LockResult<Vec<DavLock>> {
        Ok(self.0.read().find(path, now))
    }

    fn purge_expired(&self, now: SystemTime) -> LockResult<usize> {
        Ok(self.0.write().purge(now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn lock(path: &str, depth: LockDepth, expire_time: SystemTime) -> DavLock {
        DavLock {
            token: LockToken::new(),
            path: DavPath::new(path).unwrap(),
            depth,
            scope: LockScope::Exclusive,
            owner: None,
            timeout: DavTimeout::Seconds(60),
            expire_time,
            principal: None,
        }
    }

    fn paths(mut locks: Vec<DavLock>) -> Vec<String> {
        locks.sort_by(|a, b| a.path.cmp(&b.path));
        locks.iter().map(|l| l.path.as_url_string()).collect()
    }

    #[test]
    fn find_ancestors_and_descendants() {
        let now = SystemTime::now();
        let later = now + Duration::from_secs(60);
        let ls = MemLs::new();
        for p in ["/", "/a", "/a/b", "/a/b/c", "/ab", "/x"] {
            ls.create(lock(p, LockDepth::Zero, later), now).unwrap();
        }
        let found = ls.find_locks_for_path(&DavPath::new("/a/b").unwrap(), now).unwrap();
        assert_eq!(paths(found), vec!["/", "/a", "/a/b", "/a/b/c"]);

        let found = ls.find_locks_for_path(&DavPath::new("/").unwrap(), now).unwrap();
        assert_eq!(found.len(), 6);
    }

    #[test]
    fn expired_is_absent() {
        let now = SystemTime::now();
        let ls = MemLs::new();
        let l = lock("/a", LockDepth::Infinity, now + Duration::from_secs(10));
        let token = ls.create(l, now).unwrap();
        let later = now + Duration::from_secs(11);
        assert!(ls.lookup(&token, now).unwrap().is_some());
        assert!(ls.lookup(&token, later).unwrap().is_none());
        assert!(ls.find_locks_for_path(&DavPath::new("/a").unwrap(), later).unwrap().is_empty());
        assert!(matches!(
            ls.refresh(&token, later + Duration::from_secs(10), later),
            Err(LockError::NotFound)
        ));
        assert_eq!(ls.purge_expired(later).unwrap(), 1);
        assert_eq!(ls.purge_expired(later).unwrap(), 0);
    }

    #[test]
    fn duplicate_and_delete() {
        let now = SystemTime::now();
        let ls = MemLs::new();
        let l = lock("/a", LockDepth::Zero, now + Duration::from_secs(10));
        ls.create(l.clone(), now).unwrap();
        assert!(matches!(ls.create(l.clone(), now), Err(LockError::DuplicateToken)));
        ls.delete(&l.token).unwrap();
        ls.delete(&l.token).unwrap();
        assert!(ls.lookup(&l.token, now).unwrap().is_none());
    }

    #[test]
    fn refresh_never_shortens() {
        let now = SystemTime::now();
        let ls = MemLs::new();
        let l = lock("/a", LockDepth::Zero, now + Duration::from_secs(100));
        ls.create(l.clone(), now).unwrap();
        let r = ls.refresh(&l.token, now + Duration::from_secs(50), now).unwrap();
        assert_eq!(r.expire_time, l.expire_time);
        let r = ls.refresh(&l.token, now + Duration::from_secs(500), now).unwrap();
        assert_eq!(r.expire_time, now + Duration::from_secs(500));
        assert_eq!(r.token, l.token);
    }

    #[test]
    fn move_keeps_token() {
        let now = SystemTime::now();
        let ls = MemLs::new();
        let l = lock("/a", LockDepth::Zero, now + Duration::from_secs(100));
        ls.create(l.clone(), now).unwrap();
        let dest = DavPath::new("/b").unwrap();
        let moved = ls.move_lock(&l.token, &dest, now).unwrap();
        assert_eq!(moved.token, l.token);
        assert!(ls.find_locks_for_path(&DavPath::new("/a").unwrap(), now).unwrap().is_empty());
        assert_eq!(ls.find_locks_for_path(&dest, now).unwrap().len(), 1);
    }
}
