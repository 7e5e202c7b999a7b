//! Lock storage kept in a remote key-value cache.
//!
//! The cache client is abstracted as [`KeyValueCache`] so any store with
//! get/set/delete and prefix key listing can be plugged in (memcached,
//! redis, ...). [`MemCache`] is an in-process implementation for tests and
//! single-node setups.
//!
//! Layout, with `P` the configured key prefix:
//!
//! - `P:lock:<uuid>`: the JSON lock record, with a TTL that matches the lock's expiry.
//! - `P:url:<path>`: JSON array of the tokens of the locks rooted at `<path>`.
//! - `P:mutex`: short lived lease that serializes writers across processes.
//!
//! Every mutation, and every read-check-write sequence the lock manager
//! runs through [`DavLockStorage::commit_guard`], holds the `P:mutex` lease.
//! It is taken with [`KeyValueCache::set_if_absent`] and dropped with
//! [`KeyValueCache::compare_and_delete`], so the cache client must make
//! those two operations atomic (`SET NX` and a compare-and-delete script on
//! redis, `add` and `cas` on memcached).
use std::collections::HashMap;
use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant, SystemTime};

use dyn_clone::{DynClone, clone_trait_object};
use parking_lot::{Mutex, RwLock};

use crate::davpath::DavPath;
use crate::errors::{LockError, LockResult};
use crate::filels::LockRecord;
use crate::ls::*;

// Keep records around a bit after expiry so a refresh racing with the
// cache's own eviction still finds a consistent index.
const TTL_SLACK: Duration = Duration::from_secs(60);

// Lease on the writer mutex. A holder that dies keeps it for at most this long.
const MUTEX_TTL: Duration = Duration::from_secs(30);
const MUTEX_WAIT: Duration = Duration::from_secs(10);
const MUTEX_RETRY: Duration = Duration::from_millis(5);

/// Minimal client interface of a key-value cache.
pub trait KeyValueCache: Debug + Send + Sync + DynClone {
    fn get(&self, key: &str) -> io::Result<Option<Vec<u8>>>;
    /// Store a value. `ttl` of `None` means no expiry.
    fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> io::Result<()>;
    fn delete(&self, key: &str) -> io::Result<()>;
    /// All keys starting with `prefix`.
    fn keys(&self, prefix: &str) -> io::Result<Vec<String>>;
    /// Atomically store a value only if the key is absent. Returns `true`
    /// if the value was stored.
    fn set_if_absent(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> io::Result<bool>;
    /// Atomically delete a key only if it holds `value`. Returns `true` if
    /// the key was deleted.
    fn compare_and_delete(&self, key: &str, value: &[u8]) -> io::Result<bool>;
}

clone_trait_object! {KeyValueCache}

/// In-process `KeyValueCache`.
#[derive(Debug, Clone, Default)]
pub struct MemCache(Arc<Mutex<HashMap<String, (Vec<u8>, Option<SystemTime>)>>>);

impl MemCache {
    pub fn new() -> Box<MemCache> {
        Box::new(MemCache::default())
    }
}

type CacheMap = HashMap<String, (Vec<u8>, Option<SystemTime>)>;

// Value of `key`, evicting it first if it has expired.
fn live_value<'a>(map: &'a mut CacheMap, key: &str) -> Option<&'a Vec<u8>> {
    let expired = matches!(map.get(key), Some((_, Some(exp))) if *exp <= SystemTime::now());
    if expired {
        map.remove(key);
    }
    map.get(key).map(|(v, _)| v)
}

impl KeyValueCache for MemCache {
    fn get(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        Ok(live_value(&mut self.0.lock(), key).cloned())
    }

    fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> io::Result<()> {
        let exp = ttl.map(|d| SystemTime::now() + d);
        self.0.lock().insert(key.to_string(), (value.to_vec(), exp));
        Ok(())
    }

    fn delete(&self, key: &str) -> io::Result<()> {
        self.0.lock().remove(key);
        Ok(())
    }

    fn keys(&self, prefix: &str) -> io::Result<Vec<String>> {
        let now = SystemTime::now();
        Ok(self
            .0
            .lock()
            .iter()
            .filter(|(k, (_, exp))| k.starts_with(prefix) && exp.is_none_or(|e| e > now))
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn set_if_absent(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> io::Result<bool> {
        let mut map = self.0.lock();
        if live_value(&mut map, key).is_some() {
            return Ok(false);
        }
        let exp = ttl.map(|d| SystemTime::now() + d);
        map.insert(key.to_string(), (value.to_vec(), exp));
        Ok(true)
    }

    fn compare_and_delete(&self, key: &str, value: &[u8]) -> io::Result<bool> {
        let mut map = self.0.lock();
        if live_value(&mut map, key).is_some_and(|v| v.as_slice() == value) {
            map.remove(key);
            return Ok(true);
        }
        Ok(false)
    }
}

/// Lock storage on top of a `KeyValueCache`.
#[derive(Debug, Clone)]
pub struct CacheLs {
    cache: Box<dyn KeyValueCache>,
    prefix: Arc<String>,
    rw: Arc<RwLock<()>>,
    // thread that currently holds the `P:mutex` lease through a commit guard.
    holder: Arc<Mutex<Option<ThreadId>>>,
}

impl CacheLs {
    pub fn new(cache: Box<dyn KeyValueCache>, prefix: impl Into<String>) -> Box<CacheLs> {
        Box::new(CacheLs {
            cache,
            prefix: Arc::new(prefix.into()),
            rw: Arc::new(RwLock::new(())),
            holder: Arc::new(Mutex::new(None)),
        })
    }

    fn mutex_key(&self) -> String {
        format!("{}:mutex", self.prefix)
    }

    // Take the `P:mutex` lease, waiting up to MUTEX_WAIT for another
    // holder. Returns the value that identifies this holder.
    fn acquire_mutex(&self) -> LockResult<Vec<u8>> {
        let key = self.mutex_key();
        let value = uuid::Uuid::new_v4().hyphenated().to_string().into_bytes();
        let deadline = Instant::now() + MUTEX_WAIT;
        while !self.cache.set_if_absent(&key, &value, Some(MUTEX_TTL))? {
            if Instant::now() >= deadline {
                warn!("CacheLs: timed out waiting for {}", key);
                return Err(io::Error::new(io::ErrorKind::TimedOut, "lock storage mutex is busy").into());
            }
            thread::sleep(MUTEX_RETRY);
        }
        Ok(value)
    }

    fn release_mutex(&self, value: &[u8]) {
        match self.cache.compare_and_delete(&self.mutex_key(), value) {
            Ok(true) => {}
            Ok(false) => warn!("CacheLs: mutex lease expired while held"),
            Err(e) => warn!("CacheLs: failed to release mutex: {}", e),
        }
    }

    // Run a mutation under the `P:mutex` lease, unless this thread already
    // holds it through a commit guard.
    fn exclusive<T>(&self, f: impl FnOnce() -> LockResult<T>) -> LockResult<T> {
        if *self.holder.lock() == Some(thread::current().id()) {
            return f();
        }
        let value = self.acquire_mutex()?;
        let res = f();
        self.release_mutex(&value);
        res
    }

    fn lock_key(&self, token: &LockToken) -> String {
        format!("{}:lock:{}", self.prefix, token.uuid().hyphenated())
    }

    fn url_key(&self, path: &DavPath) -> String {
        format!("{}:url:{}", self.prefix, path.as_url_string())
    }

    fn read_lock(&self, token: &LockToken) -> LockResult<Option<DavLock>> {
        match self.cache.get(&self.lock_key(token))? {
            Some(data) => {
                let rec: LockRecord = serde_json::from_slice(&data)?;
                Ok(Some(rec.into_lock()?))
            }
            None => Ok(None),
        }
    }

    fn write_lock(&self, lock: &DavLock, now: SystemTime) -> LockResult<()> {
        let data = serde_json::to_vec(&LockRecord::from_lock(lock)?)?;
        let ttl = lock.remaining(now) + TTL_SLACK;
        self.cache.set(&self.lock_key(&lock.token), &data, Some(ttl))?;
        Ok(())
    }

    fn read_index(&self, key: &str) -> LockResult<Vec<LockToken>> {
        match self.cache.get(key)? {
            Some(data) => {
                let tokens: Vec<String> = serde_json::from_slice(&data)?;
                Ok(tokens.iter().filter_map(|t| t.parse().ok()).collect())
            }
            None => Ok(Vec::new()),
        }
    }

    fn write_index(&self, key: &str, tokens: &[LockToken]) -> LockResult<()> {
        if tokens.is_empty() {
            self.cache.delete(key)?;
        } else {
            let tokens: Vec<String> = tokens.iter().map(|t| t.to_string()).collect();
            self.cache.set(key, &serde_json::to_vec(&tokens)?, None)?;
        }
        Ok(())
    }

    fn index_add(&self, path: &DavPath, token: &LockToken) -> LockResult<()> {
        let key = self.url_key(path);
        let mut tokens = self.read_index(&key)?;
        if !tokens.contains(token) {
            tokens.push(*token);
        }
        self.write_index(&key, &tokens)
    }

    fn index_remove(&self, path: &DavPath, token: &LockToken) -> LockResult<()> {
        let key = self.url_key(path);
        let mut tokens = self.read_index(&key)?;
        tokens.retain(|t| t != token);
        self.write_index(&key, &tokens)
    }

    fn live_lock(&self, token: &LockToken, now: SystemTime) -> LockResult<Option<DavLock>> {
        Ok(self.read_lock(token)?.filter(|l| !l.is_expired(now)))
    }

    fn locks_in_index(&self, key: &str, now: SystemTime, out: &mut Vec<DavLock>) -> LockResult<()> {
        for token in self.read_index(key)? {
            if let Some(lock) = self.live_lock(&token, now)? {
                out.push(lock);
            }
        }
        Ok(())
    }
}

impl DavLockStorage for CacheLs {
    fn create(&self, lock: DavLock, now: SystemTime) -> LockResult<LockToken> {
        self.exclusive(|| {
            let _guard = self.rw.write();
            if self.cache.get(&self.lock_key(&lock.token))?.is_some() {
                return Err(LockError::DuplicateToken);
            }
            self.write_lock(&lock, now)?;
            self.index_add(&lock.path, &lock.token)?;
            trace!("CacheLs: lock {} created", lock.token);
            Ok(lock.token)
        })
    }

    fn refresh(&self, token: &LockToken, expire_time: SystemTime, now: SystemTime) -> LockResult<DavLock> {
        self.exclusive(|| {
            let _guard = self.rw.write();
            let mut lock = self.live_lock(token, now)?.ok_or(LockError::NotFound)?;
            if expire_time > lock.expire_time {
                lock.expire_time = expire_time;
                self.write_lock(&lock, now)?;
            }
            Ok(lock)
        })
    }

    fn move_lock(&self, token: &LockToken, new_path: &DavPath, now: SystemTime) -> LockResult<DavLock> {
        self.exclusive(|| {
            let _guard = self.rw.write();
            let mut lock = self.live_lock(token, now)?.ok_or(LockError::NotFound)?;
            let old_path = std::mem::replace(&mut lock.path, new_path.clone());
            self.write_lock(&lock, now)?;
            self.index_add(new_path, token)?;
            self.index_remove(&old_path, token)?;
            Ok(lock)
        })
    }

    fn delete(&self, token: &LockToken) -> LockResult<()> {
        self.exclusive(|| {
            let _guard = self.rw.write();
            if let Some(lock) = self.read_lock(token)? {
                self.index_remove(&lock.path, token)?;
            }
            self.cache.delete(&self.lock_key(token))?;
            Ok(())
        })
    }

    fn lookup(&self, token: &LockToken, now: SystemTime) -> LockResult<Option<DavLock>> {
        let _guard = self.rw.read();
        self.live_lock(token, now)
    }

    fn find_locks_for_path(&self, path: &DavPath, now: SystemTime) -> LockResult<Vec<DavLock>> {
        let _guard = self.rw.read();
        let mut locks = Vec::new();
        self.locks_in_index(&self.url_key(path), now, &mut locks)?;
        for anc in path.ancestors() {
            self.locks_in_index(&self.url_key(&anc), now, &mut locks)?;
        }
        let mut sub = self.url_key(path);
        if !path.is_root() {
            sub.push('/');
        }
        let own = self.url_key(path);
        for key in self.cache.keys(&sub)? {
            if key != own {
                self.locks_in_index(&key, now, &mut locks)?;
            }
        }
        Ok(locks)
    }

    fn purge_expired(&self, now: SystemTime) -> LockResult<usize> {
        self.exclusive(|| {
            let _guard = self.rw.write();
            let mut count = 0;
            for key in self.cache.keys(&format!("{}:url:", self.prefix))? {
                let tokens = self.read_index(&key)?;
                let mut live = Vec::with_capacity(tokens.len());
                for token in tokens {
                    match self.read_lock(&token)? {
                        Some(lock) if !lock.is_expired(now) => live.push(token),
                        Some(_) => {
                            self.cache.delete(&self.lock_key(&token))?;
                            count += 1;
                        }
                        // evicted by the cache already.
                        None => {}
                    }
                }
                self.write_index(&key, &live)?;
            }
            Ok(count)
        })
    }

    fn commit_guard(&self) -> LockResult<CommitGuard<'_>> {
        let value = self.acquire_mutex()?;
        *self.holder.lock() = Some(thread::current().id());
        Ok(CommitGuard::new(move || {
            *self.holder.lock() = None;
            self.release_mutex(&value);
        }))
    }
}
