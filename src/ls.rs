//! Contains the structs and traits that define a lock storage backend.
//!
//! Note that the methods DO NOT return futures, they are synchronous.
//! A storage call is bounded by the latency of the backend itself (memory,
//! local disk or one round trip to a cache) and is made while the lock
//! manager holds its commit lock, so it must never wait on anything else.
//! The one exception is [`DavLockStorage::commit_guard`], which may wait a
//! bounded time for a writer in another process.
//!
//! Three backends are included:
//!
//! - [`MemLs`](crate::memls::MemLs): ephemeral in-memory storage.
//! - [`FileLs`](crate::filels::FileLs): one JSON file per lock in a directory.
//! - [`CacheLs`](crate::cachels::CacheLs): records in a remote key-value cache.
//!
//! Expired locks are treated as absent by every read, and are removed by
//! [`DavLockStorage::purge_expired`], which the lock manager calls before it
//! checks for conflicts.
use std::fmt::Debug;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dyn_clone::{DynClone, clone_trait_object};
use parking_lot::Mutex;
use serde::Deserialize;
use uuid::Uuid;
use xmltree::Element;

use crate::cachels::{CacheLs, KeyValueCache};
use crate::davpath::DavPath;
use crate::errors::{LockError, LockResult};
use crate::filels::FileLs;
use crate::memls::MemLs;

const TOKEN_SCHEME: &str = "opaquelocktoken:";

/// Unique identifier of a lock, `opaquelocktoken:<uuid>` on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockToken(Uuid);

impl LockToken {
    /// Generate a new random token.
    pub fn new() -> LockToken {
        LockToken(Uuid::new_v4())
    }

    pub fn uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for LockToken {
    fn default() -> Self {
        LockToken::new()
    }
}

impl std::fmt::Display for LockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}{}", TOKEN_SCHEME, self.0.hyphenated())
    }
}

impl std::fmt::Debug for LockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

impl FromStr for LockToken {
    type Err = LockError;

    /// Accepts `opaquelocktoken:<uuid>` and `urn:uuid:<uuid>`, optionally
    /// wrapped in `<...>` as in the `Lock-Token` header.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().trim_start_matches('<').trim_end_matches('>');
        let uuid = s
            .strip_prefix(TOKEN_SCHEME)
            .or_else(|| s.strip_prefix("urn:uuid:"))
            .ok_or(LockError::MalformedHeader)?;
        Uuid::parse_str(uuid)
            .map(LockToken)
            .map_err(|_| LockError::MalformedHeader)
    }
}

/// Exclusive or shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockScope {
    Exclusive,
    Shared,
}

/// Depth of a lock: just the resource, or the resource and all its descendants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockDepth {
    Zero,
    Infinity,
}

/// Requested lifetime of a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DavTimeout {
    Seconds(u32),
    Infinite,
}

/// A write lock.
#[derive(Debug, Clone, PartialEq)]
pub struct DavLock {
    /// Token.
    pub token: LockToken,
    /// Resource the lock is rooted at.
    pub path: DavPath,
    /// Depth.
    pub depth: LockDepth,
    /// Scope.
    pub scope: LockScope,
    /// Owner, the `<D:owner>` element from the LOCK request, verbatim.
    pub owner: Option<Element>,
    /// Lifetime as requested by the client.
    pub timeout: DavTimeout,
    /// When the lock turns stale (absolute).
    pub expire_time: SystemTime,
    /// Principal that created the lock.
    pub principal: Option<String>,
}

impl DavLock {
    pub fn is_shared(&self) -> bool {
        self.scope == LockScope::Shared
    }

    pub fn is_deep(&self) -> bool {
        self.depth == LockDepth::Infinity
    }

    pub fn is_expired(&self, now: SystemTime) -> bool {
        self.expire_time <= now
    }

    /// Time left before the lock expires.
    pub fn remaining(&self, now: SystemTime) -> Duration {
        self.expire_time.duration_since(now).unwrap_or_default()
    }

    /// Does this lock protect `path`: it is rooted there, or it is a
    /// depth-infinity lock rooted at an ancestor.
    pub fn governs(&self, path: &DavPath) -> bool {
        self.path.as_bytes() == path.as_bytes() || (self.is_deep() && self.path.is_ancestor_of(path))
    }

    /// Would a lock requested at `path` with `scope` and `depth` conflict with this one.
    pub(crate) fn conflicts_with(&self, path: &DavPath, scope: LockScope, depth: LockDepth) -> bool {
        if self.is_shared() && scope == LockScope::Shared {
            return false;
        }
        self.governs(path) || (depth == LockDepth::Infinity && path.is_ancestor_of(&self.path))
    }
}

/// The trait that defines a lock storage backend.
///
/// All methods take the current time so that expiry is decided by the
/// caller's clock. Implementations must make `create`, `refresh`,
/// `move_lock` and `delete` atomic, and must never let a reader observe a
/// partially written record.
pub trait DavLockStorage: Debug + Send + Sync + DynClone {
    /// Store a new lock. Fails with `DuplicateToken` if the token exists.
    fn create(&self, lock: DavLock, now: SystemTime) -> LockResult<LockToken>;

    /// Set a new expiry time. Fails with `NotFound` if the lock is
    /// unknown or expired. The expiry time never moves backwards.
    fn refresh(&self, token: &LockToken, expire_time: SystemTime, now: SystemTime) -> LockResult<DavLock>;

    /// Re-root a lock at a new path, keeping its token.
    fn move_lock(&self, token: &LockToken, new_path: &DavPath, now: SystemTime) -> LockResult<DavLock>;

    /// Remove a lock. Removing an absent lock is not an error.
    fn delete(&self, token: &LockToken) -> LockResult<()>;

    /// Find a lock by token. Expired locks are not returned.
    fn lookup(&self, token: &LockToken, now: SystemTime) -> LockResult<Option<DavLock>>;

    /// All live locks rooted at `path`, at one of its ancestors, or at one
    /// of its descendants.
    fn find_locks_for_path(&self, path: &DavPath, now: SystemTime) -> LockResult<Vec<DavLock>>;

    /// Remove all expired locks. Returns how many were removed.
    fn purge_expired(&self, now: SystemTime) -> LockResult<usize>;

    /// Serialize a read-check-write sequence against every other user of
    /// the same backing store, including other processes. Backends that
    /// are only reachable from this process return a no-op guard and rely
    /// on the lock manager's own mutex.
    fn commit_guard(&self) -> LockResult<CommitGuard<'_>> {
        Ok(CommitGuard::none())
    }
}

clone_trait_object! {DavLockStorage}

/// Held while a storage-level critical section is open. Dropping it
/// releases the section.
#[must_use]
pub struct CommitGuard<'a> {
    release: Option<Box<dyn FnOnce() + 'a>>,
}

impl<'a> CommitGuard<'a> {
    /// A guard that does nothing when dropped.
    pub fn none() -> CommitGuard<'a> {
        CommitGuard { release: None }
    }

    /// A guard that runs `release` when dropped.
    pub fn new(release: impl FnOnce() + 'a) -> CommitGuard<'a> {
        CommitGuard {
            release: Some(Box::new(release)),
        }
    }
}

impl Drop for CommitGuard<'_> {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// Source of "now" for the lock manager.
pub trait Clock: Debug + Send + Sync {
    fn now(&self) -> SystemTime;
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// A clock that only moves when told to. Useful in tests.
#[derive(Debug, Clone)]
pub struct ManualClock(Arc<Mutex<SystemTime>>);

impl ManualClock {
    pub fn new(start: SystemTime) -> ManualClock {
        ManualClock(Arc::new(Mutex::new(start)))
    }

    pub fn advance(&self, d: Duration) {
        *self.0.lock() += d;
    }

    pub fn set(&self, t: SystemTime) {
        *self.0.lock() = t;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.0.lock()
    }
}

/// Which storage backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockStorageKind {
    Memory,
    File,
    Cache,
}

impl FromStr for LockStorageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" | "mem" => Ok(LockStorageKind::Memory),
            "file" => Ok(LockStorageKind::File),
            "cache" => Ok(LockStorageKind::Cache),
            _ => Err(format!("unknown lock storage {:?}", s)),
        }
    }
}

/// Lock storage section of a server configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct LsConfig {
    pub kind: LockStorageKind,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub cache_prefix: Option<String>,
}

/// Backend specific parameters for [`build_lock_storage`].
#[derive(Debug, Default)]
pub struct LsOptions {
    /// Directory for the `file` backend.
    pub path: Option<PathBuf>,
    /// Connected client for the `cache` backend.
    pub cache: Option<Box<dyn KeyValueCache>>,
    /// Key prefix for the `cache` backend.
    pub cache_prefix: Option<String>,
}

impl LsConfig {
    /// Build the configured backend. The cache client is not part of the
    /// configuration file, it has to be passed in.
    pub fn build(&self, cache: Option<Box<dyn KeyValueCache>>) -> LockResult<Box<dyn DavLockStorage>> {
        let options = LsOptions {
            path: self.path.clone(),
            cache,
            cache_prefix: self.cache_prefix.clone(),
        };
        build_lock_storage(self.kind, options)
    }
}

/// Instantiate a lock storage backend.
pub fn build_lock_storage(kind: LockStorageKind, options: LsOptions) -> LockResult<Box<dyn DavLockStorage>> {
    match kind {
        LockStorageKind::Memory => Ok(MemLs::new()),
        LockStorageKind::File => {
            let path = options.path.ok_or_else(|| {
                LockError::StorageUnavailable(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "file lock storage needs a directory",
                ))
            })?;
            Ok(FileLs::open(path)?)
        }
        LockStorageKind::Cache => {
            let cache = options.cache.ok_or_else(|| {
                LockError::StorageUnavailable(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "cache lock storage needs a cache client",
                ))
            })?;
            let prefix = options.cache_prefix.unwrap_or_else(|| "davlock".to_string());
            Ok(CacheLs::new(cache, prefix))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock(path: &str, scope: LockScope, depth: LockDepth) -> DavLock {
        DavLock {
            token: LockToken::new(),
            path: DavPath::new(path).unwrap(),
            depth,
            scope,
            owner: None,
            timeout: DavTimeout::Seconds(60),
            expire_time: SystemTime::now() + Duration::from_secs(60),
            principal: None,
        }
    }

    #[test]
    fn token_format() {
        let t = LockToken::new();
        let s = t.to_string();
        assert!(s.starts_with("opaquelocktoken:"));
        assert_eq!(s.parse::<LockToken>().unwrap(), t);
        assert_eq!(format!("<{}>", s).parse::<LockToken>().unwrap(), t);
        let urn = format!("urn:uuid:{}", t.uuid());
        assert_eq!(urn.parse::<LockToken>().unwrap(), t);
        assert!("opaquelocktoken:nope".parse::<LockToken>().is_err());
        assert!("DAV:no-lock".parse::<LockToken>().is_err());
    }

    #[test]
    fn governs() {
        let deep = lock("/a", LockScope::Exclusive, LockDepth::Infinity);
        let flat = lock("/a", LockScope::Exclusive, LockDepth::Zero);
        let child = DavPath::new("/a/b").unwrap();
        assert!(deep.governs(&child));
        assert!(!flat.governs(&child));
        assert!(flat.governs(&DavPath::new("/a").unwrap()));
        assert!(!deep.governs(&DavPath::new("/").unwrap()));
    }

    #[test]
    fn governs_ignores_url_prefix() {
        let mut flat = lock("/a", LockScope::Exclusive, LockDepth::Zero);
        flat.path = DavPath::from_str_and_prefix("/dav/a", "/dav").unwrap();
        assert!(flat.governs(&DavPath::new("/a").unwrap()));
        assert!(flat.conflicts_with(&DavPath::new("/a").unwrap(), LockScope::Shared, LockDepth::Zero));
        assert!(!flat.governs(&DavPath::new("/a/b").unwrap()));
    }

    #[test]
    fn commit_guard_releases_on_drop() {
        let released = std::cell::Cell::new(false);
        {
            let _guard = CommitGuard::new(|| released.set(true));
            assert!(!released.get());
        }
        assert!(released.get());
        drop(CommitGuard::none());
    }

    #[test]
    fn conflicts() {
        let a = DavPath::new("/a").unwrap();
        let shared = lock("/a/b", LockScope::Shared, LockDepth::Zero);
        assert!(!shared.conflicts_with(&a, LockScope::Shared, LockDepth::Infinity));
        assert!(shared.conflicts_with(&a, LockScope::Exclusive, LockDepth::Infinity));
        assert!(!shared.conflicts_with(&a, LockScope::Exclusive, LockDepth::Zero));
    }

    #[test]
    fn storage_kind() {
        assert_eq!("File".parse::<LockStorageKind>().unwrap(), LockStorageKind::File);
        assert!("shelve".parse::<LockStorageKind>().is_err());
        let cfg: LsConfig = serde_json::from_str(r#"{"kind":"memory"}"#).unwrap();
        assert_eq!(cfg.kind, LockStorageKind::Memory);
        assert!(cfg.build(None).is_ok());
        assert!(build_lock_storage(LockStorageKind::File, LsOptions::default()).is_err());
    }
}
