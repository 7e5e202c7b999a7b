//! Lock storage persisted in a directory, one JSON file per lock.
//!
//! The whole directory is loaded into memory when the storage is opened.
//! After that, every mutation is written to disk first (temp file, fsync,
//! rename) and only then applied to the in-memory table, all under the
//! table's write lock. Readers only ever see the in-memory table, so they
//! never observe a half-written record.
//!
//! Records that fail to parse are logged and skipped. They are left on
//! disk for inspection.
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use xmltree::Element;

use crate::davpath::DavPath;
use crate::errors::{LockError, LockResult};
use crate::ls::*;
use crate::memls::LockTable;

/// Serialized representation of a `DavLock`. Also used by `CacheLs`.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct LockRecord {
    token: String,
    root: String,
    #[serde(default)]
    prefix: String,
    depth: RecordDepth,
    scope: RecordScope,
    #[serde(default)]
    owner: Option<String>,
    /// `None` means infinite.
    timeout: Option<u32>,
    expire_time: DateTime<Utc>,
    #[serde(default)]
    principal: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum RecordDepth {
    Zero,
    Infinity,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum RecordScope {
    Exclusive,
    Shared,
}

fn invalid_data(msg: impl Into<String>) -> LockError {
    LockError::StorageUnavailable(io::Error::new(io::ErrorKind::InvalidData, msg.into()))
}

impl LockRecord {
    pub(crate) fn from_lock(lock: &DavLock) -> LockResult<LockRecord> {
        let owner = match lock.owner {
            Some(ref elem) => {
                let mut buf = Vec::new();
                let config = xmltree::EmitterConfig::new().write_document_declaration(false);
                elem.write_with_config(&mut buf, config)
                    .map_err(|e| invalid_data(e.to_string()))?;
                Some(String::from_utf8(buf).map_err(|e| invalid_data(e.to_string()))?)
            }
            None => None,
        };
        Ok(LockRecord {
            token: lock.token.to_string(),
            root: lock.path.as_url_string(),
            prefix: lock.path.prefix(),
            depth: match lock.depth {
                LockDepth::Zero => RecordDepth::Zero,
                LockDepth::Infinity => RecordDepth::Infinity,
            },
            scope: match lock.scope {
                LockScope::Exclusive => RecordScope::Exclusive,
                LockScope::Shared => RecordScope::Shared,
            },
            owner,
            timeout: match lock.timeout {
                DavTimeout::Seconds(s) => Some(s),
                DavTimeout::Infinite => None,
            },
            expire_time: DateTime::<Utc>::from(lock.expire_time),
            principal: lock.principal.clone(),
        })
    }

    pub(crate) fn into_lock(self) -> LockResult<DavLock> {
        let owner = match self.owner {
            Some(ref xml) => {
                Some(Element::parse(xml.as_bytes()).map_err(|e| invalid_data(e.to_string()))?)
            }
            None => None,
        };
        Ok(DavLock {
            token: self.token.parse().map_err(|_| invalid_data("bad lock token"))?,
            path: DavPath::from_str_and_prefix(&format!("{}{}", self.prefix, self.root), &self.prefix)?,
            depth: match self.depth {
                RecordDepth::Zero => LockDepth::Zero,
                RecordDepth::Infinity => LockDepth::Infinity,
            },
            scope: match self.scope {
                RecordScope::Exclusive => LockScope::Exclusive,
                RecordScope::Shared => LockScope::Shared,
            },
            owner,
            timeout: self.timeout.map(DavTimeout::Seconds).unwrap_or(DavTimeout::Infinite),
            expire_time: SystemTime::from(self.expire_time),
            principal: self.principal,
        })
    }
}

/// Lock storage that persists every lock as a file in a directory.
#[derive(Debug, Clone)]
pub struct FileLs {
    dir: Arc<PathBuf>,
    table: Arc<RwLock<LockTable>>,
}

impl FileLs {
    /// Open (or create) the lock directory and load all records in it.
    pub fn open(dir: impl AsRef<Path>) -> LockResult<Box<FileLs>> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut table = LockTable::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let lock = fs::read(&path)
                .map_err(LockError::from)
                .and_then(|data| Ok(serde_json::from_slice::<LockRecord>(&data)?))
                .and_then(|rec| rec.into_lock());
            match lock {
                Ok(lock) => {
                    if let Err(e) = table.insert(lock) {
                        warn!("FileLs: {}: {}", path.display(), e);
                    }
                }
                Err(e) => warn!("FileLs: skipping {}: {}", path.display(), e),
            }
        }
        debug!("FileLs: loaded {} locks from {}", table.len(), dir.display());

        Ok(Box::new(FileLs {
            dir: Arc::new(dir),
            table: Arc::new(RwLock::new(table)),
        }))
    }

    fn record_path(&self, token: &LockToken) -> PathBuf {
        self.dir.join(format!("{}.json", token.uuid().hyphenated()))
    }

    // Write to a temp file, sync, then rename over the final name.
    fn write_record(&self, lock: &DavLock) -> LockResult<()> {
        let data = serde_json::to_vec_pretty(&LockRecord::from_lock(lock)?)?;
        let tmp = self.dir.join(format!(".{}.tmp", lock.token.uuid().hyphenated()));
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, self.record_path(&lock.token))?;
        Ok(())
    }

    fn remove_record(&self, token: &LockToken) -> LockResult<()> {
        match fs::remove_file(self.record_path(token)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl DavLockStorage for FileLs {
    fn create(&self, lock: DavLock, _now: SystemTime) -> LockResult<LockToken> {
        let mut table = self.table.write();
        if table.contains(&lock.token) {
            return Err(LockError::DuplicateToken);
        }
        self.write_record(&lock)?;
        let token = lock.token;
        table.insert(lock)?;
        trace!("FileLs: lock {} created", token);
        Ok(token)
    }

    fn refresh(&self, token: &LockToken, expire_time: SystemTime, now: SystemTime) -> LockResult<DavLock> {
        let mut table = self.table.write();
        let mut lock = table.get(token, now).cloned().ok_or(LockError::NotFound)?;
        if expire_time > lock.expire_time {
            lock.expire_time = expire_time;
            self.write_record(&lock)?;
        }
        table.refresh(token, expire_time, now)
    }

    fn move_lock(&self, token: &LockToken, new_path: &DavPath, now: SystemTime) -> LockResult<DavLock> {
        let mut table = self.table.write();
        let mut lock = table.get(token, now).cloned().ok_or(LockError::NotFound)?;
        lock.path = new_path.clone();
        self.write_record(&lock)?;
        table.reroot(token, new_path, now)
    }

    fn delete(&self, token: &LockToken) -> LockResult<()> {
        let mut table = self.table.write();
        self.remove_record(token)?;
        table.remove(token);
        Ok(())
    }

    fn lookup(&self, token: &LockToken, now: SystemTime) -> LockResult<Option<DavLock>> {
        Ok(self.table.read().get(token, now).cloned())
    }

    fn find_locks_for_path(&self, path: &DavPath, now: SystemTime) -> LockResult<Vec<DavLock>> {
        Ok(self.table.read().find(path, now))
    }

    fn purge_expired(&self, now: SystemTime) -> LockResult<usize> {
        let mut table = self.table.write();
        let expired = table.expired(now);
        for token in &expired {
            self.remove_record(token)?;
            table.remove(token);
        }
        if !expired.is_empty() {
            debug!("FileLs: purged {} expired locks", expired.len());
        }
        Ok(expired.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn owner() -> Element {
        let mut e = Element::new("owner");
        e.children.push(xmltree::XMLNode::Text("alice".to_string()));
        e
    }

    fn lock(path: &str, expire_time: SystemTime) -> DavLock {
        DavLock {
            token: LockToken::new(),
            path: DavPath::new(path).unwrap(),
            depth: LockDepth::Infinity,
            scope: LockScope::Shared,
            owner: Some(owner()),
            timeout: DavTimeout::Seconds(3600),
            expire_time,
            principal: Some("alice".to_string()),
        }
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let now = SystemTime::now();
        let l = lock("/docs/a file.txt", now + Duration::from_secs(3600));
        {
            let ls = FileLs::open(dir.path()).unwrap();
            ls.create(l.clone(), now).unwrap();
        }
        let ls = FileLs::open(dir.path()).unwrap();
        let found = ls.lookup(&l.token, now).unwrap().unwrap();
        assert_eq!(found.token, l.token);
        assert_eq!(found.path, l.path);
        assert_eq!(found.depth, LockDepth::Infinity);
        assert_eq!(found.scope, LockScope::Shared);
        assert_eq!(found.principal.as_deref(), Some("alice"));
        assert_eq!(found.owner.as_ref().and_then(|o| o.get_text()).as_deref(), Some("alice"));
        assert_eq!(found.timeout, DavTimeout::Seconds(3600));
    }

    #[test]
    fn delete_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let now = SystemTime::now();
        let ls = FileLs::open(dir.path()).unwrap();
        let l = lock("/a", now + Duration::from_secs(60));
        ls.create(l.clone(), now).unwrap();
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
        ls.delete(&l.token).unwrap();
        ls.delete(&l.token).unwrap();
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn corrupt_records_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("garbage.json"), b"{ not json").unwrap();
        let ls = FileLs::open(dir.path()).unwrap();
        let now = SystemTime::now();
        assert!(ls.find_locks_for_path(&DavPath::new("/").unwrap(), now).unwrap().is_empty());
    }

    #[test]
    fn purge_and_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let now = SystemTime::now();
        let ls = FileLs::open(dir.path()).unwrap();
        let short = lock("/a", now + Duration::from_secs(10));
        let long = lock("/b", now + Duration::from_secs(100));
        ls.create(short.clone(), now).unwrap();
        ls.create(long.clone(), now).unwrap();

        let later = now + Duration::from_secs(20);
        let r = ls.refresh(&long.token, later + Duration::from_secs(1000), later).unwrap();
        assert_eq!(r.expire_time, later + Duration::from_secs(1000));
        assert_eq!(ls.purge_expired(later).unwrap(), 1);

        let ls = FileLs::open(dir.path()).unwrap();
        assert!(ls.lookup(&short.token, now).unwrap().is_none());
        let r = ls.lookup(&long.token, later).unwrap().unwrap();
        assert_eq!(r.expire_time, later + Duration::from_secs(1000));
    }
}
