//! Simple in-memory filesystem.
//!
//! This implementation has state, so if you create a
//! new instance in a handler(), it will be empty every time.
//!
//! This means you have to create the instance once, using `MemFs::new`, store
//! it in your handler struct, and clone() it every time you pass
//! it to the DavHandler. As a MemFs struct is just a handle, cloning is cheap.
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use futures_util::{FutureExt, future};
use http::StatusCode;
use parking_lot::Mutex;

use crate::davpath::DavPath;
use crate::fs::*;

/// Ephemeral in-memory filesystem.
#[derive(Debug, Clone)]
pub struct MemFs {
    inner: Arc<Mutex<MemFsInner>>,
}

#[derive(Debug)]
struct MemFsInner {
    // keyed by the decoded path.
    nodes: BTreeMap<Vec<u8>, MemFsNode>,
    version: u64,
}

#[derive(Debug, Clone)]
struct MemFsNode {
    is_dir: bool,
    data: Bytes,
    mtime: SystemTime,
    version: u64,
    props: HashMap<String, DavProp>,
}

#[derive(Debug, Clone)]
struct MemFsMetaData {
    is_dir: bool,
    len: u64,
    mtime: SystemTime,
    version: u64,
}

impl MemFsNode {
    fn new(is_dir: bool, data: Bytes, version: u64) -> MemFsNode {
        MemFsNode {
            is_dir,
            data,
            mtime: SystemTime::now(),
            version,
            props: HashMap::new(),
        }
    }

    fn meta(&self) -> Box<dyn DavMetaData> {
        Box::new(MemFsMetaData {
            is_dir: self.is_dir,
            len: self.data.len() as u64,
            mtime: self.mtime,
            version: self.version,
        })
    }
}

fn prop_key(ns: &Option<String>, name: &str) -> String {
    ns.to_owned().unwrap_or_default() + name
}

// key prefix of everything below `path`.
fn subtree_prefix(path: &[u8]) -> Vec<u8> {
    let mut p = path.to_vec();
    if p != b"/" {
        p.push(b'/');
    }
    p
}

impl MemFsInner {
    fn next_version(&mut self) -> u64 {
        self.version += 1;
        self.version
    }

    fn get(&self, path: &DavPath) -> FsResult<&MemFsNode> {
        self.nodes.get(path.as_bytes()).ok_or(FsError::NotFound)
    }

    fn check_parent(&self, path: &DavPath) -> FsResult<()> {
        if path.is_root() {
            return Err(FsError::Forbidden);
        }
        match self.nodes.get(path.parent().as_bytes()) {
            Some(n) if n.is_dir => Ok(()),
            Some(_) => Err(FsError::Forbidden),
            None => Err(FsError::NotFound),
        }
    }

    // all keys at or below `path`.
    fn subtree(&self, path: &[u8]) -> Vec<Vec<u8>> {
        let prefix = subtree_prefix(path);
        let mut keys = vec![path.to_vec()];
        keys.extend(
            self.nodes
                .range(prefix.clone()..)
                .take_while(|(k, _)| k.starts_with(&prefix))
                .map(|(k, _)| k.clone())
                .filter(|k| k.as_slice() != path),
        );
        keys
    }
}

impl MemFs {
    /// Create a new "memfs" filesystem.
    pub fn new() -> Box<MemFs> {
        let mut nodes = BTreeMap::new();
        nodes.insert(b"/".to_vec(), MemFsNode::new(true, Bytes::new(), 0));
        Box::new(MemFs {
            inner: Arc::new(Mutex::new(MemFsInner { nodes, version: 0 })),
        })
    }

    fn do_write(&self, path: &DavPath, data: Bytes) -> FsResult<bool> {
        let inner = &mut *self.inner.lock();
        inner.check_parent(path)?;
        let version = inner.next_version();
        match inner.nodes.get_mut(path.as_bytes()) {
            Some(node) if node.is_dir => Err(FsError::Forbidden),
            Some(node) => {
                node.data = data;
                node.mtime = SystemTime::now();
                node.version = version;
                Ok(false)
            }
            None => {
                inner.nodes.insert(path.as_bytes().to_vec(), MemFsNode::new(false, data, version));
                Ok(true)
            }
        }
    }

    fn do_create_dir(&self, path: &DavPath) -> FsResult<()> {
        let inner = &mut *self.inner.lock();
        if inner.nodes.contains_key(path.as_bytes()) {
            return Err(FsError::Exists);
        }
        inner.check_parent(path)?;
        let version = inner.next_version();
        inner
            .nodes
            .insert(path.as_bytes().to_vec(), MemFsNode::new(true, Bytes::new(), version));
        Ok(())
    }

    fn do_remove(&self, path: &DavPath) -> FsResult<()> {
        let inner = &mut *self.inner.lock();
        if path.is_root() {
            return Err(FsError::Forbidden);
        }
        inner.get(path)?;
        for key in inner.subtree(path.as_bytes()) {
            inner.nodes.remove(&key);
        }
        Ok(())
    }

    // copy or move the subtree at `from` to `to`.
    fn transfer(&self, from: &DavPath, to: &DavPath, deep: bool, remove: bool) -> FsResult<()> {
        let inner = &mut *self.inner.lock();
        inner.get(from)?;
        if inner.nodes.contains_key(to.as_bytes()) {
            return Err(FsError::Exists);
        }
        inner.check_parent(to)?;
        if from.is_ancestor_or_self(to) {
            return Err(FsError::Forbidden);
        }
        let keys = if deep {
            inner.subtree(from.as_bytes())
        } else {
            vec![from.as_bytes().to_vec()]
        };
        let from_len = from.as_bytes().len();
        for key in keys {
            let mut node = match remove {
                true => inner.nodes.remove(&key),
                false => inner.nodes.get(&key).cloned(),
            }
            .ok_or(FsError::GeneralFailure)?;
            if !remove {
                node.version = inner.next_version();
                node.mtime = SystemTime::now();
            }
            let mut dest = to.as_bytes().to_vec();
            dest.extend_from_slice(&key[from_len..]);
            inner.nodes.insert(dest, node);
        }
        Ok(())
    }

    fn do_patch_props(
        &self,
        path: &DavPath,
        set: Vec<DavProp>,
        remove: Vec<DavProp>,
    ) -> FsResult<Vec<(StatusCode, DavProp)>> {
        let inner = &mut *self.inner.lock();
        let node = inner.nodes.get_mut(path.as_bytes()).ok_or(FsError::NotFound)?;
        let mut res = Vec::new();
        for p in remove {
            node.props.remove(&prop_key(&p.namespace, &p.name));
            res.push((StatusCode::OK, p));
        }
        for p in set {
            node.props.insert(prop_key(&p.namespace, &p.name), p.clone());
            res.push((StatusCode::OK, DavProp { xml: None, ..p }));
        }
        Ok(res)
    }
}

impl DavFileSystem for MemFs {
    fn metadata<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, Box<dyn DavMetaData>> {
        let r = self.inner.lock().get(path).map(|n| n.meta());
        future::ready(r).boxed()
    }

    fn read_dir<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, Vec<DavDirEntry>> {
        let inner = self.inner.lock();
        let r = match inner.get(path) {
            Ok(node) if !node.is_dir => Err(FsError::Forbidden),
            Ok(_) => {
                let prefix = subtree_prefix(path.as_bytes());
                Ok(inner
                    .nodes
                    .range(prefix.clone()..)
                    .take_while(|(k, _)| k.starts_with(&prefix))
                    .filter(|(k, _)| k.len() > prefix.len() && !k[prefix.len()..].contains(&b'/'))
                    .map(|(k, n)| DavDirEntry {
                        name: k[prefix.len()..].to_vec(),
                        meta: n.meta(),
                    })
                    .collect())
            }
            Err(e) => Err(e),
        };
        future::ready(r).boxed()
    }

    fn read_file<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, Bytes> {
        let r = match self.inner.lock().get(path) {
            Ok(node) if node.is_dir => Err(FsError::Forbidden),
            Ok(node) => Ok(node.data.clone()),
            Err(e) => Err(e),
        };
        future::ready(r).boxed()
    }

    fn write_file<'a>(&'a self, path: &'a DavPath, data: Bytes) -> FsFuture<'a, bool> {
        future::ready(self.do_write(path, data)).boxed()
    }

    fn create_dir<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, ()> {
        future::ready(self.do_create_dir(path)).boxed()
    }

    fn remove<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, ()> {
        future::ready(self.do_remove(path)).boxed()
    }

    fn rename<'a>(&'a self, from: &'a DavPath, to: &'a DavPath) -> FsFuture<'a, ()> {
        future::ready(self.transfer(from, to, true, true)).boxed()
    }

    fn copy<'a>(&'a self, from: &'a DavPath, to: &'a DavPath, deep: bool) -> FsFuture<'a, ()> {
        future::ready(self.transfer(from, to, deep, false)).boxed()
    }

    fn patch_props<'a>(
        &'a self,
        path: &'a DavPath,
        set: Vec<DavProp>,
        remove: Vec<DavProp>,
    ) -> FsFuture<'a, Vec<(StatusCode, DavProp)>> {
        future::ready(self.do_patch_props(path, set, remove)).boxed()
    }

    fn get_props<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, Vec<DavProp>> {
        let r = self.inner.lock().get(path).map(|n| n.props.values().cloned().collect());
        future::ready(r).boxed()
    }
}

impl DavMetaData for MemFsMetaData {
    fn len(&self) -> u64 {
        self.len
    }

    fn modified(&self) -> FsResult<SystemTime> {
        Ok(self.mtime)
    }

    fn is_dir(&self) -> bool {
        self.is_dir
    }

    // mtime can have a coarse resolution, the version counter can't.
    fn etag(&self) -> Option<String> {
        Some(format!("{:x}-{:x}", self.len, self.version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> DavPath {
        DavPath::new(s).unwrap()
    }

    #[tokio::test]
    async fn write_and_read() {
        let fs = MemFs::new();
        assert!(fs.write_file(&p("/a.txt"), Bytes::from("hello")).await.unwrap());
        let etag1 = fs.get_etag(&p("/a.txt")).await.unwrap();
        assert!(!fs.write_file(&p("/a.txt"), Bytes::from("world")).await.unwrap());
        let etag2 = fs.get_etag(&p("/a.txt")).await.unwrap();
        assert_ne!(etag1, etag2);
        assert_eq!(fs.read_file(&p("/a.txt")).await.unwrap(), Bytes::from("world"));
        assert_eq!(
            fs.write_file(&p("/nodir/a.txt"), Bytes::new()).await.unwrap_err(),
            FsError::NotFound
        );
    }

    #[tokio::test]
    async fn dirs() {
        let fs = MemFs::new();
        fs.create_dir(&p("/d")).await.unwrap();
        assert_eq!(fs.create_dir(&p("/d")).await.unwrap_err(), FsError::Exists);
        fs.create_dir(&p("/d/e")).await.unwrap();
        fs.write_file(&p("/d/e/f"), Bytes::from("x")).await.unwrap();
        fs.write_file(&p("/d/g"), Bytes::from("y")).await.unwrap();
        fs.write_file(&p("/dd"), Bytes::from("z")).await.unwrap();
        let mut names: Vec<_> = fs.read_dir(&p("/d")).await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        names.sort();
        assert_eq!(names, vec![b"e".to_vec(), b"g".to_vec()]);

        fs.copy(&p("/d"), &p("/c"), true).await.unwrap();
        assert!(fs.exists(&p("/c/e/f")).await);
        fs.rename(&p("/d"), &p("/m")).await.unwrap();
        assert!(!fs.exists(&p("/d/e/f")).await);
        assert!(fs.exists(&p("/m/e/f")).await);
        fs.remove(&p("/m")).await.unwrap();
        assert!(!fs.exists(&p("/m/g")).await);
        assert!(fs.exists(&p("/dd")).await);
    }
}
