//! Contains the structs and traits that define a filesystem backend.
//!
//! This is the resource provider the handler serves from. It knows nothing
//! about locks: the handler consults the lock manager before it calls any
//! of the mutating methods.
use std::fmt::Debug;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use dyn_clone::{DynClone, clone_trait_object};
use futures_util::{FutureExt, future, future::BoxFuture};
use http::StatusCode;

use crate::davpath::DavPath;

macro_rules! notimplemented_fut {
    ($method:expr) => {
        future::ready(Err(FsError::NotImplemented)).boxed()
    };
}

/// Errors generated by a filesystem implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    NotImplemented,
    GeneralFailure,
    Exists,
    NotFound,
    Forbidden,
    InsufficientStorage,
}

/// The Result type.
pub type FsResult<T> = std::result::Result<T, FsError>;

/// Future returned by almost all of the DavFileSystem methods.
pub type FsFuture<'a, T> = BoxFuture<'a, FsResult<T>>;

/// A webdav property.
#[derive(Debug, Clone, PartialEq)]
pub struct DavProp {
    /// Name of the property.
    pub name: String,
    /// XML prefix.
    pub prefix: Option<String>,
    /// XML namespace.
    pub namespace: Option<String>,
    /// Value of the property as raw XML.
    pub xml: Option<Vec<u8>>,
}

/// One entry of a directory listing.
#[derive(Debug)]
pub struct DavDirEntry {
    pub name: Vec<u8>,
    pub meta: Box<dyn DavMetaData>,
}

/// The trait that defines a filesystem.
pub trait DavFileSystem: Debug + Send + Sync + DynClone {
    /// Return the metadata of a file or directory.
    fn metadata<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, Box<dyn DavMetaData>>;

    /// List a directory.
    fn read_dir<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, Vec<DavDirEntry>>;

    /// Read the whole contents of a file.
    fn read_file<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, Bytes>;

    /// Create or replace a file. Returns `true` if it was created.
    /// The parent directory must exist.
    fn write_file<'a>(&'a self, path: &'a DavPath, data: Bytes) -> FsFuture<'a, bool>;

    /// Create a directory. The parent must exist.
    fn create_dir<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, ()>;

    /// Remove a file, or a directory and everything below it.
    fn remove<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, ()>;

    /// Rename a file or directory. The destination must not exist.
    #[allow(unused_variables)]
    fn rename<'a>(&'a self, from: &'a DavPath, to: &'a DavPath) -> FsFuture<'a, ()> {
        notimplemented_fut!("rename")
    }

    /// Copy a file or directory. If `deep` is false, only the directory
    /// itself is copied, not its members. The destination must not exist.
    #[allow(unused_variables)]
    fn copy<'a>(&'a self, from: &'a DavPath, to: &'a DavPath, deep: bool) -> FsFuture<'a, ()> {
        notimplemented_fut!("copy")
    }

    /// Set and remove dead properties.
    #[allow(unused_variables)]
    fn patch_props<'a>(
        &'a self,
        path: &'a DavPath,
        set: Vec<DavProp>,
        remove: Vec<DavProp>,
    ) -> FsFuture<'a, Vec<(StatusCode, DavProp)>> {
        notimplemented_fut!("patch_props")
    }

    /// Get all dead properties.
    #[allow(unused_variables)]
    fn get_props<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, Vec<DavProp>> {
        future::ready(Ok(Vec::new())).boxed()
    }

    /// Does the resource exist.
    fn exists<'a>(&'a self, path: &'a DavPath) -> BoxFuture<'a, bool> {
        self.metadata(path).map(|r| r.is_ok()).boxed()
    }

    /// Current etag of the resource, if it exists.
    fn get_etag<'a>(&'a self, path: &'a DavPath) -> BoxFuture<'a, Option<String>> {
        self.metadata(path).map(|r| r.ok().and_then(|m| m.etag())).boxed()
    }
}

clone_trait_object! {DavFileSystem}

/// Metadata of a file or directory.
pub trait DavMetaData: Debug + Send + Sync {
    /// Size of the file.
    fn len(&self) -> u64;
    /// Modification time.
    fn modified(&self) -> FsResult<SystemTime>;
    /// Is it a directory.
    fn is_dir(&self) -> bool;

    /// Simplistic implementation of etag(). Apache style: length and
    /// modification time.
    fn etag(&self) -> Option<String> {
        let t = self.modified().ok()?.duration_since(UNIX_EPOCH).ok()?;
        let t = t.as_secs() * 1000000 + t.subsec_nanos() as u64 / 1000;
        if self.is_file() && self.len() > 0 {
            Some(format!("{:x}-{:x}", self.len(), t))
        } else {
            Some(format!("{:x}", t))
        }
    }

    /// Is it a file.
    fn is_file(&self) -> bool {
        !self.is_dir()
    }

    /// Is the file empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::error::Error for FsError {}

impl std::fmt::Display for FsError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            FsError::NotImplemented => write!(f, "not implemented"),
            FsError::GeneralFailure => write!(f, "general failure"),
            FsError::Exists => write!(f, "file exists"),
            FsError::NotFound => write!(f, "file not found"),
            FsError::Forbidden => write!(f, "forbidden"),
            FsError::InsufficientStorage => write!(f, "insufficient storage"),
        }
    }
}
