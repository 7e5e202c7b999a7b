//! `Webdav` (RFC4918) is HTTP (GET/HEAD/PUT/DELETE) plus a bunch of extra methods.
//!
//! This crate implements a webdav handler for Rust, using the types from the
//! `http` crate, built around its locking subsystem: WebDAV write locks
//! (`LOCK`/`UNLOCK`), the `If:` header, and the lock checks that every
//! modifying method has to pass.
//!
//! The pieces:
//!
//! - [`DavHandler`]: the HTTP handler. It takes a `http::Request`, and returns
//!   a `http::Response`.
//! - [`DavLockManager`](lockmanager::DavLockManager): creates, refreshes,
//!   releases and checks locks. It decides conflicts, and serializes
//!   commits so that of two racing LOCK requests only one wins.
//! - lock storage: where the locks live. Included are three backends:
//!   - [`memls`]: ephemeral in-memory storage.
//!   - [`filels`]: one JSON record per lock in a directory, survives restarts.
//!   - [`cachels`]: records in a key-value cache shared by several processes.
//! - [`conditional`]: parsing and evaluation of the `If:` header.
//! - [`davpath`]: canonical resource paths, and the ancestor relation locks
//!   are built on.
//! - a filesystem for the resources themselves. [`memfs`] is included.
//!
//! Example server that serves an in-memory filesystem, with locks kept
//! in a directory:
//!
//! ```no_run
//! use std::convert::Infallible;
//! use dav_lockd::{DavHandler, lockmanager::DavLockManager, filels::FileLs, memfs::MemFs};
//!
//! #[tokio::main]
//! async fn main() {
//!     let storage = FileLs::open("/var/lib/dav-locks").unwrap();
//!     let dav_server = DavHandler::builder()
//!         .filesystem(MemFs::new())
//!         .lockmanager(DavLockManager::new(storage))
//!         .build_handler();
//!
//!     let addr: std::net::SocketAddr = ([127, 0, 0, 1], 4918).into();
//!     let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
//!     loop {
//!         let (stream, _) = listener.accept().await.unwrap();
//!         let dav_server = dav_server.clone();
//!         let io = hyper_util::rt::TokioIo::new(stream);
//!         tokio::task::spawn(async move {
//!             let service = hyper::service::service_fn(move |req| {
//!                 let dav_server = dav_server.clone();
//!                 async move { Ok::<_, Infallible>(dav_server.handle(req).await) }
//!             });
//!             let _ = hyper::server::conn::http1::Builder::new()
//!                 .serve_connection(io, service)
//!                 .await;
//!         });
//!     }
//! }
//! ```
#[macro_use]
extern crate log;

mod davhandler;
mod errors;
mod handle_copymove;
mod handle_delete;
mod handle_gethead;
mod handle_lock;
mod handle_mkcol;
mod handle_options;
mod handle_props;
mod handle_put;
mod multierror;
mod util;
mod xmltree_ext;

pub mod body;
pub mod cachels;
pub mod conditional;
pub mod davheaders;
pub mod davpath;
pub mod filels;
pub mod fs;
pub mod lockmanager;
pub mod ls;
pub mod memfs;
pub mod memls;

pub(crate) use crate::davhandler::DavInner;
pub(crate) use crate::errors::{DavError, DavResult};

pub use crate::davhandler::{DavConfig, DavHandler};
pub use crate::errors::{LockError, LockResult};
pub use crate::lockmanager::{DavLockManager, LockManagerConfig};
pub use crate::util::{DavMethod, DavMethodSet};
