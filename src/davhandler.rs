use std::error::Error as StdError;
use std::sync::Arc;

use bytes::{Buf, Bytes};
use http::{Request, Response, StatusCode};
use http_body::Body as HttpBody;

use crate::body::{self, Body};
use crate::conditional::dav_if_match;
use crate::davpath::DavPath;
use crate::errors::{DavError, LockError};
use crate::fs::*;
use crate::lockmanager::DavLockManager;
use crate::ls::LockToken;
use crate::memfs::MemFs;
use crate::memls::MemLs;
use crate::multierror;
use crate::util::{DavMethod, DavMethodSet, dav_method};
use crate::DavResult;

// request bodies of everything but PUT are small XML documents.
const MAX_XML_BODY: usize = 65536;
const MAX_PUT_BODY: usize = 64 * 1024 * 1024;

/// WebDAV request handler.
///
/// Cheap to clone; all clones share one filesystem and one lock manager.
#[derive(Clone, Default)]
pub struct DavHandler {
    pub(crate) config: Arc<DavConfig>,
}

/// Configuration of the handler.
#[derive(Clone, Default)]
pub struct DavConfig {
    pub(crate) prefix: Option<String>,
    pub(crate) fs: Option<Box<dyn DavFileSystem>>,
    pub(crate) lm: Option<DavLockManager>,
    // None means all methods.
    pub(crate) allow: Option<DavMethodSet>,
    pub(crate) principal: Option<String>,
}

impl DavConfig {
    /// An empty configuration; every setting falls back to its default.
    pub fn new() -> Self {
        Self::default()
    }

    /// Turn this configuration into a [`DavHandler`].
    ///
    /// Without a filesystem an empty in-memory filesystem is used, and
    /// without a lock manager one backed by in-memory lock storage.
    pub fn build_handler(mut self) -> DavHandler {
        self.fs.get_or_insert_with(|| MemFs::new() as Box<dyn DavFileSystem>);
        self.lm.get_or_insert_with(|| DavLockManager::new(MemLs::new()));
        DavHandler { config: Arc::new(self) }
    }

    /// URL prefix under which the resources live, e.g. `/dav`.
    pub fn strip_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Filesystem that holds the resources.
    pub fn filesystem(mut self, fs: Box<dyn DavFileSystem>) -> Self {
        self.fs = Some(fs);
        self
    }

    /// Lock manager, and with it the lock storage backend.
    pub fn lockmanager(mut self, lm: DavLockManager) -> Self {
        self.lm = Some(lm);
        self
    }

    /// Restrict the methods that are served. Others get a 405.
    pub fn methods(mut self, allow: DavMethodSet) -> Self {
        self.allow = Some(allow);
        self
    }

    /// The authenticated user. Locks created by this request are
    /// recorded under this name, and only this user can release them.
    pub fn principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }

    fn merge(&self, new: Self) -> Self {
        Self {
            prefix: new.prefix.or_else(|| self.prefix.clone()),
            fs: new.fs.or_else(|| self.fs.clone()),
            lm: new.lm.or_else(|| self.lm.clone()),
            allow: new.allow.or(self.allow),
            principal: new.principal.or_else(|| self.principal.clone()),
        }
    }
}

// Per-request state, with every default resolved.
pub(crate) struct DavInner {
    pub prefix: String,
    pub fs: Box<dyn DavFileSystem>,
    pub lm: DavLockManager,
    pub allow: Option<DavMethodSet>,
    pub principal: Option<String>,
}

impl DavHandler {
    /// A handler serving an empty in-memory filesystem with in-memory locks.
    pub fn new() -> Self {
        DavConfig::new().build_handler()
    }

    /// Start building a handler.
    pub fn builder() -> DavConfig {
        DavConfig::new()
    }

    /// The lock manager this handler uses.
    pub fn lockmanager(&self) -> Option<&DavLockManager> {
        self.config.lm.as_ref()
    }

    /// Serve one request.
    pub async fn handle<ReqBody, ReqData, ReqError>(&self, req: Request<ReqBody>) -> Response<Body>
    where
        ReqData: Buf + Send + 'static,
        ReqError: StdError + Send + Sync + 'static,
        ReqBody: HttpBody<Data = ReqData, Error = ReqError>,
    {
        let inner = DavInner::new(self.config.as_ref().clone());
        inner.handle(req).await
    }

    /// Serve one request with parts of the configuration replaced,
    /// typically the `principal` of an authenticated user.
    pub async fn handle_with<ReqBody, ReqData, ReqError>(
        &self,
        config: DavConfig,
        req: Request<ReqBody>,
    ) -> Response<Body>
    where
        ReqData: Buf + Send + 'static,
        ReqError: StdError + Send + Sync + 'static,
        ReqBody: HttpBody<Data = ReqData, Error = ReqError>,
    {
        let inner = DavInner::new(self.config.merge(config));
        inner.handle(req).await
    }
}

impl DavInner {
    pub fn new(cfg: DavConfig) -> Self {
        let DavConfig {
            prefix,
            fs,
            lm,
            allow,
            principal,
        } = cfg;
        Self {
            prefix: prefix.unwrap_or_default(),
            fs: fs.unwrap_or_else(|| MemFs::new() as Box<dyn DavFileSystem>),
            lm: lm.unwrap_or_else(|| DavLockManager::new(MemLs::new())),
            allow,
            principal,
        }
    }

    // helper.
    pub(crate) async fn has_parent<'a>(&'a self, path: &'a DavPath) -> bool {
        let p = path.parent();
        self.fs.metadata(&p).await.map(|m| m.is_dir()).unwrap_or(false)
    }

    // helper.
    pub(crate) fn path(&self, req: &Request<()>) -> DavResult<DavPath> {
        Ok(DavPath::from_uri_and_prefix(req.uri(), &self.prefix)?)
    }

    // Evaluate the If: header for `path`, then see if the locks on `path`
    // allow a write with the submitted tokens. With `deep`, locks below
    // `path` count too. Returns the submitted tokens.
    pub(crate) async fn check_write(&self, req: &Request<()>, path: &DavPath, deep: bool) -> DavResult<Vec<LockToken>> {
        let (ok, tokens) = dav_if_match(req.headers(), self.fs.as_ref(), &self.lm, path).await?;
        if !ok {
            return Err(StatusCode::PRECONDITION_FAILED.into());
        }
        if deep {
            self.lm.check_tree_write_allowed(path, &tokens, self.principal.as_deref())?;
        } else {
            self.lm.check_write_allowed(path, &tokens, self.principal.as_deref())?;
        }
        Ok(tokens)
    }

    // Adding or removing `path` changes the membership of its parent
    // collection, which needs the parent's lock tokens as well.
    pub(crate) fn check_member(&self, path: &DavPath, tokens: &[LockToken]) -> DavResult<()> {
        if !path.is_root() {
            self.lm.check_write_allowed(&path.parent(), tokens, self.principal.as_deref())?;
        }
        Ok(())
    }

    // Errors become a bare status response, lock errors a 423 body.
    async fn handle<ReqBody, ReqData, ReqError>(self, req: Request<ReqBody>) -> Response<Body>
    where
        ReqBody: HttpBody<Data = ReqData, Error = ReqError>,
        ReqData: Buf + Send + 'static,
        ReqError: StdError + Send + Sync + 'static,
    {
        match self.dispatch(req).await {
            Ok(resp) => {
                debug!("== END REQUEST result OK");
                resp
            }
            Err(err) => {
                debug!("== END REQUEST result {:?}", err);
                if let DavError::Lock(LockError::Locked(ref locks) | LockError::Conflict(ref locks)) = err {
                    if let Ok(resp) = multierror::locked_response(locks) {
                        return resp;
                    }
                }
                let mut resp = Response::new(Body::empty());
                *resp.status_mut() = err.statuscode();
                resp.headers_mut()
                    .insert(http::header::CONTENT_LENGTH, http::HeaderValue::from_static("0"));
                if err.must_close() {
                    resp.headers_mut()
                        .insert(http::header::CONNECTION, http::HeaderValue::from_static("close"));
                }
                resp
            }
        }
    }

    async fn dispatch<ReqBody, ReqData, ReqError>(self, req: Request<ReqBody>) -> DavResult<Response<Body>>
    where
        ReqBody: HttpBody<Data = ReqData, Error = ReqError>,
        ReqData: Buf + Send + 'static,
        ReqError: StdError + Send + Sync + 'static,
    {
        let (req, body) = {
            let (parts, body) = req.into_parts();
            (Request::from_parts(parts, ()), body)
        };

        let method = dav_method(req.method()).inspect_err(|_| {
            debug!("unknown method {} on {}", req.method(), req.uri());
        })?;
        if self.allow.is_some_and(|a| !a.contains(method)) {
            debug!("{:?} is not enabled, refusing {}", method, req.uri());
            return Err(DavError::StatusClose(StatusCode::METHOD_NOT_ALLOWED));
        }
        let path = self.path(&req)?;

        let max_size = match method {
            DavMethod::Put => MAX_PUT_BODY,
            _ => MAX_XML_BODY,
        };
        let body_data: Bytes = match body::read_body(body, max_size).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                return Err(DavError::StatusClose(StatusCode::PAYLOAD_TOO_LARGE));
            }
            Err(e) => return Err(e.into()),
        };

        let takes_body = matches!(
            method,
            DavMethod::Put | DavMethod::PropFind | DavMethod::PropPatch | DavMethod::Lock
        );
        if !takes_body && !body_data.is_empty() {
            return Err(StatusCode::UNSUPPORTED_MEDIA_TYPE.into());
        }

        debug!("== START REQUEST {:?} {}", method, path);

        match method {
            DavMethod::Options => self.handle_options(&req).await,
            DavMethod::PropFind => self.handle_propfind(&req, &body_data).await,
            DavMethod::PropPatch => self.handle_proppatch(&req, &body_data).await,
            DavMethod::MkCol => self.handle_mkcol(&req).await,
            DavMethod::Delete => self.handle_delete(&req).await,
            DavMethod::Lock => self.handle_lock(&req, &body_data).await,
            DavMethod::Unlock => self.handle_unlock(&req).await,
            DavMethod::Head | DavMethod::Get => self.handle_get(&req).await,
            DavMethod::Copy | DavMethod::Move => self.handle_copymove(&req, method).await,
            DavMethod::Put => self.handle_put(&req, body_data).await,
        }
    }
}
