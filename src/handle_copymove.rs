use headers::HeaderMapExt;
use http::StatusCode as SC;
use http::{Request, Response};

use crate::body::Body;
use crate::conditional::http_if_match;
use crate::davheaders::{self, Depth};
use crate::davpath::DavPath;
use crate::fs::*;
use crate::util::DavMethod;
use crate::{DavError, DavResult};

impl crate::DavInner {
    pub(crate) async fn handle_copymove(&self, req: &Request<()>, method: DavMethod) -> DavResult<Response<Body>> {
        // get and check headers.
        let overwrite = match req.headers().typed_try_get::<davheaders::Overwrite>() {
            Ok(o) => o.is_none_or(|o| o.0),
            Err(_) => return Err(DavError::Status(SC::BAD_REQUEST)),
        };
        let deep = match req.headers().typed_try_get::<Depth>() {
            Ok(Some(Depth::Infinity)) | Ok(None) => true,
            Ok(Some(Depth::Zero)) if method == DavMethod::Copy => false,
            _ => return Err(DavError::Status(SC::BAD_REQUEST)),
        };

        // decode and validate destination.
        let dest = match req.headers().typed_try_get::<davheaders::Destination>() {
            Ok(Some(d)) => d,
            _ => return Err(DavError::Status(SC::BAD_REQUEST)),
        };
        let dest = DavPath::from_str_and_prefix(&dest.0, &self.prefix)?;

        let path = self.path(req)?;
        if path == dest || path.is_ancestor_of(&dest) {
            return Err(DavError::Status(SC::FORBIDDEN));
        }
        if method == DavMethod::Move && path.is_root() {
            return Err(DavError::Status(SC::FORBIDDEN));
        }

        let meta = self.fs.metadata(&path).await?;
        if let Some(s) = http_if_match(req.headers(), req.method(), Some(meta.as_ref())) {
            return Err(DavError::Status(s));
        }

        // MOVE removes the source tree from its parent, COPY only reads it.
        let tokens = if method == DavMethod::Move {
            let tokens = self.check_write(req, &path, true).await?;
            self.check_member(&path, &tokens)?;
            tokens
        } else {
            let (ok, tokens) =
                crate::conditional::dav_if_match(req.headers(), self.fs.as_ref(), &self.lm, &path).await?;
            if !ok {
                return Err(DavError::Status(SC::PRECONDITION_FAILED));
            }
            tokens
        };

        // the destination gets replaced, so it must not be locked by others.
        let exists = self.fs.exists(&dest).await;
        if exists && !overwrite {
            return Err(DavError::Status(SC::PRECONDITION_FAILED));
        }
        if !self.has_parent(&dest).await {
            return Err(DavError::Status(SC::CONFLICT));
        }
        let principal = self.principal.as_deref();
        if exists {
            self.lm.check_tree_write_allowed(&dest, &tokens, principal)?;
        } else {
            self.lm.check_write_allowed(&dest, &tokens, principal)?;
        }
        self.check_member(&dest, &tokens)?;
        // the source's locks travel along and must fit in at the destination.
        if method == DavMethod::Move {
            self.lm.check_lock_transfer(&path, &dest)?;
        }

        if exists {
            self.fs.remove(&dest).await?;
            self.lm.remove_locks(&dest)?;
        }

        match method {
            DavMethod::Move => {
                self.fs.rename(&path, &dest).await?;
                let moved = self.lm.transfer_lock_on_move(&path, &dest)?;
                debug!("MOVE {} -> {}: {} lock(s) moved", path, dest, moved.len());
            }
            _ => {
                match self.fs.copy(&path, &dest, deep).await {
                    Ok(()) => {}
                    Err(FsError::NotFound) => return Err(DavError::Status(SC::CONFLICT)),
                    Err(e) => return Err(e.into()),
                }
                debug!("COPY {} -> {} (deep {})", path, dest, deep);
            }
        }

        let mut res = Response::new(Body::empty());
        *res.status_mut() = if exists { SC::NO_CONTENT } else { SC::CREATED };
        Ok(res)
    }
}
