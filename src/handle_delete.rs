use headers::HeaderMapExt;
use http::StatusCode as SC;
use http::{Request, Response};

use crate::body::Body;
use crate::conditional::http_if_match;
use crate::davheaders::Depth;
use crate::{DavError, DavResult};

impl crate::DavInner {
    pub(crate) async fn handle_delete(&self, req: &Request<()>) -> DavResult<Response<Body>> {
        // RFC4918 9.6.1 DELETE for Collections: only Depth: infinity.
        match req.headers().typed_try_get::<Depth>() {
            Ok(Some(Depth::Infinity)) | Ok(None) => {}
            _ => return Err(DavError::Status(SC::BAD_REQUEST)),
        }

        let path = self.path(req)?;
        if path.is_root() {
            return Err(DavError::Status(SC::FORBIDDEN));
        }
        let meta = self.fs.metadata(&path).await?;

        if let Some(s) = http_if_match(req.headers(), req.method(), Some(meta.as_ref())) {
            return Err(DavError::Status(s));
        }

        // the resource, everything below it, and its parent's membership.
        let tokens = self.check_write(req, &path, true).await?;
        self.check_member(&path, &tokens)?;

        self.fs.remove(&path).await?;
        let n = self.lm.remove_locks(&path)?;
        debug!("DELETE {}: removed, {} lock(s) dropped", path, n);

        let mut res = Response::new(Body::empty());
        *res.status_mut() = SC::NO_CONTENT;
        Ok(res)
    }
}
