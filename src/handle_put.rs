use bytes::Bytes;
use headers::HeaderMapExt;
use http::StatusCode as SC;
use http::{Request, Response};

use crate::body::Body;
use crate::conditional::http_if_match;
use crate::davheaders::ETag;
use crate::fs::*;
use crate::util::systemtime_to_httpdate;
use crate::{DavError, DavResult};

impl crate::DavInner {
    pub(crate) async fn handle_put(&self, req: &Request<()>, data: Bytes) -> DavResult<Response<Body>> {
        let path = self.path(req)?;
        let meta = self.fs.metadata(&path).await.ok();

        if meta.as_ref().is_some_and(|m| m.is_dir()) {
            return Err(DavError::StatusClose(SC::METHOD_NOT_ALLOWED));
        }

        // check the HTTP conditionals first, then If: and the locks.
        if let Some(s) = http_if_match(req.headers(), req.method(), meta.as_deref()) {
            return Err(DavError::StatusClose(s));
        }
        let tokens = self.check_write(req, &path, false).await?;

        if meta.is_none() {
            if !self.has_parent(&path).await {
                return Err(DavError::StatusClose(SC::CONFLICT));
            }
            self.check_member(&path, &tokens)?;
        }

        let len = data.len();
        let created = match self.fs.write_file(&path, data).await {
            Ok(c) => c,
            Err(FsError::NotFound) => return Err(DavError::StatusClose(SC::CONFLICT)),
            Err(e) => return Err(e.into()),
        };
        debug!("PUT {}: {} bytes, created {}", path, len, created);

        let mut res = Response::new(Body::empty());
        *res.status_mut() = if created { SC::CREATED } else { SC::NO_CONTENT };

        if let Ok(m) = self.fs.metadata(&path).await {
            if let Some(etag) = ETag::from_meta(m.as_ref()) {
                res.headers_mut().typed_insert(etag);
            }
            if let Ok(modified) = m.modified() {
                if let Ok(v) = http::HeaderValue::from_str(&systemtime_to_httpdate(modified)) {
                    res.headers_mut().insert(http::header::LAST_MODIFIED, v);
                }
            }
        }
        if created {
            res.headers_mut().typed_insert(headers::ContentLength(0));
        }
        Ok(res)
    }
}
