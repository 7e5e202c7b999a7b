use headers::HeaderMapExt;
use http::{Request, Response, StatusCode};

use crate::body::Body;
use crate::conditional::http_if_match;
use crate::davheaders::ETag;
use crate::fs::*;
use crate::util::systemtime_to_httpdate;
use crate::DavResult;

impl crate::DavInner {
    pub(crate) async fn handle_get(&self, req: &Request<()>) -> DavResult<Response<Body>> {
        let head = req.method() == http::Method::HEAD;
        let path = self.path(req)?;
        let meta = self.fs.metadata(&path).await?;

        if let Some(s) = http_if_match(req.headers(), req.method(), Some(meta.as_ref())) {
            let mut res = Response::new(Body::empty());
            *res.status_mut() = s;
            return Ok(res);
        }

        let mut res = Response::new(Body::empty());
        if let Some(etag) = ETag::from_meta(meta.as_ref()) {
            res.headers_mut().typed_insert(etag);
        }
        if let Ok(modified) = meta.modified() {
            if let Ok(v) = http::HeaderValue::from_str(&systemtime_to_httpdate(modified)) {
                res.headers_mut().insert(http::header::LAST_MODIFIED, v);
            }
        }

        // a collection is listed one member per line.
        let (body, ctype) = if meta.is_dir() {
            let mut listing = String::new();
            for entry in self.fs.read_dir(&path).await? {
                listing.push_str(&String::from_utf8_lossy(&entry.name));
                if entry.meta.is_dir() {
                    listing.push('/');
                }
                listing.push('\n');
            }
            (bytes::Bytes::from(listing), "text/plain; charset=utf-8")
        } else {
            (self.fs.read_file(&path).await?, path.get_mime_type_str())
        };

        res.headers_mut().typed_insert(headers::ContentLength(body.len() as u64));
        if let Ok(v) = http::HeaderValue::from_str(ctype) {
            res.headers_mut().insert(http::header::CONTENT_TYPE, v);
        }
        *res.status_mut() = StatusCode::OK;
        if !head {
            *res.body_mut() = Body::from(body);
        }
        Ok(res)
    }
}
