use headers::HeaderMapExt;
use http::StatusCode as SC;
use http::{Request, Response};

use crate::body::Body;
use crate::util::DavMethod;
use crate::DavResult;

impl crate::DavInner {
    pub(crate) async fn handle_options(&self, req: &Request<()>) -> DavResult<Response<Body>> {
        let mut res = Response::new(Body::empty());
        {
            let h = res.headers_mut();
            h.insert("dav", http::HeaderValue::from_static("1, 2"));
            h.insert("ms-author-via", http::HeaderValue::from_static("DAV"));
            h.typed_insert(headers::ContentLength(0));
        }

        let path = self.path(req)?;
        let meta = self.fs.metadata(&path).await;
        let is_unmapped = meta.is_err();
        let is_file = meta.map(|m| m.is_file()).unwrap_or_default();

        // Helper to add method to array if method is in fact allowed.
        let mut v = Vec::new();
        let mut mm = |m: &'static str, y: DavMethod| {
            if self.allow.as_ref().is_none_or(|x| x.contains(y)) {
                v.push(m);
            }
        };

        if is_unmapped {
            mm("OPTIONS", DavMethod::Options);
            mm("MKCOL", DavMethod::MkCol);
            mm("PUT", DavMethod::Put);
            mm("LOCK", DavMethod::Lock);
        } else {
            if is_file {
                mm("HEAD", DavMethod::Head);
                mm("GET", DavMethod::Get);
                mm("PUT", DavMethod::Put);
            }
            mm("OPTIONS", DavMethod::Options);
            mm("PROPFIND", DavMethod::PropFind);
            mm("PROPPATCH", DavMethod::PropPatch);
            mm("COPY", DavMethod::Copy);
            if !path.is_root() {
                mm("MOVE", DavMethod::Move);
                mm("DELETE", DavMethod::Delete);
            }
            mm("LOCK", DavMethod::Lock);
            mm("UNLOCK", DavMethod::Unlock);
        }

        if let Ok(a) = http::HeaderValue::from_str(&v.join(",")) {
            res.headers_mut().insert(http::header::ALLOW, a);
        }
        *res.status_mut() = SC::OK;
        Ok(res)
    }
}
