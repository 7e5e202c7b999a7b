use http::StatusCode as SC;
use http::{Request, Response};

use crate::body::Body;
use crate::fs::*;
use crate::{DavError, DavResult};

impl crate::DavInner {
    pub(crate) async fn handle_mkcol(&self, req: &Request<()>) -> DavResult<Response<Body>> {
        let path = self.path(req)?;
        if self.fs.exists(&path).await {
            return Err(DavError::Status(SC::METHOD_NOT_ALLOWED));
        }

        let tokens = self.check_write(req, &path, false).await?;
        self.check_member(&path, &tokens)?;

        match self.fs.create_dir(&path).await {
            // RFC 4918 9.3.1 MKCOL Status Codes.
            Err(FsError::Exists) => Err(DavError::Status(SC::METHOD_NOT_ALLOWED)),
            Err(FsError::NotFound) => Err(DavError::Status(SC::CONFLICT)),
            Err(e) => Err(e.into()),
            Ok(()) => {
                let mut res = Response::new(Body::empty());
                let mut loc = path.as_url_string_with_prefix();
                if !loc.ends_with('/') {
                    loc.push('/');
                }
                if let Ok(v) = http::HeaderValue::from_str(&loc) {
                    res.headers_mut().insert(http::header::CONTENT_LOCATION, v);
                }
                *res.status_mut() = SC::CREATED;
                Ok(res)
            }
        }
    }
}
