use http::{Response, StatusCode};
use xmltree::Element;

use crate::body::Body;
use crate::davpath::DavPath;
use crate::errors::LockError;
use crate::ls::DavLock;
use crate::xmltree_ext::{ElementExt, NS_DAV_URI};
use crate::DavResult;

const XML_CONTENT_TYPE: &str = "application/xml; charset=utf-8";

fn status_line(sc: StatusCode) -> String {
    format!("HTTP/1.1 {}", sc)
}

/// Collects per-resource results into a `D:multistatus` body.
pub(crate) struct MultiError {
    elem: Element,
    count: usize,
}

impl MultiError {
    pub fn new() -> MultiError {
        MultiError {
            elem: Element::new2("D:multistatus").ns("D", NS_DAV_URI),
            count: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn add_status(&mut self, path: &DavPath, sc: StatusCode) {
        self.add_response(path, sc, None, None);
    }

    /// Add a `D:response` with an optional `D:error` precondition and description.
    pub fn add_response(
        &mut self,
        path: &DavPath,
        sc: StatusCode,
        error: Option<Element>,
        description: Option<String>,
    ) {
        let mut resp = Element::new2("D:response");
        resp.push_elem(Element::new_text("D:href", path.as_url_string_with_prefix()));
        resp.push_elem(Element::new_text("D:status", status_line(sc)));
        if let Some(error) = error {
            let mut e = Element::new2("D:error");
            e.push_elem(error);
            resp.push_elem(e);
        }
        if let Some(d) = description {
            resp.push_elem(Element::new_text("D:responsedescription", d));
        }
        self.elem.push_elem(resp);
        self.count += 1;
    }

    /// Add a `D:response` element built elsewhere (PROPFIND).
    pub fn push_raw(&mut self, resp: Element) {
        self.elem.push_elem(resp);
        self.count += 1;
    }

    pub fn into_response(self, status: StatusCode) -> DavResult<Response<Body>> {
        let mut buf = Vec::new();
        self.elem.write_doc(&mut buf)?;
        let mut res = Response::new(Body::from(buf));
        *res.status_mut() = status;
        res.headers_mut()
            .insert(http::header::CONTENT_TYPE, http::HeaderValue::from_static(XML_CONTENT_TYPE));
        Ok(res)
    }
}

// <D:name><D:href>root</D:href>...</D:name>
fn precondition(name: &str, locks: &[DavLock]) -> Element {
    let mut e = Element::new2(name);
    for lock in locks {
        e.push_elem(Element::new_text("D:href", lock.path.as_url_string_with_prefix()));
    }
    e
}

/// 423 response for a LOCK request that conflicts with existing locks.
/// Lists the root and token of every conflicting lock.
pub(crate) fn conflict_response(path: &DavPath, locks: &[DavLock]) -> DavResult<Response<Body>> {
    let mut ms = MultiError::new();
    for lock in locks {
        ms.add_response(
            &lock.path,
            StatusCode::LOCKED,
            Some(precondition("D:no-conflicting-lock", std::slice::from_ref(lock))),
            Some(format!("locked by {}", lock.token)),
        );
    }
    if locks.iter().all(|l| l.path != *path) {
        ms.add_status(path, StatusCode::FAILED_DEPENDENCY);
    }
    ms.into_response(StatusCode::LOCKED)
}

/// 423 response for a write to a locked resource.
pub(crate) fn locked_response(locks: &[DavLock]) -> DavResult<Response<Body>> {
    let mut error = Element::new2("D:error").ns("D", NS_DAV_URI);
    error.push_elem(precondition("D:lock-token-submitted", locks));
    let mut buf = Vec::new();
    error.write_doc(&mut buf)?;
    let mut res = Response::new(Body::from(buf));
    *res.status_mut() = StatusCode::LOCKED;
    res.headers_mut()
        .insert(http::header::CONTENT_TYPE, http::HeaderValue::from_static(XML_CONTENT_TYPE));
    Ok(res)
}

/// Response for a lock error, with a body where the protocol defines one.
pub(crate) fn lock_error_response(path: &DavPath, err: &LockError) -> DavResult<Response<Body>> {
    match err {
        LockError::Conflict(locks) => conflict_response(path, locks),
        LockError::Locked(locks) => locked_response(locks),
        other => {
            let mut res = Response::new(Body::empty());
            *res.status_mut() = crate::errors::lockerror_to_status(other);
            Ok(res)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ls::*;
    use std::time::SystemTime;

    #[test]
    fn conflict_body() {
        let lock = DavLock {
            token: LockToken::new(),
            path: DavPath::new("/docs").unwrap(),
            depth: LockDepth::Infinity,
            scope: LockScope::Exclusive,
            owner: None,
            timeout: DavTimeout::Infinite,
            expire_time: SystemTime::now(),
            principal: None,
        };
        let res = conflict_response(&DavPath::new("/docs/a").unwrap(), &[lock.clone()]).unwrap();
        assert_eq!(res.status(), StatusCode::LOCKED);
        let body = String::from_utf8(res.into_body().into_bytes().to_vec()).unwrap();
        assert!(body.contains("<D:href>/docs</D:href>"));
        assert!(body.contains("no-conflicting-lock"));
        assert!(body.contains(&lock.token.to_string()));
        assert!(body.contains("424"));
    }
}
