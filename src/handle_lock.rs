use std::io::Cursor;
use std::time::SystemTime;

use headers::HeaderMapExt;
use http::StatusCode as SC;
use http::{Request, Response};
use xmltree::Element;

use crate::body::Body;
use crate::conditional::dav_if_match;
use crate::davheaders;
use crate::davpath::DavPath;
use crate::errors::*;
use crate::fs::FsError;
use crate::lockmanager::DavLockManager;
use crate::ls::*;
use crate::multierror;
use crate::xmltree_ext::{ElementExt, NS_DAV_URI};
use crate::DavResult;

const XML_CONTENT_TYPE: &str = "application/xml; charset=utf-8";

impl crate::DavInner {
    pub(crate) async fn handle_lock(&self, req: &Request<()>, xmldata: &[u8]) -> DavResult<Response<Body>> {
        let path = self.path(req)?;
        let exists = self.fs.exists(&path).await;

        // invalid timeout is a bad request, a missing one means "default".
        let timeout = match req.headers().typed_try_get::<davheaders::Timeout>() {
            Ok(t) => t.and_then(|t| t.first()),
            Err(_) => return Err(SC::BAD_REQUEST.into()),
        };

        // lock refresh?
        if xmldata.is_empty() {
            let (ok, tokens) = dav_if_match(req.headers(), self.fs.as_ref(), &self.lm, &path).await?;
            if tokens.len() != 1 {
                return Err(SC::BAD_REQUEST.into());
            }
            if !ok {
                return Err(SC::PRECONDITION_FAILED.into());
            }
            let lock = self.lm.acquire_lock(
                &path,
                LockScope::Exclusive,
                LockDepth::Zero,
                None,
                timeout,
                self.principal.as_deref(),
                Some(&tokens[0]),
            )?;
            return lock_response(SC::OK, &lock, self.lm.now(), false);
        }

        // handle Depth:
        let depth = match req.headers().typed_try_get::<davheaders::Depth>() {
            Ok(Some(davheaders::Depth::Infinity)) | Ok(None) => LockDepth::Infinity,
            Ok(Some(davheaders::Depth::Zero)) => LockDepth::Zero,
            _ => return Err(SC::BAD_REQUEST.into()),
        };

        let (scope, owner) = parse_lockinfo(xmldata)?;

        // a LOCK has to satisfy the If: header like any other request.
        let (ok, tokens) = dav_if_match(req.headers(), self.fs.as_ref(), &self.lm, &path).await?;
        if !ok {
            return Err(SC::PRECONDITION_FAILED.into());
        }

        let principal = self.principal.as_deref();
        let lock = match self
            .lm
            .acquire_lock(&path, scope, depth, owner.as_ref(), timeout, principal, None)
        {
            Ok(lock) => lock,
            Err(LockError::Conflict(locks)) => return multierror::conflict_response(&path, &locks),
            Err(e) => return Err(e.into()),
        };

        // LOCK on an unmapped URL creates an empty resource, which
        // changes the membership of the parent.
        if !exists {
            if let Err(e) = self.check_member(&path, &tokens) {
                self.undo_lock(&lock, principal)?;
                return Err(e);
            }
            if let Err(e) = self.fs.write_file(&path, Default::default()).await {
                self.undo_lock(&lock, principal)?;
                return Err(match e {
                    FsError::NotFound | FsError::Exists => SC::CONFLICT.into(),
                    e => e.into(),
                });
            }
        }

        let status = if exists { SC::OK } else { SC::CREATED };
        lock_response(status, &lock, self.lm.now(), true)
    }

    // Drop a lock granted for a LOCK request that failed afterwards. If
    // that fails too the lock would linger, so the storage error wins.
    fn undo_lock(&self, lock: &DavLock, principal: Option<&str>) -> DavResult<()> {
        match self.lm.release_lock(&lock.token, principal) {
            Ok(()) | Err(LockError::NotFound) => Ok(()),
            Err(e) => {
                warn!("LOCK {}: could not roll back {}: {:?}", lock.path, lock.token, e);
                Err(e.into())
            }
        }
    }

    pub(crate) async fn handle_unlock(&self, req: &Request<()>) -> DavResult<Response<Body>> {
        // Must have Lock-Token header
        let token = match req.headers().typed_try_get::<davheaders::LockTokenHeader>() {
            Ok(Some(t)) => t.0,
            _ => return Err(SC::BAD_REQUEST.into()),
        };
        let path = self.path(req)?;

        // the token has to be one of the locks on this resource.
        match self.lm.lookup(&token)? {
            Some(lock) if lock.governs(&path) => {}
            _ => {
                debug!("unlock {}: {} does not lock this resource", path, token);
                return Err(SC::CONFLICT.into());
            }
        }

        match self.lm.release_lock(&token, self.principal.as_deref()) {
            Ok(()) => {
                let mut res = Response::new(Body::empty());
                *res.status_mut() = SC::NO_CONTENT;
                Ok(res)
            }
            Err(LockError::NotFound) => Err(SC::CONFLICT.into()),
            Err(e) => Err(e.into()),
        }
    }
}

// Decode a <D:lockinfo> request body.
fn parse_lockinfo(xmldata: &[u8]) -> DavResult<(LockScope, Option<Element>)> {
    let tree = Element::parse2(Cursor::new(xmldata))?;
    if !tree.is_dav("lockinfo") {
        return Err(DavError::XmlParseError);
    }

    let mut scope: Option<LockScope> = None;
    let mut owner: Option<Element> = None;
    let mut locktype = false;

    for elem in tree.child_elems() {
        let first = elem.child_elems().next();
        if elem.is_dav("lockscope") {
            scope = match first {
                Some(e) if e.is_dav("exclusive") => Some(LockScope::Exclusive),
                Some(e) if e.is_dav("shared") => Some(LockScope::Shared),
                _ => return Err(DavError::XmlParseError),
            };
        } else if elem.is_dav("locktype") {
            match first {
                Some(e) if e.is_dav("write") => locktype = true,
                _ => return Err(DavError::XmlParseError),
            }
        } else if elem.is_dav("owner") {
            let mut o = elem.clone();
            o.prefix = Some("D".to_owned());
            o.namespaces = None;
            owner = Some(o);
        } else {
            return Err(DavError::XmlParseError);
        }
    }

    match scope {
        Some(scope) if locktype => Ok((scope, owner)),
        _ => Err(DavError::XmlParseError),
    }
}

// <D:prop><D:lockdiscovery><D:activelock>...
fn lock_response(status: SC, lock: &DavLock, now: SystemTime, with_token: bool) -> DavResult<Response<Body>> {
    let mut ldis = Element::new2("D:lockdiscovery");
    ldis.push_elem(build_lock_prop(lock, now));
    let mut prop = Element::new2("D:prop").ns("D", NS_DAV_URI);
    prop.push_elem(ldis);

    let mut buf = Vec::new();
    prop.write_doc(&mut buf)?;

    let mut res = Response::new(Body::from(buf));
    *res.status_mut() = status;
    if with_token {
        res.headers_mut().typed_insert(davheaders::LockTokenHeader(lock.token));
    }
    res.headers_mut()
        .insert(http::header::CONTENT_TYPE, http::HeaderValue::from_static(XML_CONTENT_TYPE));
    Ok(res)
}

pub(crate) fn list_lockdiscovery(lm: &DavLockManager, path: &DavPath) -> Element {
    let mut elem = Element::new2("D:lockdiscovery");
    let now = lm.now();
    match lm.discover(path) {
        Ok(locks) => {
            for lock in &locks {
                elem.push_elem(build_lock_prop(lock, now));
            }
        }
        Err(e) => warn!("lockdiscovery {}: {}", path, e),
    }
    elem
}

pub(crate) fn list_supportedlock() -> Element {
    let mut elem = Element::new2("D:supportedlock");
    for scope in ["D:exclusive", "D:shared"] {
        let mut entry = Element::new2("D:lockentry");
        let mut s = Element::new2("D:lockscope");
        s.push_elem(Element::new2(scope));
        entry.push_elem(s);
        let mut t = Element::new2("D:locktype");
        t.push_elem(Element::new2("D:write"));
        entry.push_elem(t);
        elem.push_elem(entry);
    }
    elem
}

pub(crate) fn build_lock_prop(lock: &DavLock, now: SystemTime) -> Element {
    let mut actlock = Element::new2("D:activelock");

    let mut elem = Element::new2("D:lockscope");
    elem.push_elem(match lock.scope {
        LockScope::Exclusive => Element::new2("D:exclusive"),
        LockScope::Shared => Element::new2("D:shared"),
    });
    actlock.push_elem(elem);

    let mut elem = Element::new2("D:locktype");
    elem.push_elem(Element::new2("D:write"));
    actlock.push_elem(elem);

    actlock.push_elem(Element::new_text(
        "D:depth",
        match lock.depth {
            LockDepth::Zero => "0",
            LockDepth::Infinity => "infinity",
        },
    ));

    if let Some(ref o) = lock.owner {
        actlock.push_elem(o.clone());
    }

    // what is left of the lifetime, rounded up.
    let left = lock.remaining(now);
    let secs = left.as_secs() + u64::from(left.subsec_nanos() > 0);
    actlock.push_elem(Element::new_text("D:timeout", format!("Second-{}", secs)));

    let mut locktokenelem = Element::new2("D:locktoken");
    locktokenelem.push_elem(Element::new_text("D:href", lock.token.to_string()));
    actlock.push_elem(locktokenelem);

    let mut lockroot = Element::new2("D:lockroot");
    lockroot.push_elem(Element::new_text("D:href", lock.path.as_url_string_with_prefix()));
    actlock.push_elem(lockroot);

    actlock
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lockinfo() {
        let body = br#"<?xml version="1.0"?>
            <D:lockinfo xmlns:D="DAV:">
              <D:lockscope><D:shared/></D:lockscope>
              <D:locktype><D:write/></D:locktype>
              <D:owner><D:href>mailto:alice@example.org</D:href></D:owner>
            </D:lockinfo>"#;
        let (scope, owner) = parse_lockinfo(body).unwrap();
        assert_eq!(scope, LockScope::Shared);
        assert!(owner.unwrap().child_elems().next().unwrap().is_dav("href"));

        let body = br#"<lockinfo xmlns="DAV:"><lockscope><exclusive/></lockscope></lockinfo>"#;
        assert!(parse_lockinfo(body).is_err());
        let body = br#"<lockinfo xmlns="urn:x"><lockscope><exclusive/></lockscope><locktype><write/></locktype></lockinfo>"#;
        assert!(parse_lockinfo(body).is_err());
    }

    #[test]
    fn activelock() {
        let now = SystemTime::now();
        let lock = DavLock {
            token: LockToken::new(),
            path: DavPath::new("/docs/").unwrap(),
            depth: LockDepth::Infinity,
            scope: LockScope::Exclusive,
            owner: None,
            timeout: DavTimeout::Seconds(600),
            expire_time: now + std::time::Duration::from_secs(600),
            principal: None,
        };
        let res = lock_response(SC::OK, &lock, now, true).unwrap();
        let hdr = res.headers().get("lock-token").unwrap().to_str().unwrap().to_string();
        assert_eq!(hdr, format!("<{}>", lock.token));
        let body = String::from_utf8(res.into_body().into_bytes().to_vec()).unwrap();
        assert!(body.contains("<D:timeout>Second-600</D:timeout>"));
        assert!(body.contains("<D:depth>infinity</D:depth>"));
        assert!(body.contains(&format!("<D:href>{}</D:href>", lock.token)));
        assert!(body.contains("<D:lockroot><D:href>/docs</D:href></D:lockroot>"));
    }
}
