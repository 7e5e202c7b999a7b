//! Evaluation of conditional request headers.
//!
//! The WebDAV `If:` header (RFC4918, 10.4) is a disjunction of lists, each
//! list a conjunction of (optionally negated) state tokens and entity tags,
//! optionally tagged with the resource it applies to. A state token
//! condition holds if the token belongs to a live lock on that resource.
//!
//! The HTTP conditionals (RFC7232) are handled here as well.
use http::{HeaderMap, Method, StatusCode};
use headers::HeaderMapExt;

use crate::davheaders::{self, ETag, If, IfItem, IfList};
use crate::davpath::DavPath;
use crate::errors::{LockError, LockResult};
use crate::fs::{DavFileSystem, DavMetaData};
use crate::lockmanager::DavLockManager;
use crate::ls::LockToken;
use crate::DavResult;

/// The state of a resource that conditions are matched against.
#[derive(Debug, Clone, Default)]
pub struct ResourceState {
    /// Current entity tag, `None` if the resource does not exist.
    pub etag: Option<ETag>,
    /// Tokens of the live locks that govern the resource.
    pub lock_tokens: Vec<LockToken>,
}

/// Parse an `If:` header value. An empty value is a header without
/// conditions, which always passes.
pub fn parse(value: &str) -> LockResult<If> {
    if value.trim().is_empty() {
        return Ok(If(Vec::new()));
    }
    value.parse()
}

/// The lock tokens the client submitted in an `If:` header, regardless
/// of whether the expression as a whole holds.
pub fn extract_tokens(value: &str) -> LockResult<Vec<LockToken>> {
    Ok(parse(value)?.lock_tokens())
}

impl IfList {
    /// True if all conditions hold for `state`.
    pub fn evaluate(&self, state: &ResourceState) -> bool {
        self.conditions.iter().all(|cond| {
            let ok = match cond.item {
                // tokens in the DAV: namespace never match (10.4.8)
                IfItem::StateToken(ref s) if s.starts_with("DAV:") => false,
                IfItem::StateToken(ref s) => s
                    .parse::<LockToken>()
                    .map(|t| state.lock_tokens.contains(&t))
                    .unwrap_or(false),
                IfItem::ETag(ref tag) => state.etag.as_ref().is_some_and(|e| e.weak_eq(tag)),
            };
            ok != cond.not
        })
    }
}

impl If {
    /// Evaluate against the request resource only. Lists tagged with a
    /// different resource evaluate to false. An empty header passes.
    pub fn evaluate(&self, path: &DavPath, etag: Option<&ETag>, lock_tokens: &[LockToken]) -> bool {
        if self.0.is_empty() {
            return true;
        }
        let state = ResourceState {
            etag: etag.cloned(),
            lock_tokens: lock_tokens.to_vec(),
        };
        self.0.iter().any(|list| {
            let applies = match list.resource_tag {
                None => true,
                Some(ref tag) => path.sibling_from_str(tag).is_ok_and(|p| p == *path),
            };
            applies && list.evaluate(&state)
        })
    }
}

// State of the resource `path`, as seen by the filesystem and the lock manager.
async fn resource_state(fs: &dyn DavFileSystem, lm: &DavLockManager, path: &DavPath) -> LockResult<ResourceState> {
    let etag = fs.get_etag(path).await.and_then(|t| ETag::new(false, t).ok());
    let lock_tokens = lm.discover(path)?.into_iter().map(|l| l.token).collect();
    Ok(ResourceState { etag, lock_tokens })
}

/// Handle the `If:` header for a request on `path`.
///
/// Returns whether the header is absent or at least one list holds, and
/// the lock tokens that were submitted. Tagged lists are evaluated against
/// the resource they name. A malformed header is an error.
pub(crate) async fn dav_if_match(
    headers: &HeaderMap,
    fs: &dyn DavFileSystem,
    lm: &DavLockManager,
    path: &DavPath,
) -> DavResult<(bool, Vec<LockToken>)> {
    // an empty header has no conditions.
    let blank = headers
        .get(&davheaders::IF)
        .is_some_and(|v| v.as_bytes().iter().all(u8::is_ascii_whitespace));
    if blank {
        return Ok((true, Vec::new()));
    }
    let hdr = match headers.typed_try_get::<If>() {
        Ok(Some(h)) => h,
        Ok(None) => return Ok((true, Vec::new())),
        Err(_) => return Err(LockError::MalformedHeader.into()),
    };
    let tokens = hdr.lock_tokens();

    for iflist in hdr.0.iter() {
        let target = match iflist.resource_tag {
            Some(ref tag) => match path.sibling_from_str(tag) {
                Ok(p) => p,
                // not one of ours, can never match.
                Err(_) => continue,
            },
            None => path.clone(),
        };
        let state = resource_state(fs, lm, &target).await?;
        if iflist.evaluate(&state) {
            return Ok((true, tokens));
        }
    }
    debug!("precondition fail: If {}", hdr);
    Ok((false, tokens))
}

// Handle the if-headers: RFC 7232, HTTP/1.1 Conditional Requests.
pub(crate) fn http_if_match(headers: &HeaderMap, method: &Method, meta: Option<&dyn DavMetaData>) -> Option<StatusCode> {
    let modified = meta.and_then(|m| m.modified().ok());
    let etag = meta.and_then(ETag::from_meta);

    if let Some(r) = headers.typed_get::<davheaders::IfMatch>() {
        if !etag.as_ref().is_some_and(|t| r.0.matches(t)) {
            debug!("precondition fail: If-Match {:?}", r);
            return Some(StatusCode::PRECONDITION_FAILED);
        }
    } else if let Some(r) = headers.typed_get::<headers::IfUnmodifiedSince>() {
        if !modified.is_some_and(|m| r.precondition_passes(m)) {
            debug!("precondition fail: If-Unmodified-Since {:?}", r);
            return Some(StatusCode::PRECONDITION_FAILED);
        }
    }

    let is_get = method == Method::GET || method == Method::HEAD;
    if let Some(r) = headers.typed_get::<davheaders::IfNoneMatch>() {
        if etag.as_ref().is_some_and(|t| r.0.matches(t)) {
            debug!("precondition fail: If-None-Match {:?}", r);
            return Some(if is_get {
                StatusCode::NOT_MODIFIED
            } else {
                StatusCode::PRECONDITION_FAILED
            });
        }
    } else if let Some(r) = headers.typed_get::<headers::IfModifiedSince>() {
        if is_get && modified.is_some_and(|m| !r.is_modified(m)) {
            debug!("not-modified If-Modified-Since {:?}", r);
            return Some(StatusCode::NOT_MODIFIED);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> DavPath {
        DavPath::new(s).unwrap()
    }

    #[test]
    fn empty_header_passes() {
        let hdr = parse("  ").unwrap();
        assert!(hdr.evaluate(&p("/a"), None, &[]));
        assert!(extract_tokens("").unwrap().is_empty());
        assert!(matches!(parse("(<a:b>"), Err(LockError::MalformedHeader)));
    }

    #[test]
    fn tokens_and_etags() {
        let t = LockToken::new();
        let etag = ETag::new(false, "v1").unwrap();
        let path = p("/docs/a");

        let hdr = parse(&format!("(<{}>)", t)).unwrap();
        assert!(hdr.evaluate(&path, None, &[t]));
        assert!(!hdr.evaluate(&path, None, &[]));

        let hdr = parse(&format!("(<{}> [\"v2\"]) ([\"v1\"])", t)).unwrap();
        assert!(hdr.evaluate(&path, Some(&etag), &[]));
        let hdr = parse(&format!("(<{}> [\"v2\"])", t)).unwrap();
        assert!(!hdr.evaluate(&path, Some(&etag), &[t]));

        // the classic trick to submit a token without requiring it to match.
        let hdr = parse(&format!("(<{}>) (Not <DAV:no-lock>)", LockToken::new())).unwrap();
        assert!(hdr.evaluate(&path, None, &[]));
        let hdr = parse("(<DAV:no-lock>)").unwrap();
        assert!(!hdr.evaluate(&path, None, &[]));
    }

    #[test]
    fn tagged_lists() {
        let t = LockToken::new();
        let hdr = parse(&format!("<http://host/docs/a> (<{}>)", t)).unwrap();
        assert!(hdr.evaluate(&p("/docs/a"), None, &[t]));
        assert!(!hdr.evaluate(&p("/docs/b"), None, &[t]));
        let hdr = parse(&format!("</docs/a> (<{}>)", t)).unwrap();
        assert!(hdr.evaluate(&p("/docs/a"), None, &[t]));
    }

    #[test]
    fn extract() {
        let t1 = LockToken::new();
        let t2 = LockToken::new();
        let v = format!("</x> (Not <{}>) (<{}> <urn:other:thing>) (<{}>)", t1, t2, t1);
        assert_eq!(extract_tokens(&v).unwrap(), vec![t1, t2]);
    }
}
