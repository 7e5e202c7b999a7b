use std::time::SystemTime;

use chrono::{DateTime, SecondsFormat, Utc};
use headers::Header;

use crate::body::Body;
use crate::errors::DavError;
use crate::DavResult;

/// The methods a [`DavHandler`](crate::DavHandler) knows about.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
#[repr(u32)]
pub enum DavMethod {
    Head = 0x0001,
    Get = 0x0002,
    Put = 0x0004,
    Options = 0x0010,
    PropFind = 0x0020,
    PropPatch = 0x0040,
    MkCol = 0x0080,
    Copy = 0x0100,
    Move = 0x0200,
    Delete = 0x0400,
    Lock = 0x0800,
    Unlock = 0x1000,
}

const METHODS: &[(&str, DavMethod)] = &[
    ("HEAD", DavMethod::Head),
    ("GET", DavMethod::Get),
    ("PUT", DavMethod::Put),
    ("OPTIONS", DavMethod::Options),
    ("PROPFIND", DavMethod::PropFind),
    ("PROPPATCH", DavMethod::PropPatch),
    ("MKCOL", DavMethod::MkCol),
    ("COPY", DavMethod::Copy),
    ("MOVE", DavMethod::Move),
    ("DELETE", DavMethod::Delete),
    ("LOCK", DavMethod::Lock),
    ("UNLOCK", DavMethod::Unlock),
];

impl DavMethod {
    /// Methods that modify resources, and so have to pass the lock checks.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            DavMethod::Put
                | DavMethod::PropPatch
                | DavMethod::MkCol
                | DavMethod::Copy
                | DavMethod::Move
                | DavMethod::Delete
        )
    }

    fn from_name(name: &str) -> Option<DavMethod> {
        METHODS
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|&(_, m)| m)
    }
}

pub(crate) fn dav_method(method: &http::Method) -> DavResult<DavMethod> {
    // method names are case sensitive on the wire.
    METHODS
        .iter()
        .find(|(n, _)| *n == method.as_str())
        .map(|&(_, m)| m)
        .ok_or(DavError::UnknownDavMethod)
}

/// A set of [`DavMethod`]s, used to restrict what a handler serves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DavMethodSet(u32);

impl DavMethodSet {
    /// GET, HEAD and OPTIONS.
    pub const HTTP_RO: DavMethodSet =
        DavMethodSet(DavMethod::Get as u32 | DavMethod::Head as u32 | DavMethod::Options as u32);
    /// HTTP_RO plus PUT.
    pub const HTTP_RW: DavMethodSet = DavMethodSet(Self::HTTP_RO.0 | DavMethod::Put as u32);
    /// HTTP_RO plus PROPFIND.
    pub const WEBDAV_RO: DavMethodSet = DavMethodSet(Self::HTTP_RO.0 | DavMethod::PropFind as u32);
    /// Everything.
    pub const WEBDAV_RW: DavMethodSet = DavMethodSet(u32::MAX);

    pub fn all() -> DavMethodSet {
        Self::WEBDAV_RW
    }

    pub fn none() -> DavMethodSet {
        DavMethodSet(0)
    }

    pub fn add(&mut self, m: DavMethod) -> &Self {
        self.0 |= m as u32;
        self
    }

    pub fn remove(&mut self, m: DavMethod) -> &Self {
        self.0 &= !(m as u32);
        self
    }

    pub fn contains(&self, m: DavMethod) -> bool {
        self.0 & (m as u32) != 0
    }

    /// Parse a list of method names, case insensitive. The group names
    /// `http-ro`, `http-rw`, `webdav-ro` and `webdav-rw` are accepted too.
    pub fn from_vec(v: Vec<impl AsRef<str>>) -> Result<DavMethodSet, String> {
        v.iter().try_fold(DavMethodSet::none(), |set, w| {
            let w = w.as_ref();
            let bits = match w.to_ascii_lowercase().as_str() {
                "http-ro" => Self::HTTP_RO.0,
                "http-rw" => Self::HTTP_RW.0,
                "webdav-ro" => Self::WEBDAV_RO.0,
                "webdav-rw" => Self::WEBDAV_RW.0,
                _ => match DavMethod::from_name(w) {
                    Some(m) => m as u32,
                    None => return Err(format!("unknown method {:?}", w)),
                },
            };
            Ok(DavMethodSet(set.0 | bits))
        })
    }
}

// A DAV:error body around one precondition element.
pub(crate) fn dav_xml_error(body: &str) -> Body {
    Body::from(format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\" ?>\n<D:error xmlns:D=\"DAV:\">\n{}\n</D:error>\n",
        body
    ))
}

pub(crate) fn systemtime_to_httpdate(t: SystemTime) -> String {
    let mut values: Vec<http::HeaderValue> = Vec::with_capacity(1);
    headers::Date::from(t).encode(&mut values);
    values
        .first()
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_default()
}

pub(crate) fn systemtime_to_rfc3339(t: SystemTime) -> String {
    DateTime::<Utc>::from(t).to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    #[test]
    fn method_sets() {
        let set = DavMethodSet::from_vec(vec!["webdav-ro", "lock"]).unwrap();
        assert!(set.contains(DavMethod::PropFind));
        assert!(set.contains(DavMethod::Lock));
        assert!(!set.contains(DavMethod::Put));
        assert!(DavMethodSet::from_vec(vec!["bogus"]).is_err());
        assert!(DavMethodSet::from_vec(vec!["Mkcol"]).unwrap().contains(DavMethod::MkCol));
        assert!(dav_method(&http::Method::from_bytes(b"lock").unwrap()).is_err());
        assert_eq!(dav_method(&http::Method::from_bytes(b"LOCK").unwrap()).unwrap(), DavMethod::Lock);
        assert!(DavMethod::Move.is_write());
        assert!(!DavMethod::Lock.is_write());
    }

    #[test]
    fn dates() {
        let t = UNIX_EPOCH + Duration::from_secs(784111777);
        assert_eq!(systemtime_to_httpdate(t), "Sun, 06 Nov 1994 08:49:37 GMT");
        assert_eq!(systemtime_to_rfc3339(t), "1994-11-06T08:49:37Z");
    }
}
