//! Utility module to handle the path part of an URL as a resource path.
//!
//! A [`DavPath`] is always canonical: absolute, percent-decoded, with `.` and
//! `..` processed, no repeated slashes and no trailing slash (except for the
//! root, `/`). Equality and ancestry are decided on whole segments, so `/ab`
//! is not an ancestor of `/abc`.
use std::error::Error;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode, percent_encode};

/// Path information relative to a prefix.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DavPath {
    path: Vec<u8>,
    prefix: Vec<u8>,
}

// Encode all non-unreserved characters, except '/'.
// See RFC3986, and https://en.wikipedia.org/wiki/Percent-encoding .
const PATH_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

impl std::fmt::Display for DavPath {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.as_url_string_with_prefix())
    }
}

impl std::fmt::Debug for DavPath {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if self.prefix.is_empty() {
            write!(f, "{:?}", self.as_url_string())
        } else {
            write!(f, "{:?}", format!("{}[{}]", encode_path(&self.prefix), self.as_url_string()))
        }
    }
}

/// Error returned by some of the DavPath methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// cannot parse
    InvalidPath,
    /// outside of prefix
    IllegalPath,
    /// too many dotdots
    ForbiddenPath,
}

impl Error for ParseError {}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ParseError::InvalidPath => write!(f, "invalid path"),
            ParseError::IllegalPath => write!(f, "path outside of prefix"),
            ParseError::ForbiddenPath => write!(f, "path escapes the root"),
        }
    }
}

// a segment must only contain valid %XX escapes, and the decoded
// segment can contain any value except '/' or '\0'
fn valid_segment(src: &[u8]) -> Result<(), ParseError> {
    let mut i = 0;
    while i < src.len() {
        if src[i] == b'%' {
            if i + 2 >= src.len()
                || !src[i + 1].is_ascii_hexdigit()
                || !src[i + 2].is_ascii_hexdigit()
            {
                return Err(ParseError::InvalidPath);
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    if percent_decode(src).any(|x| x == 0 || x == b'/') {
        return Err(ParseError::InvalidPath);
    }
    Ok(())
}

// encode path with PATH_ENCODE_SET
fn encode_path(src: &[u8]) -> String {
    percent_encode(src, PATH_ENCODE_SET).to_string()
}

// make path safe:
// - raw path before decoding can contain only printable ascii
// - make sure path is absolute
// - remove query part (everything after ?)
// - merge consecutive slashes
// - process . and ..
// - decode percent encoded bytes, fail on invalid encodings.
// - do not allow NUL or '/' in segments.
// - drop the trailing slash.
fn normalize_path(rp: &[u8]) -> Result<Vec<u8>, ParseError> {
    // must consist of printable ASCII
    if rp.iter().any(|&x| !(32..=126).contains(&x)) {
        return Err(ParseError::InvalidPath);
    }

    // don't allow fragments. query part gets deleted.
    let mut rawpath = rp;
    if let Some(pos) = rawpath.iter().position(|&x| x == b'?' || x == b'#') {
        if rawpath[pos] == b'#' {
            return Err(ParseError::InvalidPath);
        }
        rawpath = &rawpath[..pos];
    }

    // must start with "/"
    if rawpath.first() != Some(&b'/') {
        return Err(ParseError::InvalidPath);
    }

    let mut v: Vec<&[u8]> = Vec::new();
    for segment in rawpath.split(|c| *c == b'/') {
        match segment {
            b"." | b"" => {}
            b".." => {
                if v.pop().is_none() {
                    return Err(ParseError::ForbiddenPath);
                }
            }
            s => {
                valid_segment(s)?;
                v.push(s);
            }
        }
    }

    let mut path = Vec::with_capacity(rawpath.len());
    for seg in v {
        path.push(b'/');
        path.extend(percent_decode(seg));
    }
    if path.is_empty() {
        path.push(b'/');
    }
    Ok(path)
}

/// Canonicalize a raw, percent-encoded path.
pub fn normalize(raw: &str) -> Result<DavPath, ParseError> {
    DavPath::new(raw)
}

/// Is `a` a strict ancestor of `b`.
pub fn is_ancestor(a: &DavPath, b: &DavPath) -> bool {
    a.is_ancestor_of(b)
}

/// Longest common ancestor-or-self of two paths.
pub fn common_prefix(a: &DavPath, b: &DavPath) -> DavPath {
    let mut path = Vec::new();
    for (x, y) in a.segments().zip(b.segments()) {
        if x != y {
            break;
        }
        path.push(b'/');
        path.extend_from_slice(x);
    }
    if path.is_empty() {
        path.push(b'/');
    }
    DavPath {
        path,
        prefix: a.prefix.clone(),
    }
}

impl DavPath {
    /// from URL encoded path, without a prefix.
    pub fn new(src: &str) -> Result<DavPath, ParseError> {
        Ok(DavPath {
            path: normalize_path(src.as_bytes())?,
            prefix: Vec::new(),
        })
    }

    /// from URL encoded strings: path and prefix.
    pub fn from_str_and_prefix(src: &str, prefix: &str) -> Result<DavPath, ParseError> {
        let path = normalize_path(src.as_bytes())?;
        let prefix = match prefix.trim_end_matches('/') {
            "" => return Ok(DavPath { path, prefix: Vec::new() }),
            p => normalize_path(p.as_bytes())?,
        };
        if !path.starts_with(&prefix) {
            return Err(ParseError::IllegalPath);
        }
        let rest = &path[prefix.len()..];
        if !rest.is_empty() && rest[0] != b'/' {
            return Err(ParseError::IllegalPath);
        }
        Ok(DavPath {
            path: if rest.is_empty() { b"/".to_vec() } else { rest.to_vec() },
            prefix,
        })
    }

    /// from request.uri
    pub fn from_uri_and_prefix(uri: &http::uri::Uri, prefix: &str) -> Result<Self, ParseError> {
        match uri.path() {
            path if path.starts_with('/') => DavPath::from_str_and_prefix(path, prefix),
            _ => Err(ParseError::InvalidPath),
        }
    }

    /// from url::Url and prefix string.
    pub fn from_url(url: &url::Url, prefix: &str) -> Result<Self, ParseError> {
        DavPath::from_str_and_prefix(url.path(), prefix)
    }

    /// Build a path that shares our prefix from another (encoded) path or URL.
    pub(crate) fn sibling_from_str(&self, src: &str) -> Result<DavPath, ParseError> {
        let prefix = self.prefix();
        if src.starts_with('/') {
            return DavPath::from_str_and_prefix(src, &prefix);
        }
        let url = url::Url::parse(src).map_err(|_| ParseError::InvalidPath)?;
        DavPath::from_url(&url, &prefix)
    }

    /// as URL encoded string, without prefix.
    pub fn as_url_string(&self) -> String {
        encode_path(&self.path)
    }

    /// as URL encoded string, with prefix.
    pub fn as_url_string_with_prefix(&self) -> String {
        if self.prefix.is_empty() {
            return self.as_url_string();
        }
        let mut p = encode_path(&self.prefix);
        if !self.is_root() {
            p.push_str(&self.as_url_string());
        }
        p
    }

    /// as utf8 string, with prefix. uses String::from_utf8_lossy.
    pub fn as_utf8_string_with_prefix(&self) -> String {
        let mut p = self.prefix.clone();
        if !self.is_root() || p.is_empty() {
            p.extend_from_slice(&self.path);
        }
        String::from_utf8_lossy(&p).to_string()
    }

    /// as raw bytes, not encoded, no prefix.
    pub fn as_bytes(&self) -> &[u8] {
        self.path.as_slice()
    }

    /// return the URL prefix.
    pub fn prefix(&self) -> String {
        encode_path(&self.prefix)
    }

    /// Is this "/".
    pub fn is_root(&self) -> bool {
        self.path == b"/"
    }

    /// Iterate over the (decoded) segments. "/" has none.
    pub fn segments(&self) -> impl Iterator<Item = &[u8]> {
        self.path.split(|&c| c == b'/').filter(|s| !s.is_empty())
    }

    /// Count the number of segments the path has. "/" has 0.
    pub fn num_segments(&self) -> usize {
        self.segments().count()
    }

    /// get parent. The parent of "/" is "/".
    pub fn parent(&self) -> DavPath {
        let path = match self.path.iter().rposition(|&c| c == b'/') {
            Some(0) | None => b"/".to_vec(),
            Some(pos) => self.path[..pos].to_vec(),
        };
        DavPath {
            path,
            prefix: self.prefix.clone(),
        }
    }

    /// All ancestors, nearest first, ending with "/".
    pub fn ancestors(&self) -> Vec<DavPath> {
        let mut v = Vec::new();
        let mut p = self.clone();
        while !p.is_root() {
            p = p.parent();
            v.push(p.clone());
        }
        v
    }

    /// The filename is the last segment of the path. Can be empty.
    pub fn file_name(&self) -> &[u8] {
        self.segments().last().unwrap_or(b"")
    }

    /// Add a segment to the end of the path.
    pub fn push_segment(&mut self, b: &[u8]) {
        if !self.is_root() {
            self.path.push(b'/');
        }
        self.path.extend_from_slice(b);
    }

    /// Is `self` a strict ancestor of `other`.
    pub fn is_ancestor_of(&self, other: &DavPath) -> bool {
        if self.is_root() {
            return !other.is_root();
        }
        other.path.len() > self.path.len()
            && other.path.starts_with(&self.path)
            && other.path[self.path.len()] == b'/'
    }

    /// `self == other`, or `self` is an ancestor of `other`.
    pub fn is_ancestor_or_self(&self, other: &DavPath) -> bool {
        self.path == other.path || self.is_ancestor_of(other)
    }

    /// Move `self` from below `old_root` to below `new_root`. Returns
    /// `None` if `self` is not `old_root` or one of its descendants.
    pub fn rebase(&self, old_root: &DavPath, new_root: &DavPath) -> Option<DavPath> {
        if !old_root.is_ancestor_or_self(self) {
            return None;
        }
        let rest = if self.path == old_root.path {
            &[][..]
        } else if old_root.is_root() {
            &self.path[..]
        } else {
            &self.path[old_root.path.len()..]
        };
        let mut path = if new_root.is_root() {
            Vec::new()
        } else {
            new_root.path.clone()
        };
        path.extend_from_slice(rest);
        if path.is_empty() {
            path.push(b'/');
        }
        Some(DavPath {
            path,
            prefix: new_root.prefix.clone(),
        })
    }

    pub(crate) fn get_mime_type_str(&self) -> &'static str {
        let name = self.file_name();
        let d = name.rsplitn(2, |&c| c == b'.').collect::<Vec<&[u8]>>();
        if d.len() > 1 {
            if let Ok(ext) = std::str::from_utf8(d[0]) {
                if let Some(t) = mime_guess::from_ext(ext).first_raw() {
                    return t;
                }
            }
        }
        "application/octet-stream"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> DavPath {
        DavPath::new(s).unwrap()
    }

    #[test]
    fn normalize_paths() {
        assert_eq!(p("/").as_bytes(), b"/");
        assert_eq!(p("/a/b/").as_bytes(), b"/a/b");
        assert_eq!(p("//a///b").as_bytes(), b"/a/b");
        assert_eq!(p("/a/./b/../c").as_bytes(), b"/a/c");
        assert_eq!(p("/a/b?x=1").as_bytes(), b"/a/b");
        assert_eq!(p("/a%20b/c%c3%a9").as_bytes(), "/a b/cé".as_bytes());
        assert_eq!(p("/a%20b").as_url_string(), "/a%20b");
    }

    #[test]
    fn reject_bad_paths() {
        assert_eq!(DavPath::new("a/b").unwrap_err(), ParseError::InvalidPath);
        assert_eq!(DavPath::new("/a%00b").unwrap_err(), ParseError::InvalidPath);
        assert_eq!(DavPath::new("/a%2fb").unwrap_err(), ParseError::InvalidPath);
        assert_eq!(DavPath::new("/a%zzb").unwrap_err(), ParseError::InvalidPath);
        assert_eq!(DavPath::new("/a%4").unwrap_err(), ParseError::InvalidPath);
        assert_eq!(DavPath::new("/a#frag").unwrap_err(), ParseError::InvalidPath);
        assert_eq!(DavPath::new("/a\tb").unwrap_err(), ParseError::InvalidPath);
        assert_eq!(DavPath::new("/a/../..").unwrap_err(), ParseError::ForbiddenPath);
    }

    #[test]
    fn prefix() {
        let path = DavPath::from_str_and_prefix("/dav/a/b", "/dav/").unwrap();
        assert_eq!(path.as_bytes(), b"/a/b");
        assert_eq!(path.as_url_string_with_prefix(), "/dav/a/b");
        let root = DavPath::from_str_and_prefix("/dav", "/dav").unwrap();
        assert!(root.is_root());
        assert_eq!(root.as_url_string_with_prefix(), "/dav");
        assert_eq!(
            DavPath::from_str_and_prefix("/davx/a", "/dav").unwrap_err(),
            ParseError::IllegalPath
        );
    }

    #[test]
    fn ancestry() {
        assert!(is_ancestor(&p("/"), &p("/a")));
        assert!(is_ancestor(&p("/a"), &p("/a/b/c")));
        assert!(!is_ancestor(&p("/a"), &p("/a")));
        assert!(!is_ancestor(&p("/ab"), &p("/abc")));
        assert!(!is_ancestor(&p("/a/b"), &p("/a")));
        assert!(p("/a").is_ancestor_or_self(&p("/a")));
        assert_eq!(p("/a/b/c").parent(), p("/a/b"));
        assert_eq!(p("/a").parent(), p("/"));
        assert_eq!(p("/a/b").ancestors(), vec![p("/a"), p("/")]);
    }

    #[test]
    fn prefixes_and_rebase() {
        assert_eq!(common_prefix(&p("/a/b/c"), &p("/a/b/d")), p("/a/b"));
        assert_eq!(common_prefix(&p("/a"), &p("/b")), p("/"));
        assert_eq!(p("/a/b/c").rebase(&p("/a"), &p("/x/y")), Some(p("/x/y/b/c")));
        assert_eq!(p("/a").rebase(&p("/a"), &p("/z")), Some(p("/z")));
        assert_eq!(p("/ab").rebase(&p("/a"), &p("/z")), None);
    }
}
