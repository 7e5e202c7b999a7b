//! Typed versions of the WebDAV request and response headers, for use
//! with `HeaderMapExt::typed_get` and friends from the `headers` crate.
use std::fmt::{self, Display};
use std::str::FromStr;

use headers::Header;
use http::header::{HeaderName, HeaderValue};

use crate::errors::{LockError, LockResult};
use crate::fs::DavMetaData;
use crate::ls::{DavTimeout, LockToken};

pub static DEPTH: HeaderName = HeaderName::from_static("depth");
pub static TIMEOUT: HeaderName = HeaderName::from_static("timeout");
pub static OVERWRITE: HeaderName = HeaderName::from_static("overwrite");
pub static DESTINATION: HeaderName = HeaderName::from_static("destination");
pub static ETAG: HeaderName = HeaderName::from_static("etag");
pub static IF_MATCH: HeaderName = HeaderName::from_static("if-match");
pub static IF_NONE_MATCH: HeaderName = HeaderName::from_static("if-none-match");
pub static IF: HeaderName = HeaderName::from_static("if");
pub static LOCK_TOKEN: HeaderName = HeaderName::from_static("lock-token");

fn invalid() -> headers::Error {
    headers::Error::invalid()
}

fn map_invalid(_e: impl std::error::Error) -> headers::Error {
    headers::Error::invalid()
}

// Headers that must appear exactly once, and whose value is one
// string we can parse and render.
trait SingleValue: Sized {
    fn parse(value: &str) -> Option<Self>;
    fn render(&self) -> String;
}

macro_rules! single_value_header {
    ($($ty:ty => $name:ident),* $(,)?) => {
        $(
            impl Header for $ty {
                fn name() -> &'static HeaderName {
                    &$name
                }

                fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
                where
                    I: Iterator<Item = &'i HeaderValue>,
                {
                    let value = values.next().ok_or_else(invalid)?;
                    if values.next().is_some() {
                        return Err(invalid());
                    }
                    let value = value.to_str().map_err(map_invalid)?;
                    <$ty as SingleValue>::parse(value).ok_or_else(invalid)
                }

                fn encode<E>(&self, values: &mut E)
                where
                    E: Extend<HeaderValue>,
                {
                    // we only render values we parsed or generated ourselves.
                    if let Ok(v) = HeaderValue::from_str(&self.render()) {
                        values.extend(std::iter::once(v));
                    }
                }
            }
        )*
    };
}

single_value_header! {
    Depth => DEPTH,
    Timeout => TIMEOUT,
    LockTokenHeader => LOCK_TOKEN,
    Destination => DESTINATION,
    Overwrite => OVERWRITE,
    ETag => ETAG,
    If => IF,
}

/// Depth: header.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Depth {
    Zero,
    One,
    Infinity,
}

impl SingleValue for Depth {
    fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "0" => Some(Depth::Zero),
            "1" => Some(Depth::One),
            v if v.eq_ignore_ascii_case("infinity") => Some(Depth::Infinity),
            _ => None,
        }
    }

    fn render(&self) -> String {
        let s = match self {
            Depth::Zero => "0",
            Depth::One => "1",
            Depth::Infinity => "infinity",
        };
        s.to_string()
    }
}

/// Timeout: header. Clients may send a list of preferences.
#[derive(Debug, Clone, PartialEq)]
pub struct Timeout(pub Vec<DavTimeout>);

impl Timeout {
    /// The preferred timeout. Later entries are only fallbacks, which
    /// we never need since any value gets clamped instead of refused.
    pub fn first(&self) -> Option<DavTimeout> {
        self.0.first().copied()
    }
}

impl SingleValue for Timeout {
    fn parse(value: &str) -> Option<Self> {
        value
            .split(',')
            .map(str::trim)
            .map(|word| match word.strip_prefix("Second-") {
                // absurd values saturate, they get capped anyway.
                Some(n) => n.parse::<u64>().ok().map(|n| DavTimeout::Seconds(n.min(u32::MAX as u64) as u32)),
                None if word == "Infinite" => Some(DavTimeout::Infinite),
                None => None,
            })
            .collect::<Option<Vec<_>>>()
            .map(Timeout)
    }

    fn render(&self) -> String {
        let words: Vec<String> = self
            .0
            .iter()
            .map(|t| match t {
                DavTimeout::Seconds(n) => format!("Second-{}", n),
                DavTimeout::Infinite => "Infinite".to_string(),
            })
            .collect();
        words.join(", ")
    }
}

/// Lock-Token: header, `<opaquelocktoken:...>`.
#[derive(Debug, Clone, PartialEq)]
pub struct LockTokenHeader(pub LockToken);

impl SingleValue for LockTokenHeader {
    fn parse(value: &str) -> Option<Self> {
        let inner = value.trim().strip_prefix('<')?.strip_suffix('>')?;
        inner.parse().ok().map(LockTokenHeader)
    }

    fn render(&self) -> String {
        format!("<{}>", self.0)
    }
}

/// Destination: header. Holds the path part of the URL, still percent-encoded.
#[derive(Debug, Clone, PartialEq)]
pub struct Destination(pub String);

impl SingleValue for Destination {
    fn parse(value: &str) -> Option<Self> {
        if value.starts_with('/') {
            return Some(Destination(value.to_string()));
        }
        let url = url::Url::parse(value).ok()?;
        matches!(url.scheme(), "http" | "https").then(|| Destination(url.path().to_string()))
    }

    fn render(&self) -> String {
        self.0.clone()
    }
}

/// Overwrite: header, `T` or `F`.
#[derive(Debug, Clone, PartialEq)]
pub struct Overwrite(pub bool);

impl SingleValue for Overwrite {
    fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "T" => Some(Overwrite(true)),
            "F" => Some(Overwrite(false)),
            _ => None,
        }
    }

    fn render(&self) -> String {
        let s = if self.0 { "T" } else { "F" };
        s.to_string()
    }
}

/// An entity tag, stored as it goes over the wire: quoted, and
/// prefixed with `W/` when weak.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ETag {
    tag: String,
    weak: bool,
}

impl ETag {
    pub fn new(weak: bool, t: impl Into<String>) -> Result<ETag, headers::Error> {
        let t = t.into();
        if t.contains('"') {
            return Err(invalid());
        }
        let tag = if weak { format!("W/\"{}\"", t) } else { format!("\"{}\"", t) };
        Ok(ETag { tag, weak })
    }

    pub fn from_meta(meta: &dyn DavMetaData) -> Option<ETag> {
        ETag::new(false, meta.etag()?).ok()
    }

    pub fn is_weak(&self) -> bool {
        self.weak
    }

    fn opaque(&self) -> &str {
        self.tag.strip_prefix("W/").unwrap_or(&self.tag)
    }

    /// Strong comparison: both strong, same value.
    pub fn strong_eq(&self, other: &ETag) -> bool {
        !self.weak && !other.weak && self.tag == other.tag
    }

    /// Weak comparison: same value, weakness ignored.
    pub fn weak_eq(&self, other: &ETag) -> bool {
        self.opaque() == other.opaque()
    }
}

impl FromStr for ETag {
    type Err = headers::Error;

    fn from_str(t: &str) -> Result<Self, Self::Err> {
        let (weak, quoted) = match t.strip_prefix("W/") {
            Some(rest) => (true, rest),
            None => (false, t),
        };
        let inner = quoted
            .strip_prefix('"')
            .and_then(|s| s.strip_suffix('"'))
            .ok_or_else(invalid)?;
        if inner.contains('"') {
            return Err(invalid());
        }
        Ok(ETag { tag: t.to_string(), weak })
    }
}

impl Display for ETag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.tag)
    }
}

impl SingleValue for ETag {
    fn parse(value: &str) -> Option<Self> {
        value.trim().parse().ok()
    }

    fn render(&self) -> String {
        self.tag.clone()
    }
}

/// The value of `If-Match` or `If-None-Match`.
#[derive(Debug, Clone, PartialEq)]
pub enum ETagList {
    Tags(Vec<ETag>),
    Star,
}

impl ETagList {
    pub fn matches(&self, tag: &ETag) -> bool {
        match self {
            ETagList::Star => true,
            ETagList::Tags(tags) => tags.iter().any(|t| t.strong_eq(tag)),
        }
    }

    // These may be sent as several header lines. Unparseable entries
    // are dropped, they would never match anyway.
    fn decode<'i, I>(values: &mut I) -> Result<ETagList, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let mut tags = Vec::new();
        let mut seen = false;
        for value in values {
            seen = true;
            let s = value.to_str().map_err(map_invalid)?;
            if s.trim() == "*" {
                return Ok(ETagList::Star);
            }
            tags.extend(s.split(',').filter_map(|t| t.trim().parse::<ETag>().ok()));
        }
        if seen { Ok(ETagList::Tags(tags)) } else { Err(invalid()) }
    }

    fn encode<E>(&self, values: &mut E)
    where
        E: Extend<HeaderValue>,
    {
        let s = match self {
            ETagList::Star => "*".to_string(),
            ETagList::Tags(tags) => tags.iter().map(|t| t.tag.as_str()).collect::<Vec<_>>().join(", "),
        };
        if let Ok(v) = HeaderValue::from_str(&s) {
            values.extend(std::iter::once(v));
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IfMatch(pub ETagList);

#[derive(Debug, Clone, PartialEq)]
pub struct IfNoneMatch(pub ETagList);

macro_rules! etag_list_header {
    ($($ty:ident => $name:ident),*) => {
        $(
            impl Header for $ty {
                fn name() -> &'static HeaderName {
                    &$name
                }

                fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
                where
                    I: Iterator<Item = &'i HeaderValue>,
                {
                    ETagList::decode(values).map($ty)
                }

                fn encode<E>(&self, values: &mut E)
                where
                    E: Extend<HeaderValue>,
                {
                    self.0.encode(values)
                }
            }
        )*
    };
}

etag_list_header!(IfMatch => IF_MATCH, IfNoneMatch => IF_NONE_MATCH);

/// The `If:` header: a list of condition lists. The header is true if
/// any one of the lists is.
#[derive(Debug, Clone, PartialEq)]
pub struct If(pub Vec<IfList>);

/// A parenthesized list of conditions, all of which must hold.
#[derive(Debug, Clone, PartialEq)]
pub struct IfList {
    /// The `<uri>` the list applies to, as sent. `None` means the request URI.
    pub resource_tag: Option<String>,
    pub conditions: Vec<IfCondition>,
}

/// One condition: an optionally negated state token or entity tag.
#[derive(Debug, Clone, PartialEq)]
pub struct IfCondition {
    pub not: bool,
    pub item: IfItem,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IfItem {
    StateToken(String),
    ETag(ETag),
}

impl Display for IfCondition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.not {
            f.write_str("Not ")?;
        }
        match &self.item {
            IfItem::StateToken(t) => write!(f, "<{}>", t),
            IfItem::ETag(t) => write!(f, "[{}]", t),
        }
    }
}

impl Display for IfList {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Some(tag) = &self.resource_tag {
            write!(f, "<{}> ", tag)?;
        }
        f.write_str("(")?;
        for (i, cond) in self.conditions.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}", cond)?;
        }
        f.write_str(")")
    }
}

impl Display for If {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, list) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}", list)?;
        }
        Ok(())
    }
}

impl If {
    /// All state tokens in the header that are valid lock tokens, no
    /// matter whether they appear negated or in which list.
    pub fn lock_tokens(&self) -> Vec<LockToken> {
        let mut tokens = Vec::new();
        for cond in self.0.iter().flat_map(|l| &l.conditions) {
            if let IfItem::StateToken(s) = &cond.item {
                if let Ok(t) = s.parse::<LockToken>() {
                    if !tokens.contains(&t) {
                        tokens.push(t);
                    }
                }
            }
        }
        tokens
    }
}

impl FromStr for If {
    type Err = LockError;

    /// Parse an `If:` header value. Syntax errors are `MalformedHeader`.
    fn from_str(s: &str) -> Result<If, LockError> {
        IfParser { rest: s }.parse()
    }
}

impl SingleValue for If {
    fn parse(value: &str) -> Option<Self> {
        value.parse().ok()
    }

    fn render(&self) -> String {
        self.to_string()
    }
}

fn is_special(c: char) -> bool {
    "<>()[]".contains(c)
}

// Recursive descent over the header text.
//
//   If        = 1*( [ "<" Resource-Tag ">" ] "(" 1*Condition ")" )
//   Condition = [ "Not" ] ( "<" State-Token ">" | "[" entity-tag "]" )
//
// Like several other servers we also take a bare word as State-Token.
struct IfParser<'a> {
    rest: &'a str,
}

impl<'a> IfParser<'a> {
    fn parse(mut self) -> LockResult<If> {
        let mut lists = Vec::new();
        while let Some(c) = self.peek() {
            let resource_tag = match c {
                '<' => {
                    self.bump();
                    let tag = self.delimited('>')?;
                    // either an absolute path or an absolute URI.
                    if !tag.starts_with('/') {
                        url::Url::parse(tag).map_err(|_| LockError::MalformedHeader)?;
                    }
                    Some(tag.to_string())
                }
                '(' => None,
                _ => return Err(LockError::MalformedHeader),
            };
            if self.peek() != Some('(') {
                return Err(LockError::MalformedHeader);
            }
            self.bump();
            lists.push(IfList {
                resource_tag,
                conditions: self.conditions()?,
            });
        }
        if lists.is_empty() {
            return Err(LockError::MalformedHeader);
        }
        Ok(If(lists))
    }

    // everything after "(" up to and including ")".
    fn conditions(&mut self) -> LockResult<Vec<IfCondition>> {
        let mut conditions = Vec::new();
        loop {
            let not = self.keyword("Not");
            let item = match self.peek() {
                Some(')') if !not && !conditions.is_empty() => {
                    self.bump();
                    return Ok(conditions);
                }
                Some('<') => {
                    self.bump();
                    state_token(self.delimited('>')?)?
                }
                Some('[') => {
                    self.bump();
                    let etag = self.delimited(']')?;
                    IfItem::ETag(etag.parse().map_err(|_| LockError::MalformedHeader)?)
                }
                Some(c) if !is_special(c) => state_token(self.word())?,
                _ => return Err(LockError::MalformedHeader),
            };
            conditions.push(IfCondition { not, item });
        }
    }

    // next non-whitespace character, not consumed.
    fn peek(&mut self) -> Option<char> {
        self.rest = self.rest.trim_start();
        self.rest.chars().next()
    }

    fn bump(&mut self) {
        let mut chars = self.rest.chars();
        chars.next();
        self.rest = chars.as_str();
    }

    fn keyword(&mut self, kw: &str) -> bool {
        self.rest = self.rest.trim_start();
        match self.rest.strip_prefix(kw) {
            Some(after) if after.chars().next().is_none_or(|c| c.is_whitespace() || is_special(c)) => {
                self.rest = after;
                true
            }
            _ => false,
        }
    }

    // up to the closing character, which is consumed. Whitespace is
    // only allowed between double quotes.
    fn delimited(&mut self, close: char) -> LockResult<&'a str> {
        let rest: &'a str = self.rest;
        let mut quoted = false;
        for (i, c) in rest.char_indices() {
            match c {
                '"' => quoted = !quoted,
                c if c == close && !quoted => {
                    let inner = &rest[..i];
                    self.rest = &rest[i + c.len_utf8()..];
                    return Ok(inner);
                }
                c if c.is_whitespace() && !quoted => break,
                _ => {}
            }
        }
        Err(LockError::MalformedHeader)
    }

    fn word(&mut self) -> &'a str {
        let rest: &'a str = self.rest;
        let end = rest
            .find(|c: char| c.is_whitespace() || c.is_control() || is_special(c))
            .unwrap_or(rest.len());
        let (word, rest) = rest.split_at(end);
        self.rest = rest;
        word
    }
}

// any URI will do, we do not try to validate it beyond having a scheme.
fn state_token(s: &str) -> LockResult<IfItem> {
    if s.contains(':') {
        Ok(IfItem::StateToken(s.to_string()))
    } else {
        Err(LockError::MalformedHeader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode<H: Header>(val: &str) -> Result<H, headers::Error> {
        let hdrval = HeaderValue::from_str(val).unwrap();
        let mut iter = std::iter::once(&hdrval);
        H::decode(&mut iter)
    }

    #[test]
    fn if_header() {
        let val = r#"  <http://x.yz/> ([W/"etag"] Not <DAV:nope> ) (Not<urn:x>[W/"bla"] plain:word:123) "#;
        let hdr = decode::<If>(val).unwrap();
        assert_eq!(hdr.0.len(), 2);
        assert_eq!(hdr.0[0].resource_tag.as_deref(), Some("http://x.yz/"));
        assert_eq!(hdr.0[0].conditions.len(), 2);
        assert!(hdr.0[0].conditions[1].not);
        assert_eq!(hdr.0[1].resource_tag, None);
        assert!(hdr.0[1].conditions[0].not);
        assert_eq!(hdr.0[1].conditions[2].item, IfItem::StateToken("plain:word:123".to_string()));
    }

    #[test]
    fn if_header_errors() {
        for val in [
            "",
            "()",
            "(<opaquelocktoken:abc>",
            "<opaquelocktoken:abc>",
            "(<no-colon>)",
            "(Not Not <a:b>)",
            "(Not)",
            "(<a:b>) garbage",
            "([\"unterminated)",
            "(<a: b>)",
        ] {
            assert!(val.parse::<If>().is_err(), "{:?} should not parse", val);
        }
    }

    #[test]
    fn if_header_roundtrip() {
        let val = r#"</docs/a%20b> (<opaquelocktoken:f81d4fae-7dec-11d0-a765-00a0c91e6bf6> ["x"]) (Not <DAV:no-lock> [W/"y"])"#;
        let hdr = val.parse::<If>().unwrap();
        let again = hdr.to_string().parse::<If>().unwrap();
        assert_eq!(hdr, again);
        assert_eq!(hdr.lock_tokens().len(), 1);
    }

    #[test]
    fn depth_header() {
        assert_eq!(decode::<Depth>("Infinity").unwrap(), Depth::Infinity);
        assert_eq!(decode::<Depth>("0").unwrap(), Depth::Zero);
        assert!(decode::<Depth>("2").is_err());
    }

    #[test]
    fn timeout_header() {
        let t = decode::<Timeout>("Second-60, Infinite").unwrap();
        assert_eq!(t.0, vec![DavTimeout::Seconds(60), DavTimeout::Infinite]);
        let t = decode::<Timeout>("Second-99999999999").unwrap();
        assert_eq!(t.first(), Some(DavTimeout::Seconds(u32::MAX)));
        assert!(decode::<Timeout>("Minute-5").is_err());
    }

    #[test]
    fn lock_token_header() {
        let tok = LockToken::new();
        let h = decode::<LockTokenHeader>(&format!("<{}>", tok)).unwrap();
        assert_eq!(h.0, tok);
        assert!(decode::<LockTokenHeader>(&tok.to_string()).is_err());
    }

    #[test]
    fn destination_header() {
        let d = decode::<Destination>("http://host:8080/a/b%20c").unwrap();
        assert_eq!(d.0, "/a/b%20c");
        assert_eq!(decode::<Destination>("/x").unwrap().0, "/x");
        assert!(decode::<Destination>("ftp://host/x").is_err());
    }

    #[test]
    fn etag_header() {
        let t1 = ETag::from_str(r#"W/"12345""#).unwrap();
        let t2 = ETag::from_str(r#"W/"12345""#).unwrap();
        let t3 = ETag::from_str(r#""12346""#).unwrap();
        let t4 = ETag::from_str(r#""12346""#).unwrap();
        assert!(!t1.strong_eq(&t2));
        assert!(t1.weak_eq(&t2));
        assert!(!t2.weak_eq(&t3));
        assert!(t3.strong_eq(&t4));
        assert_eq!(t3.to_string(), r#""12346""#);
        assert!(ETag::from_str("\"a\"b\"").is_err());
    }

    #[test]
    fn etag_lists() {
        match decode::<IfMatch>(r#""a", W/"b", junk"#).unwrap().0 {
            ETagList::Tags(tags) => assert_eq!(tags.len(), 2),
            ETagList::Star => panic!("not a star"),
        }
        assert_eq!(decode::<IfNoneMatch>(" * ").unwrap().0, ETagList::Star);
    }
}
