use std::collections::BTreeMap;
use std::io::Cursor;

use headers::HeaderMapExt;
use http::{Request, Response, StatusCode};
use xmltree::{Element, EmitterConfig};

use crate::body::Body;
use crate::davheaders;
use crate::davpath::DavPath;
use crate::fs::*;
use crate::handle_lock::{list_lockdiscovery, list_supportedlock};
use crate::multierror::MultiError;
use crate::util::{dav_xml_error, systemtime_to_httpdate};
use crate::xmltree_ext::{ElementExt, NS_DAV_URI};
use crate::{DavError, DavInner, DavResult};

const ALLPROP_STR: &[&str] = &[
    "getetag",
    "getcontentlength",
    "getcontenttype",
    "getlastmodified",
    "resourcetype",
    "supportedlock",
    "lockdiscovery",
];

// What a PROPFIND asks for.
enum PropFind {
    AllProp,
    PropName,
    Prop(Vec<Element>),
}

fn dav_elem(name: &str) -> Element {
    let mut e = Element::new2(format!("D:{}", name).as_str());
    e.namespace = Some(NS_DAV_URI.to_string());
    e
}

impl DavInner {
    pub(crate) async fn handle_propfind(&self, req: &Request<()>, xmldata: &[u8]) -> DavResult<Response<Body>> {
        // No checks on If: and If-* headers here, there's nothing in
        // RFC4918 that indicates we should.
        let depth = match req.headers().typed_try_get::<davheaders::Depth>() {
            Ok(Some(davheaders::Depth::Infinity)) | Ok(None) => {
                let mut res = Response::new(dav_xml_error("<D:propfind-finite-depth/>"));
                *res.status_mut() = StatusCode::FORBIDDEN;
                res.headers_mut().insert(
                    http::header::CONTENT_TYPE,
                    http::HeaderValue::from_static("application/xml; charset=utf-8"),
                );
                return Ok(res);
            }
            Ok(Some(d)) => d,
            Err(_) => return Err(StatusCode::BAD_REQUEST.into()),
        };

        let path = self.path(req)?;
        let meta = self.fs.metadata(&path).await?;
        let what = parse_propfind(xmldata)?;

        let mut ms = MultiError::new();
        let is_dir = meta.is_dir();
        ms.push_raw(self.propresponse(&path, meta.as_ref(), &what).await);

        if is_dir && depth == davheaders::Depth::One {
            match self.fs.read_dir(&path).await {
                Ok(entries) => {
                    for entry in entries {
                        let mut npath = path.clone();
                        npath.push_segment(&entry.name);
                        ms.push_raw(self.propresponse(&npath, entry.meta.as_ref(), &what).await);
                    }
                }
                Err(e) => error!("read_dir error {:?}", e),
            }
        }

        let mut res = ms.into_response(StatusCode::MULTI_STATUS)?;
        let h = res.headers_mut();
        h.insert("cache-control", http::HeaderValue::from_static("no-store, no-cache, must-revalidate"));
        h.insert("pragma", http::HeaderValue::from_static("no-cache"));
        Ok(res)
    }

    // One <D:response> for a resource, with a <D:propstat> per status.
    async fn propresponse(&self, path: &DavPath, meta: &dyn DavMetaData, what: &PropFind) -> Element {
        let mut props: BTreeMap<StatusCode, Vec<Element>> = BTreeMap::new();
        let dead = self.fs.get_props(path).await.unwrap_or_default();

        match what {
            PropFind::AllProp | PropFind::PropName => {
                let content = matches!(what, PropFind::AllProp);
                for name in ALLPROP_STR {
                    if let Some(e) = self.build_prop(&dav_elem(name), path, meta, content) {
                        props.entry(StatusCode::OK).or_default().push(e);
                    }
                }
                for p in dead {
                    let e = if content { davprop_to_element(p) } else { davprop_to_element(strip_value(p)) };
                    props.entry(StatusCode::OK).or_default().push(e);
                }
            }
            PropFind::Prop(wanted) => {
                for w in wanted {
                    let found = if w.namespace.as_deref() == Some(NS_DAV_URI) {
                        self.build_prop(w, path, meta, true)
                    } else {
                        None
                    };
                    let found = found.or_else(|| {
                        dead.iter()
                            .find(|p| p.name == w.name && p.namespace == w.namespace)
                            .map(|p| davprop_to_element(p.clone()))
                    });
                    match found {
                        Some(e) => props.entry(StatusCode::OK).or_default().push(e),
                        None => {
                            let e = if w.namespace.as_deref() == Some(NS_DAV_URI) {
                                dav_elem(&w.name)
                            } else {
                                let mut e = w.clone();
                                e.children.clear();
                                e
                            };
                            props.entry(StatusCode::NOT_FOUND).or_default().push(e);
                        }
                    }
                }
            }
        }

        let mut resp = Element::new2("D:response");
        let mut href = path.as_url_string_with_prefix();
        if meta.is_dir() && !href.ends_with('/') {
            href.push('/');
        }
        resp.push_elem(Element::new_text("D:href", href));
        for (status, elems) in props {
            let mut propstat = Element::new2("D:propstat");
            let mut prop = Element::new2("D:prop");
            for e in elems {
                prop.push_elem(e);
            }
            propstat.push_elem(prop);
            propstat.push_elem(Element::new_text("D:status", format!("HTTP/1.1 {}", status)));
            resp.push_elem(propstat);
        }
        resp
    }

    // A live DAV: property, or None if we don't have it for this resource.
    fn build_prop(&self, prop: &Element, path: &DavPath, meta: &dyn DavMetaData, content: bool) -> Option<Element> {
        let mut elem = dav_elem(&prop.name);
        if !content {
            return match prop.name.as_str() {
                "getcontentlength" if meta.is_dir() => None,
                _ => Some(elem),
            };
        }
        let text = match prop.name.as_str() {
            "getetag" => format!("\"{}\"", meta.etag()?),
            "getcontentlength" if !meta.is_dir() => meta.len().to_string(),
            "getcontenttype" if meta.is_dir() => "httpd/unix-directory".to_string(),
            "getcontenttype" => path.get_mime_type_str().to_string(),
            "getlastmodified" => systemtime_to_httpdate(meta.modified().ok()?),
            "resourcetype" => {
                if meta.is_dir() {
                    elem.push_elem(Element::new2("D:collection"));
                }
                return Some(elem);
            }
            "supportedlock" => return Some(list_supportedlock()),
            "lockdiscovery" => return Some(list_lockdiscovery(&self.lm, path)),
            _ => return None,
        };
        Some(elem.text(text))
    }

    pub(crate) async fn handle_proppatch(&self, req: &Request<()>, xmldata: &[u8]) -> DavResult<Response<Body>> {
        // file must exist.
        let path = self.path(req)?;
        self.fs.metadata(&path).await?;

        // check the If header and the locks.
        self.check_write(req, &path, false).await?;

        debug!(target: "xml", "proppatch input:\n{}]\n", String::from_utf8_lossy(xmldata));

        // parse xml
        let tree = Element::parse2(Cursor::new(xmldata))?;
        if !tree.is_dav("propertyupdate") {
            return Err(DavError::XmlParseError);
        }

        let mut set = Vec::new();
        let mut rem = Vec::new();
        let mut ret = Vec::new();

        // DAV: properties are live and cannot be changed, except
        // displayname which we keep as a dead property.
        for elem in tree.child_elems() {
            for n in elem.child_elems().filter(|f| f.is_dav("prop")).flat_map(|f| f.child_elems()) {
                let protected = n.namespace.as_deref() == Some(NS_DAV_URI) && n.name != "displayname";
                if elem.is_dav("set") {
                    if protected {
                        ret.push((StatusCode::FORBIDDEN, element_to_davprop(n)));
                    } else {
                        set.push(element_to_davprop_full(n));
                    }
                } else if elem.is_dav("remove") {
                    if protected {
                        ret.push((StatusCode::FORBIDDEN, element_to_davprop(n)));
                    } else {
                        rem.push(element_to_davprop(n));
                    }
                }
            }
        }

        // if any set/remove failed, stop processing here.
        if !ret.is_empty() {
            ret.extend(set.into_iter().chain(rem).map(|p| (StatusCode::FAILED_DEPENDENCY, p)));
        } else if !set.is_empty() || !rem.is_empty() {
            ret.extend(self.fs.patch_props(&path, set, rem).await?);
        }

        // group by statuscode.
        let mut hm: BTreeMap<StatusCode, Vec<Element>> = BTreeMap::new();
        for (code, prop) in ret {
            hm.entry(code).or_default().push(davprop_to_element(strip_value(prop)));
        }

        let mut resp = Element::new2("D:response");
        resp.push_elem(Element::new_text("D:href", path.as_url_string_with_prefix()));
        for (status, elems) in hm {
            let mut propstat = Element::new2("D:propstat");
            let mut prop = Element::new2("D:prop");
            for e in elems {
                prop.push_elem(e);
            }
            propstat.push_elem(prop);
            propstat.push_elem(Element::new_text("D:status", format!("HTTP/1.1 {}", status)));
            resp.push_elem(propstat);
        }
        let mut ms = MultiError::new();
        ms.push_raw(resp);
        ms.into_response(StatusCode::MULTI_STATUS)
    }
}

fn parse_propfind(xmldata: &[u8]) -> DavResult<PropFind> {
    if xmldata.is_empty() {
        return Ok(PropFind::AllProp);
    }
    let tree = Element::parse2(Cursor::new(xmldata))?;
    if !tree.is_dav("propfind") {
        return Err(DavError::XmlParseError);
    }
    for elem in tree.child_elems() {
        if elem.is_dav("allprop") {
            return Ok(PropFind::AllProp);
        } else if elem.is_dav("propname") {
            return Ok(PropFind::PropName);
        } else if elem.is_dav("prop") {
            return Ok(PropFind::Prop(elem.child_elems().cloned().collect()));
        }
    }
    Err(DavError::XmlParseError)
}

fn strip_value(mut prop: DavProp) -> DavProp {
    prop.xml = None;
    prop
}

fn element_to_davprop_full(elem: &Element) -> DavProp {
    let mut xml = Vec::new();
    let config = EmitterConfig::new().perform_indent(false).write_document_declaration(false);
    elem.write_with_config(&mut xml, config).ok();
    DavProp {
        name: elem.name.clone(),
        prefix: elem.prefix.clone(),
        namespace: elem.namespace.clone(),
        xml: Some(xml),
    }
}

fn element_to_davprop(elem: &Element) -> DavProp {
    DavProp {
        name: elem.name.clone(),
        prefix: elem.prefix.clone(),
        namespace: elem.namespace.clone(),
        xml: None,
    }
}

fn davprop_to_element(prop: DavProp) -> Element {
    if let Some(ref xml) = prop.xml {
        if let Ok(e) = Element::parse2(Cursor::new(xml)) {
            return e;
        }
    }
    let mut elem = Element::new(&prop.name);
    if let Some(ref ns) = prop.namespace {
        let pfx = prop.prefix.as_deref().unwrap_or("");
        elem = elem.ns(pfx, ns.as_str());
    }
    elem.prefix = prop.prefix;
    elem.namespace = prop.namespace;
    elem
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn propfind_body() {
        assert!(matches!(parse_propfind(b"").unwrap(), PropFind::AllProp));
        let body = br#"<D:propfind xmlns:D="DAV:"><D:prop><D:lockdiscovery/><Z:color xmlns:Z="urn:z"/></D:prop></D:propfind>"#;
        match parse_propfind(body).unwrap() {
            PropFind::Prop(v) => {
                assert_eq!(v.len(), 2);
                assert!(v[0].is_dav("lockdiscovery"));
                assert_eq!(v[1].namespace.as_deref(), Some("urn:z"));
            }
            _ => panic!("expected prop"),
        }
        assert!(parse_propfind(br#"<propfind xmlns="urn:x"><prop/></propfind>"#).is_err());
    }

    #[test]
    fn dead_prop_roundtrip() {
        let e = Element::parse2(&br#"<Z:color xmlns:Z="urn:z">blue</Z:color>"#[..]).unwrap();
        let p = element_to_davprop_full(&e);
        let back = davprop_to_element(p.clone());
        assert_eq!(back.name, "color");
        assert_eq!(back.get_text().as_deref(), Some("blue"));
        let bare = davprop_to_element(strip_value(p));
        assert!(bare.children.is_empty());
        assert_eq!(bare.namespace.as_deref(), Some("urn:z"));
    }
}
