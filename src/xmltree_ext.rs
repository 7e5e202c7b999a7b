use std::io::{Read, Write};

use xmltree::{self, Element, EmitterConfig, XMLNode};

use crate::{DavError, DavResult};

pub(crate) const NS_DAV_URI: &str = "DAV:";

pub(crate) trait ElementExt {
    /// Builder: add a namespace declaration.
    fn ns<S: Into<String>>(self, prefix: S, namespace: S) -> Self;
    /// Element with an optional `prefix:`, e.g. `D:href`.
    fn new2<'a, E: Into<&'a str>>(e: E) -> Self;
    /// Parse, and map errors to `DavError`.
    fn parse2<R: Read>(r: R) -> Result<Element, DavError>;
    fn new_text<'a, E: Into<&'a str>, T: Into<String>>(e: E, t: T) -> Self;
    fn text<T: Into<String>>(self, t: T) -> Self;
    fn push_elem(&mut self, e: Element);
    fn child_elems(&self) -> Box<dyn Iterator<Item = &Element> + '_>;
    fn has_child_elems(&self) -> bool;
    /// Is this element `{DAV:}name`.
    fn is_dav(&self, name: &str) -> bool;
    /// Serialize, with an XML declaration.
    fn write_doc<W: Write>(&self, w: W) -> DavResult<()>;
}

impl ElementExt for Element {
    fn ns<S: Into<String>>(mut self, prefix: S, namespace: S) -> Element {
        let mut ns = self.namespaces.unwrap_or_else(xmltree::Namespace::empty);
        ns.force_put(prefix.into(), namespace.into());
        self.namespaces = Some(ns);
        self
    }

    fn new2<'a, N: Into<&'a str>>(n: N) -> Element {
        let v: Vec<&str> = n.into().splitn(2, ':').collect();
        if v.len() == 1 {
            Element::new(v[0])
        } else {
            let mut e = Element::new(v[1]);
            e.prefix = Some(v[0].to_string());
            e
        }
    }

    fn new_text<'a, N: Into<&'a str>, S: Into<String>>(n: N, t: S) -> Element {
        Element::new2(n).text(t)
    }

    fn text<S: Into<String>>(mut self, t: S) -> Element {
        self.children.push(XMLNode::Text(t.into()));
        self
    }

    fn push_elem(&mut self, e: Element) {
        self.children.push(XMLNode::Element(e));
    }

    fn child_elems(&self) -> Box<dyn Iterator<Item = &Element> + '_> {
        Box::new(self.children.iter().filter_map(|n| n.as_element()))
    }

    fn has_child_elems(&self) -> bool {
        self.children.iter().any(|n| n.as_element().is_some())
    }

    fn is_dav(&self, name: &str) -> bool {
        self.name == name && self.namespace.as_deref() == Some(NS_DAV_URI)
    }

    fn parse2<R: Read>(r: R) -> Result<Element, DavError> {
        match Element::parse(r) {
            Ok(elems) => Ok(elems),
            Err(xmltree::ParseError::MalformedXml(_)) => Err(DavError::XmlParseError),
            Err(_) => Err(DavError::XmlReadError),
        }
    }

    fn write_doc<W: Write>(&self, w: W) -> DavResult<()> {
        let config = EmitterConfig::new().perform_indent(false).write_document_declaration(true);
        self.write_with_config(w, config).map_err(|_| DavError::XmlWriteError)
    }
}
