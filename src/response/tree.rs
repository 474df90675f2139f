//! A small namespace-aware element tree.
//!
//! Shell, subscription and fault responses are small and have a fixed
//! shape, so they are read fully and queried by (namespace, local name)
//! instead of going through the streaming parser.

use quick_xml::events::{BytesStart, Event};
use quick_xml::name::ResolveResult;
use quick_xml::NsReader;

use crate::error::{Error, Result};

/// An XML element with its resolved namespace.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Element {
    pub namespace: Option<String>,
    pub name: String,
    /// Attributes by local name, in document order
    pub attributes: Vec<(String, String)>,
    /// Character data directly inside this element
    pub text: String,
    pub children: Vec<Element>,
}

impl Element {
    /// Parse a complete document and return its root element.
    pub fn parse(xml: &[u8]) -> Result<Element> {
        let mut reader = NsReader::from_reader(xml);
        reader.config_mut().expand_empty_elements = true;

        let mut buf = Vec::new();
        let mut stack: Vec<Element> = Vec::new();

        loop {
            let (resolved, event) = reader.read_resolved_event_into(&mut buf)?;
            let namespace = namespace_of(&resolved);
            match event {
                Event::Start(start) => {
                    let element = start_element(&reader, namespace, &start)?;
                    stack.push(element);
                }
                Event::End(_) => {
                    let element = stack
                        .pop()
                        .ok_or_else(|| Error::protocol("Unbalanced end tag"))?;
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(element),
                        None => return Ok(element),
                    }
                }
                Event::Text(text) => {
                    if let Some(current) = stack.last_mut() {
                        current.text.push_str(&text.unescape()?);
                    }
                }
                Event::CData(data) => {
                    if let Some(current) = stack.last_mut() {
                        current.text.push_str(&String::from_utf8_lossy(&data));
                    }
                }
                Event::Eof => return Err(Error::protocol("Unexpected end of document")),
                _ => {}
            }
            buf.clear();
        }
    }

    pub fn is(&self, namespace: &str, name: &str) -> bool {
        self.name == name && self.namespace.as_deref() == Some(namespace)
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Trimmed text of this element.
    pub fn trimmed_text(&self) -> &str {
        self.text.trim()
    }

    /// Depth-first iterator over all descendants, excluding `self`.
    pub fn descendants(&self) -> Descendants<'_> {
        Descendants {
            stack: self.children.iter().rev().collect(),
        }
    }

    /// First descendant with the given namespace and local name.
    pub fn find(&self, namespace: &str, name: &str) -> Option<&Element> {
        self.descendants().find(|e| e.is(namespace, name))
    }

    /// All descendants with the given namespace and local name.
    pub fn find_all<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
    ) -> impl Iterator<Item = &'a Element> + 'a {
        self.descendants().filter(move |e| e.is(namespace, name))
    }

    /// Trimmed text of the first matching descendant.
    pub fn find_text(&self, namespace: &str, name: &str) -> Option<&str> {
        self.find(namespace, name).map(Element::trimmed_text)
    }

    /// First direct child with the given namespace and local name.
    pub fn child(&self, namespace: &str, name: &str) -> Option<&Element> {
        self.children.iter().find(|e| e.is(namespace, name))
    }
}

pub struct Descendants<'a> {
    stack: Vec<&'a Element>,
}

impl<'a> Iterator for Descendants<'a> {
    type Item = &'a Element;

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.stack.pop()?;
        self.stack.extend(next.children.iter().rev());
        Some(next)
    }
}

pub(crate) fn namespace_of(resolved: &ResolveResult<'_>) -> Option<String> {
    match resolved {
        ResolveResult::Bound(ns) => Some(String::from_utf8_lossy(ns.as_ref()).into_owned()),
        _ => None,
    }
}

fn start_element<R>(
    reader: &NsReader<R>,
    namespace: Option<String>,
    start: &BytesStart<'_>,
) -> Result<Element> {
    let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
    let mut attributes = Vec::new();
    for attr in start.attributes() {
        let attr = attr?;
        if attr.key.as_namespace_binding().is_some() {
            continue;
        }
        let (_, local) = reader.resolve_attribute(attr.key);
        let key = String::from_utf8_lossy(local.as_ref()).into_owned();
        let value = attr.unescape_value()?.into_owned();
        attributes.push((key, value));
    }
    Ok(Element {
        namespace,
        name,
        attributes,
        text: String::new(),
        children: Vec::new(),
    })
}
