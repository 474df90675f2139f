//! Streaming parser for enumerate and pull responses.
//!
//! The XML reader produces namespace-resolved events which a
//! [`ResponseParser`] routes to one of two handlers:
//!
//! - the header handler records the enumeration context and the
//!   end-of-sequence marker,
//! - the items handler rebuilds [`Item`]s from the `Items` element using a
//!   tag stack bounded at three levels below `Items`
//!   (instance / property / typed value).
//!
//! `select *` responses name the instance element after the CIM class and
//! namespace each property; explicit field lists wrap the instance in a
//! generic `XmlFragment` and leave properties unqualified. Only tag
//! identity differs, so both produce the same items.
//!
//! No document tree is built; items are assembled while the body is still
//! arriving.

use quick_xml::events::{BytesStart, Event};
use quick_xml::NsReader;
use tokio::io::AsyncBufRead;
use tracing::trace;

use super::datetime::parse_datetime;
use super::item::{Item, Value};
use super::tree::namespace_of;
use super::{CIM_SCHEMA_NS, ENUMERATION_NS, WSMAN_NS, XSI_NS};
use crate::error::{Error, Result};

/// Deepest tag level allowed below the `Items` element.
pub const MAX_ITEM_DEPTH: usize = 3;

// ============================================================================
// Parse Events
// ============================================================================

/// A namespace-qualified tag name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub namespace: Option<String>,
    pub name: String,
}

impl Tag {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self {
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
        }
    }

    /// Case-insensitive comparison of namespace and local name.
    pub fn matches(&self, namespace: Option<&str>, name: &str) -> bool {
        let ns_match = match (self.namespace.as_deref(), namespace) {
            (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
            (None, None) => true,
            _ => false,
        };
        ns_match && self.name.eq_ignore_ascii_case(name)
    }

    fn matches_tag(&self, other: &Tag) -> bool {
        self.matches(other.namespace.as_deref(), &other.name)
    }
}

/// Reader-independent event fed to a [`ResponseParser`].
#[derive(Debug, Clone, PartialEq)]
pub enum ParseEvent {
    Start { tag: Tag, nil: bool },
    End { tag: Tag },
    Text(String),
}

// ============================================================================
// Parse Result
// ============================================================================

/// Pagination state reported by one enumerate or pull response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnumerationContext {
    pub token: Option<String>,
    pub end_of_sequence: bool,
}

impl EnumerationContext {
    /// The token to pull with next, or `None` when paging is finished.
    pub fn next(&self) -> Option<&str> {
        if self.end_of_sequence {
            return None;
        }
        self.token.as_deref().filter(|t| !t.is_empty())
    }
}

/// Everything extracted from one enumerate or pull response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedResponse {
    pub context: EnumerationContext,
    pub items: Vec<Item>,
}

// ============================================================================
// Handlers
// ============================================================================

/// `n:EndOfSequence` on pulls, `w:EndOfSequence` on optimized enumerations.
fn is_end_of_sequence(tag: &Tag) -> bool {
    tag.matches(Some(ENUMERATION_NS), "EndOfSequence")
        || tag.matches(Some(WSMAN_NS), "EndOfSequence")
}

#[derive(Debug, Default)]
struct HeaderHandler {
    context: EnumerationContext,
}

impl HeaderHandler {
    fn end(&mut self, tag: &Tag, text: &str) {
        if tag.matches(Some(ENUMERATION_NS), "EnumerationContext") {
            self.context.token = Some(text.to_string());
        } else if is_end_of_sequence(tag) {
            self.context.end_of_sequence = true;
        }
    }
}

#[derive(Debug, Default)]
struct ItemsHandler {
    stack: Vec<Tag>,
    value: Option<Value>,
    items: Vec<Item>,
}

impl ItemsHandler {
    fn start(&mut self, tag: Tag, nil: bool) -> Result<()> {
        // stack[0] is the Items element itself
        if self.stack.len() > MAX_ITEM_DEPTH {
            let path: Vec<&str> = self.stack.iter().map(|t| t.name.as_str()).collect();
            return Err(Error::protocol(format!(
                "Tag stack too deep: {} {}",
                path.join("/"),
                tag.name
            )));
        }
        match self.stack.len() {
            1 => self.items.push(Item::new()),
            2 if nil => self.value = Some(Value::Nil),
            _ => {}
        }
        self.stack.push(tag);
        Ok(())
    }

    fn end(&mut self, tag: &Tag, text: &str) -> Result<()> {
        let open = self
            .stack
            .pop()
            .ok_or_else(|| Error::protocol(format!("End of {} with no open tag", tag.name)))?;
        if !open.matches_tag(tag) {
            return Err(Error::protocol(format!(
                "End of {} when expecting {}",
                tag.name, open.name
            )));
        }

        match self.stack.len() {
            2 => {
                let value = self
                    .value
                    .take()
                    .unwrap_or_else(|| Value::Text(text.to_string()));
                let item = self.items.last_mut().ok_or_else(|| {
                    Error::protocol(format!("Property {} outside of an instance", tag.name))
                })?;
                item.add_property(tag.name.clone(), value);
            }
            3 => {
                if tag.matches(Some(CIM_SCHEMA_NS), "Datetime") || tag.matches(None, "Datetime") {
                    self.value = Some(Value::Datetime(parse_datetime(text)?));
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Header,
    Items,
}

// ============================================================================
// Response Parser
// ============================================================================

/// Parser state for one response body.
///
/// Each response gets its own instance, so concurrent parses never share
/// state.
#[derive(Debug, Default)]
pub struct ResponseParser {
    buffer: String,
    text: String,
    active: Option<(Route, Tag)>,
    header: HeaderHandler,
    items: ItemsHandler,
}

impl ResponseParser {
    pub fn new() -> Self {
        Self::default()
    }

    fn route_for(tag: &Tag) -> Option<Route> {
        if tag.matches(Some(ENUMERATION_NS), "EnumerationContext") || is_end_of_sequence(tag) {
            Some(Route::Header)
        } else if tag.matches(Some(WSMAN_NS), "Items") || tag.matches(Some(ENUMERATION_NS), "Items")
        {
            Some(Route::Items)
        } else {
            None
        }
    }

    /// Feed one event.
    pub fn handle(&mut self, event: ParseEvent) -> Result<()> {
        match event {
            ParseEvent::Start { tag, nil } => {
                self.buffer.clear();
                if self.active.is_none() {
                    if let Some(route) = Self::route_for(&tag) {
                        trace!(tag = %tag.name, ?route, "Dispatching");
                        self.active = Some((route, tag.clone()));
                    }
                }
                if let Some((Route::Items, _)) = self.active {
                    self.items.start(tag, nil)?;
                }
            }
            ParseEvent::End { tag } => {
                self.text = std::mem::take(&mut self.buffer);
                let routed = self
                    .active
                    .as_ref()
                    .map(|(route, open)| (*route, open.matches_tag(&tag)));
                if let Some((route, closes)) = routed {
                    match route {
                        Route::Header => self.header.end(&tag, &self.text),
                        Route::Items => self.items.end(&tag, &self.text)?,
                    }
                    if closes {
                        self.active = None;
                    }
                }
            }
            ParseEvent::Text(chunk) => self.buffer.push_str(chunk.trim()),
        }
        Ok(())
    }

    /// Finish the document and return what was collected.
    pub fn finish(self) -> Result<ParsedResponse> {
        if let Some((Route::Items, tag)) = &self.active {
            return Err(Error::protocol(format!(
                "Response ended inside {}",
                tag.name
            )));
        }
        Ok(ParsedResponse {
            context: self.header.context,
            items: self.items.items,
        })
    }
}

// ============================================================================
// Reader Drivers
// ============================================================================

fn start_event<R>(
    reader: &NsReader<R>,
    namespace: Option<String>,
    start: &BytesStart<'_>,
) -> Result<ParseEvent> {
    let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
    let mut nil = false;
    for attr in start.attributes() {
        let attr = attr?;
        let (resolved, local) = reader.resolve_attribute(attr.key);
        let is_nil = local.as_ref() == b"nil"
            && namespace_of(&resolved).as_deref() == Some(XSI_NS);
        if is_nil {
            nil = attr.unescape_value()?.trim() == "true";
        }
    }
    Ok(ParseEvent::Start {
        tag: Tag { namespace, name },
        nil,
    })
}

/// Translate one reader event. Returns `false` at end of document.
fn feed<R>(
    parser: &mut ResponseParser,
    reader: &NsReader<R>,
    namespace: Option<String>,
    event: Event<'_>,
) -> Result<bool> {
    match event {
        Event::Start(start) => parser.handle(start_event(reader, namespace, &start)?)?,
        Event::End(end) => {
            let name = String::from_utf8_lossy(end.local_name().as_ref()).into_owned();
            parser.handle(ParseEvent::End {
                tag: Tag { namespace, name },
            })?;
        }
        Event::Text(text) => parser.handle(ParseEvent::Text(text.unescape()?.into_owned()))?,
        Event::CData(data) => {
            parser.handle(ParseEvent::Text(String::from_utf8_lossy(&data).into_owned()))?
        }
        Event::Eof => return Ok(false),
        _ => {}
    }
    Ok(true)
}

/// Parse a complete response held in memory.
pub fn parse_slice(xml: &[u8]) -> Result<ParsedResponse> {
    let mut reader = NsReader::from_reader(xml);
    reader.config_mut().expand_empty_elements = true;

    let mut parser = ResponseParser::new();
    let mut buf = Vec::new();
    loop {
        let (resolved, event) = reader.read_resolved_event_into(&mut buf)?;
        let namespace = namespace_of(&resolved);
        if !feed(&mut parser, &reader, namespace, event)? {
            break;
        }
        buf.clear();
    }
    parser.finish()
}

/// Parse a response body incrementally as it arrives.
pub async fn parse_stream<R>(body: R) -> Result<ParsedResponse>
where
    R: AsyncBufRead + Unpin,
{
    let mut reader = NsReader::from_reader(body);
    reader.config_mut().expand_empty_elements = true;

    let mut parser = ResponseParser::new();
    let mut buf = Vec::new();
    loop {
        let (resolved, event) = reader.read_resolved_event_into_async(&mut buf).await?;
        let namespace = namespace_of(&resolved);
        if !feed(&mut parser, &reader, namespace, event)? {
            break;
        }
        buf.clear();
    }
    parser.finish()
}
