//! Event-log subscriptions.
//!
//! `subscribe` registers a pull-mode subscription on an event channel,
//! `pull` fetches the events queued since the last pull and `unsubscribe`
//! releases the subscription. Event batches are small, so pulled responses
//! are read fully and decoded into [`Event`] records.

use chrono::NaiveDateTime;
use serde::Serialize;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

use crate::client::WinRmClient;
use crate::config::ConnectionInfo;
use crate::error::{Error, Result};
use crate::response::{parse_datetime, Element, ENUMERATION_NS, EVENTING_NS, EVENT_NS};
use crate::session::{Session, SessionKey};

/// XML-escaped `QueryList` filter for `path` and `select`.
pub fn event_query(path: &str, select: &str) -> String {
    format!(
        "&lt;QueryList&gt;&lt;Query Path=&quot;{}&quot;&gt;\
         &lt;Select&gt;{}&lt;/Select&gt;&lt;/Query&gt;&lt;/QueryList&gt;",
        path, select
    )
}

// ============================================================================
// Event Records
// ============================================================================

/// The `System` section of an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct System {
    pub provider: String,
    pub event_id: u32,
    pub event_id_qualifiers: Option<u32>,
    pub level: u32,
    pub task: u32,
    pub keywords: u64,
    pub time_created: NaiveDateTime,
    pub event_record_id: u64,
    pub channel: String,
    pub computer: String,
    pub user_id: Option<String>,
}

/// Localized rendering of an event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RenderingInfo {
    pub culture: Option<String>,
    pub message: Option<String>,
    pub level: Option<String>,
    pub opcode: Option<String>,
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Event {
    pub system: System,
    pub data: Option<String>,
    pub rendering_info: Option<RenderingInfo>,
}

// ============================================================================
// Response Extraction
// ============================================================================

pub fn find_subscription_id(root: &Element) -> Result<String> {
    root.find_text(EVENTING_NS, "Identifier")
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .ok_or_else(|| Error::protocol("Subscription identifier missing from response"))
}

pub fn find_enumeration_context(root: &Element) -> Option<String> {
    root.find_text(ENUMERATION_NS, "EnumerationContext")
        .filter(|context| !context.is_empty())
        .map(str::to_string)
}

/// All events in a pull response, in document order.
pub fn find_events(root: &Element) -> Result<Vec<Event>> {
    root.find_all(EVENT_NS, "Event").map(parse_event).collect()
}

fn required<'a>(parent: &'a Element, name: &str) -> Result<&'a Element> {
    parent
        .child(EVENT_NS, name)
        .ok_or_else(|| Error::protocol(format!("Event is missing <{}>", name)))
}

fn child_text(parent: &Element, name: &str) -> Option<String> {
    parent
        .child(EVENT_NS, name)
        .map(|e| e.trimmed_text().to_string())
}

fn parse_number<T>(text: &str, name: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    text.trim()
        .parse()
        .map_err(|e| Error::protocol(format!("Invalid event {} '{}': {}", name, text, e)))
}

fn parse_keywords(text: &str) -> Result<u64> {
    let text = text.trim();
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|e| Error::protocol(format!("Invalid event keywords '{}': {}", text, e)))
}

fn parse_system(system: &Element) -> Result<System> {
    let provider = required(system, "Provider")?
        .attr("Name")
        .unwrap_or_default()
        .to_string();
    let event_id_elem = required(system, "EventID")?;
    let time_created = required(system, "TimeCreated")?
        .attr("SystemTime")
        .ok_or_else(|| Error::protocol("TimeCreated has no SystemTime"))?;

    Ok(System {
        provider,
        event_id: parse_number(event_id_elem.trimmed_text(), "EventID")?,
        event_id_qualifiers: event_id_elem
            .attr("Qualifiers")
            .map(|q| parse_number(q, "Qualifiers"))
            .transpose()?,
        level: parse_number(required(system, "Level")?.trimmed_text(), "Level")?,
        task: parse_number(required(system, "Task")?.trimmed_text(), "Task")?,
        keywords: parse_keywords(required(system, "Keywords")?.trimmed_text())?,
        time_created: parse_datetime(time_created)?,
        event_record_id: parse_number(
            required(system, "EventRecordID")?.trimmed_text(),
            "EventRecordID",
        )?,
        channel: child_text(system, "Channel").unwrap_or_default(),
        computer: child_text(system, "Computer").unwrap_or_default(),
        user_id: system
            .child(EVENT_NS, "Security")
            .and_then(|security| security.attr("UserID"))
            .map(str::to_string),
    })
}

fn parse_rendering_info(info: &Element) -> RenderingInfo {
    RenderingInfo {
        culture: info.attr("Culture").map(str::to_string),
        message: child_text(info, "Message"),
        level: child_text(info, "Level"),
        opcode: child_text(info, "Opcode"),
        keywords: info
            .child(EVENT_NS, "Keywords")
            .map(|keywords| {
                keywords
                    .children
                    .iter()
                    .filter(|k| k.is(EVENT_NS, "Keyword"))
                    .map(|k| k.trimmed_text().to_string())
                    .collect()
            })
            .unwrap_or_default(),
    }
}

fn parse_event(event: &Element) -> Result<Event> {
    Ok(Event {
        system: parse_system(required(event, "System")?)?,
        data: event
            .child(EVENT_NS, "EventData")
            .and_then(|data| data.child(EVENT_NS, "Data"))
            .map(|data| data.trimmed_text().to_string()),
        rendering_info: event
            .child(EVENT_NS, "RenderingInfo")
            .map(parse_rendering_info),
    })
}

// ============================================================================
// Event Subscription
// ============================================================================

/// A pull-mode subscription on one event channel.
#[derive(Debug)]
pub struct EventSubscription {
    client: WinRmClient,
    conn_info: Arc<ConnectionInfo>,
    session: Option<Arc<Session>>,
    subscription_id: Option<String>,
    enumeration_context: Option<String>,
}

impl EventSubscription {
    pub(crate) fn new(client: WinRmClient, conn_info: Arc<ConnectionInfo>) -> Self {
        Self {
            client,
            conn_info,
            session: None,
            subscription_id: None,
            enumeration_context: None,
        }
    }

    pub fn subscription_id(&self) -> Option<&str> {
        self.subscription_id.as_deref()
    }

    pub fn enumeration_context(&self) -> Option<&str> {
        self.enumeration_context.as_deref()
    }

    fn active(&self) -> Result<(&Arc<Session>, &str)> {
        match (&self.session, &self.subscription_id) {
            (Some(session), Some(id)) => Ok((session, id)),
            _ => Err(Error::protocol("Not subscribed")),
        }
    }

    /// Subscribe to `path` (e.g. `Application`) with an XPath `select`
    /// filter (`*` for everything).
    pub async fn subscribe(&mut self, path: &str, select: &str) -> Result<()> {
        if self.subscription_id.is_some() {
            return Err(Error::protocol("Already subscribed"));
        }
        let key = SessionKey::new(self.conn_info.address(), format!("subscription:{}", path));
        let session = self.client.sessions().get_or_create(key, &self.conn_info);

        let sender = session.acquire().await?;
        let query = event_query(path, select);
        let body = sender
            .send("subscribe", &[("event_query", query.as_str())])
            .await?
            .bytes()
            .await?;
        drop(sender);

        let root = Element::parse(&body)?;
        let subscription_id = find_subscription_id(&root)?;
        info!(
            host = %self.conn_info.hostname,
            path,
            subscription_id = %subscription_id,
            "Subscribed to event channel"
        );
        self.enumeration_context = find_enumeration_context(&root);
        self.subscription_id = Some(subscription_id);
        self.session = Some(session);
        Ok(())
    }

    /// Pull queued events, calling `callback` once per event in document
    /// order.
    pub async fn pull<F>(&mut self, mut callback: F) -> Result<()>
    where
        F: FnMut(Event),
    {
        for event in self.pull_events().await? {
            callback(event);
        }
        Ok(())
    }

    /// Pull queued events.
    pub async fn pull_events(&mut self) -> Result<Vec<Event>> {
        let (session, subscription_id) = self.active()?;
        let context = self
            .enumeration_context
            .as_deref()
            .ok_or_else(|| Error::protocol("Subscription has no enumeration context"))?;

        let sender = session.acquire().await?;
        let body = sender
            .send(
                "event_pull",
                &[
                    ("subscription_id", subscription_id),
                    ("enumeration_context", context),
                ],
            )
            .await?
            .bytes()
            .await?;
        drop(sender);

        let root = Element::parse(&body)?;
        let events = find_events(&root)?;
        debug!(host = %self.conn_info.hostname, events = events.len(), "Pulled events");
        if let Some(context) = find_enumeration_context(&root) {
            self.enumeration_context = Some(context);
        }
        Ok(events)
    }

    /// Release the subscription.
    pub async fn unsubscribe(&mut self) -> Result<()> {
        let (session, subscription_id) = self.active()?;
        let session = Arc::clone(session);
        let sender = session.acquire().await?;
        sender
            .send("unsubscribe", &[("subscription_id", subscription_id)])
            .await?;
        drop(sender);

        info!(host = %self.conn_info.hostname, "Unsubscribed");
        self.subscription_id = None;
        self.enumeration_context = None;
        self.session = None;
        session.close();
        Ok(())
    }
}
