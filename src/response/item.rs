//! Dynamically shaped records produced by enumeration.

use chrono::NaiveDateTime;
use indexmap::IndexMap;
use serde::Serialize;
use std::fmt;

/// A single property value of an [`Item`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    /// The property was present and marked `xsi:nil="true"`
    Nil,
    /// Character data of the property
    Text(String),
    /// A typed `Datetime` value
    Datetime(NaiveDateTime),
    /// The property repeated within one instance, in document order
    List(Vec<Value>),
}

impl Value {
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<&NaiveDateTime> {
        match self {
            Value::Datetime(dt) => Some(dt),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(values) => Some(values),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "None"),
            Value::Text(text) => write!(f, "{}", text),
            Value::Datetime(dt) => write!(f, "{}", dt.format("%Y-%m-%dT%H:%M:%S%.6f")),
            Value::List(values) => {
                write!(f, "[")?;
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", value)?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<&str> for Value {
    fn from(text: &str) -> Self {
        Value::Text(text.to_string())
    }
}

impl From<String> for Value {
    fn from(text: String) -> Self {
        Value::Text(text)
    }
}

/// One enumerated CIM instance: properties in first-seen order.
///
/// A property never observed in the response is absent; one marked nil is
/// present with [`Value::Nil`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Item {
    properties: IndexMap<String, Value>,
}

impl Item {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a property value. A name seen before in this item turns into
    /// a list holding every value in document order.
    pub fn add_property(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        match self.properties.get_mut(&name) {
            None => {
                self.properties.insert(name, value);
            }
            Some(Value::List(values)) => values.push(value),
            Some(existing) => {
                let first = std::mem::replace(existing, Value::Nil);
                *existing = Value::List(vec![first, value]);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    /// Text value of a property, if it is plain text.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.properties.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.properties.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn property_names(&self) -> impl Iterator<Item = &str> {
        self.properties.keys().map(String::as_str)
    }
}
