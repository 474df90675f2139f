//! Request template store
//!
//! Each WS-Management operation is a SOAP envelope with `{name}`
//! placeholders. Templates are embedded at compile time; a template
//! directory in [`ClientConfig`](crate::config::ClientConfig) overrides them
//! file by file (`<dir>/<name>.xml`).
//!
//! Whitespace between tags is collapsed once when a template is first
//! loaded. Substitution is a single pass: substituted values are never
//! rescanned for placeholders, so WQL containing braces is safe.

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::error::{Error, Result};

/// Whitespace between two tags
static XML_WHITESPACE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r">\s+<").expect("Invalid XML whitespace regex"));

/// A `{name}` placeholder
static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([a-z_]+)\}").expect("Invalid placeholder regex"));

/// Names of every request template the client sends.
pub const TEMPLATE_NAMES: [&str; 10] = [
    "enumerate",
    "pull",
    "create",
    "command",
    "receive",
    "signal",
    "delete",
    "subscribe",
    "event_pull",
    "unsubscribe",
];

fn embedded(name: &str) -> Option<&'static str> {
    let text = match name {
        "enumerate" => include_str!("../templates/enumerate.xml"),
        "pull" => include_str!("../templates/pull.xml"),
        "create" => include_str!("../templates/create.xml"),
        "command" => include_str!("../templates/command.xml"),
        "receive" => include_str!("../templates/receive.xml"),
        "signal" => include_str!("../templates/signal.xml"),
        "delete" => include_str!("../templates/delete.xml"),
        "subscribe" => include_str!("../templates/subscribe.xml"),
        "event_pull" => include_str!("../templates/event_pull.xml"),
        "unsubscribe" => include_str!("../templates/unsubscribe.xml"),
        _ => return None,
    };
    Some(text)
}

/// Collapse whitespace between tags and trim the document.
pub fn normalize_whitespace(xml: &str) -> String {
    XML_WHITESPACE.replace_all(xml, "><").trim().to_string()
}

/// Loads, normalizes and renders the named request templates.
#[derive(Debug, Default)]
pub struct TemplateStore {
    override_dir: Option<PathBuf>,
    cache: RwLock<HashMap<String, Arc<str>>>,
}

impl TemplateStore {
    pub fn new(override_dir: Option<PathBuf>) -> Self {
        Self {
            override_dir,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Get the normalized template text for `name`.
    pub fn get(&self, name: &str) -> Result<Arc<str>> {
        if let Some(text) = self.cache.read().get(name) {
            return Ok(Arc::clone(text));
        }

        let raw = self.load(name)?;
        let text: Arc<str> = Arc::from(normalize_whitespace(&raw));
        self.cache
            .write()
            .insert(name.to_string(), Arc::clone(&text));
        Ok(text)
    }

    fn load(&self, name: &str) -> Result<String> {
        if !TEMPLATE_NAMES.contains(&name) {
            return Err(Error::Template(format!(
                "Invalid request template name: {}",
                name
            )));
        }

        if let Some(dir) = &self.override_dir {
            let path = dir.join(format!("{}.xml", name));
            if path.is_file() {
                debug!(template = name, path = %path.display(), "Loading request template override");
                return Ok(std::fs::read_to_string(&path)?);
            }
        }

        embedded(name)
            .map(str::to_string)
            .ok_or_else(|| Error::Template(format!("No embedded template for '{}'", name)))
    }

    /// Render `name` with the given parameters.
    ///
    /// Every placeholder in the template must have a parameter; extra
    /// parameters are ignored.
    pub fn render(&self, name: &str, params: &[(&str, &str)]) -> Result<String> {
        let template = self.get(name)?;
        let lookup: HashMap<&str, &str> = params.iter().copied().collect();

        if let Some(missing) = PLACEHOLDER
            .captures_iter(&template)
            .filter_map(|caps| caps.get(1))
            .map(|m| m.as_str())
            .find(|key| !lookup.contains_key(key))
        {
            return Err(Error::Template(format!(
                "Template '{}' is missing parameter '{}'",
                name, missing
            )));
        }

        let rendered = PLACEHOLDER.replace_all(&template, |caps: &regex::Captures<'_>| {
            lookup.get(&caps[1]).copied().unwrap_or_default().to_string()
        });
        trace!(template = name, request = %rendered, "Rendered request");
        Ok(rendered.into_owned())
    }
}
