//! SOAP fault bodies returned with non-200 responses.

use super::tree::Element;
use super::SOAP_ENV_NS;

/// Build a human-readable reason from a SOAP fault body.
///
/// The fault `Text` and the first `Detail/*/*` text are joined with a
/// single space. Bodies that are not XML come back trimmed as-is.
pub fn parse_fault_message(body: &[u8]) -> String {
    let root = match Element::parse(body) {
        Ok(root) => root,
        Err(_) => return String::from_utf8_lossy(body).trim().to_string(),
    };

    let text = root
        .find_text(SOAP_ENV_NS, "Text")
        .filter(|t| !t.is_empty());

    let detail = root.find(SOAP_ENV_NS, "Detail").and_then(|detail| {
        detail
            .children
            .iter()
            .flat_map(|child| child.children.iter())
            .map(Element::trimmed_text)
            .find(|t| !t.is_empty())
    });

    match (text, detail) {
        (Some(text), Some(detail)) => format!("{} {}", text, detail),
        (Some(text), None) => text.to_string(),
        (None, Some(detail)) => detail.to_string(),
        (None, None) => String::new(),
    }
}
