//! Response handling: the streaming enumeration parser, the item model,
//! WMI datetimes, SOAP faults, and a small element tree for the
//! fixed-shape shell and event responses.

pub mod datetime;
pub mod fault;
pub mod item;
pub mod parser;
pub mod tree;

pub use datetime::parse_datetime;
pub use fault::parse_fault_message;
pub use item::{Item, Value};
pub use parser::{parse_slice, parse_stream, EnumerationContext, ParsedResponse, ResponseParser};
pub use tree::Element;

// ============================================================================
// XML Namespaces
// ============================================================================

pub const SOAP_ENV_NS: &str = "http://www.w3.org/2003/05/soap-envelope";
pub const ADDRESSING_NS: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing";
pub const ENUMERATION_NS: &str = "http://schemas.xmlsoap.org/ws/2004/09/enumeration";
pub const EVENTING_NS: &str = "http://schemas.xmlsoap.org/ws/2004/08/eventing";
pub const WSMAN_NS: &str = "http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd";
pub const SHELL_NS: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell";
pub const CIM_SCHEMA_NS: &str = "http://schemas.dmtf.org/wbem/wscim/1/common";
pub const XSI_NS: &str = "http://www.w3.org/2001/XMLSchema-instance";
pub const EVENT_NS: &str = "http://schemas.microsoft.com/win/2004/08/events/event";
