//! Error types for the WinRM client.
//!
//! The variants mirror the failure classes a caller has to tell apart when
//! driving many hosts: configuration problems that fail before any I/O,
//! credential failures that are fatal for a whole host, query-specific
//! request failures, transport timeouts, and protocol violations in the
//! server's responses.

use thiserror::Error;

/// Result type alias for WinRM client operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for the WinRM client.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Connection info failed validation. Raised before any network I/O.
    #[error("Invalid connection info: {0}")]
    Validation(String),

    /// A configuration file could not be read or parsed.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A request template is unknown, unreadable or missing a parameter.
    #[error("Request template error: {0}")]
    Template(String),

    // ========================================================================
    // Authentication Errors
    // ========================================================================
    /// HTTP 401 that survived the reauthentication attempt.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// HTTP 403.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// The Kerberos handshake or message protection failed.
    #[error("Kerberos error: {0}")]
    Kerberos(String),

    // ========================================================================
    // Request Errors
    // ========================================================================
    /// Any other non-200 response, carrying the SOAP fault text.
    #[error("HTTP status: {status}. {message}")]
    Request {
        /// HTTP status code
        status: u16,
        /// Reason and detail text parsed from the SOAP fault
        message: String,
    },

    /// The transport gave up waiting for the host.
    #[error("Request to '{host}' timed out after {timeout_secs} seconds")]
    Timeout {
        /// Target host
        host: String,
        /// Timeout in seconds
        timeout_secs: u64,
    },

    /// The HTTP layer failed for a reason other than a timeout.
    #[error("Transport error: {0}")]
    Transport(String),

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// Malformed XML, unexpected nesting or a missing required element.
    #[error("Protocol state error: {0}")]
    ProtocolState(String),

    /// A paging or polling loop hit its iteration guard.
    #[error("Reached max requests per {operation} ({limit})")]
    MaxIterationsExceeded {
        /// The looping operation (enumeration, command)
        operation: &'static str,
        /// The configured guard value
        limit: usize,
    },

    /// I/O error while reading templates or configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a protocol state error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Error::ProtocolState(message.into())
    }

    /// Credential failures apply to every query against a host, so batch
    /// drivers abort the whole host on them.
    pub fn is_credential_failure(&self) -> bool {
        matches!(self, Error::Unauthorized(_) | Error::Forbidden(_))
    }

    /// Whether this is a transport-level timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    /// Whether this is a query-specific request failure.
    pub fn is_request_error(&self) -> bool {
        matches!(self, Error::Request { .. })
    }
}

impl From<quick_xml::Error> for Error {
    fn from(err: quick_xml::Error) -> Self {
        Error::ProtocolState(format!("XML error: {}", err))
    }
}

impl From<quick_xml::events::attributes::AttrError> for Error {
    fn from(err: quick_xml::events::attributes::AttrError) -> Self {
        Error::ProtocolState(format!("XML attribute error: {}", err))
    }
}
