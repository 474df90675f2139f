//! Kerberos authentication.
//!
//! The GSS-API itself is reached through the [`GssProvider`] and
//! [`GssMechanism`] traits so a system binding can be plugged in by the
//! caller and tests can inject a scripted mechanism.
//!
//! Handshake, as driven by the session:
//!
//! 1. POST an empty, unauthenticated body to the endpoint.
//! 2. Expect `401` with `WWW-Authenticate: Kerberos <challenge>`.
//! 3. Step a fresh GSS context with the challenge; the resulting token is
//!    sent as `Authorization: Kerberos <token>` and the context wraps and
//!    unwraps every subsequent body.
//!
//! The lifecycle is an explicit state machine:
//! `Uninitiated -> ChallengeSent -> Established -> Expired -> ChallengeSent ...`

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use bytes::Bytes;
use secrecy::SecretString;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use super::encryption;
use crate::config::{ConnectionInfo, KerberosOptions};
use crate::error::{Error, Result};
use crate::transport::{HttpRequest, Transport, SOAP_CONTENT_TYPE};

// ============================================================================
// GSS Seams
// ============================================================================

/// Output of a GSS wrap: the token header and the sealed data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WrappedMessage {
    pub header: Vec<u8>,
    pub data: Vec<u8>,
}

/// One GSS security context.
pub trait GssMechanism: Send {
    /// Feed the server token (`None` on the first step) and return the
    /// token to send back, if any.
    fn step(&mut self, server_token: Option<&[u8]>) -> Result<Option<Vec<u8>>>;

    /// Encrypt a message body.
    fn wrap(&mut self, plaintext: &[u8]) -> Result<WrappedMessage>;

    /// Decrypt a message body.
    fn unwrap(&mut self, message: &WrappedMessage) -> Result<Vec<u8>>;
}

/// Credentials and target handed to a [`GssProvider`].
pub struct GssRequest<'a> {
    /// Service principal, `HTTP@<hostname>` for http endpoints
    pub service: String,
    pub username: &'a str,
    pub password: &'a SecretString,
    pub options: &'a KerberosOptions,
}

/// Creates GSS contexts.
pub trait GssProvider: Send + Sync {
    fn init_context(&self, request: GssRequest<'_>) -> Result<Box<dyn GssMechanism>>;
}

/// Service principal for a connection. WinRM registers `HTTP/` SPNs for
/// both http and https listeners.
pub fn service_principal(conn_info: &ConnectionInfo) -> String {
    format!("HTTP@{}", conn_info.hostname)
}

/// Extract the Kerberos token from a `WWW-Authenticate` header.
///
/// The header may list several comma-separated schemes; a bare
/// `Kerberos` yields an empty token.
pub fn parse_challenge(header: &str) -> Option<String> {
    header.split(',').find_map(|field| {
        let field = field.trim();
        let (kind, details) = field.split_once(' ').unwrap_or((field, ""));
        kind.eq_ignore_ascii_case("kerberos")
            .then(|| details.trim().to_string())
    })
}

// ============================================================================
// State Machine
// ============================================================================

/// Where a Kerberos security context is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KerberosState {
    Uninitiated,
    ChallengeSent,
    Established,
    Expired,
}

/// Inputs that move a context between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KerberosEvent {
    /// The unauthenticated probe went out
    ProbeSent,
    /// The server challenge was stepped successfully
    ChallengeAccepted,
    /// The server answered 400/401 on an established context
    Rejected,
}

impl fmt::Display for KerberosState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl KerberosState {
    /// Pure transition function.
    pub fn next(self, event: KerberosEvent) -> Result<KerberosState> {
        use KerberosEvent::*;
        use KerberosState::*;
        match (self, event) {
            (Uninitiated | Expired, ProbeSent) => Ok(ChallengeSent),
            (ChallengeSent, ChallengeAccepted) => Ok(Established),
            (Established, Rejected) => Ok(Expired),
            (state, event) => Err(Error::Kerberos(format!(
                "Invalid transition from {} on {:?}",
                state, event
            ))),
        }
    }

    pub fn needs_handshake(self) -> bool {
        self != KerberosState::Established
    }
}

/// A Kerberos security context and the token presented with requests.
pub struct KerberosContext {
    state: KerberosState,
    mechanism: Option<Box<dyn GssMechanism>>,
    token: Option<String>,
}

impl fmt::Debug for KerberosContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KerberosContext")
            .field("state", &self.state)
            .field("has_mechanism", &self.mechanism.is_some())
            .finish()
    }
}

impl Default for KerberosContext {
    fn default() -> Self {
        Self::new()
    }
}

impl KerberosContext {
    pub fn new() -> Self {
        Self {
            state: KerberosState::Uninitiated,
            mechanism: None,
            token: None,
        }
    }

    pub fn state(&self) -> KerberosState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == KerberosState::Established
    }

    fn transition(&mut self, event: KerberosEvent) -> Result<()> {
        self.state = self.state.next(event)?;
        Ok(())
    }

    /// Record that the probe was sent.
    pub fn probe_sent(&mut self) -> Result<()> {
        self.transition(KerberosEvent::ProbeSent)
    }

    /// Step a new GSS context with the server challenge.
    pub fn accept_challenge(
        &mut self,
        mut mechanism: Box<dyn GssMechanism>,
        challenge: &str,
    ) -> Result<()> {
        let server_token = if challenge.is_empty() {
            None
        } else {
            Some(BASE64_STANDARD.decode(challenge).map_err(|e| {
                Error::Kerberos(format!("Invalid Kerberos challenge encoding: {}", e))
            })?)
        };

        let client_token = mechanism.step(server_token.as_deref())?;
        self.transition(KerberosEvent::ChallengeAccepted)?;
        self.token = client_token.map(|token| BASE64_STANDARD.encode(token));
        self.mechanism = Some(mechanism);
        Ok(())
    }

    /// Discard the security context after the server rejected it.
    pub fn expire(&mut self) -> Result<()> {
        self.transition(KerberosEvent::Rejected)?;
        self.mechanism = None;
        self.token = None;
        Ok(())
    }

    /// Drop any context and start over.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// `Authorization` header value for requests on this context.
    pub fn authorization(&self) -> Option<String> {
        match (&self.state, &self.token) {
            (KerberosState::Established, Some(token)) => Some(format!("Kerberos {}", token)),
            _ => None,
        }
    }

    fn mechanism(&mut self) -> Result<&mut Box<dyn GssMechanism>> {
        if self.state != KerberosState::Established {
            return Err(Error::Kerberos(format!(
                "No established security context ({})",
                self.state
            )));
        }
        self.mechanism
            .as_mut()
            .ok_or_else(|| Error::Kerberos("Security context missing".to_string()))
    }

    /// Encrypt a SOAP body into the multipart envelope.
    pub fn encrypt_body(&mut self, body: &[u8]) -> Result<Vec<u8>> {
        let wrapped = self.mechanism()?.wrap(body)?;
        Ok(encryption::encode_envelope(body.len(), &wrapped))
    }

    /// Decrypt a multipart envelope; plain bodies pass through unchanged.
    pub fn decrypt_body(&mut self, body: Bytes) -> Result<Bytes> {
        if !encryption::is_encrypted(&body) {
            return Ok(body);
        }
        let (length, wrapped) = encryption::decode_envelope(&body)?;
        let plaintext = self.mechanism()?.unwrap(&wrapped)?;
        if plaintext.len() != length {
            return Err(Error::Kerberos(format!(
                "Decrypted length {} does not match declared length {}",
                plaintext.len(),
                length
            )));
        }
        Ok(Bytes::from(plaintext))
    }
}

// ============================================================================
// Handshake
// ============================================================================

/// Run the probe/challenge handshake and establish `context`.
pub async fn authenticate(
    context: &mut KerberosContext,
    transport: &dyn Transport,
    provider: Option<&Arc<dyn GssProvider>>,
    conn_info: &ConnectionInfo,
    url: &str,
) -> Result<()> {
    let provider = provider.ok_or_else(|| {
        Error::Kerberos("No GSS provider configured for kerberos authentication".to_string())
    })?;

    if context.state() == KerberosState::Established {
        context.expire()?;
    } else if context.state() == KerberosState::ChallengeSent {
        context.reset();
    }

    debug!(host = %conn_info.hostname, "Starting kerberos handshake");
    let probe = HttpRequest {
        host: conn_info.hostname.clone(),
        url: url.to_string(),
        headers: vec![
            ("Content-Type".to_string(), SOAP_CONTENT_TYPE.to_string()),
            (
                "Connection".to_string(),
                conn_info.connection_type.header_value().to_string(),
            ),
            ("Content-Length".to_string(), "0".to_string()),
        ],
        body: Bytes::new(),
        timeout: conn_info.request_timeout(),
    };
    let response = transport.post(probe).await?;
    context.probe_sent()?;

    if response.status != 401 {
        let body = response.body.bytes().await.unwrap_or_default();
        return Err(Error::Kerberos(format!(
            "status code {} received on initial kerberos request {}",
            response.status,
            String::from_utf8_lossy(&body).trim()
        )));
    }

    let header = response.header("WWW-Authenticate").unwrap_or_default();
    let challenge = parse_challenge(header).ok_or_else(|| {
        Error::Unauthorized(format!(
            "Kerberos not found in WWW-Authenticate header: {}",
            header
        ))
    })?;

    let mechanism = provider.init_context(GssRequest {
        service: service_principal(conn_info),
        username: &conn_info.username,
        password: &conn_info.password,
        options: &conn_info.kerberos,
    })?;
    context.accept_challenge(mechanism, &challenge)?;
    info!(host = %conn_info.hostname, user = %conn_info.username, "Kerberos auth successful");
    Ok(())
}
