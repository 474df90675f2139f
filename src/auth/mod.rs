//! Authentication for WS-Management requests.
//!
//! Two schemes are supported:
//!
//! - **Basic**: a static `Authorization` header on every request.
//! - **Kerberos**: a probe/challenge handshake that yields a security
//!   context; every body is then encrypted (see [`encryption`]).

pub mod encryption;
pub mod kerberos;

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use bytes::Bytes;
use secrecy::ExposeSecret;
use std::sync::Arc;

use crate::config::{AuthType, ConnectionInfo};
use crate::error::Result;
use crate::transport::{Transport, SOAP_CONTENT_TYPE};

pub use kerberos::{
    GssMechanism, GssProvider, GssRequest, KerberosContext, KerberosEvent, KerberosState,
    WrappedMessage,
};

/// `Basic <base64(username:password)>`
pub fn basic_auth_header(username: &str, password: &str) -> String {
    let credentials = format!("{}:{}", username, password);
    format!("Basic {}", BASE64_STANDARD.encode(credentials))
}

/// Per-session authentication state.
#[derive(Debug)]
pub enum Authenticator {
    Basic { header: String },
    Kerberos(KerberosContext),
}

impl Authenticator {
    pub fn for_connection(conn_info: &ConnectionInfo) -> Self {
        match conn_info.auth_type {
            AuthType::Basic => Authenticator::Basic {
                header: basic_auth_header(
                    &conn_info.username,
                    conn_info.password.expose_secret(),
                ),
            },
            AuthType::Kerberos => Authenticator::Kerberos(KerberosContext::new()),
        }
    }

    /// Run the handshake if there is no usable security context.
    pub async fn ensure_authenticated(
        &mut self,
        transport: &dyn Transport,
        provider: Option<&Arc<dyn GssProvider>>,
        conn_info: &ConnectionInfo,
        url: &str,
    ) -> Result<()> {
        match self {
            Authenticator::Basic { .. } => Ok(()),
            Authenticator::Kerberos(context) if context.state().needs_handshake() => {
                kerberos::authenticate(context, transport, provider, conn_info, url).await
            }
            Authenticator::Kerberos(_) => Ok(()),
        }
    }

    /// Headers that authenticate a request.
    pub fn request_headers(&self) -> Vec<(String, String)> {
        let value = match self {
            Authenticator::Basic { header } => Some(header.clone()),
            Authenticator::Kerberos(context) => context.authorization(),
        };
        value
            .map(|value| vec![("Authorization".to_string(), value)])
            .unwrap_or_default()
    }

    /// Prepare a rendered body for the wire, returning it with its content
    /// type.
    pub fn encode_body(&mut self, body: String) -> Result<(Bytes, &'static str)> {
        match self {
            Authenticator::Basic { .. } => Ok((Bytes::from(body), SOAP_CONTENT_TYPE)),
            Authenticator::Kerberos(context) => {
                let encrypted = context.encrypt_body(body.as_bytes())?;
                Ok((Bytes::from(encrypted), encryption::ENCRYPTED_CONTENT_TYPE))
            }
        }
    }

    /// Undo [`encode_body`](Self::encode_body) on a response body.
    pub fn decode_body(&mut self, body: Bytes) -> Result<Bytes> {
        match self {
            Authenticator::Basic { .. } => Ok(body),
            Authenticator::Kerberos(context) => context.decrypt_body(body),
        }
    }

    /// Whether responses may arrive encrypted.
    pub fn has_security_context(&self) -> bool {
        matches!(self, Authenticator::Kerberos(context) if context.is_established())
    }

    /// Forget the security context so the next request re-handshakes.
    pub fn invalidate(&mut self) {
        if let Authenticator::Kerberos(context) = self {
            if context.is_established() {
                // Established -> Expired cannot fail
                let _ = context.expire();
            } else {
                context.reset();
            }
        }
    }
}
