//! Sending templated requests through a session.

use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::Session;
use crate::auth::{encryption, Authenticator};
use crate::error::{Error, Result};
use crate::response::parse_fault_message;
use crate::transport::{HttpRequest, HttpResponse, ResponseBody};

/// Exclusive handle on a [`Session`]; the session is free again once this
/// is dropped.
#[derive(Debug)]
pub struct RequestSender {
    session: Arc<Session>,
    _permit: OwnedSemaphorePermit,
}

fn unauthorized() -> Error {
    Error::Unauthorized("HTTP Unauthorized received: Check username and password".to_string())
}

impl RequestSender {
    pub(crate) fn new(session: Arc<Session>, permit: OwnedSemaphorePermit) -> Self {
        Self {
            session,
            _permit: permit,
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Render `template` with `params` and send it.
    ///
    /// `url`, `message_id`, `envelope_size`, `locale` and `code_page` are
    /// filled in from the connection info. Returns the response body of a
    /// 200; Kerberos-encrypted bodies are decrypted first.
    pub async fn send(&self, template: &str, params: &[(&str, &str)]) -> Result<ResponseBody> {
        let session = &self.session;
        let conn_info = session.conn_info();
        let message_id = Uuid::new_v4().to_string();
        let envelope_size = conn_info.envelope_size.to_string();
        let code_page = conn_info.code_page.to_string();

        let mut all_params: Vec<(&str, &str)> = vec![
            ("url", session.url()),
            ("message_id", message_id.as_str()),
            ("envelope_size", envelope_size.as_str()),
            ("locale", conn_info.locale.as_str()),
            ("code_page", code_page.as_str()),
        ];
        all_params.extend_from_slice(params);
        let body = session.templates.render(template, &all_params)?;

        debug!(key = %session.key(), template, "Sending request");
        trace!(template, body = %body, "Request body");

        let mut auth = session.auth.lock().await;
        self.authenticate(&mut auth).await?;

        let mut retried = false;
        loop {
            let request = self.build_request(&mut auth, &body)?;
            let response = session
                .transport
                .post(request)
                .await
                .map_err(|e| session.note_failure(e))?;
            debug!(key = %session.key(), template, status = response.status, "Received response");

            match response.status {
                200 => return self.decode_success(&mut auth, response).await,
                400 | 401 if auth.has_security_context() && !retried => {
                    warn!(
                        key = %session.key(),
                        status = response.status,
                        "Security context rejected, reauthenticating"
                    );
                    retried = true;
                    auth.invalidate();
                    self.authenticate(&mut auth).await?;
                }
                400 | 401 if retried => {
                    warn!(key = %session.key(), status = response.status, "Reauthentication rejected");
                    return Err(unauthorized());
                }
                401 => return Err(unauthorized()),
                403 => {
                    return Err(Error::Forbidden(
                        "Forbidden: Check WinRM port and version".to_string(),
                    ))
                }
                status => {
                    let raw = response.body.bytes().await?;
                    let raw = if encryption::is_encrypted(&raw) {
                        auth.decode_body(raw)?
                    } else {
                        raw
                    };
                    trace!(template, status, body = %String::from_utf8_lossy(&raw), "Fault body");
                    return Err(Error::Request {
                        status,
                        message: parse_fault_message(&raw),
                    });
                }
            }
        }
    }

    async fn authenticate(&self, auth: &mut Authenticator) -> Result<()> {
        let session = &self.session;
        auth.ensure_authenticated(
            session.transport.as_ref(),
            session.gss.as_ref(),
            session.conn_info(),
            session.url(),
        )
        .await
        .map_err(|e| session.note_failure(e))
    }

    fn build_request(&self, auth: &mut Authenticator, body: &str) -> Result<HttpRequest> {
        let conn_info = self.session.conn_info();
        let (body, content_type) = auth.encode_body(body.to_string())?;
        let mut headers = vec![
            ("Content-Type".to_string(), content_type.to_string()),
            (
                "Connection".to_string(),
                conn_info.connection_type.header_value().to_string(),
            ),
        ];
        headers.extend(auth.request_headers());

        Ok(HttpRequest {
            host: conn_info.hostname.clone(),
            url: self.session.url().to_string(),
            headers,
            body,
            timeout: conn_info.request_timeout(),
        })
    }

    async fn decode_success(
        &self,
        auth: &mut Authenticator,
        response: HttpResponse,
    ) -> Result<ResponseBody> {
        if !auth.has_security_context() {
            return Ok(response.body);
        }
        let raw: Bytes = response.body.bytes().await?;
        Ok(ResponseBody::Buffered(auth.decode_body(raw)?))
    }
}
