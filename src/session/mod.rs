//! Sessions: serialized, authenticated conversations with one host.
//!
//! Windows cannot interleave different conversation kinds (enumerate/pull
//! versus shell create/command/receive) on one channel, so every
//! operation first takes the session's single permit through
//! [`Session::acquire`] and holds it, as a [`RequestSender`], until the
//! whole conversation is finished.
//!
//! [`Session::close`] does not tear the session down immediately. It
//! schedules removal after an idle grace period so a follow-up operation on
//! the same key reuses the pooled connection and security context; the
//! next `acquire` cancels the pending close.

pub mod manager;
pub mod sender;

pub use manager::SessionManager;
pub use sender::RequestSender;

use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::auth::{Authenticator, GssProvider};
use crate::config::ConnectionInfo;
use crate::error::{Error, Result};
use crate::templates::TemplateStore;
use crate::transport::Transport;

use manager::Registry;

/// Conversation key shared by enumerations and single commands.
pub const SHORT_CONVERSATION: &str = "short";

/// Identifies a session: the host plus the conversation class.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub host: String,
    pub conversation: String,
}

impl SessionKey {
    pub fn new(host: impl Into<String>, conversation: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            conversation: conversation.into(),
        }
    }

    /// Key for short-lived conversations on `host`.
    pub fn short(host: impl Into<String>) -> Self {
        Self::new(host, SHORT_CONVERSATION)
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.host, self.conversation)
    }
}

/// One authenticated conversation channel.
pub struct Session {
    key: SessionKey,
    conn_info: Arc<ConnectionInfo>,
    url: String,
    transport: Arc<dyn Transport>,
    templates: Arc<TemplateStore>,
    gss: Option<Arc<dyn GssProvider>>,
    auth: tokio::sync::Mutex<Authenticator>,
    gate: Arc<Semaphore>,
    idle_close: Mutex<Option<JoinHandle<()>>>,
    idle_grace: Duration,
    registry: Weak<Registry>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("key", &self.key)
            .field("url", &self.url)
            .field("idle_grace", &self.idle_grace)
            .finish()
    }
}

impl Session {
    pub(crate) fn new(
        key: SessionKey,
        conn_info: Arc<ConnectionInfo>,
        transport: Arc<dyn Transport>,
        templates: Arc<TemplateStore>,
        gss: Option<Arc<dyn GssProvider>>,
        idle_grace: Duration,
        registry: Weak<Registry>,
    ) -> Arc<Self> {
        let url = conn_info.endpoint_url();
        let auth = Authenticator::for_connection(&conn_info);
        debug!(key = %key, url = %url, auth = %conn_info.auth_type, "Creating session");
        Arc::new(Self {
            key,
            conn_info,
            url,
            transport,
            templates,
            gss,
            auth: tokio::sync::Mutex::new(auth),
            gate: Arc::new(Semaphore::new(1)),
            idle_close: Mutex::new(None),
            idle_grace,
            registry,
        })
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn conn_info(&self) -> &ConnectionInfo {
        &self.conn_info
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whether a Kerberos security context is currently established.
    pub async fn has_security_context(&self) -> bool {
        self.auth.lock().await.has_security_context()
    }

    /// Whether an idle close is pending.
    pub fn close_pending(&self) -> bool {
        self.idle_close
            .lock()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Wait for exclusive use of the session.
    ///
    /// If an idle close evicted this session and another one has since
    /// been registered under the same key, the permit is taken on that
    /// session instead; the returned sender's [`RequestSender::session`]
    /// is the one in use. An evicted session with no replacement is
    /// registered again.
    pub async fn acquire(self: &Arc<Self>) -> Result<RequestSender> {
        let mut session = Arc::clone(self);
        loop {
            session.cancel_idle_close();
            let permit = session
                .gate
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| Error::protocol(format!("Session {} is closed", session.key)))?;
            match session.registered() {
                Some(current) if !Arc::ptr_eq(&current, &session) => {
                    debug!(key = %session.key, "Session was replaced, switching to the registered one");
                    drop(permit);
                    session = current;
                }
                _ => return Ok(RequestSender::new(session, permit)),
            }
        }
    }

    /// The session registered under this key, registering `self` when the
    /// key is vacant.
    fn registered(self: &Arc<Self>) -> Option<Arc<Session>> {
        let registry = self.registry.upgrade()?;
        let entry = registry
            .sessions
            .entry(self.key.clone())
            .or_insert_with(|| Arc::clone(self));
        Some(Arc::clone(entry.value()))
    }

    /// Schedule teardown after the idle grace period.
    ///
    /// Must be called from within a tokio runtime.
    pub fn close(self: &Arc<Self>) {
        let session = Arc::clone(self);
        let grace = self.idle_grace;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let Ok(_permit) = session.gate.clone().acquire_owned().await else {
                return;
            };
            if let Some(registry) = session.registry.upgrade() {
                registry
                    .sessions
                    .remove_if(&session.key, |_, current| Arc::ptr_eq(current, &session));
            }
            session.auth.lock().await.invalidate();
            debug!(key = %session.key, "Closed idle session");
        });

        if let Some(previous) = self.idle_close.lock().replace(handle) {
            previous.abort();
        }
    }

    fn cancel_idle_close(&self) {
        if let Some(handle) = self.idle_close.lock().take() {
            handle.abort();
        }
    }

    /// Record a transport timeout against this session's key.
    pub(crate) fn note_failure(&self, error: Error) -> Error {
        if error.is_timeout() {
            if let Some(registry) = self.registry.upgrade() {
                warn!(key = %self.key, "Marking session degraded after timeout");
                registry.degraded.insert(self.key.clone());
            }
        }
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_key() {
        let key = SessionKey::short("10.0.0.5");
        assert_eq!(key.conversation, SHORT_CONVERSATION);
        assert_eq!(key.to_string(), "10.0.0.5/short");
        assert_ne!(key, SessionKey::new("10.0.0.5", "typeperf -si 1"));
    }
}
