//! Session registry.

use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{Session, SessionKey};
use crate::auth::GssProvider;
use crate::config::ConnectionInfo;
use crate::templates::TemplateStore;
use crate::transport::Transport;

/// Live sessions and degraded keys, shared with the sessions themselves so
/// an idle close can evict its own entry.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    pub(crate) sessions: DashMap<SessionKey, Arc<Session>>,
    pub(crate) degraded: DashSet<SessionKey>,
}

/// Lazily creates, reuses and evicts [`Session`]s by key.
#[derive(Clone)]
pub struct SessionManager {
    registry: Arc<Registry>,
    transport: Arc<dyn Transport>,
    templates: Arc<TemplateStore>,
    gss: Option<Arc<dyn GssProvider>>,
    idle_grace: Duration,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("sessions", &self.registry.sessions.len())
            .field("degraded", &self.registry.degraded.len())
            .field("idle_grace", &self.idle_grace)
            .finish()
    }
}

impl SessionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        templates: Arc<TemplateStore>,
        gss: Option<Arc<dyn GssProvider>>,
        idle_grace: Duration,
    ) -> Self {
        Self {
            registry: Arc::new(Registry::default()),
            transport,
            templates,
            gss,
            idle_grace,
        }
    }

    /// Return the session for `key`, creating it on first use.
    ///
    /// Authentication happens lazily on the session's first request.
    /// Sessions are keyed by host and conversation only, so every
    /// `ConnectionInfo` for one host must carry the same credentials: a
    /// later caller with different ones reuses the registered session and
    /// its authenticator.
    pub fn get_or_create(&self, key: SessionKey, conn_info: &Arc<ConnectionInfo>) -> Arc<Session> {
        if let Some(existing) = self.get(&key) {
            let registered = existing.conn_info();
            if registered.username != conn_info.username
                || registered.auth_type != conn_info.auth_type
            {
                warn!(
                    key = %key,
                    username = %conn_info.username,
                    registered = %registered.username,
                    "Credentials differ from the registered session, reusing it"
                );
            }
            return existing;
        }
        let entry = self.registry.sessions.entry(key.clone()).or_insert_with(|| {
            Session::new(
                key,
                Arc::clone(conn_info),
                Arc::clone(&self.transport),
                Arc::clone(&self.templates),
                self.gss.clone(),
                self.idle_grace,
                Arc::downgrade(&self.registry),
            )
        });
        Arc::clone(entry.value())
    }

    pub fn get(&self, key: &SessionKey) -> Option<Arc<Session>> {
        self.registry
            .sessions
            .get(key)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Drop the session for `key` immediately.
    pub fn evict(&self, key: &SessionKey) -> Option<Arc<Session>> {
        let removed = self.registry.sessions.remove(key).map(|(_, session)| session);
        if removed.is_some() {
            debug!(key = %key, "Evicted session");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.registry.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.sessions.is_empty()
    }

    // ========================================================================
    // Degraded Keys
    // ========================================================================

    /// Whether a request on `key` has timed out before.
    pub fn is_degraded(&self, key: &SessionKey) -> bool {
        self.registry.degraded.contains(key)
    }

    pub fn mark_degraded(&self, key: SessionKey) {
        self.registry.degraded.insert(key);
    }

    pub fn clear_degraded(&self, key: &SessionKey) -> bool {
        let cleared = self.registry.degraded.remove(key).is_some();
        if cleared {
            info!(key = %key, "Cleared degraded session key");
        }
        cleared
    }
}
