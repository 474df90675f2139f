//! Client entry point.
//!
//! A [`WinRmClient`] owns the pieces shared by every conversation: the
//! pooled transport, the request templates, the optional GSS provider and
//! the session registry. It is cheap to clone and hands out the protocol
//! clients, each bound to one validated [`ConnectionInfo`].
//!
//! # Example
//!
//! ```no_run
//! use winrm_client::prelude::*;
//!
//! # async fn example() -> winrm_client::Result<()> {
//! let client = WinRmClient::new(ClientConfig::load())?;
//! let conn_info = ConnectionInfo::builder("win01.example.com")
//!     .basic("Administrator", "secret")
//!     .build()?;
//!
//! let services = client
//!     .enumerate_client(conn_info)?
//!     .enumerate("select Name, State from Win32_Service", DEFAULT_RESOURCE_URI)
//!     .await?;
//! for service in &services {
//!     println!("{:?}", service.get_str("Name"));
//! }
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::Arc;

use crate::auth::GssProvider;
use crate::config::{ClientConfig, ConnectionInfo};
use crate::enumerate::{AssociatorClient, EnumerateClient};
use crate::error::{Error, Result};
use crate::session::SessionManager;
use crate::shell::{LongCommandClient, SingleCommandClient};
use crate::subscribe::EventSubscription;
use crate::templates::TemplateStore;
use crate::transport::{HttpTransport, Transport};

/// Shared client context.
#[derive(Clone)]
pub struct WinRmClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    sessions: SessionManager,
    has_gss: bool,
}

impl fmt::Debug for WinRmClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WinRmClient")
            .field("config", &self.inner.config)
            .field("sessions", &self.inner.sessions)
            .field("has_gss", &self.inner.has_gss)
            .finish()
    }
}

impl WinRmClient {
    /// Client over the default `reqwest` transport, basic auth only.
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: ClientConfig) -> WinRmClientBuilder {
        WinRmClientBuilder::new(config)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.inner.sessions
    }

    /// Validate connection info before handing it to a protocol client.
    fn prepare(&self, conn_info: ConnectionInfo) -> Result<Arc<ConnectionInfo>> {
        conn_info.validate()?;
        if conn_info.is_kerberos() && !self.inner.has_gss {
            return Err(Error::Kerberos(format!(
                "kerberos authentication for '{}' needs a GSS provider",
                conn_info.hostname
            )));
        }
        Ok(Arc::new(conn_info))
    }

    // ========================================================================
    // Protocol Clients
    // ========================================================================

    pub fn enumerate_client(&self, conn_info: ConnectionInfo) -> Result<EnumerateClient> {
        Ok(EnumerateClient::new(self.clone(), self.prepare(conn_info)?))
    }

    pub fn associator_client(&self, conn_info: ConnectionInfo) -> Result<AssociatorClient> {
        Ok(AssociatorClient::new(self.enumerate_client(conn_info)?))
    }

    pub fn single_command_client(&self, conn_info: ConnectionInfo) -> Result<SingleCommandClient> {
        Ok(SingleCommandClient::new(self.clone(), self.prepare(conn_info)?))
    }

    pub fn long_command_client(&self, conn_info: ConnectionInfo) -> Result<LongCommandClient> {
        Ok(LongCommandClient::new(self.clone(), self.prepare(conn_info)?))
    }

    pub fn event_subscription(&self, conn_info: ConnectionInfo) -> Result<EventSubscription> {
        Ok(EventSubscription::new(self.clone(), self.prepare(conn_info)?))
    }
}

/// Builder for [`WinRmClient`]
pub struct WinRmClientBuilder {
    config: ClientConfig,
    transport: Option<Arc<dyn Transport>>,
    gss: Option<Arc<dyn GssProvider>>,
}

impl WinRmClientBuilder {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            transport: None,
            gss: None,
        }
    }

    /// Use a custom transport instead of the pooled `reqwest` client.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Enable kerberos through a GSS-API binding.
    pub fn gss_provider(mut self, provider: Arc<dyn GssProvider>) -> Self {
        self.gss = Some(provider);
        self
    }

    pub fn build(self) -> Result<WinRmClient> {
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(&self.config)?),
        };
        let templates = Arc::new(TemplateStore::new(self.config.template_dir.clone()));
        let has_gss = self.gss.is_some();
        let sessions =
            SessionManager::new(transport, templates, self.gss, self.config.idle_close());

        Ok(WinRmClient {
            inner: Arc::new(ClientInner {
                config: self.config,
                sessions,
                has_gss,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthType;

    #[test]
    fn test_factories_validate_connection_info() {
        let client = WinRmClient::new(ClientConfig::default()).unwrap();

        let mut bad = ConnectionInfo::builder("win01")
            .basic("Administrator", "secret")
            .build()
            .unwrap();
        bad.scheme = "ftp".to_string();
        assert!(matches!(
            client.enumerate_client(bad),
            Err(Error::Validation(_))
        ));

        let good = ConnectionInfo::builder("win01")
            .basic("Administrator", "secret")
            .build()
            .unwrap();
        assert!(client.single_command_client(good).is_ok());
    }

    #[test]
    fn test_kerberos_requires_gss_provider() {
        let client = WinRmClient::new(ClientConfig::default()).unwrap();
        let info = ConnectionInfo::builder("win01.example.com")
            .kerberos("admin@EXAMPLE.COM", "secret")
            .build()
            .unwrap();
        assert_eq!(info.auth_type, AuthType::Kerberos);
        assert!(matches!(
            client.event_subscription(info),
            Err(Error::Kerberos(_))
        ));
    }
}
