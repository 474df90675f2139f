//! # winrm-client - An async WS-Management client
//!
//! `winrm-client` speaks the WS-Management (WinRM) SOAP protocol to remote
//! Windows hosts. It drives three conversations:
//!
//! - **Enumeration**: WQL queries, paged with `enumerate` / `pull`
//! - **Remote shell**: `create` / `command` / `receive` / `signal` / `delete`
//! - **Event subscription**: `subscribe` / `pull` / `unsubscribe`
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          WinRmClient                             │
//! │   EnumerateClient   SingleCommandClient   EventSubscription      │
//! │   AssociatorClient  LongCommandClient                            │
//! └──────────────────────────────────────────────────────────────────┘
//!                                 │
//!                                 ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        SessionManager                            │
//! │   Session per (host, conversation): permit, idle close, auth     │
//! │   RequestSender: templates, status mapping, reauth retry         │
//! └──────────────────────────────────────────────────────────────────┘
//!          │                      │                      │
//!          ▼                      ▼                      ▼
//! ┌─────────────────┐   ┌───────────────────┐   ┌───────────────────┐
//! │    Templates    │   │   Authenticator   │   │     Transport     │
//! │ (embedded SOAP  │   │ (basic, kerberos  │   │ (pooled reqwest)  │
//! │   envelopes)    │   │  + encryption)    │   │                   │
//! └─────────────────┘   └───────────────────┘   └───────────────────┘
//!                                 │
//!                                 ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │   Response parsing: streaming item parser, element tree, faults  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Example
//!
//! ```rust,ignore
//! use winrm_client::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = WinRmClient::new(ClientConfig::load())?;
//!     let conn_info = ConnectionInfo::builder("win01.example.com")
//!         .basic("Administrator", "secret")
//!         .build()?;
//!
//!     let response = client
//!         .single_command_client(conn_info)?
//!         .run_command("ipconfig /all", None)
//!         .await?;
//!     if let Some(response) = response {
//!         println!("{}", response.stdout.join("\n"));
//!     }
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod client;
pub mod config;
pub mod enumerate;
pub mod error;
pub mod response;
pub mod session;
pub mod shell;
pub mod subscribe;
pub mod templates;
pub mod transport;

pub use client::{WinRmClient, WinRmClientBuilder};
pub use config::{ClientConfig, ConnectionInfo};
pub use error::{Error, Result};

pub mod prelude {
    //! Convenient re-exports of commonly used types and traits.

    pub use crate::auth::{GssMechanism, GssProvider, GssRequest, WrappedMessage};
    pub use crate::client::{WinRmClient, WinRmClientBuilder};
    pub use crate::config::{AuthType, ClientConfig, ConnectionInfo, ConnectionType, KerberosOptions};
    pub use crate::enumerate::{
        Association, AssociationResults, AssociatorClient, EnumInfo, EnumerateClient,
        DEFAULT_RESOURCE_URI,
    };
    pub use crate::error::{Error, Result};
    pub use crate::response::{Item, Value};
    pub use crate::session::{SessionKey, SessionManager};
    pub use crate::shell::{CommandResponse, LongCommandClient, SingleCommandClient};
    pub use crate::subscribe::{Event, EventSubscription, RenderingInfo, System};
    pub use crate::transport::{HttpRequest, HttpResponse, ResponseBody, Transport};
}

/// Returns the current version of winrm-client.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
