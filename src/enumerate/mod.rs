//! WQL enumeration.
//!
//! An enumeration is one `enumerate` request followed by `pull` requests
//! for as long as the server hands back a live enumeration context. The
//! whole exchange runs under the session permit so no other conversation
//! can interleave on the host's channel.

pub mod associate;

pub use associate::{Association, AssociationResults, AssociatorClient};

use indexmap::IndexMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::client::WinRmClient;
use crate::config::ConnectionInfo;
use crate::error::{Error, Result};
use crate::response::{parse_stream, Item};
use crate::session::{RequestSender, Session, SessionKey};

/// Resource URI of the `root/cimv2` WMI namespace.
pub const DEFAULT_RESOURCE_URI: &str = "http://schemas.microsoft.com/wbem/wsman/1/wmi/root/cimv2/*";

/// A query and the resource URI it runs against.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EnumInfo {
    pub wql: String,
    pub resource_uri: String,
}

impl EnumInfo {
    pub fn new(wql: impl Into<String>) -> Self {
        Self::with_resource_uri(wql, DEFAULT_RESOURCE_URI)
    }

    pub fn with_resource_uri(wql: impl Into<String>, resource_uri: impl Into<String>) -> Self {
        Self {
            wql: wql.into(),
            resource_uri: resource_uri.into(),
        }
    }
}

/// Runs WQL queries against one host.
#[derive(Debug, Clone)]
pub struct EnumerateClient {
    client: WinRmClient,
    conn_info: Arc<ConnectionInfo>,
    key: SessionKey,
}

impl EnumerateClient {
    pub(crate) fn new(client: WinRmClient, conn_info: Arc<ConnectionInfo>) -> Self {
        let key = SessionKey::short(conn_info.address());
        Self {
            client,
            conn_info,
            key,
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn conn_info(&self) -> &ConnectionInfo {
        &self.conn_info
    }

    fn session(&self) -> Arc<Session> {
        self.client
            .sessions()
            .get_or_create(self.key.clone(), &self.conn_info)
    }

    /// Run one query, following pull requests to the end of the sequence.
    pub async fn enumerate(&self, wql: &str, resource_uri: &str) -> Result<Vec<Item>> {
        let sender = self.session().acquire().await?;
        let result = self.run(&sender, wql, resource_uri).await;
        if let Err(e) = &result {
            info!(host = %self.conn_info.hostname, wql, error = %e, "Enumeration failed");
        }
        result
    }

    async fn run(&self, sender: &RequestSender, wql: &str, resource_uri: &str) -> Result<Vec<Item>> {
        let limit = self.client.config().max_requests_per_enumeration;
        let mut items = Vec::new();
        let mut context: Option<String> = None;

        for _ in 0..limit {
            let body = match &context {
                None => {
                    info!(host = %self.conn_info.hostname, wql, template = "enumerate", "Enumerating");
                    sender
                        .send("enumerate", &[("resource_uri", resource_uri), ("wql", wql)])
                        .await?
                }
                Some(token) => {
                    sender
                        .send(
                            "pull",
                            &[
                                ("resource_uri", resource_uri),
                                ("enumeration_context", token.as_str()),
                            ],
                        )
                        .await?
                }
            };

            let parsed = parse_stream(body.into_reader()).await?;
            debug!(
                host = %self.conn_info.hostname,
                wql,
                items = parsed.items.len(),
                end_of_sequence = parsed.context.end_of_sequence,
                "Parsed enumeration response"
            );
            items.extend(parsed.items);

            match parsed.context.next() {
                Some(token) => context = Some(token.to_string()),
                None => return Ok(items),
            }
        }

        Err(Error::MaxIterationsExceeded {
            operation: "enumeration",
            limit,
        })
    }

    /// Run a batch of queries one after another.
    ///
    /// A query that fails with a request error yields an empty result;
    /// credential failures abort the batch. A host that already timed out
    /// is refused up front.
    pub async fn do_collect(&self, enum_infos: &[EnumInfo]) -> Result<IndexMap<EnumInfo, Vec<Item>>> {
        if self.client.sessions().is_degraded(&self.key) {
            return Err(Error::Timeout {
                host: self.conn_info.hostname.clone(),
                timeout_secs: self.conn_info.timeout,
            });
        }

        let session = self.session();
        let mut results = IndexMap::with_capacity(enum_infos.len());
        for enum_info in enum_infos {
            match self.enumerate(&enum_info.wql, &enum_info.resource_uri).await {
                Ok(items) => {
                    results.insert(enum_info.clone(), items);
                }
                Err(e) if e.is_request_error() => {
                    warn!(host = %self.conn_info.hostname, wql = %enum_info.wql, error = %e, "Query failed");
                    results.insert(enum_info.clone(), Vec::new());
                }
                Err(e) => {
                    session.close();
                    return Err(e);
                }
            }
        }

        session.close();
        Ok(results)
    }
}
