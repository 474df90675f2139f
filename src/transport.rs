//! HTTP transport for the WS-Management endpoint
//!
//! The protocol layers only need "POST these bytes, give me status,
//! headers and a body stream", so the transport sits behind the
//! [`Transport`] trait. [`HttpTransport`] is the pooled `reqwest`
//! implementation; tests substitute scripted transports.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::BoxStream;
use futures::StreamExt;
use std::fmt;
use std::io;
use std::time::Duration;
use tokio::io::AsyncBufRead;
use tokio_util::io::StreamReader;
use tracing::{debug, trace};

use crate::config::ClientConfig;
use crate::error::{Error, Result};

/// SOAP content type for plain requests
pub const SOAP_CONTENT_TYPE: &str = "application/soap+xml;charset=UTF-8";

// ============================================================================
// Request / Response
// ============================================================================

/// One POST to a WS-Management endpoint.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// Host the request targets, for error reporting
    pub host: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    /// Overall timeout for the call
    pub timeout: Duration,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

/// Response body, either fully buffered or still arriving.
pub enum ResponseBody {
    Buffered(Bytes),
    Streaming(BoxStream<'static, io::Result<Bytes>>),
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseBody::Buffered(bytes) => f
                .debug_tuple("Buffered")
                .field(&bytes.len())
                .finish(),
            ResponseBody::Streaming(_) => f.write_str("Streaming"),
        }
    }
}

impl ResponseBody {
    pub fn empty() -> Self {
        ResponseBody::Buffered(Bytes::new())
    }

    /// Collect the whole body.
    pub async fn bytes(self) -> Result<Bytes> {
        match self {
            ResponseBody::Buffered(bytes) => Ok(bytes),
            ResponseBody::Streaming(mut stream) => {
                let mut buf = BytesMut::new();
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk.map_err(|e| Error::Transport(e.to_string()))?;
                    buf.extend_from_slice(&chunk);
                }
                Ok(buf.freeze())
            }
        }
    }

    /// View the body as an async reader for incremental parsing.
    pub fn into_reader(self) -> Box<dyn AsyncBufRead + Send + Unpin> {
        match self {
            ResponseBody::Buffered(bytes) => Box::new(io::Cursor::new(bytes)),
            ResponseBody::Streaming(stream) => Box::new(StreamReader::new(stream)),
        }
    }
}

impl From<Bytes> for ResponseBody {
    fn from(bytes: Bytes) -> Self {
        ResponseBody::Buffered(bytes)
    }
}

/// Status, headers and body of a response.
#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: ResponseBody,
}

impl HttpResponse {
    /// First header with the given name (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

// ============================================================================
// Transport Trait
// ============================================================================

/// Issues POST requests with connection reuse.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request. Timeouts must surface as [`Error::Timeout`].
    async fn post(&self, request: HttpRequest) -> Result<HttpResponse>;
}

// ============================================================================
// reqwest Transport
// ============================================================================

/// Pooled HTTP transport built on `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Build a client with the pool and connect-timeout settings of `config`.
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .pool_max_idle_per_host(config.max_persistent_per_host)
            .pool_idle_timeout(Duration::from_secs(config.cached_connection_timeout))
            .build()
            .map_err(|e| Error::Transport(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(&self, request: HttpRequest) -> Result<HttpResponse> {
        let HttpRequest {
            host,
            url,
            headers,
            body,
            timeout,
        } = request;

        trace!(host = %host, url = %url, bytes = body.len(), "POST");
        let mut builder = self.client.post(&url).timeout(timeout);
        for (name, value) in &headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.body(body).send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Timeout {
                    host: host.clone(),
                    timeout_secs: timeout.as_secs(),
                }
            } else {
                Error::Transport(format!("HTTP request to {} failed: {}", host, e))
            }
        })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    value.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect();
        debug!(host = %host, status, "Received response");

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| io::Error::new(io::ErrorKind::Other, e)))
            .boxed();

        Ok(HttpResponse {
            status,
            headers,
            body: ResponseBody::Streaming(stream),
        })
    }
}
