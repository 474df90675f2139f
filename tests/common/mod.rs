//! Shared test utilities for the winrm-client test suite.
//!
//! This module provides:
//! - Fixture loading helpers
//! - A scripted [`Transport`] that records every request
//! - A fake GSS provider whose "encryption" is a byte XOR
//! - Connection info and client builders
//!
//! # Usage
//!
//! ```rust,ignore
//! mod common;
//! use common::*;
//! ```

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;

use winrm_client::auth::encryption;
use winrm_client::auth::{GssMechanism, GssProvider, GssRequest, WrappedMessage};
use winrm_client::config::{ClientConfig, ConnectionInfo};
use winrm_client::transport::{HttpRequest, HttpResponse, ResponseBody, Transport};
use winrm_client::{Error, Result, WinRmClient};

/// `<a:Action>` of a rendered request
static ACTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<a:Action[^>]*>([^<]+)</a:Action>").expect("Invalid action regex"));

// ============================================================================
// Fixture Loading Helpers
// ============================================================================

/// Get the path to the test fixtures directory.
pub fn fixtures_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures")
}

/// Load a fixture file as bytes.
pub fn load_fixture_bytes(name: &str) -> Bytes {
    let path = fixtures_path().join(name);
    Bytes::from(
        std::fs::read(&path)
            .unwrap_or_else(|e| panic!("Failed to read fixture {}: {}", path.display(), e)),
    )
}

/// Route client logs to the test writer; `RUST_LOG=winrm_client=trace`
/// shows request bodies.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ============================================================================
// Connection Helpers
// ============================================================================

pub fn basic_conn_info(hostname: &str) -> ConnectionInfo {
    ConnectionInfo::builder(hostname)
        .basic("Administrator", "Z3n0ss")
        .build()
        .expect("valid basic connection info")
}

pub fn kerberos_conn_info(hostname: &str) -> ConnectionInfo {
    ConnectionInfo::builder(hostname)
        .kerberos("Administrator@EXAMPLE.COM", "Z3n0ss")
        .build()
        .expect("valid kerberos connection info")
}

/// Client config with a short idle grace so closes settle quickly.
pub fn test_config() -> ClientConfig {
    ClientConfig {
        idle_close_secs: 0,
        ..ClientConfig::default()
    }
}

/// Client over `transport`, basic auth only.
pub fn client(transport: Arc<FakeTransport>) -> WinRmClient {
    WinRmClient::builder(test_config())
        .transport(transport)
        .build()
        .expect("client builds")
}

/// Client over `transport` with the fake GSS provider.
pub fn kerberos_client(transport: Arc<FakeTransport>, gss: Arc<FakeGss>) -> WinRmClient {
    WinRmClient::builder(test_config())
        .transport(transport)
        .gss_provider(gss)
        .build()
        .expect("client builds")
}

// ============================================================================
// Scripted Replies
// ============================================================================

/// A canned HTTP response.
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Reply {
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self::status(200, body)
    }

    /// 200 with the content of a fixture file.
    pub fn fixture(name: &str) -> Self {
        Self::ok(load_fixture_bytes(name))
    }

    pub fn status(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Stream the body in small chunks so parsers see split reads.
    fn into_response(self) -> HttpResponse {
        let chunks: Vec<io::Result<Bytes>> = self
            .body
            .chunks(64)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();
        HttpResponse {
            status: self.status,
            headers: self.headers,
            body: ResponseBody::Streaming(futures::stream::iter(chunks).boxed()),
        }
    }
}

// ============================================================================
// Fake Transport
// ============================================================================

/// A request as seen by the [`FakeTransport`].
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub host: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Last path segment of the WS-Addressing action, e.g. `Enumerate`.
    pub fn action(&self) -> Option<String> {
        action_of(&self.body)
    }

    pub fn is_probe(&self) -> bool {
        self.body.is_empty()
    }
}

pub fn action_of(body: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(body);
    ACTION
        .captures(&text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().rsplit('/').next())
        .map(str::to_string)
}

type Responder = Box<dyn Fn(&RecordedRequest) -> Result<Reply> + Send + Sync>;

/// A transport that answers from a closure and records every request.
pub struct FakeTransport {
    responder: Responder,
    requests: Mutex<Vec<RecordedRequest>>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeTransport {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&RecordedRequest) -> Result<Reply> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            requests: Mutex::new(Vec::new()),
            delay: None,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Answer requests with `replies` in order; extra requests fail.
    pub fn scripted(replies: Vec<Reply>) -> Self {
        let queue = Mutex::new(VecDeque::from(replies));
        Self::new(move |request| {
            queue.lock().pop_front().ok_or_else(|| {
                Error::Transport(format!("no scripted reply for {:?}", request.action()))
            })
        })
    }

    /// Hold every request for `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Actions of the recorded requests; probes show up as `probe`.
    pub fn actions(&self) -> Vec<String> {
        self.requests
            .lock()
            .iter()
            .map(|request| {
                request
                    .action()
                    .unwrap_or_else(|| "probe".to_string())
            })
            .collect()
    }

    /// Highest number of requests that were in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn post(&self, request: HttpRequest) -> Result<HttpResponse> {
        let recorded = RecordedRequest {
            host: request.host,
            url: request.url,
            headers: request.headers,
            body: request.body,
        };
        self.requests.lock().push(recorded.clone());

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let reply = (self.responder)(&recorded);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        reply.map(Reply::into_response)
    }
}

// ============================================================================
// Fake GSS
// ============================================================================

const XOR_KEY: u8 = 0x5A;

/// Token the fake mechanism answers every challenge with.
pub const CLIENT_TOKEN: &[u8] = b"client-token";

/// `Authorization` value carrying [`CLIENT_TOKEN`].
pub const KERBEROS_AUTHORIZATION: &str = "Kerberos Y2xpZW50LXRva2Vu";

fn xor(data: &[u8]) -> Vec<u8> {
    data.iter().map(|b| b ^ XOR_KEY).collect()
}

struct XorMechanism;

impl GssMechanism for XorMechanism {
    fn step(&mut self, _server_token: Option<&[u8]>) -> Result<Option<Vec<u8>>> {
        Ok(Some(CLIENT_TOKEN.to_vec()))
    }

    fn wrap(&mut self, plaintext: &[u8]) -> Result<WrappedMessage> {
        Ok(WrappedMessage {
            header: vec![XOR_KEY; 4],
            data: xor(plaintext),
        })
    }

    fn unwrap(&mut self, message: &WrappedMessage) -> Result<Vec<u8>> {
        Ok(xor(&message.data))
    }
}

/// GSS provider handing out [`XorMechanism`] contexts.
#[derive(Debug, Default)]
pub struct FakeGss {
    services: Mutex<Vec<String>>,
}

impl FakeGss {
    /// Number of security contexts created so far.
    pub fn contexts_created(&self) -> usize {
        self.services.lock().len()
    }

    pub fn services(&self) -> Vec<String> {
        self.services.lock().clone()
    }
}

impl GssProvider for FakeGss {
    fn init_context(&self, request: GssRequest<'_>) -> Result<Box<dyn GssMechanism>> {
        self.services.lock().push(request.service);
        Ok(Box::new(XorMechanism))
    }
}

/// Encrypt a response body the way the server side of [`XorMechanism`]
/// would.
pub fn seal(body: &[u8]) -> Bytes {
    let message = WrappedMessage {
        header: vec![XOR_KEY; 4],
        data: xor(body),
    };
    Bytes::from(encryption::encode_envelope(body.len(), &message))
}

/// Decrypt a request body sent through [`XorMechanism`].
pub fn unseal(body: &[u8]) -> Vec<u8> {
    let (_, message) = encryption::decode_envelope(body).expect("encrypted request body");
    xor(&message.data)
}

/// The 401 a WinRM listener answers the Kerberos probe with.
pub fn kerberos_challenge() -> Reply {
    Reply::status(401, Bytes::new()).header("WWW-Authenticate", "Negotiate, Kerberos")
}

// ============================================================================
// Response Builders
// ============================================================================

/// A single-page `XmlFragment` enumerate response holding `rows`.
pub fn fragment_response(rows: &[&[(&str, &str)]]) -> String {
    let mut items = String::new();
    for row in rows {
        items.push_str("<w:XmlFragment>");
        for (name, value) in row.iter() {
            items.push_str(&format!("<{0}>{1}</{0}>", name, value));
        }
        items.push_str("</w:XmlFragment>");
    }
    format!(
        concat!(
            r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope" "#,
            r#"xmlns:n="http://schemas.xmlsoap.org/ws/2004/09/enumeration" "#,
            r#"xmlns:w="http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd">"#,
            "<s:Body><n:EnumerateResponse><n:EnumerationContext></n:EnumerationContext>",
            "<w:Items>{}</w:Items><n:EndOfSequence/></n:EnumerateResponse></s:Body></s:Envelope>"
        ),
        items
    )
}
