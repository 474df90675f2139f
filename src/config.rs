//! Configuration for the WinRM client
//!
//! Two layers of configuration exist:
//! - [`ConnectionInfo`]: everything needed to talk to one host (address,
//!   credentials, WS-Management envelope options). Validated once when a
//!   protocol client is constructed, before any network I/O.
//! - [`ClientConfig`]: process-wide knobs shared by every host (transport
//!   timeouts, connection pooling, loop guards, template directory), loaded
//!   from defaults, an optional TOML file and environment variables.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Default WinRM HTTP port
pub const DEFAULT_WINRM_PORT: u16 = 5985;

/// Default WinRM HTTPS port
pub const DEFAULT_WINRM_SSL_PORT: u16 = 5986;

/// Default maximum SOAP envelope size in bytes
pub const DEFAULT_ENVELOPE_SIZE: u32 = 512_000;

/// Default per-request timeout in seconds
pub const DEFAULT_TIMEOUT: u64 = 60;

/// Default guard for enumerate/pull and receive loops
pub const DEFAULT_MAX_REQUESTS: usize = 9999;

// ============================================================================
// Connection Info
// ============================================================================

/// Authentication scheme used against the WS-Management endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    /// HTTP basic authentication
    Basic,
    /// Kerberos (GSS) authentication with message encryption
    Kerberos,
}

impl fmt::Display for AuthType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthType::Basic => write!(f, "basic"),
            AuthType::Kerberos => write!(f, "kerberos"),
        }
    }
}

/// Value of the HTTP `Connection` header sent with every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionType {
    #[serde(rename = "Keep-Alive", alias = "keep-alive")]
    KeepAlive,
    #[serde(rename = "close")]
    Close,
}

impl ConnectionType {
    pub fn header_value(&self) -> &'static str {
        match self {
            ConnectionType::KeepAlive => "Keep-Alive",
            ConnectionType::Close => "close",
        }
    }
}

/// Kerberos overrides handed to the GSS mechanism factory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KerberosOptions {
    /// Keytab to acquire credentials from
    pub keytab: Option<PathBuf>,
    /// KDC address override (domain controller IP)
    pub kdc: Option<String>,
    /// Realm trusted by the user's realm
    pub trusted_realm: Option<String>,
    /// KDC of the trusted realm
    pub trusted_kdc: Option<String>,
    /// Directory holding additional krb5 configuration snippets
    pub include_dir: Option<PathBuf>,
}

/// Everything needed to reach and authenticate against one host.
///
/// Use [`ConnectionInfo::builder`] or [`ConnectionInfo::from_toml`];
/// either way [`ConnectionInfo::validate`] runs before a protocol client
/// accepts it.
#[derive(Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Target hostname
    pub hostname: String,
    /// Authentication scheme
    #[serde(default = "default_auth_type")]
    pub auth_type: AuthType,
    /// User name (`user@REALM` for Kerberos)
    pub username: String,
    /// Password, never logged
    #[serde(
        default = "empty_secret",
        deserialize_with = "deserialize_secret",
        skip_serializing
    )]
    pub password: SecretString,
    /// URL scheme, `http` or `https`
    #[serde(default = "default_scheme")]
    pub scheme: String,
    /// Port; defaults by scheme when omitted
    #[serde(default)]
    pub port: Option<u16>,
    /// HTTP `Connection` header
    #[serde(default = "default_connection_type")]
    pub connection_type: ConnectionType,
    /// `MaxEnvelopeSize` sent in each request header
    #[serde(default = "default_envelope_size")]
    pub envelope_size: u32,
    /// Locale sent in each request header
    #[serde(default = "default_locale")]
    pub locale: String,
    /// Code page for remote shells
    #[serde(default = "default_code_page")]
    pub code_page: u32,
    /// Per-request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Address to connect to instead of the hostname
    #[serde(default)]
    pub ipaddress: Option<String>,
    /// Kerberos overrides
    #[serde(default)]
    pub kerberos: KerberosOptions,
}

fn default_auth_type() -> AuthType {
    AuthType::Kerberos
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_connection_type() -> ConnectionType {
    ConnectionType::KeepAlive
}

fn default_envelope_size() -> u32 {
    DEFAULT_ENVELOPE_SIZE
}

fn default_locale() -> String {
    "en-US".to_string()
}

fn default_code_page() -> u32 {
    65001
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT
}

fn empty_secret() -> SecretString {
    SecretString::new(String::new().into())
}

fn deserialize_secret<'de, D>(deserializer: D) -> std::result::Result<SecretString, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    Ok(SecretString::new(raw.into()))
}

impl Clone for ConnectionInfo {
    fn clone(&self) -> Self {
        Self {
            hostname: self.hostname.clone(),
            auth_type: self.auth_type,
            username: self.username.clone(),
            password: SecretString::new(self.password.expose_secret().into()),
            scheme: self.scheme.clone(),
            port: self.port,
            connection_type: self.connection_type,
            envelope_size: self.envelope_size,
            locale: self.locale.clone(),
            code_page: self.code_page,
            timeout: self.timeout,
            ipaddress: self.ipaddress.clone(),
            kerberos: self.kerberos.clone(),
        }
    }
}

impl fmt::Debug for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionInfo")
            .field("hostname", &self.hostname)
            .field("auth_type", &self.auth_type)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("scheme", &self.scheme)
            .field("port", &self.port())
            .field("connection_type", &self.connection_type)
            .field("envelope_size", &self.envelope_size)
            .field("locale", &self.locale)
            .field("code_page", &self.code_page)
            .field("timeout", &self.timeout)
            .field("ipaddress", &self.ipaddress)
            .finish()
    }
}

impl ConnectionInfo {
    /// Start building connection info for a host.
    pub fn builder(hostname: impl Into<String>) -> ConnectionInfoBuilder {
        ConnectionInfoBuilder::new(hostname)
    }

    /// Parse connection info from a TOML document and validate it.
    pub fn from_toml(content: &str) -> Result<Self> {
        let info: ConnectionInfo = toml::from_str(content)
            .map_err(|e| Error::Validation(e.to_string()))?;
        info.validate()?;
        Ok(info)
    }

    /// Effective port: explicit, else 5986 for https and 5985 otherwise.
    pub fn port(&self) -> u16 {
        match self.port {
            Some(port) => port,
            None if self.scheme == "https" => DEFAULT_WINRM_SSL_PORT,
            None => DEFAULT_WINRM_PORT,
        }
    }

    /// Address used in the endpoint URL.
    pub fn address(&self) -> &str {
        self.ipaddress.as_deref().unwrap_or(&self.hostname)
    }

    /// The WS-Management endpoint URL.
    pub fn endpoint_url(&self) -> String {
        format!("{}://{}:{}/wsman", self.scheme, self.address(), self.port())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn is_kerberos(&self) -> bool {
        self.auth_type == AuthType::Kerberos
    }

    /// Check the combination of fields, failing on the first problem.
    pub fn validate(&self) -> Result<()> {
        if self.hostname.trim().is_empty() {
            return Err(Error::Validation("hostname is required".to_string()));
        }
        if self.scheme != "http" && self.scheme != "https" {
            return Err(Error::Validation(format!(
                "scheme must be 'http' or 'https', got '{}'",
                self.scheme
            )));
        }
        if self.port == Some(0) {
            return Err(Error::Validation("port must be greater than 0".to_string()));
        }
        url::Url::parse(&self.endpoint_url()).map_err(|e| {
            Error::Validation(format!("invalid endpoint for '{}': {}", self.hostname, e))
        })?;
        if self.username.trim().is_empty() {
            return Err(Error::Validation("username is required".to_string()));
        }
        if self.auth_type == AuthType::Basic && self.password.expose_secret().is_empty() {
            return Err(Error::Validation(
                "password is required for basic authentication".to_string(),
            ));
        }
        if self.envelope_size == 0 {
            return Err(Error::Validation(
                "envelope_size must be greater than 0".to_string(),
            ));
        }
        if self.timeout == 0 {
            return Err(Error::Validation("timeout must be greater than 0".to_string()));
        }
        if let Some(dir) = &self.kerberos.include_dir {
            if !dir.is_dir() {
                return Err(Error::Validation(format!(
                    "include_dir '{}' does not exist",
                    dir.display()
                )));
            }
        }
        if let Some(keytab) = &self.kerberos.keytab {
            if !keytab.is_file() {
                return Err(Error::Validation(format!(
                    "keytab '{}' does not exist",
                    keytab.display()
                )));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Connection Info Builder
// ============================================================================

/// Builder for [`ConnectionInfo`]
pub struct ConnectionInfoBuilder {
    info: ConnectionInfo,
}

impl ConnectionInfoBuilder {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            info: ConnectionInfo {
                hostname: hostname.into(),
                auth_type: default_auth_type(),
                username: String::new(),
                password: empty_secret(),
                scheme: default_scheme(),
                port: None,
                connection_type: default_connection_type(),
                envelope_size: DEFAULT_ENVELOPE_SIZE,
                locale: default_locale(),
                code_page: default_code_page(),
                timeout: DEFAULT_TIMEOUT,
                ipaddress: None,
                kerberos: KerberosOptions::default(),
            },
        }
    }

    /// Use basic authentication with the given credentials
    pub fn basic(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.info.auth_type = AuthType::Basic;
        self.info.username = username.into();
        self.info.password = SecretString::new(password.into().into());
        self
    }

    /// Use Kerberos authentication as the given principal
    pub fn kerberos(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.info.auth_type = AuthType::Kerberos;
        self.info.username = username.into();
        self.info.password = SecretString::new(password.into().into());
        self
    }

    pub fn scheme(mut self, scheme: impl Into<String>) -> Self {
        self.info.scheme = scheme.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.info.port = Some(port);
        self
    }

    pub fn connection_type(mut self, connection_type: ConnectionType) -> Self {
        self.info.connection_type = connection_type;
        self
    }

    pub fn envelope_size(mut self, size: u32) -> Self {
        self.info.envelope_size = size;
        self
    }

    pub fn locale(mut self, locale: impl Into<String>) -> Self {
        self.info.locale = locale.into();
        self
    }

    pub fn code_page(mut self, code_page: u32) -> Self {
        self.info.code_page = code_page;
        self
    }

    /// Set the per-request timeout in seconds
    pub fn timeout(mut self, timeout: u64) -> Self {
        self.info.timeout = timeout;
        self
    }

    pub fn ipaddress(mut self, ipaddress: impl Into<String>) -> Self {
        self.info.ipaddress = Some(ipaddress.into());
        self
    }

    pub fn kerberos_options(mut self, options: KerberosOptions) -> Self {
        self.info.kerberos = options;
        self
    }

    /// Validate and return the connection info
    pub fn build(self) -> Result<ConnectionInfo> {
        self.info.validate()?;
        Ok(self.info)
    }
}

// ============================================================================
// Client Config
// ============================================================================

/// Process-wide settings shared by all hosts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// TCP connect timeout in seconds
    pub connect_timeout: u64,
    /// Maximum idle pooled connections kept per host
    pub max_persistent_per_host: usize,
    /// Seconds an idle pooled connection is kept
    pub cached_connection_timeout: u64,
    /// Grace period before an idle session is torn down
    pub idle_close_secs: u64,
    /// Guard for enumerate + pull requests per enumeration
    pub max_requests_per_enumeration: usize,
    /// Guard for receive requests per command
    pub max_requests_per_command: usize,
    /// Directory with request template overrides
    pub template_dir: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: 5,
            max_persistent_per_host: 2,
            cached_connection_timeout: 240,
            idle_close_secs: 60,
            max_requests_per_enumeration: DEFAULT_MAX_REQUESTS,
            max_requests_per_command: DEFAULT_MAX_REQUESTS,
            template_dir: None,
        }
    }
}

impl ClientConfig {
    /// Defaults plus environment overrides
    pub fn load() -> Self {
        let mut config = ClientConfig::default();
        config.apply_env_overrides();
        config
    }

    /// Load from a TOML file, then apply environment overrides
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse from a TOML document
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }

    /// Apply `WINRM_*` environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        // WINRM_CONNECT_TIMEOUT
        if let Ok(timeout) = std::env::var("WINRM_CONNECT_TIMEOUT") {
            if let Ok(n) = timeout.parse() {
                self.connect_timeout = n;
            }
        }

        // WINRM_IDLE_CLOSE_SECS
        if let Ok(secs) = std::env::var("WINRM_IDLE_CLOSE_SECS") {
            if let Ok(n) = secs.parse() {
                self.idle_close_secs = n;
            }
        }

        // WINRM_TEMPLATE_DIR
        if let Ok(dir) = std::env::var("WINRM_TEMPLATE_DIR") {
            self.template_dir = Some(PathBuf::from(dir));
        }

        // WINRM_MAX_ENUM_REQUESTS
        if let Ok(max) = std::env::var("WINRM_MAX_ENUM_REQUESTS") {
            if let Ok(n) = max.parse() {
                self.max_requests_per_enumeration = n;
            }
        }

        // WINRM_MAX_RECEIVE_REQUESTS
        if let Ok(max) = std::env::var("WINRM_MAX_RECEIVE_REQUESTS") {
            if let Ok(n) = max.parse() {
                self.max_requests_per_command = n;
            }
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn idle_close(&self) -> Duration {
        Duration::from_secs(self.idle_close_secs)
    }
}
