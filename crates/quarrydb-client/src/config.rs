//! Client configuration (spec §9 design notes; SPEC_FULL §4.13 "AMBIENT
//! — Configuration").
//!
//! [`ClientConfig`] is a builder struct, not a runtime key-value map: one
//! field per knob the core actually reads (initial endpoints, wire
//! content type, transport/TLS settings, authentication mode, the
//! endpoint auto-sync interval, and the default deadlines spec §5
//! documents). Grounded on `mofa_kernel::config`'s format-detecting file
//! loader (`detect_format` + `config::Config::builder().add_source(File
//! ::from_str(...))`), gated behind the `config-file` feature so a
//! caller who only wants to build a `ClientConfig` in code never pulls
//! in the `config` crate's parsers.

use std::time::Duration;

use error_stack::Report;
use serde::{Deserialize, Serialize};

use crate::codec::ContentType;
use crate::error::{ClientError, Result};

/// How a connection authenticates (spec §4.3 "C3: Authenticator").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AuthenticationMode {
    None,
    Basic { username: String, password: String },
    Jwt { username: String, password: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    /// One or more server URLs the cluster router starts with.
    pub endpoints: Vec<String>,
    /// Wire content type every connection built from this config
    /// negotiates (spec §6.1).
    #[serde(default)]
    pub content_type: WireContentType,
    /// TLS/connect-timeout knobs passed to the HTTP transport.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Whether the HTTP transport may negotiate HTTP/2 (requires the
    /// crate's `http2` feature to actually take effect).
    #[serde(default)]
    pub http2: bool,
    #[serde(default)]
    pub authentication: AuthenticationModeOrNone,
    /// Endpoint auto-sync interval in seconds (spec §4.9); `0` disables
    /// the background loop entirely.
    #[serde(default)]
    pub sync_interval_secs: u64,
    /// Default per-request deadline when the caller attaches none (spec
    /// §5 "Timeouts"). Defaults to 30s. Applied to the router built by
    /// `Client::connect` via `ClusterConnection::set_default_deadline`.
    #[serde(default = "default_deadline_secs")]
    pub default_deadline_secs: u64,
    /// Agency racer's per-peer timeout floor (spec §4.5). Defaults to 2s.
    /// Applied to racers built via `Client::agency_racer`.
    #[serde(default = "default_agency_floor_secs")]
    pub agency_timeout_floor_secs: u64,
}

/// Serde can't derive a sensible `Default` for an externally-tagged enum
/// with no "unit-like" `None` ambiguity removed, so this newtype carries
/// `AuthenticationMode::None` as the config-level default explicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthenticationModeOrNone(pub AuthenticationMode);

impl Default for AuthenticationModeOrNone {
    fn default() -> Self {
        Self(AuthenticationMode::None)
    }
}

/// Serde-friendly mirror of [`ContentType`] (kept separate so `codec`
/// doesn't need a `serde` dependency on behalf of a config-only concern).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireContentType {
    #[default]
    Json,
    VelocyStream,
}

impl From<WireContentType> for ContentType {
    fn from(value: WireContentType) -> Self {
        match value {
            WireContentType::Json => ContentType::Json,
            WireContentType::VelocyStream => ContentType::VelocyStream,
        }
    }
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_deadline_secs() -> u64 {
    30
}

fn default_agency_floor_secs() -> u64 {
    2
}

impl ClientConfig {
    pub fn new(endpoints: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            endpoints: endpoints.into_iter().map(Into::into).collect(),
            content_type: WireContentType::Json,
            connect_timeout_secs: default_connect_timeout_secs(),
            http2: false,
            authentication: AuthenticationModeOrNone::default(),
            sync_interval_secs: 0,
            default_deadline_secs: default_deadline_secs(),
            agency_timeout_floor_secs: default_agency_floor_secs(),
        }
    }

    pub fn with_authentication(mut self, mode: AuthenticationMode) -> Self {
        self.authentication = AuthenticationModeOrNone(mode);
        self
    }

    pub fn with_content_type(mut self, content_type: WireContentType) -> Self {
        self.content_type = content_type;
        self
    }

    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval_secs = interval.as_secs();
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn default_deadline(&self) -> Duration {
        Duration::from_secs(self.default_deadline_secs)
    }

    pub fn agency_timeout_floor(&self) -> Duration {
        Duration::from_secs(self.agency_timeout_floor_secs)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    /// Load a `ClientConfig` from a TOML/YAML/JSON file, auto-detecting
    /// the format from its extension (requires the `config-file`
    /// feature). Mirrors `mofa_kernel::config::load_config`.
    #[cfg(feature = "config-file")]
    pub fn from_file(path: &str) -> Result<Self> {
        let format = detect_format(path)?;
        let content = std::fs::read_to_string(path)
            .map_err(|e| Report::new(ClientError::InvalidArgument(format!("reading config file {path}: {e}"))))?;

        let built = config::Config::builder()
            .add_source(config::File::from_str(&content, format))
            .build()
            .map_err(|e| Report::new(ClientError::InvalidArgument(format!("parsing config file {path}: {e}"))))?;

        built
            .try_deserialize()
            .map_err(|e| Report::new(ClientError::InvalidArgument(format!("deserializing config file {path}: {e}"))))
    }
}

#[cfg(feature = "config-file")]
fn detect_format(path: &str) -> Result<config::FileFormat> {
    let ext = std::path::Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| Report::new(ClientError::InvalidArgument(format!("config path {path} has no file extension"))))?;

    match ext.to_ascii_lowercase().as_str() {
        "yaml" | "yml" => Ok(config::FileFormat::Yaml),
        "toml" => Ok(config::FileFormat::Toml),
        "json" => Ok(config::FileFormat::Json),
        other => Err(Report::new(ClientError::InvalidArgument(format!("unsupported config format: {other}")))),
    }
}
