//! Single-endpoint HTTP transport (spec §4.2 "C2: Transport").
//!
//! Grounded on `mofa-gateway`'s `OpenAiBackend::forward` (forward a method
//! + path + headers + body to one fixed base URL through a shared
//! `reqwest::Client`, translate the response status, surface transport
//! failures as a dedicated error variant) but bound to exactly one
//! endpoint — fan-out across endpoints is the router's job (§4.4), not
//! the transport's.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use error_stack::Report;
use reqwest::Client;
use tracing::instrument;

use crate::codec::ContentType;
use crate::context::RequestContext;
use crate::error::{ClientError, Result};
use crate::request::{Body, Method, Request};
use crate::response::Response;

use super::Connection;

#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    pub endpoint: String,
    pub content_type: ContentType,
    pub connect_timeout: Duration,
    pub follow_redirects: bool,
    /// Negotiate HTTP/2 instead of HTTP/1.1 (spec §4.13 "AMBIENT —
    /// Configuration"). Only takes effect when the crate's `http2` Cargo
    /// feature is enabled; without it, `HttpTransport::new` logs a
    /// warning and falls back to HTTP/1.1 instead of negotiating.
    pub http2: bool,
}

impl HttpTransportConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            content_type: ContentType::Json,
            connect_timeout: Duration::from_secs(5),
            follow_redirects: false,
            http2: false,
        }
    }
}

/// A transport bound to exactly one server URL.
///
/// `follow_redirects` is normally `false`: the 503+`location` leader
/// redirect (spec §4.4.6) must surface to the router unfollowed so it can
/// reissue the request against the new leader itself, preserving
/// per-attempt accounting.
pub struct HttpTransport {
    client: Client,
    endpoint: String,
    content_type: ContentType,
}

impl HttpTransport {
    pub fn new(config: HttpTransportConfig) -> Result<Self> {
        let mut builder = Client::builder()
            .connect_timeout(config.connect_timeout)
            .redirect(if config.follow_redirects {
                reqwest::redirect::Policy::limited(5)
            } else {
                reqwest::redirect::Policy::none()
            });

        #[cfg(feature = "http2")]
        if config.http2 {
            builder = builder.http2_prior_knowledge();
        }
        #[cfg(not(feature = "http2"))]
        if config.http2 {
            tracing::warn!("ClientConfig.http2 is set but the `http2` crate feature is not enabled; ignoring");
        }

        let client = builder
            .build()
            .map_err(|e| Report::new(ClientError::Transport(format!("failed to build http client: {e}"))))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            content_type: config.content_type,
        })
    }

    fn url_for(&self, req: &Request) -> String {
        let mut url = format!("{}{}", self.endpoint, req.path());
        if !req.query_params().is_empty() {
            let qs = req
                .query_params()
                .iter()
                .map(|(k, v)| format!("{}={}", urlencode(k), urlencode(v)))
                .collect::<Vec<_>>()
                .join("&");
            url.push('?');
            url.push_str(&qs);
        }
        url
    }

    fn reqwest_method(method: Method) -> reqwest::Method {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
            Method::Head => reqwest::Method::HEAD,
            Method::Options => reqwest::Method::OPTIONS,
        }
    }
}

#[async_trait]
impl Connection for HttpTransport {
    #[instrument(skip(self, ctx), fields(endpoint = %self.endpoint, method = %req.method().as_str(), path = %req.path()))]
    async fn do_request(&self, ctx: &RequestContext, req: Request) -> Result<Response> {
        let url = self.url_for(&req);
        let mut builder = self
            .client
            .request(Self::reqwest_method(req.method()), &url)
            .timeout(ctx.remaining());

        for (key, value) in req.headers() {
            builder = builder.header(key, value);
        }

        let (body_bytes, body_content_type) = match req.body() {
            Body::None => (None, None),
            Body::Single(value) => (Some(self.content_type.encode(value)?), Some(self.content_type.mime())),
            Body::Array { items, merge } => {
                let merged = merge_array(items, merge.as_deref());
                (
                    Some(self.content_type.encode(&serde_json::Value::Array(merged))?),
                    Some(self.content_type.mime()),
                )
            }
            Body::ImportArray(items) => {
                let lines: Vec<String> = items.iter().map(|v| v.to_string()).collect();
                (Some(lines.join("\n").into_bytes()), Some("application/x-ldjson"))
            }
            Body::Raw { bytes, content_type } => (Some(bytes.to_vec()), Some(content_type.as_str())),
        };

        if let Some(ct) = body_content_type {
            builder = builder.header(reqwest::header::CONTENT_TYPE, ct);
        }
        if let Some(bytes) = body_bytes {
            builder = builder.body(bytes);
        }

        let send = tokio::select! {
            biased;
            _ = ctx.cancel_token().cancelled() => {
                return Err(Report::new(ClientError::Canceled).attach_printable(format!("canceled before response from {url}")));
            }
            result = builder.send() => result,
        };

        // `reqwest::Error::is_connect()` means the failure happened while
        // establishing the TCP/TLS connection, before any request bytes
        // could have crossed the socket; a timeout is explicitly listed as
        // transient by spec §4.4 step 5 regardless of how far the request
        // got. Both stay unwritten so the router retries another
        // candidate. Any other send-stage error (write failure,
        // connection reset mid request) may have already put bytes on the
        // wire, so the written-flag is set before surfacing it as
        // `ResponseError` ("written-after-failure").
        let response = match send {
            Ok(response) => response,
            Err(e) if e.is_connect() => {
                return Err(Report::new(ClientError::Transport(e.to_string())).attach_printable(format!("connecting to {url}")));
            }
            Err(e) if e.is_timeout() => {
                return Err(Report::new(ClientError::DeadlineExceeded).attach_printable(format!("request to {url} timed out")));
            }
            Err(e) => {
                req.mark_written();
                return Err(Report::new(ClientError::ResponseError(e.to_string())).attach_printable(format!("sending request to {url}")));
            }
        };
        req.mark_written();

        let status = response.status().as_u16();
        let mut headers = BTreeMap::new();
        for (name, value) in response.headers() {
            if let Ok(v) = value.to_str() {
                headers.insert(name.as_str().to_ascii_lowercase(), v.to_string());
            }
        }
        let content_type = headers.get("content-type").cloned().unwrap_or_else(|| self.content_type.mime().to_string());

        let body = response
            .bytes()
            .await
            .map_err(|e| Report::new(ClientError::ResponseError(e.to_string())).attach_printable("reading response body"))?;

        Ok(Response::new(status, headers, body, content_type))
    }

    fn endpoints(&self) -> Vec<String> {
        vec![self.endpoint.clone()]
    }

    async fn update_endpoints(&self, endpoints: Vec<String>) -> Result<()> {
        if endpoints.len() == 1 && endpoints[0].trim_end_matches('/') == self.endpoint {
            return Ok(());
        }
        Err(Report::new(ClientError::InvalidArgument(
            "a single-endpoint transport cannot change its endpoint; rebuild the cluster router instead".into(),
        )))
    }

    fn protocols(&self) -> ContentType {
        self.content_type
    }
}

fn merge_array(items: &[serde_json::Value], merge: Option<&[serde_json::Value]>) -> Vec<serde_json::Value> {
    match merge {
        None => items.to_vec(),
        Some(overlays) => items
            .iter()
            .enumerate()
            .map(|(i, item)| match (item, overlays.get(i)) {
                (serde_json::Value::Object(base), Some(serde_json::Value::Object(overlay))) => {
                    let mut merged = base.clone();
                    for (k, v) in overlay {
                        merged.insert(k.clone(), v.clone());
                    }
                    serde_json::Value::Object(merged)
                }
                _ => item.clone(),
            })
            .collect(),
    }
}

fn urlencode(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}
