//! Request model (spec §3, §4.1).
//!
//! A [`Request`] is immutable once built except for the one-shot
//! written-flag transition a transport performs when the bytes have
//! crossed the socket boundary. Requests are cloneable so the router
//! (retries) and the agency racer (fan-out) can send independent copies.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use error_stack::Report;
use serde::Serialize;

use crate::error::{ClientError, Result};

/// HTTP methods the core understands. Anything else is rejected by
/// [`Request::new`] with `ClientError::InvalidArgument`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "PATCH" => Ok(Method::Patch),
            "DELETE" => Ok(Method::Delete),
            "HEAD" => Ok(Method::Head),
            "OPTIONS" => Ok(Method::Options),
            other => Err(Report::new(ClientError::InvalidArgument(format!(
                "unsupported HTTP method {other}"
            )))),
        }
    }
}

/// The request body, in one of the four forms spec §4.1 lists.
#[derive(Debug, Clone)]
pub enum Body {
    /// No body (GET/HEAD/DELETE in the common case).
    None,
    /// A single value, marshalled with the connection's content type.
    Single(Arc<serde_json::Value>),
    /// An array of values, each optionally merged with a per-item
    /// overlay object (bulk update semantics).
    Array {
        items: Vec<serde_json::Value>,
        merge: Option<Vec<serde_json::Value>>,
    },
    /// Values marshalled one-per-line (bulk import, line-delimited JSON).
    ImportArray(Vec<serde_json::Value>),
    /// Already-serialized bytes with an explicit content type, bypassing
    /// the connection's negotiated codec.
    Raw {
        bytes: bytes::Bytes,
        content_type: String,
    },
}

/// A single outbound request. Immutable after construction aside from
/// the written-flag, which only ever transitions `false -> true`.
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    headers: BTreeMap<String, String>,
    body: Body,
    written: Arc<AtomicBool>,
}

impl Request {
    /// Build a new request. Fails with `InvalidArgument` for an unknown
    /// method or an empty path (spec §7).
    pub fn new(method: &str, path: impl Into<String>) -> Result<Self> {
        let method = Method::parse(method)?;
        let path = path.into();
        if path.is_empty() {
            return Err(Report::new(ClientError::InvalidArgument(
                "request path must not be empty".into(),
            )));
        }
        Ok(Self {
            method,
            path,
            query: Vec::new(),
            headers: BTreeMap::new(),
            body: Body::None,
            written: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Build a database-scoped path, `/_db/<db>/<rest>`.
    pub fn db_path(db: &str, rest: &str) -> String {
        let rest = rest.trim_start_matches('/');
        format!("/_db/{db}/{rest}")
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query_params(&self) -> &[(String, String)] {
        &self.query
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    /// Set a header. Header names are treated case-insensitively by
    /// lower-casing them at insertion time.
    pub fn set_header(&mut self, key: impl AsRef<str>, value: impl Into<String>) -> &mut Self {
        self.headers.insert(key.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(&key.to_ascii_lowercase()).map(String::as_str)
    }

    /// Set (overwrite) a query parameter. Parameters are kept sorted by
    /// key so that two requests built from the same options produce
    /// byte-identical wire requests (spec §8: order-insensitive replay).
    pub fn set_query(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        let key = key.into();
        let value = value.into();
        if let Some(existing) = self.query.iter_mut().find(|(k, _)| *k == key) {
            existing.1 = value;
        } else {
            self.query.push((key, value));
            self.query.sort_by(|a, b| a.0.cmp(&b.0));
        }
        self
    }

    pub fn set_body<T: Serialize>(&mut self, value: &T) -> Result<&mut Self> {
        let json = serde_json::to_value(value).map_err(|e| Report::new(ClientError::Serialization(e)))?;
        self.body = Body::Single(Arc::new(json));
        Ok(self)
    }

    pub fn set_body_array<T: Serialize>(
        &mut self,
        values: &[T],
        merge: Option<&[serde_json::Value]>,
    ) -> Result<&mut Self> {
        let items = values
            .iter()
            .map(serde_json::to_value)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Report::new(ClientError::from(e)))?;
        self.body = Body::Array {
            items,
            merge: merge.map(|m| m.to_vec()),
        };
        Ok(self)
    }

    pub fn set_body_import_array<T: Serialize>(&mut self, values: &[T]) -> Result<&mut Self> {
        let items = values
            .iter()
            .map(serde_json::to_value)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Report::new(ClientError::from(e)))?;
        self.body = Body::ImportArray(items);
        Ok(self)
    }

    pub fn set_body_raw(&mut self, bytes: bytes::Bytes, content_type: impl Into<String>) -> &mut Self {
        self.body = Body::Raw {
            bytes,
            content_type: content_type.into(),
        };
        self
    }

    /// Whether the request bytes have fully crossed the socket boundary.
    /// Monotonic: once `true`, never reverts (spec §3 invariant).
    pub fn is_written(&self) -> bool {
        self.written.load(Ordering::Acquire)
    }

    /// Transport-internal hook: mark the request as written. Idempotent.
    pub fn mark_written(&self) {
        self.written.store(true, Ordering::Release);
    }

    /// A cheap clone of the written-flag, for callers that need to
    /// observe it after the `Request` itself has been moved into a
    /// transport call (the router's written-after-failure check).
    pub fn written_flag(&self) -> Arc<AtomicBool> {
        self.written.clone()
    }

    /// Produce an independent copy whose written-flag is reset to
    /// `false`, for router retries and agency fan-out (spec §3, §9).
    pub fn clone_for_retry(&self) -> Self {
        Self {
            method: self.method,
            path: self.path.clone(),
            query: self.query.clone(),
            headers: self.headers.clone(),
            body: self.body.clone(),
            written: Arc::new(AtomicBool::new(false)),
        }
    }
}
