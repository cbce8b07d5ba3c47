//! Response model (spec §3, §4.1).

use std::collections::BTreeMap;

use error_stack::Report;
use serde::de::DeserializeOwned;

use crate::error::{truncate_body, ClientError, Result};

/// A response received from a single endpoint.
#[derive(Debug, Clone)]
pub struct Response {
    status: u16,
    headers: BTreeMap<String, String>,
    body: bytes::Bytes,
    content_type: String,
}

impl Response {
    pub fn new(status: u16, headers: BTreeMap<String, String>, body: bytes::Bytes, content_type: impl Into<String>) -> Self {
        Self {
            status,
            headers,
            body,
            content_type: content_type.into(),
        }
    }

    pub fn status_code(&self) -> u16 {
        self.status
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(&key.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn raw_body(&self) -> &bytes::Bytes {
        &self.body
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Fail with `UnexpectedStatus` unless the status code is one of
    /// `allowed` (spec §4.1).
    pub fn check_status(&self, allowed: &[u16]) -> Result<()> {
        if allowed.contains(&self.status) {
            return Ok(());
        }
        Err(Report::new(ClientError::UnexpectedStatus {
            status: self.status,
            body: truncate_body(&self.body, 512),
        }))
    }

    /// Parse the whole body (when `field` is empty) or a single named
    /// sub-field of the top-level JSON object into `out`.
    pub fn parse_body<T: DeserializeOwned>(&self, field: &str) -> Result<T> {
        let value: serde_json::Value =
            serde_json::from_slice(&self.body).map_err(|e| Report::new(ClientError::Serialization(e)))?;

        let target = if field.is_empty() {
            value
        } else {
            value
                .get(field)
                .cloned()
                .ok_or_else(|| Report::new(ClientError::InvalidArgument(format!("field '{field}' not present in response body"))))?
        };

        serde_json::from_value(target).map_err(|e| Report::new(ClientError::Serialization(e)))
    }

    /// Split a bulk-operation envelope (a top-level JSON array, one
    /// element per submitted item) into per-element sub-responses that
    /// each carry their own status code so `check_status`/`parse_body`
    /// can be re-applied individually.
    pub fn parse_array_body(&self) -> Result<Vec<Response>> {
        let value: serde_json::Value =
            serde_json::from_slice(&self.body).map_err(|e| Report::new(ClientError::Serialization(e)))?;

        let items = value
            .as_array()
            .ok_or_else(|| Report::new(ClientError::InvalidArgument("response body is not a bulk array envelope".into())))?;

        items
            .iter()
            .map(|item| {
                let status = item
                    .get("_status")
                    .or_else(|| item.get("code"))
                    .and_then(serde_json::Value::as_u64)
                    .unwrap_or(self.status as u64) as u16;
                let bytes = serde_json::to_vec(item).map_err(|e| Report::new(ClientError::Serialization(e)))?;
                Ok(Response::new(status, BTreeMap::new(), bytes.into(), self.content_type.clone()))
            })
            .collect()
    }
}
