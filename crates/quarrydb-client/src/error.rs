//! Crate-level error taxonomy.
//!
//! [`ClientError`] enumerates every failure kind the core surfaces to a
//! caller (spec §4.8 / §7). Every fallible function returns [`Result<T>`],
//! an alias for `error_stack::Result<T, ClientError>`, so that context can
//! be attached at each return site with `.attach_printable(...)` /
//! `.change_context(...)` without inventing a bespoke stack-walking
//! mechanism — see `mofa_kernel::error::KernelError` in the reference
//! corpus for the pattern this follows.

/// The structured error kinds a caller can match on.
///
/// `#[non_exhaustive]` so new failure modes don't become a breaking change.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ClientError {
    /// A caller-supplied argument was invalid: an unknown HTTP method, an
    /// empty path, a pinned endpoint not present in the pool, a nil
    /// dependency.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// 404 from the server.
    #[error("not found")]
    NotFound,

    /// 401 from the server.
    #[error("unauthorized")]
    Unauthorized,

    /// 403 from the server.
    #[error("forbidden")]
    Forbidden,

    /// 409 from the server.
    #[error("conflict")]
    Conflict,

    /// 412 from the server.
    #[error("precondition failed")]
    PreconditionFailed,

    /// 503 carrying the server's "no leader" marker.
    #[error("no leader currently elected")]
    NoLeader,

    /// Any other structured error the server returned in its JSON error
    /// envelope: `{"code": ..., "errorNum": ..., "errorMessage": ...}`.
    #[error("server error {code} (errorNum {error_num}): {message}")]
    ServerError {
        code: u16,
        error_num: i64,
        message: String,
    },

    /// A network-level error observed *after* the request bytes were
    /// fully written (spec §4.4 step 5, "written-after-failure"). The
    /// router must not retry; the side effect may already have applied.
    #[error("response error after request was written: {0}")]
    ResponseError(String),

    /// A status code that was not in the caller's accepted set, from
    /// `Response::check_status`.
    #[error("unexpected status {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },

    /// Cursor read issued after the cursor returned `has_more = false`
    /// and the in-memory batch was exhausted.
    #[error("no more documents")]
    NoMoreDocuments,

    /// The underlying multiplexed stream transport lost its connection;
    /// every outstanding caller on that connection fails with this.
    #[error("connection lost")]
    ConnectionLost,

    /// The caller's context was cancelled before the operation completed.
    #[error("operation canceled")]
    Canceled,

    /// The caller's deadline passed before a response was obtained.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// All candidate endpoints in one router pass returned transient
    /// failures and the deadline has not expired enough to retry again.
    #[error("all {0} servers responded with temporary failure")]
    AllServersFailed(usize),

    /// An async job (spec §4.10) has not finished yet.
    #[error("async job {0} is still pending")]
    AsyncJobPending(String),

    /// Lower-level transport failure (connection refused, TLS error, DNS
    /// failure, timeout at the HTTP-client layer).
    #[error("transport error: {0}")]
    Transport(String),

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ClientError {
    /// Classify an HTTP status code into the taxonomy's permanent-error
    /// variants. Returns `None` for status codes that are not mapped to a
    /// dedicated variant (2xx, or a generic 4xx/5xx without a structured
    /// body, which callers see via `UnexpectedStatus` instead).
    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            401 => Some(ClientError::Unauthorized),
            403 => Some(ClientError::Forbidden),
            404 => Some(ClientError::NotFound),
            409 => Some(ClientError::Conflict),
            412 => Some(ClientError::PreconditionFailed),
            _ => None,
        }
    }

    /// Whether this status code, considered in isolation, is a transient
    /// failure the router/agency racer should retry (spec §4.4 step 5).
    ///
    /// 408 is explicitly transient; every other 4xx is permanent; 5xx and
    /// 503 are transient.
    pub fn is_transient_status(status: u16) -> bool {
        match status {
            408 => true,
            400..=499 => false,
            500..=599 => true,
            _ => false,
        }
    }
}

/// Result alias carrying an `error_stack::Report` so call sites can
/// `.attach_printable()` context as the error propagates (spec §4.8:
/// "every error is wrapped with stack context at every return site").
pub type Result<T> = error_stack::Result<T, ClientError>;

/// Classifier predicates over a [`Report<ClientError>`](error_stack::Report).
///
/// These see through any number of `.change_context()` / `.attach()`
/// wraps by inspecting `Report::current_context()`, matching spec §8's
/// requirement that `is_not_found(wrap(wrap(err))) == is_not_found(err)`.
pub trait ErrorClassifiers {
    fn is_not_found(&self) -> bool;
    fn is_conflict(&self) -> bool;
    fn is_unauthorized(&self) -> bool;
    fn is_precondition_failed(&self) -> bool;
    fn is_no_leader(&self) -> bool;
    fn is_response_error(&self) -> bool;
    fn is_server_error_with_code(&self, error_num: i64) -> bool;
    fn is_canceled(&self) -> bool;
    fn is_deadline_exceeded(&self) -> bool;
    fn is_no_more_documents(&self) -> bool;
    fn is_async_job_pending(&self) -> bool;
}

impl ErrorClassifiers for error_stack::Report<ClientError> {
    fn is_not_found(&self) -> bool {
        matches!(self.current_context(), ClientError::NotFound)
    }

    fn is_conflict(&self) -> bool {
        matches!(self.current_context(), ClientError::Conflict)
    }

    fn is_unauthorized(&self) -> bool {
        matches!(self.current_context(), ClientError::Unauthorized)
    }

    fn is_precondition_failed(&self) -> bool {
        matches!(self.current_context(), ClientError::PreconditionFailed)
    }

    fn is_no_leader(&self) -> bool {
        matches!(self.current_context(), ClientError::NoLeader)
    }

    fn is_response_error(&self) -> bool {
        matches!(self.current_context(), ClientError::ResponseError(_))
    }

    fn is_server_error_with_code(&self, want: i64) -> bool {
        matches!(
            self.current_context(),
            ClientError::ServerError { error_num, .. } if *error_num == want
        )
    }

    fn is_canceled(&self) -> bool {
        matches!(self.current_context(), ClientError::Canceled)
    }

    fn is_deadline_exceeded(&self) -> bool {
        matches!(self.current_context(), ClientError::DeadlineExceeded)
    }

    fn is_no_more_documents(&self) -> bool {
        matches!(self.current_context(), ClientError::NoMoreDocuments)
    }

    fn is_async_job_pending(&self) -> bool {
        matches!(self.current_context(), ClientError::AsyncJobPending(_))
    }
}

/// Helper for formatting a body snippet into error messages without
/// pulling a multi-megabyte payload into a log line.
pub(crate) fn truncate_body(body: &[u8], max: usize) -> String {
    let text = String::from_utf8_lossy(body);
    if text.len() > max {
        let boundary = (0..=max).rev().find(|&i| text.is_char_boundary(i)).unwrap_or(0);
        format!("{}… ({} bytes total)", &text[..boundary], body.len())
    } else {
        text.into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use error_stack::Report;

    #[test]
    fn classifier_sees_through_multiple_wraps() {
        let base = Report::new(ClientError::NotFound);
        let wrapped = base.attach_printable("loading document");
        let wrapped_again = wrapped.attach_printable("inside retry loop");
        assert!(wrapped_again.is_not_found());
    }

    #[test]
    fn status_classification_matches_transient_rules() {
        assert!(ClientError::is_transient_status(503));
        assert!(ClientError::is_transient_status(408));
        assert!(!ClientError::is_transient_status(404));
        assert!(!ClientError::is_transient_status(400));
        assert!(ClientError::is_transient_status(500));
    }

    #[test]
    fn from_status_maps_known_codes() {
        assert!(matches!(ClientError::from_status(404), Some(ClientError::NotFound)));
        assert!(matches!(ClientError::from_status(409), Some(ClientError::Conflict)));
        assert!(ClientError::from_status(200).is_none());
    }
}
