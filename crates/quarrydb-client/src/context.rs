//! Request-scoped execution context (spec §5 "Cancellation"; §4.4.1/6).
//!
//! Distinct from [`RequestOptions`](crate::options::RequestOptions): this
//! carries *transport-level* routing/cancellation concerns that are never
//! serialized onto the wire — deadline, cancellation, pinned endpoint, and
//! whether the router is allowed to follow a leader redirect. It is the
//! analogue of a Go `context.Context` plus the arangodb-specific values
//! attached to it.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

/// Default per-request deadline applied when the caller attaches none
/// (spec §5 "Timeouts").
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);

/// Per-peer floor used by the agency racer (spec §4.5).
pub const AGENCY_TIMEOUT_FLOOR: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct RequestContext {
    deadline: Option<Instant>,
    cancel: CancellationToken,
    /// Endpoint pinned by the caller (explicit `endpoint` option) or by a
    /// cursor's affinity invariant. Bypasses router failover entirely.
    pub(crate) pinned_endpoint: Option<String>,
    /// Whether a 503+location leader redirect should be followed
    /// (spec §4.4.6). Defaults to `true`.
    pub(crate) follow_leader_redirect: bool,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self {
            deadline: None,
            cancel: CancellationToken::new(),
            pinned_endpoint: None,
            follow_leader_redirect: true,
        }
    }
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn pinned_to(mut self, endpoint: impl Into<String>) -> Self {
        self.pinned_endpoint = Some(endpoint.into());
        self
    }

    pub fn without_leader_redirect(mut self) -> Self {
        self.follow_leader_redirect = false;
        self
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Time remaining until the deadline, or `DEFAULT_DEADLINE` when the
    /// caller attached none (spec §4.4 step 3 / §5).
    pub fn remaining(&self) -> Duration {
        match self.deadline {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            None => DEFAULT_DEADLINE,
        }
    }

    /// Returns a context carrying `default` as its deadline if the caller
    /// attached none, otherwise `self` unchanged. Lets a router/racer apply
    /// its own configured default instead of [`DEFAULT_DEADLINE`] without
    /// overriding a deadline the caller actually set.
    pub fn or_timeout(&self, default: Duration) -> Self {
        if self.deadline.is_some() {
            self.clone()
        } else {
            self.clone().with_timeout(default)
        }
    }

    pub fn deadline_passed(&self) -> bool {
        matches!(self.deadline, Some(d) if Instant::now() >= d)
    }

    pub fn pinned_endpoint(&self) -> Option<&str> {
        self.pinned_endpoint.as_deref()
    }

    pub fn follows_leader_redirect(&self) -> bool {
        self.follow_leader_redirect
    }

    /// Derive a child context carrying a slice of the remaining deadline,
    /// used by the router to divide time fairly across candidates
    /// (spec §4.4 step 3).
    pub fn with_slice(&self, slice: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + slice),
            cancel: self.cancel.child_token(),
            pinned_endpoint: self.pinned_endpoint.clone(),
            follow_leader_redirect: self.follow_leader_redirect,
        }
    }
}
