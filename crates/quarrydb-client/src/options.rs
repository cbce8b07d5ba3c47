//! Context-settings / request-options layer (spec §4.6 "C6: Context
//! settings").
//!
//! The original design threads per-request settings through a runtime key
//! bag attached to a context value. Idiomatic Rust prefers a typed
//! builder: [`RequestOptions`] is a plain struct with one optional field
//! per recognized setting, `apply()` decodes it onto a [`Request`] (query
//! params / headers) and derives the transport-level [`RequestContext`]
//! pieces it also controls (endpoint pin, leader-redirect, async mode),
//! and [`ResponseEffects::extract`] performs the documented post-response
//! side effects (spec §4.6.3). `success_status_codes()` surfaces
//! `wait_for_sync`'s expected-status-switch effect for the caller's own
//! `Response::check_status` to use.
//!
//! Parent-pointer inheritance (spec §6.3: a child options value inherits
//! any field its own builder chain left unset) is modeled by `inherit`,
//! which fills `None` fields from a parent without overwriting anything
//! the child already set.

use crate::agency::RaceMode;
use crate::context::RequestContext;
use crate::error::Result;
use crate::query::QueryOptions;
use crate::request::Request;
use crate::response::Response;

#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub revision: Option<String>,
    /// Per-document revisions for a bulk (array-bodied) call — one entry
    /// per element of the submitted slice. Presence forces
    /// `ignoreRevs=false`; absence leaves revision checking up to the
    /// server default (spec §4.6 "revisions").
    pub revisions: Option<Vec<String>>,
    pub if_match: Option<String>,
    pub if_none_match: Option<String>,
    pub return_new: Option<bool>,
    pub return_old: Option<bool>,
    pub silent: Option<bool>,
    pub wait_for_sync: Option<bool>,
    pub details: Option<bool>,
    pub keep_null: Option<bool>,
    pub merge_objects: Option<bool>,
    pub capture_raw_response: Option<bool>,
    pub capture_response: Option<bool>,
    pub import_details: Option<bool>,
    pub is_restore: Option<bool>,
    pub is_system: Option<bool>,
    pub ignore_revs: Option<bool>,
    pub enforce_replication_factor: Option<bool>,
    /// Spec §4.6 "configured": sets the `configured` query param (used by
    /// collection/index creation calls to report back the configuration
    /// actually applied rather than the requested one).
    pub configured: Option<bool>,
    pub dbserver_id: Option<String>,
    pub batch_id: Option<String>,
    pub query_params: Vec<(String, String)>,
    pub endpoint: Option<String>,
    pub follow_leader_redirect: Option<bool>,
    pub r#async: Option<AsyncMode>,
    pub allow_dirty_reads: Option<bool>,
    /// `query-*` keys (spec §4.6): decoded into the `/_api/cursor`
    /// submission body by [`QueryOptions::build_body`], not onto `req`
    /// directly — cursor opening has its own body shape (§6.5).
    pub query: Option<QueryOptions>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncMode {
    /// Fire-and-forget: server drops the response, driver never sees it.
    FireAndForget,
    /// Store-and-poll: server keeps the result under a job id the driver
    /// retrieves later (spec §4.10).
    Store,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fill any field left `None`/empty on `self` from `parent`, without
    /// overwriting a field `self` already set (spec §6.3).
    pub fn inherit(mut self, parent: &RequestOptions) -> Self {
        macro_rules! fill {
            ($field:ident) => {
                if self.$field.is_none() {
                    self.$field = parent.$field.clone();
                }
            };
        }
        fill!(revision);
        fill!(revisions);
        fill!(if_match);
        fill!(if_none_match);
        fill!(return_new);
        fill!(return_old);
        fill!(silent);
        fill!(wait_for_sync);
        fill!(details);
        fill!(keep_null);
        fill!(merge_objects);
        fill!(capture_raw_response);
        fill!(capture_response);
        fill!(import_details);
        fill!(is_restore);
        fill!(is_system);
        fill!(ignore_revs);
        fill!(enforce_replication_factor);
        fill!(configured);
        fill!(dbserver_id);
        fill!(batch_id);
        fill!(endpoint);
        fill!(follow_leader_redirect);
        fill!(r#async);
        fill!(allow_dirty_reads);
        fill!(query);
        if self.query_params.is_empty() {
            self.query_params = parent.query_params.clone();
        }
        self
    }

    /// Decode this options bag onto `req` (headers/query params) and
    /// produce the `RequestContext` pieces it controls. `base_ctx` carries
    /// the caller's deadline/cancellation, which options never override.
    pub fn apply(&self, req: &mut Request, base_ctx: RequestContext) -> Result<RequestContext> {
        if let Some(rev) = &self.revision {
            req.set_header("if-match", rev.clone());
        }
        if self.revisions.is_some() && self.ignore_revs.is_none() {
            req.set_query("ignoreRevs", "false");
        }
        if let Some(v) = &self.if_match {
            req.set_header("if-match", v.clone());
        }
        if let Some(v) = &self.if_none_match {
            req.set_header("if-none-match", v.clone());
        }
        if let Some(true) = self.return_new {
            req.set_query("returnNew", "true");
        }
        if let Some(true) = self.return_old {
            req.set_query("returnOld", "true");
        }
        if let Some(v) = self.silent {
            req.set_query("silent", v.to_string());
        }
        if let Some(v) = self.wait_for_sync {
            req.set_query("waitForSync", v.to_string());
        }
        if let Some(true) = self.details {
            req.set_query("details", "true");
        }
        if let Some(v) = self.keep_null {
            req.set_query("keepNull", v.to_string());
        }
        if let Some(v) = self.merge_objects {
            req.set_query("mergeObjects", v.to_string());
        }
        if let Some(true) = self.import_details {
            req.set_query("details", "true");
        }
        if let Some(true) = self.is_restore {
            req.set_query("isRestore", "true");
        }
        if let Some(true) = self.is_system {
            req.set_query("isSystem", "true");
        }
        if let Some(true) = self.ignore_revs {
            req.set_query("ignoreRevs", "true");
        }
        if let Some(v) = self.enforce_replication_factor {
            req.set_query("enforceReplicationFactor", v.to_string());
        }
        if let Some(v) = self.configured {
            req.set_query("configured", v.to_string());
        }
        if let Some(id) = &self.dbserver_id {
            req.set_header("x-quarry-dbserver-id", id.clone());
        }
        if let Some(id) = &self.batch_id {
            req.set_header("x-quarry-batch-id", id.clone());
        }
        if let Some(true) = self.allow_dirty_reads {
            req.set_header("x-quarry-dirty-read", "true");
        }
        for (k, v) in &self.query_params {
            req.set_query(k.clone(), v.clone());
        }
        match self.r#async {
            Some(AsyncMode::FireAndForget) => {
                req.set_header("x-quarry-async", "true");
            }
            Some(AsyncMode::Store) => {
                req.set_header("x-quarry-async", "store");
            }
            None => {}
        }

        let mut ctx = base_ctx;
        if let Some(endpoint) = &self.endpoint {
            ctx = ctx.pinned_to(endpoint.clone());
        }
        if self.follow_leader_redirect == Some(false) {
            ctx = ctx.without_leader_redirect();
        }
        Ok(ctx)
    }

    /// Derive the scalar-valued options bag for element `index` of a bulk
    /// (array-bodied) call (spec §4.6 "Multi-document helpers"): when the
    /// caller supplied a per-document `revisions` slice, the derived
    /// options bag carries that element's revision as its singular
    /// `revision` field so per-document `If-Match` semantics can be
    /// layered on top of the shared array body. Every other field is
    /// inherited unchanged from `self`.
    pub fn for_element(&self, index: usize) -> RequestOptions {
        let mut derived = self.clone();
        if let Some(revisions) = &self.revisions {
            derived.revision = revisions.get(index).cloned();
        }
        derived
    }

    /// Which [`RaceMode`](crate::agency::RaceMode) the agency racer should
    /// use for a request built from this options bag (spec §4.5 "Serial"
    /// mode / §9 Open Question). Capturing the raw response or the parsed
    /// `Response` only makes sense for a single winning peer, so either
    /// flag forces serial fan-out; everything else races in parallel.
    pub fn race_mode(&self) -> RaceMode {
        if self.capture_response.unwrap_or(false) || self.capture_raw_response.unwrap_or(false) {
            RaceMode::Serial
        } else {
            RaceMode::Parallel
        }
    }

    /// Which status code(s) a write endpoint's success response can carry
    /// for this options bag's `wait_for_sync` setting (spec §4.6
    /// "waitForSync": sets query + switches expected success status, e.g.
    /// 201 vs 202). `created` is the status returned once the write is
    /// durable, `accepted` the status returned when the server queued it
    /// without waiting. Unset `wait_for_sync` leaves it up to the server,
    /// so the caller's `Response::check_status` should accept either.
    pub fn success_status_codes(&self, created: u16, accepted: u16) -> Vec<u16> {
        match self.wait_for_sync {
            Some(true) => vec![created],
            Some(false) => vec![accepted],
            None => vec![created, accepted],
        }
    }
}

/// Post-response values an options bag promised to populate (spec
/// §4.6.3: `response`/`rawResponse` capture slots, and `x-quarry-async-id`
/// relay for async-store mode).
#[derive(Debug, Clone, Default)]
pub struct ResponseEffects {
    pub response: Option<Response>,
    pub raw_response: Option<bytes::Bytes>,
    pub async_job_id: Option<String>,
}

impl ResponseEffects {
    pub fn extract(options: &RequestOptions, response: &Response) -> Self {
        let async_job_id = response.header("x-quarry-async-id").map(String::from);
        Self {
            response: options.capture_response.unwrap_or(false).then(|| response.clone()),
            raw_response: options
                .capture_raw_response
                .unwrap_or(false)
                .then(|| response.raw_body().clone()),
            async_job_id,
        }
    }
}
