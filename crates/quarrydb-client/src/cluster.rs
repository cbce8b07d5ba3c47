//! Cluster failover router (spec §4.4 "C4: Cluster router").
//!
//! Wraps N single-endpoint [`Connection`]s (each already possibly
//! decorated with [`crate::auth::AuthenticatedConnection`]) behind one
//! façade that itself implements `Connection`, so callers never know
//! whether they are talking to one server or a cluster. Candidate
//! selection, backoff, and written-after-failure handling follow the
//! attempt-loop shape of `llm/retry.rs`; the round-robin pool index
//! follows `llm/routing.rs`'s backend-cycling pattern.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use error_stack::Report;
use parking_lot::RwLock;
use tracing::{debug, instrument, warn};

use crate::codec::ContentType;
use crate::context::RequestContext;
use crate::error::{truncate_body, ClientError, Result};
use crate::request::Request;
use crate::response::Response;
use crate::transport::Connection;

/// Up to this many endpoints are tried per logical call before giving up
/// and returning `AllServersFailed` (spec §4.4 step 2).
const MAX_CANDIDATES_PER_CALL: usize = 3;

const BACKOFF_INITIAL: Duration = Duration::from_millis(1);
const BACKOFF_FACTOR: f64 = 1.5;
const BACKOFF_CAP: Duration = Duration::from_secs(2);

/// Builds a `Connection` for a freshly-discovered endpoint URL, used by
/// [`ClusterConnection::update_endpoints`] to grow the pool without the
/// router needing to know about HTTP vs. stream transports or auth
/// wrapping.
pub type ConnectionFactory = Arc<dyn Fn(&str) -> Result<Arc<dyn Connection>> + Send + Sync>;

struct Entry {
    url: String,
    conn: Arc<dyn Connection>,
}

pub struct ClusterConnection {
    pool: RwLock<Vec<Entry>>,
    current: AtomicUsize,
    factory: ConnectionFactory,
    content_type: ContentType,
    /// Deadline applied when a caller's context carries none (spec §5
    /// "Timeouts"), overridable via [`Self::set_default_deadline`] so a
    /// [`crate::config::ClientConfig`]'s `default_deadline_secs` can take
    /// effect after the router is already behind an `Arc`.
    default_deadline_millis: AtomicU64,
}

impl ClusterConnection {
    pub fn new(initial: Vec<Arc<dyn Connection>>, factory: ConnectionFactory) -> Result<Arc<Self>> {
        if initial.is_empty() {
            return Err(Report::new(ClientError::InvalidArgument("cluster router requires at least one endpoint".into())));
        }
        let content_type = initial[0].protocols();
        let pool = initial
            .into_iter()
            .map(|conn| Entry { url: conn.endpoints().remove(0), conn })
            .collect();
        Ok(Arc::new(Self {
            pool: RwLock::new(pool),
            current: AtomicUsize::new(0),
            factory,
            content_type,
            default_deadline_millis: AtomicU64::new(crate::context::DEFAULT_DEADLINE.as_millis() as u64),
        }))
    }

    /// Overrides the deadline applied to contexts that carry none.
    pub fn set_default_deadline(&self, deadline: Duration) {
        self.default_deadline_millis.store(deadline.as_millis() as u64, Ordering::Relaxed);
    }

    fn default_deadline(&self) -> Duration {
        Duration::from_millis(self.default_deadline_millis.load(Ordering::Relaxed))
    }

    async fn candidates(&self, pinned: Option<&str>) -> Result<Vec<Arc<dyn Connection>>> {
        let pool = self.pool.read();
        if pool.is_empty() {
            return Err(Report::new(ClientError::AllServersFailed(0)));
        }

        if let Some(pin) = pinned {
            return pool
                .iter()
                .find(|e| e.url == pin)
                .map(|e| vec![e.conn.clone()])
                .ok_or_else(|| Report::new(ClientError::InvalidArgument(format!("pinned endpoint {pin} is not in the current pool"))));
        }

        let len = pool.len();
        let window = len.min(MAX_CANDIDATES_PER_CALL);
        let start = self.current.fetch_add(1, Ordering::Relaxed) % len;
        Ok((0..window).map(|i| pool[(start + i) % len].conn.clone()).collect())
    }

    async fn find_by_url(&self, url: &str) -> Option<Arc<dyn Connection>> {
        self.pool.read().iter().find(|e| e.url == url).map(|e| e.conn.clone())
    }
}

#[async_trait]
impl Connection for ClusterConnection {
    #[instrument(skip(self, ctx, req), fields(path = %req.path()))]
    async fn do_request(&self, ctx: &RequestContext, req: Request) -> Result<Response> {
        let ctx = &ctx.or_timeout(self.default_deadline());
        let mut backoff = BACKOFF_INITIAL;
        let mut last_err = None;
        let mut candidate_count = 0usize;

        // Spec §4.4 step 8: if an entire pass comes back all-transient and
        // the deadline has not expired, reselect candidates (the
        // round-robin pointer has already advanced past the failed ones)
        // and try a whole new pass, rather than giving up after one.
        loop {
            let candidates = self.candidates(ctx.pinned_endpoint()).await?;
            candidate_count = candidates.len();
            let slice = ctx.remaining().checked_div(candidates.len() as u32).unwrap_or(ctx.remaining());

            let mut pass_all_transient = true;

            for (attempt, conn) in candidates.iter().enumerate() {
                if ctx.deadline_passed() || ctx.is_canceled() {
                    pass_all_transient = false;
                    break;
                }
                let attempt_req = if attempt == 0 { req.clone() } else { req.clone_for_retry() };
                let written_flag = attempt_req.written_flag();
                let child_ctx = ctx.with_slice(slice);

                match conn.do_request(&child_ctx, attempt_req).await {
                    Ok(resp) => {
                        let status = resp.status_code();
                        if status < 300 {
                            return Ok(resp);
                        }
                        if status == 503 && ctx.follows_leader_redirect() {
                            if let Some(location) = resp.header("location") {
                                if let Some(leader) = self.find_by_url(location).await {
                                    debug!(location, "following leader redirect");
                                    let redirect_ctx = ctx.with_slice(slice);
                                    return leader.do_request(&redirect_ctx, req.clone_for_retry()).await;
                                }
                            }
                            if resp.header("x-no-leader").is_some() {
                                last_err = Some(Report::new(ClientError::NoLeader));
                                tokio::time::sleep(backoff).await;
                                backoff = next_backoff(backoff);
                                continue;
                            }
                        }
                        if ClientError::is_transient_status(status) {
                            warn!(attempt, status, "candidate endpoint returned a transient status, trying next");
                            last_err = Some(Report::new(ClientError::UnexpectedStatus {
                                status,
                                body: truncate_body(resp.raw_body(), 256),
                            }));
                            tokio::time::sleep(backoff).await;
                            backoff = next_backoff(backoff);
                            continue;
                        }
                        // Permanent 4xx (or anything unmapped): hand the
                        // response back as-is so the caller's own
                        // `check_status` reports it (spec §4.4 step 5).
                        return Ok(resp);
                    }
                    Err(report) => {
                        if written_flag.load(Ordering::Acquire) {
                            return Err(report.change_context(ClientError::ResponseError(
                                "request bytes were already sent when the failure occurred".into(),
                            )));
                        }
                        if is_permanent(&report) {
                            return Err(report);
                        }
                        warn!(attempt, "candidate endpoint failed, trying next");
                        last_err = Some(report);
                        tokio::time::sleep(backoff).await;
                        backoff = next_backoff(backoff);
                    }
                }
            }

            if !pass_all_transient || ctx.deadline_passed() || ctx.is_canceled() {
                break;
            }
            warn!("cluster router pass came back all-transient, retrying whole candidate window");
        }

        match last_err {
            Some(report) => Err(report.change_context(ClientError::AllServersFailed(candidate_count))),
            None => Err(Report::new(ClientError::AllServersFailed(candidate_count))),
        }
    }

    fn new_request(&self, method: &str, path: &str) -> Result<Request> {
        Request::new(method, path)
    }

    fn endpoints(&self) -> Vec<String> {
        self.pool.read().iter().map(|e| e.url.clone()).collect()
    }

    async fn update_endpoints(&self, endpoints: Vec<String>) -> Result<()> {
        let mut pool = self.pool.write();
        let mut next = Vec::with_capacity(endpoints.len());
        for url in &endpoints {
            if let Some(existing) = pool.iter().find(|e| &e.url == url) {
                next.push(Entry { url: existing.url.clone(), conn: existing.conn.clone() });
            } else {
                let conn = (self.factory)(url)?;
                next.push(Entry { url: url.clone(), conn });
            }
        }
        if next.is_empty() {
            return Err(Report::new(ClientError::InvalidArgument("refusing to replace the pool with an empty endpoint set".into())));
        }
        *pool = next;
        self.current.store(0, Ordering::Relaxed);
        Ok(())
    }

    fn protocols(&self) -> ContentType {
        self.content_type
    }
}

fn next_backoff(current: Duration) -> Duration {
    let scaled = current.mul_f64(BACKOFF_FACTOR);
    scaled.min(BACKOFF_CAP)
}

fn is_permanent(report: &Report<ClientError>) -> bool {
    matches!(
        report.current_context(),
        ClientError::Unauthorized
            | ClientError::Forbidden
            | ClientError::NotFound
            | ClientError::Conflict
            | ClientError::PreconditionFailed
            | ClientError::InvalidArgument(_)
            | ClientError::Serialization(_)
    )
}
