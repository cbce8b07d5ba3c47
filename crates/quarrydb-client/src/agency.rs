//! Agency racer (spec §4.5 "C5: Agency racer").
//!
//! The agency is a small odd-sized quorum of equivalent peers (no leader
//! concept, unlike the cluster router's coordinators). A request is fanned
//! out to every peer in parallel; the first response that is either a
//! success or a permanent 4xx wins and every other in-flight attempt is
//! canceled. When the caller asked to capture the raw response or wants
//! the parsed response back (`RequestOptions::response`/`raw_response`),
//! fan-out degrades to serial, first-to-answer order, because only one
//! peer's bytes can be threaded back through those slots.
//!
//! Grounded on `llm/routing.rs`'s multi-backend fan-out (try candidates,
//! keep the first usable result, record per-candidate outcome) combined
//! with a cooperative-cancellation race, analogous to the "shared slot
//! written at most once" idiom used for circuit-breaker state transitions
//! in `circuit_breaker/state.rs`.

use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use tracing::{instrument, warn};

use crate::context::{RequestContext, AGENCY_TIMEOUT_FLOOR};
use crate::error::{ClientError, Result};
use crate::request::Request;
use crate::response::Response;
use crate::transport::Connection;

/// Whether the racer may run peers concurrently or must answer in the
/// order attempted, capturing the winner's raw bytes as it goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaceMode {
    Parallel,
    Serial,
}

const BACKOFF_INITIAL: Duration = Duration::from_millis(1);
const BACKOFF_FACTOR: f64 = 1.5;
const BACKOFF_CAP: Duration = Duration::from_secs(2);

fn next_backoff(current: Duration) -> Duration {
    current.mul_f64(BACKOFF_FACTOR).min(BACKOFF_CAP)
}

pub struct AgencyRacer {
    peers: Vec<Arc<dyn Connection>>,
    timeout_floor: Duration,
}

impl AgencyRacer {
    pub fn new(peers: Vec<Arc<dyn Connection>>) -> Result<Self> {
        if peers.is_empty() {
            return Err(Report::new(ClientError::InvalidArgument("agency racer requires at least one peer".into())));
        }
        Ok(Self { peers, timeout_floor: AGENCY_TIMEOUT_FLOOR })
    }

    /// Overrides the per-peer timeout floor (defaults to
    /// [`AGENCY_TIMEOUT_FLOOR`]), e.g. from a
    /// [`crate::config::ClientConfig`]'s `agency_timeout_floor_secs`.
    pub fn with_timeout_floor(mut self, floor: Duration) -> Self {
        self.timeout_floor = floor;
        self
    }

    fn per_attempt_timeout(&self, ctx: &RequestContext) -> Duration {
        let share = ctx.remaining() / 3;
        share.max(self.timeout_floor)
    }

    /// Fan out `req` to every peer and return the first authoritative
    /// answer. If an entire pass comes back all-transient (spec §4.5:
    /// "If all peers return transient failures, sleep backoff ... and
    /// retry the whole fan-out until the caller's deadline expires"), the
    /// whole fan-out is retried with the same growing backoff the cluster
    /// router uses, until `ctx`'s deadline passes.
    #[instrument(skip(self, ctx, req), fields(peers = self.peers.len(), path = %req.path()))]
    pub async fn race(&self, ctx: &RequestContext, req: Request, mode: RaceMode) -> Result<Response> {
        let mut backoff = BACKOFF_INITIAL;
        loop {
            let outcome = match mode {
                RaceMode::Serial => self.race_serial(ctx, &req).await,
                RaceMode::Parallel => self.race_parallel(ctx, &req).await,
            };
            match outcome {
                RaceOutcome::Resolved(result) => return result,
                RaceOutcome::AllTransient(report) => {
                    if ctx.deadline_passed() || ctx.is_canceled() {
                        return Err(report);
                    }
                    warn!("agency fan-out came back all-transient, retrying whole race");
                    tokio::time::sleep(backoff).await;
                    backoff = next_backoff(backoff);
                }
            }
        }
    }

    async fn race_serial(&self, ctx: &RequestContext, req: &Request) -> RaceOutcome {
        let timeout = self.per_attempt_timeout(ctx);
        let mut last_err = None;

        for peer in &self.peers {
            let attempt_ctx = ctx.with_slice(timeout);
            match peer.do_request(&attempt_ctx, req.clone_for_retry()).await {
                Ok(resp) if resp.status_code() < 300 || !ClientError::is_transient_status(resp.status_code()) => {
                    return RaceOutcome::Resolved(Ok(resp));
                }
                Ok(resp) => {
                    last_err = Some(Report::new(ClientError::UnexpectedStatus {
                        status: resp.status_code(),
                        body: crate::error::truncate_body(resp.raw_body(), 256),
                    }));
                }
                Err(report) if is_decisive(&report) => return RaceOutcome::Resolved(Err(report)),
                Err(report) => last_err = Some(report),
            }
        }

        RaceOutcome::AllTransient(last_err.unwrap_or_else(|| Report::new(ClientError::AllServersFailed(self.peers.len()))))
    }

    async fn race_parallel(&self, ctx: &RequestContext, req: &Request) -> RaceOutcome {
        let timeout = self.per_attempt_timeout(ctx);
        let (tx, mut rx) = tokio::sync::mpsc::channel(self.peers.len().max(1));

        let mut handles = Vec::with_capacity(self.peers.len());
        for peer in self.peers.iter().cloned() {
            let attempt_ctx = ctx.with_slice(timeout);
            let attempt_req = req.clone_for_retry();
            let tx = tx.clone();
            handles.push(tokio::spawn(async move {
                let result = peer.do_request(&attempt_ctx, attempt_req).await;
                let _ = tx.send(result).await;
            }));
        }
        drop(tx);

        let mut last_err = None;
        let mut replies = 0usize;
        while let Some(result) = rx.recv().await {
            replies += 1;
            match result {
                Ok(resp) if resp.status_code() < 300 || !ClientError::is_transient_status(resp.status_code()) => {
                    for handle in &handles {
                        handle.abort();
                    }
                    return RaceOutcome::Resolved(Ok(resp));
                }
                Ok(resp) => {
                    warn!(replies, status = resp.status_code(), "agency peer responded with a transient status");
                    last_err = Some(Report::new(ClientError::UnexpectedStatus {
                        status: resp.status_code(),
                        body: crate::error::truncate_body(resp.raw_body(), 256),
                    }));
                }
                Err(report) if is_decisive(&report) => {
                    for handle in &handles {
                        handle.abort();
                    }
                    return RaceOutcome::Resolved(Err(report));
                }
                Err(report) => {
                    warn!(replies, "agency peer responded with a transient failure");
                    last_err = Some(report);
                }
            }
            if replies == self.peers.len() {
                break;
            }
        }

        RaceOutcome::AllTransient(last_err.unwrap_or_else(|| Report::new(ClientError::AllServersFailed(self.peers.len()))))
    }
}

/// The outcome of one fan-out pass: either a final answer (success or a
/// decisive/permanent error), or "every peer came back transient" — which
/// the caller retries as a whole (spec §4.5).
enum RaceOutcome {
    Resolved(Result<Response>),
    AllTransient(Report<ClientError>),
}

/// A result that should stop the race immediately rather than waiting on
/// the remaining peers: permanent 4xx classes. Transient failures keep
/// the race open for a slower-but-successful peer.
fn is_decisive(report: &Report<ClientError>) -> bool {
    matches!(
        report.current_context(),
        ClientError::Unauthorized | ClientError::Forbidden | ClientError::Conflict | ClientError::PreconditionFailed
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex as AsyncMutex;
    use tokio::time::Duration as TokioDuration;

    use crate::codec::ContentType;

    struct DelayedConnection {
        delay: TokioDuration,
        result: AsyncMutex<Option<Result<Response>>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Connection for DelayedConnection {
        async fn do_request(&self, _ctx: &RequestContext, _req: Request) -> Result<Response> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.result.lock().await.take().expect("single-use scripted result")
        }

        fn endpoints(&self) -> Vec<String> {
            vec!["mock://agency-peer".into()]
        }

        async fn update_endpoints(&self, _endpoints: Vec<String>) -> Result<()> {
            Ok(())
        }

        fn protocols(&self) -> ContentType {
            ContentType::Json
        }
    }

    fn ok_response() -> Response {
        Response::new(200, Default::default(), b"{}"[..].into(), "application/json")
    }

    #[test]
    fn with_timeout_floor_overrides_the_default() {
        let peer = Arc::new(DelayedConnection {
            delay: TokioDuration::from_millis(0),
            result: AsyncMutex::new(None),
            calls: AtomicUsize::new(0),
        });
        let racer = AgencyRacer::new(vec![peer]).unwrap().with_timeout_floor(Duration::from_secs(9));
        let ctx = RequestContext::new().with_timeout(Duration::from_millis(1));
        assert_eq!(racer.per_attempt_timeout(&ctx), Duration::from_secs(9));
    }

    #[tokio::test(start_paused = true)]
    async fn fastest_peer_wins_and_cancels_the_rest() {
        let fast = Arc::new(DelayedConnection {
            delay: TokioDuration::from_millis(10),
            result: AsyncMutex::new(Some(Ok(ok_response()))),
            calls: AtomicUsize::new(0),
        });
        let slow = Arc::new(DelayedConnection {
            delay: TokioDuration::from_secs(5),
            result: AsyncMutex::new(Some(Ok(ok_response()))),
            calls: AtomicUsize::new(0),
        });

        let racer = AgencyRacer::new(vec![fast.clone(), slow.clone()]).unwrap();
        let req = Request::new("GET", "/_api/agency/read").unwrap();

        let result = tokio::time::timeout(
            TokioDuration::from_secs(1),
            racer.race(&RequestContext::new(), req, RaceMode::Parallel),
        )
        .await
        .expect("race should resolve once the fast peer answers");

        assert!(result.unwrap().check_status(&[200]).is_ok());
        assert_eq!(fast.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn serial_mode_tries_peers_in_order() {
        let first = Arc::new(DelayedConnection {
            delay: TokioDuration::from_millis(1),
            result: AsyncMutex::new(Some(Err(Report::new(ClientError::Transport("unreachable".into()))))),
            calls: AtomicUsize::new(0),
        });
        let second = Arc::new(DelayedConnection {
            delay: TokioDuration::from_millis(1),
            result: AsyncMutex::new(Some(Ok(ok_response()))),
            calls: AtomicUsize::new(0),
        });

        let racer = AgencyRacer::new(vec![first.clone(), second.clone()]).unwrap();
        let req = Request::new("GET", "/_api/agency/read").unwrap();
        let result = racer.race(&RequestContext::new(), req, RaceMode::Serial).await;

        assert!(result.is_ok());
        assert_eq!(first.calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_status_response_does_not_win_the_race() {
        let flaky = Arc::new(DelayedConnection {
            delay: TokioDuration::from_millis(1),
            result: AsyncMutex::new(Some(Ok(Response::new(503, Default::default(), b"{}"[..].into(), "application/json")))),
            calls: AtomicUsize::new(0),
        });
        let healthy = Arc::new(DelayedConnection {
            delay: TokioDuration::from_millis(5),
            result: AsyncMutex::new(Some(Ok(ok_response()))),
            calls: AtomicUsize::new(0),
        });

        let racer = AgencyRacer::new(vec![flaky.clone(), healthy.clone()]).unwrap();
        let req = Request::new("GET", "/_api/agency/read").unwrap();
        let result = racer.race(&RequestContext::new(), req, RaceMode::Parallel).await;

        assert_eq!(result.unwrap().status_code(), 200);
    }

    /// A peer whose scripted results are consumed one per call, so the
    /// same peer can fail transiently on the first fan-out pass and
    /// succeed on a later retried pass.
    struct ScriptedPeer {
        script: AsyncMutex<Vec<Result<Response>>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Connection for ScriptedPeer {
        async fn do_request(&self, _ctx: &RequestContext, _req: Request) -> Result<Response> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script.lock().await.remove(0)
        }

        fn endpoints(&self) -> Vec<String> {
            vec!["mock://scripted-peer".into()]
        }

        async fn update_endpoints(&self, _endpoints: Vec<String>) -> Result<()> {
            Ok(())
        }

        fn protocols(&self) -> ContentType {
            ContentType::Json
        }
    }

    #[tokio::test]
    async fn all_transient_pass_retries_the_whole_fan_out() {
        let peer = Arc::new(ScriptedPeer {
            script: AsyncMutex::new(vec![
                Ok(Response::new(503, Default::default(), b"{}"[..].into(), "application/json")),
                Ok(ok_response()),
            ]),
            calls: AtomicUsize::new(0),
        });

        let racer = AgencyRacer::new(vec![peer.clone()]).unwrap();
        let req = Request::new("GET", "/_api/agency/read").unwrap();
        let result = tokio::time::timeout(
            TokioDuration::from_secs(1),
            racer.race(&RequestContext::new(), req, RaceMode::Parallel),
        )
        .await
        .expect("retried fan-out should resolve well within the deadline");

        assert_eq!(result.unwrap().status_code(), 200);
        assert_eq!(peer.calls.load(Ordering::SeqCst), 2, "first pass transient, second pass succeeds");
    }

    #[tokio::test]
    async fn all_transient_pass_gives_up_once_the_deadline_has_passed() {
        let peer = Arc::new(ScriptedPeer {
            script: AsyncMutex::new(vec![Ok(Response::new(
                503,
                Default::default(),
                b"{}"[..].into(),
                "application/json",
            ))]),
            calls: AtomicUsize::new(0),
        });

        let racer = AgencyRacer::new(vec![peer.clone()]).unwrap();
        let req = Request::new("GET", "/_api/agency/read").unwrap();
        let ctx = RequestContext::new().with_timeout(TokioDuration::from_millis(1));
        tokio::time::sleep(TokioDuration::from_millis(5)).await;

        let result = racer.race(&ctx, req, RaceMode::Parallel).await;
        assert!(result.is_err());
        assert_eq!(peer.calls.load(Ordering::SeqCst), 1, "must not retry once the deadline has already passed");
    }
}
