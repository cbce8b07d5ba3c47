//! Concrete end-to-end scenarios exercised against the public API,
//! using hand-written mock `Connection`s rather than a live server.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use error_stack::Report;
use tokio::sync::Mutex as AsyncMutex;

use quarrydb_client::{
    job_from_response, AgencyRacer, AsyncMode, ClientError, ClusterConnection, Connection, Cursor, ErrorClassifiers,
    RaceMode, Request, RequestContext, RequestOptions, Response, Result,
};
use quarrydb_client::cluster::ConnectionFactory;

fn ok(body: serde_json::Value) -> Response {
    Response::new(200, Default::default(), serde_json::to_vec(&body).unwrap().into(), "application/json")
}

struct ScriptedConnection {
    url: String,
    script: AsyncMutex<Vec<Result<Response>>>,
    calls: AtomicUsize,
}

impl ScriptedConnection {
    fn new(url: &str, script: Vec<Result<Response>>) -> Arc<Self> {
        Arc::new(Self { url: url.into(), script: AsyncMutex::new(script), calls: AtomicUsize::new(0) })
    }
}

#[async_trait]
impl Connection for ScriptedConnection {
    async fn do_request(&self, _ctx: &RequestContext, _req: Request) -> Result<Response> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script.lock().await;
        if script.is_empty() {
            return Ok(ok(serde_json::json!({})));
        }
        script.remove(0)
    }

    fn endpoints(&self) -> Vec<String> {
        vec![self.url.clone()]
    }

    async fn update_endpoints(&self, _endpoints: Vec<String>) -> Result<()> {
        Ok(())
    }

    fn protocols(&self) -> quarrydb_client::ContentType {
        quarrydb_client::ContentType::Json
    }
}

fn no_factory() -> ConnectionFactory {
    Arc::new(|_url| Err(Report::new(ClientError::InvalidArgument("pool grows only via update_endpoints".into()))))
}

// 1. Failover chooses second endpoint.
#[tokio::test]
async fn failover_chooses_second_endpoint() {
    let a = ScriptedConnection::new("http://a", vec![Err(Report::new(ClientError::Transport("connection refused".into())))]);
    let b = ScriptedConnection::new("http://b", vec![Ok(ok(serde_json::json!({"version": "1.2.3"})))]);

    let router = ClusterConnection::new(vec![a.clone(), b.clone()], no_factory()).unwrap();
    let req = Request::new("GET", "/_api/version").unwrap();
    let resp = router.do_request(&RequestContext::new(), req).await.unwrap();

    let version: String = resp.parse_body("version").unwrap();
    assert_eq!(version, "1.2.3");
    assert_eq!(a.calls.load(Ordering::SeqCst), 1);
    assert_eq!(b.calls.load(Ordering::SeqCst), 1);
}

// 2. Agency race first-wins: x wins with a leader body, y and z never
// determine the outcome (y fails fast but is not decisive, z is too slow).
#[tokio::test]
async fn agency_race_first_wins() {
    let x = Arc::new(DelayedPeer {
        delay: Duration::from_millis(5),
        result: AsyncMutex::new(Some(Ok(ok(serde_json::json!({"mode": "leader"}))))),
        calls: AtomicUsize::new(0),
    });
    let y = Arc::new(DelayedPeer {
        delay: Duration::from_millis(1),
        result: AsyncMutex::new(Some(Ok(Response::new(503, Default::default(), b"{}"[..].into(), "application/json")))),
        calls: AtomicUsize::new(0),
    });
    let z = Arc::new(DelayedPeer {
        delay: Duration::from_millis(200),
        result: AsyncMutex::new(Some(Ok(ok(serde_json::json!({"mode": "leader"}))))),
        calls: AtomicUsize::new(0),
    });

    let racer = AgencyRacer::new(vec![x.clone(), y.clone(), z.clone()]).unwrap();
    let req = Request::new("GET", "/_api/agency/read").unwrap();

    let result = tokio::time::timeout(Duration::from_secs(1), racer.race(&RequestContext::new(), req, RaceMode::Parallel))
        .await
        .expect("race resolves once x answers");

    let resp = result.unwrap();
    let mode: String = resp.parse_body("mode").unwrap();
    assert_eq!(mode, "leader");
}

struct DelayedPeer {
    delay: Duration,
    result: AsyncMutex<Option<Result<Response>>>,
    calls: AtomicUsize,
}

#[async_trait]
impl Connection for DelayedPeer {
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

    fn protocols(&self) -> quarrydb_client::ContentType {
        quarrydb_client::ContentType::Json
    }
}

// 3. Cursor streams two batches.
#[tokio::test]
async fn cursor_streams_two_batches_then_closes() {
    let open_body = serde_json::json!({"id": "c1", "result": [1, 2], "hasMore": true});
    let next_body = serde_json::json!({"result": [3], "hasMore": false});

    let backend = ScriptedConnection::new(
        "http://node-1:8629",
        vec![
            Ok(Response::new(201, Default::default(), serde_json::to_vec(&open_body).unwrap().into(), "application/json")),
            Ok(ok(next_body)),
            Ok(Response::new(202, Default::default(), b"{}"[..].into(), "application/json")),
        ],
    );

    let cursor: Cursor<i64> = Cursor::open(
        "mydb",
        "http://node-1:8629".into(),
        backend.clone(),
        "FOR i IN 1..3 RETURN i",
        &BTreeMap::new(),
        &Default::default(),
    )
    .await
    .unwrap();

    assert_eq!(cursor.read_document().await.unwrap(), 1);
    assert_eq!(cursor.read_document().await.unwrap(), 2);
    assert_eq!(cursor.read_document().await.unwrap(), 3);
    assert!(cursor.read_document().await.unwrap_err().is_no_more_documents());

    cursor.close().await.unwrap();
    // open + one re-fetch + one close == 3 calls.
    assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
}

// 4. Deadline divided across candidates: with a 3-candidate pool and a 3s
// caller deadline, each attempt gets roughly a 1s slice. We can't observe
// the slice directly through the public API, so we assert the proxy the
// router actually implements: `ctx.remaining() / candidate_count`.
#[test]
fn deadline_divides_evenly_across_candidates() {
    let ctx = RequestContext::new().with_timeout(Duration::from_secs(3));
    let candidates = 3u32;
    let slice = ctx.remaining().checked_div(candidates).unwrap();
    assert!(slice <= Duration::from_millis(1050));
    assert!(slice >= Duration::from_millis(950));
}

// 5. Written-after-failure surfaces as ResponseError.
#[tokio::test]
async fn written_after_failure_surfaces_as_response_error() {
    let a = ScriptedConnection::new("http://a", vec![Err(Report::new(ClientError::Transport("connection dropped mid-response".into())))]);
    let b = ScriptedConnection::new("http://b", vec![Ok(ok(serde_json::json!({})))]);

    let router = ClusterConnection::new(vec![a.clone(), b.clone()], no_factory()).unwrap();
    let req = Request::new("POST", "/_api/document/col").unwrap();
    req.mark_written();

    let result = router.do_request(&RequestContext::new(), req).await;
    assert!(result.as_ref().unwrap_err().is_response_error());
    assert_eq!(b.calls.load(Ordering::SeqCst), 0, "router must not retry once bytes were already on the wire");
}

// 6. Async store mode: the caller observes the x-quarry-async header on
// the outbound request, receives a job handle from the 202's
// x-quarry-async-id header, and can poll it to completion. (This crate
// surfaces the job id via `job_from_response`'s `Option<AsyncJob>` rather
// than through the error channel — see DESIGN.md's "Async job id
// delivery" entry for why.)
#[tokio::test]
async fn async_store_mode_round_trips_through_a_job_handle() {
    struct RecordingAsyncBackend {
        seen_header: AsyncMutex<Option<String>>,
        script: AsyncMutex<Vec<Response>>,
    }

    #[async_trait]
    impl Connection for RecordingAsyncBackend {
        async fn do_request(&self, _ctx: &RequestContext, req: Request) -> Result<Response> {
            *self.seen_header.lock().await = req.header("x-quarry-async").map(String::from);
            Ok(self.script.lock().await.remove(0))
        }
        fn endpoints(&self) -> Vec<String> {
            vec!["mock://one".into()]
        }
        async fn update_endpoints(&self, _endpoints: Vec<String>) -> Result<()> {
            Ok(())
        }
        fn protocols(&self) -> quarrydb_client::ContentType {
            quarrydb_client::ContentType::Json
        }
    }

    let mut accepted_headers = BTreeMap::new();
    accepted_headers.insert("x-quarry-async-id".to_string(), "job-9".to_string());

    let backend = Arc::new(RecordingAsyncBackend {
        seen_header: AsyncMutex::new(None),
        script: AsyncMutex::new(vec![
            Response::new(202, accepted_headers, b""[..].into(), "application/json"),
            Response::new(204, Default::default(), b""[..].into(), "application/json"),
            Response::new(200, Default::default(), serde_json::to_vec(&serde_json::json!({"version": "1.2.3"})).unwrap().into(), "application/json"),
        ]),
    });

    let mut req = Request::new("GET", "/_api/version").unwrap();
    let opts = RequestOptions { r#async: Some(AsyncMode::Store), ..Default::default() };
    opts.apply(&mut req, RequestContext::new()).unwrap();

    let accepted = backend.do_request(&RequestContext::new(), req).await.unwrap();
    assert_eq!(*backend.seen_header.lock().await, Some("store".to_string()));
    assert_eq!(accepted.status_code(), 202);

    let job = job_from_response(&accepted, backend.clone()).expect("202 carries a job id");
    assert_eq!(job.id(), "job-9");

    let pending = job.result().await;
    assert!(pending.unwrap_err().is_async_job_pending());

    let done = job.result().await.unwrap();
    let version: String = done.parse_body("version").unwrap();
    assert_eq!(version, "1.2.3");
}
