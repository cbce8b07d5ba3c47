//! Cursor engine (spec §4.7 "C7: Cursor").
//!
//! A cursor owns one in-memory batch plus a read index into it. Once the
//! batch is exhausted, a follow-up fetch is issued against the *same*
//! endpoint that produced the cursor (endpoint affinity) rather than
//! going back through the failover router — continuing a server-side
//! cursor on a different node would just 404. `close()` is idempotent and
//! single-shot, guarded the same way the authenticator's handshake is
//! (atomic flag + async mutex, spec §4.3's "prepared" pattern reused
//! here for "closed").

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use error_stack::Report;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tracing::instrument;

use crate::context::RequestContext;
use crate::error::{ClientError, Result};
use crate::query::QueryOptions;
use crate::request::Request;
use crate::transport::Connection;

#[derive(Debug, Clone, Default)]
pub struct CursorStats {
    pub full_count: Option<u64>,
    pub scanned_full: Option<u64>,
    pub scanned_index: Option<u64>,
    pub filtered: Option<u64>,
    pub execution_time_secs: Option<f64>,
}

/// A server-side query cursor. Pinned to the endpoint that created it.
pub struct Cursor<T> {
    id: Option<String>,
    endpoint: String,
    conn: Arc<dyn Connection>,
    batch: AsyncMutex<Vec<T>>,
    read_index: AsyncMutex<usize>,
    has_more: AtomicBool,
    count: Option<u64>,
    stats: CursorStats,
    closed: AtomicBool,
    close_lock: AsyncMutex<()>,
    /// Dirty-read flag that governs the document the *next* call to
    /// `read_document` returns (spec §9 open question, resolved: the
    /// server only tells us about a dirty read on the batch fetch that
    /// contains it, by which point that batch's documents have already
    /// started being handed back, so the earliest we can honor the flag
    /// is the following read).
    dirty_read: AtomicBool,
    /// Flag observed on the most recent batch fetch, not yet promoted
    /// into `dirty_read` (that happens at the start of the next call).
    staged_dirty_read: AtomicBool,
}

/// Decode a raw JSON array into `Vec<T>`, mapping a `null` element to
/// `T::default()` instead of failing (spec §4.7: "If the result at
/// position `i` is a JSON null, `out` is set to its zero value but no
/// error is raised").
fn decode_batch<T: DeserializeOwned + Default>(raw: &[Value]) -> Result<Vec<T>> {
    raw.iter()
        .map(|item| {
            if item.is_null() {
                Ok(T::default())
            } else {
                serde_json::from_value(item.clone()).map_err(|e| Report::new(ClientError::Serialization(e)))
            }
        })
        .collect()
}

impl<T: DeserializeOwned + Default + Clone + Send + Sync + 'static> Cursor<T> {
    pub fn from_first_batch(
        id: Option<String>,
        endpoint: String,
        conn: Arc<dyn Connection>,
        batch: Vec<T>,
        has_more: bool,
        count: Option<u64>,
        stats: CursorStats,
        dirty_read: bool,
    ) -> Self {
        Self {
            id,
            endpoint,
            conn,
            batch: AsyncMutex::new(batch),
            read_index: AsyncMutex::new(0),
            has_more: AtomicBool::new(has_more),
            count,
            stats,
            closed: AtomicBool::new(false),
            close_lock: AsyncMutex::new(()),
            dirty_read: AtomicBool::new(dirty_read),
            staged_dirty_read: AtomicBool::new(dirty_read),
        }
    }

    /// Open a new cursor: `POST` the query submission body (spec §6.5)
    /// and decode the initial batch. `endpoint` is the single endpoint
    /// this cursor is pinned to for the rest of its life (spec §4.7's
    /// endpoint-affinity invariant) — picking it is the out-of-scope
    /// typed `Database::query()` surface's job; by the time `open` is
    /// called the choice has already been made, so `conn` here is
    /// expected to be a connection bound to exactly that endpoint (a
    /// single-endpoint transport, or a router already pinned via
    /// `RequestContext::pinned_to`).
    #[instrument(skip(conn, bind_vars, query_options), fields(db = db))]
    pub async fn open(
        db: &str,
        endpoint: String,
        conn: Arc<dyn Connection>,
        query: &str,
        bind_vars: &BTreeMap<String, Value>,
        query_options: &QueryOptions,
    ) -> Result<Self> {
        let path = Request::db_path(db, "_api/cursor");
        let mut req = conn.new_request("POST", &path)?;
        req.set_body(&query_options.build_body(query, bind_vars))?;

        let ctx = RequestContext::new().pinned_to(endpoint.clone());
        let resp = conn.do_request(&ctx, req).await?;
        resp.check_status(&[200, 201])?;

        let body: Value = resp.parse_body("")?;
        let id = body.get("id").and_then(Value::as_str).map(String::from);
        let raw_items = body.get("result").and_then(Value::as_array).cloned().unwrap_or_default();
        let items: Vec<T> = decode_batch(&raw_items)?;
        let has_more = body.get("hasMore").and_then(Value::as_bool).unwrap_or(false);
        let count = body.get("count").and_then(Value::as_u64);

        let stats_obj = body.get("extra").and_then(|e| e.get("stats"));
        let stats = CursorStats {
            full_count: stats_obj.and_then(|s| s.get("fullCount")).and_then(Value::as_u64),
            scanned_full: stats_obj.and_then(|s| s.get("scannedFull")).and_then(Value::as_u64),
            scanned_index: stats_obj.and_then(|s| s.get("scannedIndex")).and_then(Value::as_u64),
            filtered: stats_obj.and_then(|s| s.get("filtered")).and_then(Value::as_u64),
            execution_time_secs: stats_obj.and_then(|s| s.get("executionTime")).and_then(Value::as_f64),
        };
        let dirty = resp.header("x-quarry-dirty-read").is_some();

        Ok(Self::from_first_batch(id, endpoint, conn, items, has_more, count, stats, dirty))
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn count(&self) -> Option<u64> {
        self.count
    }

    pub fn stats(&self) -> &CursorStats {
        &self.stats
    }

    pub fn has_more(&self) -> bool {
        self.has_more.load(Ordering::Acquire)
    }

    /// Whether the document just returned by `read_document` was read
    /// from a follower that may not have observed the latest write (spec
    /// §4.6 `allow_dirty_reads` relay semantics).
    pub fn last_read_was_dirty(&self) -> bool {
        self.dirty_read.load(Ordering::Acquire)
    }

    /// Read the next document out of the in-memory batch, fetching the
    /// next server-side batch first if the current one is exhausted.
    /// Fails with `NoMoreDocuments` once `has_more` is false and the
    /// batch is drained.
    #[instrument(skip(self), fields(cursor_id = self.id.as_deref().unwrap_or("")))]
    pub async fn read_document(&self) -> Result<T> {
        // Promote whatever the previous call's batch fetch staged. This
        // read, not the one that triggered that fetch, is the first to
        // observe it.
        self.dirty_read.store(self.staged_dirty_read.load(Ordering::Acquire), Ordering::Release);

        {
            let batch = self.batch.lock().await;
            let mut index = self.read_index.lock().await;
            if *index < batch.len() {
                let item = batch[*index].clone();
                *index += 1;
                return Ok(item);
            }
        }

        if !self.has_more() {
            return Err(Report::new(ClientError::NoMoreDocuments));
        }

        self.fetch_next_batch().await?;

        let batch = self.batch.lock().await;
        let mut index = self.read_index.lock().await;
        if *index < batch.len() {
            let item = batch[*index].clone();
            *index += 1;
            Ok(item)
        } else {
            Err(Report::new(ClientError::NoMoreDocuments))
        }
    }

    async fn fetch_next_batch(&self) -> Result<()> {
        let id = self
            .id
            .as_ref()
            .ok_or_else(|| Report::new(ClientError::NoMoreDocuments))?;

        let req = self.conn.new_request("PUT", &format!("/_api/cursor/{id}"))?;
        let ctx = RequestContext::new().pinned_to(self.endpoint.clone());
        let resp = self.conn.do_request(&ctx, req).await?;
        resp.check_status(&[200])?;

        let raw_items: Vec<Value> = resp.parse_body("result").unwrap_or_default();
        let items: Vec<T> = decode_batch(&raw_items)?;
        let has_more: bool = resp.parse_body("hasMore").unwrap_or(false);
        let dirty = resp.header("x-quarry-dirty-read").is_some();

        self.has_more.store(has_more, Ordering::Release);
        self.staged_dirty_read.store(dirty, Ordering::Release);
        *self.batch.lock().await = items;
        *self.read_index.lock().await = 0;
        Ok(())
    }

    /// Close the cursor on the server, releasing its resources. Safe to
    /// call more than once or concurrently: only the first caller's close
    /// actually reaches the network, everyone else observes it as already
    /// done.
    pub async fn close(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        let _guard = self.close_lock.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }

        if let Some(id) = &self.id {
            let req: Request = self.conn.new_request("DELETE", &format!("/_api/cursor/{id}"))?;
            let ctx = RequestContext::new().pinned_to(self.endpoint.clone());
            match self.conn.do_request(&ctx, req).await {
                Ok(resp) => {
                    let _ = resp.check_status(&[200, 202, 404]);
                }
                Err(report) if matches!(report.current_context(), ClientError::NotFound) => {}
                Err(report) => return Err(report),
            }
        }

        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ContentType;
    use crate::response::Response;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Mutex as TMutex;

    struct ScriptedCursorBackend {
        calls: AtomicUsize,
        pages: TMutex<Vec<Response>>,
    }

    #[async_trait]
    impl Connection for ScriptedCursorBackend {
        async fn do_request(&self, _ctx: &RequestContext, _req: Request) -> Result<Response> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut pages = self.pages.lock().await;
            if pages.is_empty() {
                return Err(Report::new(ClientError::NoMoreDocuments));
            }
            Ok(pages.remove(0))
        }

        fn endpoints(&self) -> Vec<String> {
            vec!["http://node-1:8629".into()]
        }

        async fn update_endpoints(&self, _endpoints: Vec<String>) -> Result<()> {
            Ok(())
        }

        fn protocols(&self) -> ContentType {
            ContentType::Json
        }
    }

    fn page(result: serde_json::Value, has_more: bool) -> Response {
        let body = serde_json::json!({"result": result, "hasMore": has_more});
        Response::new(200, Default::default(), serde_json::to_vec(&body).unwrap().into(), "application/json")
    }

    #[tokio::test]
    async fn open_decodes_the_initial_batch_and_stats() {
        let open_body = serde_json::json!({
            "id": "cur-open-1",
            "result": [1, 2],
            "hasMore": true,
            "count": 3,
            "extra": {"stats": {"fullCount": 3, "scannedFull": 10, "executionTime": 0.002}},
        });
        let backend = Arc::new(ScriptedCursorBackend {
            calls: AtomicUsize::new(0),
            pages: TMutex::new(vec![Response::new(201, Default::default(), serde_json::to_vec(&open_body).unwrap().into(), "application/json")]),
        });

        let mut bind_vars = BTreeMap::new();
        bind_vars.insert("limit".to_string(), serde_json::json!(3));

        let cursor: Cursor<i64> = Cursor::open(
            "mydb",
            "http://node-1:8629".into(),
            backend.clone(),
            "FOR i IN 1..@limit RETURN i",
            &bind_vars,
            &QueryOptions::new(),
        )
        .await
        .unwrap();

        assert_eq!(cursor.id(), Some("cur-open-1"));
        assert_eq!(cursor.count(), Some(3));
        assert!(cursor.has_more());
        assert_eq!(cursor.stats().full_count, Some(3));
        assert_eq!(cursor.read_document().await.unwrap(), 1);
        assert_eq!(cursor.read_document().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn streams_across_two_batches() {
        let backend = Arc::new(ScriptedCursorBackend {
            calls: AtomicUsize::new(0),
            pages: TMutex::new(vec![page(serde_json::json!([3, 4]), false)]),
        });

        let cursor: Cursor<i64> = Cursor::from_first_batch(
            Some("cur-1".into()),
            "http://node-1:8629".into(),
            backend.clone(),
            vec![1, 2],
            true,
            Some(4),
            CursorStats::default(),
            false,
        );

        assert_eq!(cursor.read_document().await.unwrap(), 1);
        assert_eq!(cursor.read_document().await.unwrap(), 2);
        // Batch exhausted, has_more still true: fetches the next page.
        assert_eq!(cursor.read_document().await.unwrap(), 3);
        assert_eq!(cursor.read_document().await.unwrap(), 4);
        assert!(cursor.read_document().await.is_err());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn null_result_entries_decode_to_the_default_value_not_an_error() {
        let backend = Arc::new(ScriptedCursorBackend { calls: AtomicUsize::new(0), pages: TMutex::new(vec![]) });

        let cursor: Cursor<i64> = Cursor::from_first_batch(
            Some("cur-null".into()),
            "http://node-1:8629".into(),
            backend,
            vec![],
            false,
            None,
            CursorStats::default(),
            false,
        );
        let raw = vec![serde_json::json!(7), Value::Null, serde_json::json!(9)];
        let decoded: Vec<i64> = decode_batch(&raw).unwrap();
        assert_eq!(decoded, vec![7, 0, 9]);
        let _ = cursor;
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let backend = Arc::new(ScriptedCursorBackend {
            calls: AtomicUsize::new(0),
            pages: TMutex::new(vec![Response::new(200, Default::default(), b"{}"[..].into(), "application/json")]),
        });

        let cursor: Cursor<i64> = Cursor::from_first_batch(
            Some("cur-2".into()),
            "http://node-1:8629".into(),
            backend.clone(),
            vec![],
            false,
            None,
            CursorStats::default(),
            false,
        );

        cursor.close().await.unwrap();
        cursor.close().await.unwrap();
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dirty_read_flag_applies_to_next_read_not_current_one() {
        let mut dirty_page = page(serde_json::json!([20, 30]), false);
        dirty_page = Response::new(200, {
            let mut h = std::collections::BTreeMap::new();
            h.insert("x-quarry-dirty-read".to_string(), "true".to_string());
            h
        }, dirty_page.raw_body().clone(), "application/json");

        let backend = Arc::new(ScriptedCursorBackend {
            calls: AtomicUsize::new(0),
            pages: TMutex::new(vec![dirty_page]),
        });

        let cursor: Cursor<i64> = Cursor::from_first_batch(
            Some("cur-3".into()),
            "http://node-1:8629".into(),
            backend,
            vec![10],
            true,
            None,
            CursorStats::default(),
            false,
        );

        let first = cursor.read_document().await.unwrap();
        assert_eq!(first, 10);
        assert!(!cursor.last_read_was_dirty());

        // This read exhausts the first batch and triggers the fetch that
        // observes the dirty-read flag — but the flag must not taint the
        // document this very call returns.
        let second = cursor.read_document().await.unwrap();
        assert_eq!(second, 20);
        assert!(!cursor.last_read_was_dirty(), "the fetch-triggering read must not itself be marked dirty");

        // Only now, one read later, does the flag take effect — even
        // though this read is served from the already-fetched batch and
        // triggers no further network call.
        let third = cursor.read_document().await.unwrap();
        assert_eq!(third, 30);
        assert!(cursor.last_read_was_dirty());
    }
}
