//! Async-job dispatcher (spec §4.10 "C10: Async jobs").
//!
//! Two modes, both triggered by [`crate::options::AsyncMode`]:
//! fire-and-forget (`x-quarry-async: true`, server never gives the
//! client anything to wait on) and store-and-poll (`x-quarry-async:
//! store`, server replies `202` with `x-quarry-async-id`, and the result
//! is fetched later by id). A pending job is surfaced to the caller as
//! `ClientError::AsyncJobPending` rather than silently blocking.

use std::sync::Arc;

use error_stack::Report;
use tracing::instrument;

use crate::context::RequestContext;
use crate::error::{ClientError, Result};
use crate::response::Response;
use crate::transport::Connection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Done,
}

/// Handle to a store-mode async job. Cheap to clone; all instances share
/// the same server-side job id.
#[derive(Clone)]
pub struct AsyncJob {
    id: String,
    conn: Arc<dyn Connection>,
}

impl AsyncJob {
    pub(crate) fn new(id: String, conn: Arc<dyn Connection>) -> Self {
        Self { id, conn }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Poll the job's current status without consuming its result.
    #[instrument(skip(self))]
    pub async fn status(&self) -> Result<JobStatus> {
        let req = self.conn.new_request("GET", &format!("/_api/job/{}", self.id))?;
        let ctx = RequestContext::new();
        let resp = self.conn.do_request(&ctx, req).await?;
        match resp.status_code() {
            204 => Ok(JobStatus::Pending),
            200 => Ok(JobStatus::Done),
            other => {
                resp.check_status(&[200, 204])?;
                Err(Report::new(ClientError::UnexpectedStatus { status: other, body: String::new() }))
            }
        }
    }

    /// Fetch the job's stored result. Fails with `AsyncJobPending` if the
    /// job has not completed yet; the caller should poll `status()` or
    /// retry this call.
    #[instrument(skip(self))]
    pub async fn result(&self) -> Result<Response> {
        let req = self.conn.new_request("PUT", &format!("/_api/job/{}", self.id))?;
        let ctx = RequestContext::new();
        let resp = self.conn.do_request(&ctx, req).await?;
        if resp.status_code() == 204 {
            return Err(Report::new(ClientError::AsyncJobPending(self.id.clone())));
        }
        Ok(resp)
    }

    /// Cancel a pending job on the server.
    #[instrument(skip(self))]
    pub async fn cancel(&self) -> Result<()> {
        let req = self.conn.new_request("PUT", &format!("/_api/job/{}/cancel", self.id))?;
        let ctx = RequestContext::new();
        let resp = self.conn.do_request(&ctx, req).await?;
        resp.check_status(&[200])?;
        Ok(())
    }

    /// List job ids in the given bucket (`done` or `pending`) on one
    /// connection.
    #[instrument(skip(conn))]
    pub async fn list(conn: Arc<dyn Connection>, bucket: JobStatus) -> Result<Vec<String>> {
        let path = match bucket {
            JobStatus::Done => "/_api/job/done",
            JobStatus::Pending => "/_api/job/pending",
        };
        let req = conn.new_request("GET", path)?;
        let ctx = RequestContext::new();
        let resp = conn.do_request(&ctx, req).await?;
        resp.check_status(&[200])?;
        resp.parse_body("")
    }
}

/// Extract the async job id a store-mode request's response carries, per
/// the `x-quarry-async-id` header (spec §4.6.3 / §4.10).
pub fn job_from_response(response: &Response, conn: Arc<dyn Connection>) -> Option<AsyncJob> {
    response.header("x-quarry-async-id").map(|id| AsyncJob::new(id.to_string(), conn))
}
