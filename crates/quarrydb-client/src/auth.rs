//! Authenticator (spec §4.3 "C3: Authenticator").
//!
//! Two modes: a static header applied to every request, or a JWT-style
//! handshake performed lazily and once, guarded by an atomic "prepared"
//! flag plus a mutex so concurrent first-callers don't race the
//! handshake (grounded on `circuit_breaker::state`'s atomic-guard
//! pattern: check the flag unlocked, take the lock, check again).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use error_stack::Report;
use tokio::sync::Mutex as AsyncMutex;
use tracing::instrument;

use crate::codec::ContentType;
use crate::context::RequestContext;
use crate::error::{ClientError, Result};
use crate::request::Request;
use crate::response::Response;
use crate::transport::Connection;

/// How credentials are supplied.
#[derive(Debug, Clone)]
pub enum AuthMethod {
    /// A pre-built header value (e.g. `Basic <base64>`) applied verbatim.
    Static { header: String, value: String },
    /// Username/password exchanged for a bearer token via a handshake
    /// endpoint, then cached and attached as `Authorization: bearer <token>`.
    Jwt { username: String, password: String, handshake_path: String },
}

/// Performs the one-time handshake for [`AuthMethod::Jwt`] and exposes
/// the header to attach to every subsequent request.
struct JwtState {
    prepared: AtomicBool,
    lock: AsyncMutex<()>,
    token: AsyncMutex<Option<String>>,
}

impl JwtState {
    fn new() -> Self {
        Self {
            prepared: AtomicBool::new(false),
            lock: AsyncMutex::new(()),
            token: AsyncMutex::new(None),
        }
    }

    async fn ensure_prepared(&self, inner: &dyn Connection, username: &str, password: &str, handshake_path: &str) -> Result<()> {
        if self.prepared.load(Ordering::Acquire) {
            return Ok(());
        }
        let _guard = self.lock.lock().await;
        if self.prepared.load(Ordering::Acquire) {
            return Ok(());
        }

        let mut req = inner.new_request("POST", handshake_path)?;
        req.set_body(&serde_json::json!({ "username": username, "password": password }))?;
        let ctx = RequestContext::new();
        let resp = inner.do_request(&ctx, req).await?;
        resp.check_status(&[200])?;
        let token: String = resp.parse_body("jwt")?;

        *self.token.lock().await = Some(token);
        self.prepared.store(true, Ordering::Release);
        Ok(())
    }

    async fn header_value(&self) -> Option<String> {
        self.token.lock().await.as_ref().map(|t| format!("bearer {t}"))
    }

    fn invalidate(&self) {
        self.prepared.store(false, Ordering::Release);
    }
}

/// A `Connection` decorator that injects credentials into every request
/// before delegating to `inner`.
pub struct AuthenticatedConnection {
    inner: Arc<dyn Connection>,
    method: AuthMethod,
    jwt: Option<JwtState>,
}

impl AuthenticatedConnection {
    pub fn wrap(inner: Arc<dyn Connection>, method: AuthMethod) -> Arc<Self> {
        let jwt = matches!(method, AuthMethod::Jwt { .. }).then(JwtState::new);
        Arc::new(Self { inner, method, jwt })
    }

    /// Force the next request to redo the JWT handshake (e.g. after a 401
    /// suggests the cached token expired).
    pub fn invalidate_handshake(&self) {
        if let Some(jwt) = &self.jwt {
            jwt.invalidate();
        }
    }
}

#[async_trait]
impl Connection for AuthenticatedConnection {
    fn new_request(&self, method: &str, path: &str) -> Result<Request> {
        self.inner.new_request(method, path)
    }

    #[instrument(skip(self, ctx, req), fields(path = %req.path()))]
    async fn do_request(&self, ctx: &RequestContext, mut req: Request) -> Result<Response> {
        match &self.method {
            AuthMethod::Static { header, value } => {
                req.set_header(header, value.clone());
            }
            AuthMethod::Jwt { username, password, handshake_path } => {
                let jwt = self.jwt.as_ref().expect("jwt state present for Jwt auth method");
                jwt.ensure_prepared(self.inner.as_ref(), username, password, handshake_path).await?;
                if let Some(header) = jwt.header_value().await {
                    req.set_header("authorization", header);
                }
            }
        }

        let result = self.inner.do_request(ctx, req).await;
        if let Err(report) = &result {
            if matches!(report.current_context(), ClientError::Unauthorized) {
                self.invalidate_handshake();
            }
        }
        result
    }

    fn endpoints(&self) -> Vec<String> {
        self.inner.endpoints()
    }

    async fn update_endpoints(&self, endpoints: Vec<String>) -> Result<()> {
        self.inner.update_endpoints(endpoints).await
    }

    fn protocols(&self) -> ContentType {
        self.inner.protocols()
    }
}

pub(crate) fn static_basic_header(username: &str, password: &str) -> String {
    use base64::Engine;
    let raw = format!("{username}:{password}");
    format!("Basic {}", base64::engine::general_purpose::STANDARD.encode(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct RecordingConnection {
        calls: AtomicUsize,
        seen_header: AsyncMutex<Option<String>>,
        responses: AsyncMutex<Vec<Response>>,
    }

    #[async_trait]
    impl Connection for RecordingConnection {
        async fn do_request(&self, _ctx: &RequestContext, req: Request) -> Result<Response> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.seen_header.lock().await = req.header("authorization").map(String::from);
            let mut responses = self.responses.lock().await;
            if responses.is_empty() {
                return Ok(Response::new(200, Default::default(), b"{}"[..].into(), "application/json"));
            }
            Ok(responses.remove(0))
        }

        fn endpoints(&self) -> Vec<String> {
            vec!["mock://one".into()]
        }

        async fn update_endpoints(&self, _endpoints: Vec<String>) -> Result<()> {
            Ok(())
        }

        fn protocols(&self) -> ContentType {
            ContentType::Json
        }
    }

    #[tokio::test]
    async fn static_auth_attaches_header_on_every_call() {
        let inner = Arc::new(RecordingConnection {
            calls: AtomicUsize::new(0),
            seen_header: AsyncMutex::new(None),
            responses: AsyncMutex::new(vec![]),
        });
        let auth = AuthenticatedConnection::wrap(
            inner.clone(),
            AuthMethod::Static { header: "authorization".into(), value: "Basic abc".into() },
        );

        let req = auth.new_request("GET", "/_api/version").unwrap();
        auth.do_request(&RequestContext::new(), req).await.unwrap();
        assert_eq!(*inner.seen_header.lock().await, Some("Basic abc".to_string()));
    }

    #[tokio::test]
    async fn jwt_handshake_runs_once_then_reuses_token() {
        let handshake_body = serde_json::to_vec(&serde_json::json!({"jwt": "tok-1"})).unwrap();
        let inner = Arc::new(RecordingConnection {
            calls: AtomicUsize::new(0),
            seen_header: AsyncMutex::new(None),
            responses: AsyncMutex::new(vec![Response::new(200, Default::default(), handshake_body.into(), "application/json")]),
        });
        let auth = AuthenticatedConnection::wrap(
            inner.clone(),
            AuthMethod::Jwt {
                username: "root".into(),
                password: "pw".into(),
                handshake_path: "/_open/auth".into(),
            },
        );

        let req1 = auth.new_request("GET", "/_api/version").unwrap();
        auth.do_request(&RequestContext::new(), req1).await.unwrap();
        assert_eq!(*inner.seen_header.lock().await, Some("bearer tok-1".to_string()));

        let req2 = auth.new_request("GET", "/_api/version").unwrap();
        auth.do_request(&RequestContext::new(), req2).await.unwrap();
        // Handshake (1 call) + two real requests = 3, not 4: the token was reused.
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn static_basic_header_encodes_username_and_password() {
        let header = static_basic_header("root", "");
        assert!(header.starts_with("Basic "));
    }
}
