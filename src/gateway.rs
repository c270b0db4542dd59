//! Uniform request pipeline over the backend REST API.
//!
//! Every call goes through the same stages:
//!
//! ```text
//! RateLimiter.acquire() ─▶ attach session token ─▶ RetryHandler ─┬─▶ Transport.send()
//!                                                                └─▶ acquire() + send() (retries)
//!                                       ◀── 2xx payload / ApiError ──┘
//!                 401 ─▶ invalidate session once ─▶ ApiError::AuthExpired
//! ```
//!
//! A 401 is an expired session for every request except login and
//! registration, which go through [`RequestGateway::post_anonymous`] and get
//! [`ApiError::Client`] back instead.
//!
//! The limiter is consulted for every attempt, so retries count against the
//! outbound budget like any other request. Navigation on session expiry is
//! left to the caller, which can watch [`SessionStore::subscribe`].

use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

use crate::config::Config;
use crate::error::{ApiError, ApiResult};
use crate::rate_limit::RateLimiter;
use crate::retry::RetryHandler;
use crate::session::SessionStore;
use crate::transport::{
    HttpTransport, ProgressFn, RawResponse, RequestDescriptor, Transport, UploadFile,
};

pub struct RequestGateway {
    transport: Arc<dyn Transport>,
    limiter: RateLimiter,
    retry: RetryHandler,
    session: Arc<SessionStore>,
}

impl RequestGateway {
    pub fn new(
        transport: Arc<dyn Transport>,
        limiter: RateLimiter,
        retry: RetryHandler,
        session: Arc<SessionStore>,
    ) -> Self {
        Self {
            transport,
            limiter,
            retry,
            session,
        }
    }

    /// Gateway over HTTP with limiter and retry settings from `config`.
    pub fn from_config(config: &Config, session: Arc<SessionStore>) -> ApiResult<Self> {
        Ok(Self::new(
            Arc::new(HttpTransport::new(&config.api)?),
            RateLimiter::from_config(&config.rate_limit),
            RetryHandler::from_config(&config.retry),
            session,
        ))
    }

    pub fn session(&self) -> &Arc<SessionStore> {
        &self.session
    }

    pub async fn get<T: DeserializeOwned>(&self, url: &str) -> ApiResult<T> {
        let response = self.execute(RequestDescriptor::new(Method::GET, url)).await?;
        decode(&response)
    }

    pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &B,
    ) -> ApiResult<T> {
        let request = RequestDescriptor::new(Method::POST, url).json(to_json(body)?);
        decode(&self.execute(request).await?)
    }

    /// POST without the session token, for login and registration.
    pub async fn post_anonymous<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &B,
    ) -> ApiResult<T> {
        let request = RequestDescriptor::new(Method::POST, url)
            .json(to_json(body)?)
            .credentials();
        decode(&self.execute(request).await?)
    }

    pub async fn put<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &B,
    ) -> ApiResult<T> {
        let request = RequestDescriptor::new(Method::PUT, url).json(to_json(body)?);
        decode(&self.execute(request).await?)
    }

    pub async fn delete<T: DeserializeOwned>(&self, url: &str) -> ApiResult<T> {
        let response = self
            .execute(RequestDescriptor::new(Method::DELETE, url))
            .await?;
        decode(&response)
    }

    /// POST `file` as `multipart/form-data`, reporting `(sent, total)` bytes.
    pub async fn upload<T: DeserializeOwned>(
        &self,
        url: &str,
        file: UploadFile,
        on_progress: Option<ProgressFn>,
    ) -> ApiResult<T> {
        let request = RequestDescriptor::new(Method::POST, url).multipart(file, on_progress);
        decode(&self.execute(request).await?)
    }

    /// GET `url` and save the body to `dest`. Returns the number of bytes written.
    pub async fn download(&self, url: &str, dest: &Path) -> ApiResult<u64> {
        let response = self.execute(RequestDescriptor::new(Method::GET, url)).await?;
        if let Some(parent) = dest.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(dest, &response.body).await?;
        tracing::info!(url, dest = %dest.display(), bytes = response.body.len(), "download saved");
        Ok(response.body.len() as u64)
    }

    /// Run one logical request through the full pipeline.
    ///
    /// The session token is read once the first attempt has been admitted by
    /// the limiter, so a login that lands during a rate-limit wait is used.
    /// Retries resend the same descriptor.
    pub async fn execute(&self, request: RequestDescriptor) -> ApiResult<RawResponse> {
        self.limiter.acquire().await;
        let token = if request.credential_request {
            None
        } else {
            self.session.token()
        };
        let request = match &token {
            Some(token) => request.bearer(token),
            None => request,
        };

        let this = self;
        let request = &request;
        let result = self
            .retry
            .run(move |attempt| async move {
                if attempt > 0 {
                    this.limiter.acquire().await;
                }
                tracing::debug!(
                    method = %request.method,
                    url = %request.url,
                    attempt,
                    "sending request"
                );
                let response = this.transport.send(request).await?;
                if response.is_success() {
                    Ok(response)
                } else if response.status == 401 && request.credential_request {
                    // Rejected credentials on login/register, not an expired session.
                    Err(ApiError::Client {
                        status: 401,
                        body: response.text(),
                    })
                } else {
                    Err(ApiError::from_status(response.status, response.text()))
                }
            })
            .await;

        match result {
            Err(ApiError::AuthExpired) => {
                if let Some(token) = token {
                    self.session.invalidate_if_current(&token);
                }
                Err(ApiError::AuthExpired)
            }
            other => other,
        }
    }
}

fn to_json<B: Serialize + ?Sized>(body: &B) -> ApiResult<serde_json::Value> {
    serde_json::to_value(body).map_err(|e| ApiError::Validation(e.to_string()))
}

fn decode<T: DeserializeOwned>(response: &RawResponse) -> ApiResult<T> {
    if response.body.iter().all(|b| b.is_ascii_whitespace()) {
        return serde_json::from_value(serde_json::Value::Null)
            .map_err(|e| ApiError::Decode(e.to_string()));
    }
    serde_json::from_slice(&response.body).map_err(|e| ApiError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportErrorKind;
    use crate::session::{Session, SessionEvent};
    use crate::testing::{gateway_with, ScriptedTransport};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::sync::broadcast::error::TryRecvError;

    fn login(store: &SessionStore, token: &str) {
        store
            .replace(Session {
                token: token.to_string(),
                user: None,
            })
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn attaches_bearer_token_when_logged_in() {
        let transport = ScriptedTransport::new(|_| Ok(RawResponse::json(200, &json!({"ok": true}))));
        let gateway = gateway_with(transport.clone());
        login(gateway.session(), "abc");

        let _: Value = gateway.get("/api/auth/me").await.unwrap();
        let sent = transport.requests();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].authenticated);
        assert_eq!(sent[0].header_value("Authorization"), Some("Bearer abc"));
    }

    #[tokio::test(start_paused = true)]
    async fn anonymous_requests_carry_no_token() {
        let transport = ScriptedTransport::new(|_| Ok(RawResponse::json(200, &json!({}))));
        let gateway = gateway_with(transport.clone());

        let _: Value = gateway
            .post("/api/auth/login", &json!({"username": "a", "password": "b"}))
            .await
            .unwrap();
        assert!(!transport.requests()[0].authenticated);
        assert!(transport.requests()[0].header_value("Authorization").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn server_errors_are_retried_then_succeed() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let transport = ScriptedTransport::new(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Ok(RawResponse::json(503, &json!({"detail": "busy"})))
            } else {
                Ok(RawResponse::json(200, &json!({"n": 1})))
            }
        });
        let gateway = gateway_with(transport.clone());

        let body: Value = gateway.get("/api/knowledge-bases").await.unwrap();
        assert_eq!(body["n"], 1);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn client_errors_surface_immediately() {
        let transport =
            ScriptedTransport::new(|_| Ok(RawResponse::json(404, &json!({"detail": "nope"}))));
        let gateway = gateway_with(transport.clone());

        let err = gateway.get::<Value>("/api/knowledge-bases/x").await.unwrap_err();
        assert!(matches!(err, ApiError::Client { status: 404, .. }));
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_transport_errors_propagate_cause() {
        let transport = ScriptedTransport::new(|_| {
            Err(ApiError::Transport {
                kind: TransportErrorKind::ConnectionReset,
                message: "reset by peer".into(),
            })
        });
        let gateway = gateway_with(transport.clone());

        let err = gateway.get::<Value>("/api/knowledge-bases").await.unwrap_err();
        assert!(matches!(
            err,
            ApiError::Transport {
                kind: TransportErrorKind::ConnectionReset,
                ..
            }
        ));
        // 1 attempt + 3 retries
        assert_eq!(transport.requests().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn unauthorized_invalidates_session_once_across_concurrent_calls() {
        let transport = ScriptedTransport::new(|_| Ok(RawResponse::json(401, &json!({}))))
            .with_latency(Duration::from_millis(50));
        let gateway = Arc::new(gateway_with(transport.clone()));
        login(gateway.session(), "stale");
        let mut events = gateway.session().subscribe();

        let a = {
            let gateway = gateway.clone();
            tokio::spawn(async move { gateway.get::<Value>("/api/knowledge-bases").await })
        };
        let b = {
            let gateway = gateway.clone();
            tokio::spawn(async move { gateway.get::<Value>("/api/auth/me").await })
        };

        assert!(matches!(a.await.unwrap(), Err(ApiError::AuthExpired)));
        assert!(matches!(b.await.unwrap(), Err(ApiError::AuthExpired)));
        assert_eq!(transport.requests().len(), 2);
        assert!(!gateway.session().is_authenticated());

        assert_eq!(events.try_recv().unwrap(), SessionEvent::Expired);
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_login_is_a_client_error() {
        let transport =
            ScriptedTransport::new(|_| Ok(RawResponse::json(401, &json!({"detail": "bad password"}))));
        let gateway = gateway_with(transport.clone());

        let err = gateway
            .post_anonymous::<Value, _>("/api/auth/login", &json!({"username": "a", "password": "b"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Client { status: 401, .. }));
        assert!(transport.requests()[0].credential_request);
    }

    #[tokio::test(start_paused = true)]
    async fn unauthorized_without_session_is_auth_expired() {
        let transport = ScriptedTransport::new(|_| Ok(RawResponse::json(401, &json!({}))));
        let gateway = gateway_with(transport.clone());
        let mut events = gateway.session().subscribe();

        let err = gateway.get::<Value>("/api/knowledge-bases").await.unwrap_err();
        assert!(matches!(err, ApiError::AuthExpired));
        assert_eq!(transport.requests().len(), 1);
        assert!(!transport.requests()[0].authenticated);
        // Nothing to invalidate.
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test(start_paused = true)]
    async fn token_is_read_after_rate_limit_wait() {
        let transport = ScriptedTransport::new(|_| Ok(RawResponse::json(200, &json!({}))));
        let gateway = Arc::new(RequestGateway::new(
            Arc::new(transport.clone()),
            RateLimiter::new(1, Duration::from_millis(1000)),
            RetryHandler::new(0, Duration::from_millis(100)),
            Arc::new(SessionStore::in_memory()),
        ));
        login(gateway.session(), "old");

        let _: Value = gateway.get("/api/knowledge-bases").await.unwrap();
        let waiting = {
            let gateway = gateway.clone();
            tokio::spawn(async move { gateway.get::<Value>("/api/auth/me").await })
        };
        tokio::time::sleep(Duration::from_millis(500)).await;
        login(gateway.session(), "fresh");

        waiting.await.unwrap().unwrap();
        let sent = transport.requests();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].header_value("Authorization"), Some("Bearer fresh"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_relogin_keeps_existing_session() {
        let transport =
            ScriptedTransport::new(|_| Ok(RawResponse::json(401, &json!({"detail": "bad password"}))));
        let gateway = gateway_with(transport.clone());
        login(gateway.session(), "still-good");

        let err = gateway
            .post_anonymous::<Value, _>("/api/auth/login", &json!({"username": "a", "password": "b"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Client { status: 401, .. }));
        assert!(transport.requests()[0].header_value("Authorization").is_none());
        assert_eq!(gateway.session().token().as_deref(), Some("still-good"));
    }

    #[tokio::test(start_paused = true)]
    async fn upload_reports_progress_and_reuses_descriptor() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let transport = ScriptedTransport::new(move |req| {
            assert!(matches!(req.body, crate::transport::RequestBody::Multipart { .. }));
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(RawResponse::json(500, &json!({})))
            } else {
                Ok(RawResponse::json(201, &json!({"id": "d1"})))
            }
        });
        let gateway = gateway_with(transport.clone());

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let progress: ProgressFn = Arc::new(move |sent, total| sink.lock().unwrap().push((sent, total)));
        let file = UploadFile::from_bytes("a.md", b"# hello".to_vec());

        let doc: Value = gateway
            .upload("/api/knowledge-bases/k/documents", file, Some(progress))
            .await
            .unwrap();
        assert_eq!(doc["id"], "d1");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        let sent = transport.requests();
        assert_eq!(sent[0].url, sent[1].url);
        assert_eq!(seen.lock().unwrap().last(), Some(&(7, 7)));
    }

    #[tokio::test(start_paused = true)]
    async fn download_writes_file() {
        let transport = ScriptedTransport::new(|_| {
            Ok(RawResponse {
                status: 200,
                body: b"blob-bytes".to_vec(),
            })
        });
        let gateway = gateway_with(transport);
        let tmp = tempfile::TempDir::new().unwrap();
        let dest = tmp.path().join("out").join("doc.bin");

        let written = gateway.download("/files/doc.bin", &dest).await.unwrap();
        assert_eq!(written, 10);
        assert_eq!(std::fs::read(&dest).unwrap(), b"blob-bytes");
    }

    #[tokio::test(start_paused = true)]
    async fn empty_body_decodes_as_unit() {
        let transport = ScriptedTransport::new(|_| {
            Ok(RawResponse {
                status: 204,
                body: Vec::new(),
            })
        });
        let gateway = gateway_with(transport);
        gateway.delete::<()>("/api/knowledge-bases/k").await.unwrap();
    }
}
