//! Scripted transport shared by the unit tests.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::ApiResult;
use crate::gateway::RequestGateway;
use crate::rate_limit::RateLimiter;
use crate::retry::RetryHandler;
use crate::session::SessionStore;
use crate::transport::{RawResponse, RequestBody, RequestDescriptor, Transport};

type Handler = dyn Fn(&RequestDescriptor) -> ApiResult<RawResponse> + Send + Sync;

/// A [`Transport`] that answers from a closure and records every request.
#[derive(Clone)]
pub struct ScriptedTransport {
    handler: Arc<Handler>,
    log: Arc<Mutex<Vec<RequestDescriptor>>>,
    latency: Duration,
}

impl ScriptedTransport {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&RequestDescriptor) -> ApiResult<RawResponse> + Send + Sync + 'static,
    {
        Self {
            handler: Arc::new(handler),
            log: Arc::new(Mutex::new(Vec::new())),
            latency: Duration::ZERO,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn requests(&self) -> Vec<RequestDescriptor> {
        self.log.lock().unwrap().clone()
    }

    pub fn urls(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| r.url).collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: &RequestDescriptor) -> ApiResult<RawResponse> {
        self.log.lock().unwrap().push(request.clone());
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if let RequestBody::Multipart {
            file,
            on_progress: Some(cb),
        } = &request.body
        {
            cb(file.len(), file.len());
        }
        (self.handler)(request)
    }
}

/// Gateway with a generous rate budget, 3 retries at 100ms, and no session.
pub fn gateway_with(transport: ScriptedTransport) -> RequestGateway {
    RequestGateway::new(
        Arc::new(transport),
        RateLimiter::new(1000, Duration::from_secs(60)),
        RetryHandler::new(3, Duration::from_millis(100)),
        Arc::new(SessionStore::in_memory()),
    )
}
