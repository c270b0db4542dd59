//! Indexing progress polling.
//!
//! After documents are uploaded the backend chunks and embeds them on its
//! own schedule. [`IndexingProgressPoller`] asks for the knowledge base's
//! indexing state every `interval` until it reaches a terminal status:
//!
//! ```text
//! Idle ─▶ Polling ─┬─▶ Completed
//!          ▲   │   ├─▶ Failed
//!          └───┘   └─▶ Aborted (cancelled, or the request failed)
//!        pending /
//!        processing
//! ```
//!
//! A failed request ends the loop with an explicit [`PollOutcome::Aborted`]
//! instead of retrying forever; transient failures were already retried by
//! the gateway.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::ApiClient;
use crate::config::PollConfig;
use crate::error::ApiError;
use crate::models::{IndexingProgress, IndexingStatus};
use crate::progress::{ProgressEvent, ProgressReporter};

#[derive(Debug)]
pub enum AbortReason {
    Cancelled,
    Request(ApiError),
    /// The background task panicked or was torn down by the runtime.
    Task(String),
}

#[derive(Debug)]
pub enum PollOutcome {
    Completed(IndexingProgress),
    Failed(IndexingProgress),
    Aborted(AbortReason),
}

impl PollOutcome {
    /// The last progress seen, when the backend reached a terminal state.
    pub fn progress(&self) -> Option<&IndexingProgress> {
        match self {
            Self::Completed(p) | Self::Failed(p) => Some(p),
            Self::Aborted(_) => None,
        }
    }
}

#[derive(Clone)]
pub struct IndexingProgressPoller {
    api: ApiClient,
    interval: Duration,
    reporter: Option<Arc<dyn ProgressReporter>>,
}

impl IndexingProgressPoller {
    pub fn new(api: ApiClient, interval: Duration) -> Self {
        Self {
            api,
            interval,
            reporter: None,
        }
    }

    pub fn from_config(api: ApiClient, config: &PollConfig) -> Self {
        Self::new(api, Duration::from_millis(config.interval_ms))
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Poll until a terminal status, a request failure, or `cancel`.
    ///
    /// `observe` sees every snapshot, including the terminal one. A snapshot
    /// that goes backwards is passed on like any other. `pending` is not
    /// terminal: a backend that never leaves it is polled until `cancel`.
    pub async fn watch<F>(
        &self,
        knowledge_base_id: &str,
        cancel: &CancellationToken,
        mut observe: F,
    ) -> PollOutcome
    where
        F: FnMut(&IndexingProgress),
    {
        let mut last: Option<IndexingProgress> = None;
        loop {
            if cancel.is_cancelled() {
                return PollOutcome::Aborted(AbortReason::Cancelled);
            }
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return PollOutcome::Aborted(AbortReason::Cancelled),
                r = self.api.indexing_progress(knowledge_base_id) => r,
            };
            let progress = match result {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(knowledge_base = knowledge_base_id, error = %e, "indexing progress request failed");
                    return PollOutcome::Aborted(AbortReason::Request(e));
                }
            };

            if let Some(prev) = &last {
                if progress.regresses_from(prev) {
                    tracing::debug!(
                        knowledge_base = knowledge_base_id,
                        processed = progress.processed,
                        previous = prev.processed,
                        "indexing progress went backwards"
                    );
                }
            }
            if let Some(reporter) = &self.reporter {
                reporter.report(ProgressEvent::Indexing {
                    knowledge_base_id: knowledge_base_id.to_string(),
                    progress: progress.clone(),
                });
            }
            observe(&progress);

            match progress.status {
                IndexingStatus::Completed => return PollOutcome::Completed(progress),
                IndexingStatus::Failed => return PollOutcome::Failed(progress),
                IndexingStatus::Pending | IndexingStatus::Processing => {}
            }
            last = Some(progress);

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return PollOutcome::Aborted(AbortReason::Cancelled),
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }

    /// Poll on a background task. Dropping the handle stops polling.
    pub fn spawn(&self, knowledge_base_id: &str) -> PollHandle {
        let cancel = CancellationToken::new();
        let poller = self.clone();
        let kb = knowledge_base_id.to_string();
        let token = cancel.clone();
        let task = tokio::spawn(async move { poller.watch(&kb, &token, |_| {}).await });
        PollHandle {
            cancel,
            task: Some(task),
        }
    }
}

pub struct PollHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<PollOutcome>>,
}

impl PollHandle {
    /// Stop scheduling polls. An in-flight request is abandoned.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn join(mut self) -> PollOutcome {
        let Some(task) = self.task.take() else {
            return PollOutcome::Aborted(AbortReason::Cancelled);
        };
        match task.await {
            Ok(outcome) => outcome,
            Err(e) => PollOutcome::Aborted(AbortReason::Task(e.to_string())),
        }
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{gateway_with, ScriptedTransport};
    use crate::transport::RawResponse;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn progress_body(status: &str, processed: u64) -> RawResponse {
        RawResponse::json(
            200,
            &json!({ "data": { "progress": { "total": 10, "processed": processed, "status": status } } }),
        )
    }

    fn poller(transport: ScriptedTransport) -> IndexingProgressPoller {
        let api = ApiClient::new(Arc::new(gateway_with(transport)));
        IndexingProgressPoller::new(api, Duration::from_millis(2000))
    }

    #[tokio::test(start_paused = true)]
    async fn polls_until_completed() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let transport = ScriptedTransport::new(move |_| {
            Ok(match counter.fetch_add(1, Ordering::SeqCst) {
                0 => progress_body("processing", 5),
                1 => progress_body("processing", 8),
                _ => progress_body("completed", 10),
            })
        });
        let poller = poller(transport);

        let mut seen = Vec::new();
        let start = tokio::time::Instant::now();
        let outcome = poller
            .watch("kb1", &CancellationToken::new(), |p| seen.push(p.processed))
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(seen, vec![5, 8, 10]);
        assert!(start.elapsed() >= Duration::from_millis(4000));
        match outcome {
            PollOutcome::Completed(p) => assert_eq!(p.processed, 10),
            other => panic!("expected completion, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn regressing_snapshots_are_observed_in_order() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let transport = ScriptedTransport::new(move |_| {
            Ok(match counter.fetch_add(1, Ordering::SeqCst) {
                0 => progress_body("processing", 8),
                1 => progress_body("processing", 5),
                _ => progress_body("completed", 10),
            })
        });

        let mut seen = Vec::new();
        let outcome = poller(transport)
            .watch("kb1", &CancellationToken::new(), |p| seen.push(p.processed))
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(seen, vec![8, 5, 10]);
        assert!(matches!(outcome, PollOutcome::Completed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn pending_keeps_polling_and_failed_is_terminal() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let transport = ScriptedTransport::new(move |_| {
            Ok(match counter.fetch_add(1, Ordering::SeqCst) {
                0 => progress_body("pending", 0),
                _ => RawResponse::json(
                    200,
                    &json!({ "progress": { "total": 10, "processed": 3, "status": "failed", "error": "embedding model offline" } }),
                ),
            })
        });
        let outcome = poller(transport)
            .watch("kb1", &CancellationToken::new(), |_| {})
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        match outcome {
            PollOutcome::Failed(p) => {
                assert_eq!(p.error.as_deref(), Some("embedding model offline"))
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn no_poll_after_cancel() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let transport = ScriptedTransport::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(progress_body("processing", 1))
        });
        let handle = poller(transport).spawn("kb1");

        // polls at t=0, 2000, 4000
        tokio::time::sleep(Duration::from_millis(4500)).await;
        handle.cancel();
        let outcome = handle.join().await;
        assert!(matches!(outcome, PollOutcome::Aborted(AbortReason::Cancelled)));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_from_observer_stops_the_loop() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let transport = ScriptedTransport::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(progress_body("processing", 2))
        });
        let cancel = CancellationToken::new();
        let outcome = poller(transport)
            .watch("kb1", &cancel, |_| cancel.cancel())
            .await;

        assert!(matches!(outcome, PollOutcome::Aborted(AbortReason::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn request_failure_aborts_with_error() {
        let transport =
            ScriptedTransport::new(|_| Ok(RawResponse::json(500, &json!({ "detail": "boom" }))));
        let outcome = poller(transport.clone())
            .watch("kb1", &CancellationToken::new(), |_| {})
            .await;

        match outcome {
            PollOutcome::Aborted(AbortReason::Request(ApiError::Server { status, .. })) => {
                assert_eq!(status, 500)
            }
            other => panic!("expected aborted request, got {:?}", other),
        }
        // one call plus the gateway's three retries, then no further polls
        assert_eq!(transport.requests().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_handle_stops_polling() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let transport = ScriptedTransport::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(progress_body("processing", 1))
        });
        let handle = poller(transport).spawn("kb1");
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(handle);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
