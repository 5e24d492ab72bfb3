//! Transport abstraction: reliable-or-retryable request/response delivery.
//!
//! The engine never sees sockets. `SyncTransport` is the full contract; the
//! `RetryingTransport` wrapper adds per-request timeouts with bounded
//! exponential backoff, and `LoopbackTransport` wires a session directly to
//! an in-process responder (server-to-server replication, tests).

use crate::messages::{
    EndSessionRequest, EndSessionResponse, EnsureScopeRequest, EnsureScopeResponse,
    GetChangesRequest, GetChangesResponse, SendChangesRequest, SendChangesResponse,
};
use crate::responder::SyncResponder;
use async_trait::async_trait;
use rowsync_core::{SyncError, SyncOptions, SyncResult};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn ensure_scope(&self, req: EnsureScopeRequest) -> SyncResult<EnsureScopeResponse>;
    async fn get_changes(&self, req: GetChangesRequest) -> SyncResult<GetChangesResponse>;
    async fn send_changes(&self, req: SendChangesRequest) -> SyncResult<SendChangesResponse>;
    async fn end_session(&self, req: EndSessionRequest) -> SyncResult<EndSessionResponse>;
}

/// Timeout + bounded-backoff wrapper around any transport.
///
/// A request is retried only on timeout (the wrapper's own deadline or a
/// `TransportTimeout` surfaced by the inner transport); every other error
/// passes through untouched. Exhausting the bound yields `TransportTimeout`.
pub struct RetryingTransport<T> {
    inner: T,
    timeout: Duration,
    max_retries: u32,
    backoff: Duration,
}

impl<T: SyncTransport> RetryingTransport<T> {
    pub fn new(inner: T, options: &SyncOptions) -> Self {
        Self {
            inner,
            timeout: Duration::from_millis(options.transport_timeout_ms),
            max_retries: options.max_transfer_retries,
            backoff: Duration::from_millis(options.retry_backoff_ms),
        }
    }

    async fn with_retry<R, F, Fut>(&self, context: &str, mut call: F) -> SyncResult<R>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = SyncResult<R>> + Send,
    {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match tokio::time::timeout(self.timeout, call()).await {
                Ok(Ok(resp)) => return Ok(resp),
                Ok(Err(SyncError::TransportTimeout { .. })) | Err(_) => {
                    if attempts > self.max_retries {
                        return Err(SyncError::TransportTimeout {
                            attempts,
                            context: context.to_string(),
                        });
                    }
                    let delay = self.backoff * 2u32.saturating_pow(attempts - 1);
                    warn!(
                        context,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        "transport timeout, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Ok(Err(other)) => return Err(other),
            }
        }
    }
}

#[async_trait]
impl<T: SyncTransport> SyncTransport for RetryingTransport<T> {
    async fn ensure_scope(&self, req: EnsureScopeRequest) -> SyncResult<EnsureScopeResponse> {
        self.with_retry("ensure_scope", || self.inner.ensure_scope(req.clone()))
            .await
    }

    async fn get_changes(&self, req: GetChangesRequest) -> SyncResult<GetChangesResponse> {
        let context = format!("get_changes part {}", req.batch_index_requested);
        self.with_retry(&context, || self.inner.get_changes(req.clone()))
            .await
    }

    async fn send_changes(&self, req: SendChangesRequest) -> SyncResult<SendChangesResponse> {
        let context = format!("send_changes part {}", req.batch_index);
        self.with_retry(&context, || self.inner.send_changes(req.clone()))
            .await
    }

    async fn end_session(&self, req: EndSessionRequest) -> SyncResult<EndSessionResponse> {
        self.with_retry("end_session", || self.inner.end_session(req.clone()))
            .await
    }
}

/// In-process transport: requests go straight to a responder.
pub struct LoopbackTransport {
    responder: Arc<SyncResponder>,
}

impl LoopbackTransport {
    pub fn new(responder: Arc<SyncResponder>) -> Self {
        Self { responder }
    }
}

#[async_trait]
impl SyncTransport for LoopbackTransport {
    async fn ensure_scope(&self, req: EnsureScopeRequest) -> SyncResult<EnsureScopeResponse> {
        self.responder.ensure_scope(req).await
    }

    async fn get_changes(&self, req: GetChangesRequest) -> SyncResult<GetChangesResponse> {
        self.responder.get_changes(req).await
    }

    async fn send_changes(&self, req: SendChangesRequest) -> SyncResult<SendChangesResponse> {
        self.responder.send_changes(req).await
    }

    async fn end_session(&self, req: EndSessionRequest) -> SyncResult<EndSessionResponse> {
        self.responder.end_session(req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowsync_core::{ConflictPolicy, ReplicaId, Scope, Watermark};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Times out `failures` times, then answers.
    struct Flaky {
        failures: AtomicU32,
    }

    fn canned_response() -> EnsureScopeResponse {
        EnsureScopeResponse {
            schema: Scope::new(
                "default",
                vec![rowsync_core::TableDescriptor::new(
                    "t",
                    vec![rowsync_core::ColumnDescriptor::new(
                        "id",
                        rowsync_core::ColumnKind::Integer,
                    )],
                    vec!["id"],
                )],
            ),
            policy: ConflictPolicy::ServerWins,
            server_id: ReplicaId::generate(),
            server_watermark: Watermark(7),
        }
    }

    #[async_trait]
    impl SyncTransport for Flaky {
        async fn ensure_scope(
            &self,
            _req: EnsureScopeRequest,
        ) -> SyncResult<EnsureScopeResponse> {
            if self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |f| {
                (f > 0).then(|| f - 1)
            }).is_ok()
            {
                return Err(SyncError::TransportTimeout {
                    attempts: 1,
                    context: "flaky".into(),
                });
            }
            Ok(canned_response())
        }

        async fn get_changes(&self, _req: GetChangesRequest) -> SyncResult<GetChangesResponse> {
            Err(SyncError::Storage("unused in this test".into()))
        }

        async fn send_changes(&self, _req: SendChangesRequest) -> SyncResult<SendChangesResponse> {
            Err(SyncError::Storage("unused in this test".into()))
        }

        async fn end_session(&self, _req: EndSessionRequest) -> SyncResult<EndSessionResponse> {
            Err(SyncError::Storage("unused in this test".into()))
        }
    }

    fn fast_options(max_retries: u32) -> SyncOptions {
        SyncOptions {
            transport_timeout_ms: 50,
            max_transfer_retries: max_retries,
            retry_backoff_ms: 1,
            ..Default::default()
        }
    }

    fn request() -> EnsureScopeRequest {
        EnsureScopeRequest {
            scope_name: "default".into(),
            client_id: ReplicaId::generate(),
            schema_version: 1,
        }
    }

    #[tokio::test]
    async fn recovers_within_retry_budget() {
        let transport = RetryingTransport::new(
            Flaky {
                failures: AtomicU32::new(2),
            },
            &fast_options(3),
        );
        let resp = transport.ensure_scope(request()).await.unwrap();
        assert_eq!(resp.server_watermark, Watermark(7));
    }

    #[tokio::test]
    async fn exhausting_the_budget_is_fatal() {
        let transport = RetryingTransport::new(
            Flaky {
                failures: AtomicU32::new(100),
            },
            &fast_options(2),
        );
        let err = transport.ensure_scope(request()).await.unwrap_err();
        match err {
            SyncError::TransportTimeout { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("expected TransportTimeout, got {other}"),
        }
    }

    #[tokio::test]
    async fn non_timeout_errors_pass_through() {
        let transport = RetryingTransport::new(
            Flaky {
                failures: AtomicU32::new(0),
            },
            &fast_options(3),
        );
        let err = transport
            .get_changes(GetChangesRequest {
                scope_name: "default".into(),
                client_id: ReplicaId::generate(),
                client_watermark: Watermark::ZERO,
                batch_index_requested: 0,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Storage(_)));
    }
}
