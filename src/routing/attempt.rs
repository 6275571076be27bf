use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::body::Bytes;
use futures_util::stream::{BoxStream, Stream, StreamExt};
use tokio::time::Sleep;

use super::health::{Admission, HealthTracker};
use crate::config::{ApiType, Pricing, Provider};
use crate::error::UpstreamFailure;
use crate::events::{EventSink, GatewayEvent, ProviderStatus};
use crate::logging::{RequestLog, RequestRecorder};
use crate::providers::sse::UsageScanner;
use crate::providers::{InboundRequest, ProtocolAdapter, Usage, estimate_tokens};

/// Shared handles every attempt reports to.
#[derive(Clone)]
pub struct AttemptSinks {
    pub health: Arc<HealthTracker>,
    pub recorder: RequestRecorder,
    pub events: Arc<dyn EventSink>,
}

/// One call to one provider. Exactly one RequestLog is written per attempt:
/// by `succeed`, `fail`, or on drop when the caller went away.
pub struct Attempt {
    log: Option<RequestLog>,
    started: Instant,
    admission: Admission,
    api_type: ApiType,
    pricing: Pricing,
    request_bytes: usize,
    sinks: AttemptSinks,
}

impl Attempt {
    pub fn begin(
        sinks: AttemptSinks,
        provider: &Provider,
        admission: Admission,
        request: &InboundRequest,
        upstream_model: Option<String>,
    ) -> Self {
        let mut log = RequestLog::new(
            request.api_type,
            request.method.as_str(),
            &request.path,
            &request.client,
        );
        log.model = request.model.clone();
        log.upstream_model = upstream_model;
        log.provider_id = Some(provider.id.clone());
        log.provider_name = Some(provider.name.clone());

        sinks.events.publish(GatewayEvent::provider_status(
            &provider.id,
            ProviderStatus::Pending,
            request.api_type,
        ));

        Self {
            log: Some(log),
            started: Instant::now(),
            admission,
            api_type: request.api_type,
            pricing: provider.pricing(),
            request_bytes: request.body.len(),
            sinks,
        }
    }

    pub fn request_bytes(&self) -> usize {
        self.request_bytes
    }

    /// The provider answered. Non-2xx answers that reach here are caller
    /// errors and still prove the provider alive.
    pub fn succeed(mut self, status: u16, usage: Usage, error_message: Option<String>) {
        let Some(mut log) = self.log.take() else {
            return;
        };
        let provider_id = log.provider_id.clone().unwrap_or_default();
        self.sinks.health.record_success(&provider_id, self.admission);
        self.sinks.events.publish(GatewayEvent::provider_status(
            &provider_id,
            ProviderStatus::Success,
            self.api_type,
        ));

        log.status = status;
        log.input_tokens = usage.input_tokens;
        log.output_tokens = usage.output_tokens;
        log.cost = self.pricing.cost(usage.input_tokens, usage.output_tokens);
        log.error_message = error_message;
        self.finish(log);
    }

    pub fn fail(mut self, failure: &UpstreamFailure) {
        let Some(mut log) = self.log.take() else {
            return;
        };
        let provider_id = log.provider_id.clone().unwrap_or_default();
        let message = failure.to_string();
        self.sinks
            .health
            .record_failure(&provider_id, self.admission, &message);
        self.sinks.events.publish(GatewayEvent::provider_status(
            &provider_id,
            ProviderStatus::Error,
            self.api_type,
        ));

        log.status = failure.status_code();
        log.error_message = Some(message);
        self.finish(log);
    }

    fn finish(&self, mut log: RequestLog) {
        log.duration_ms = self.started.elapsed().as_millis() as u64;
        self.sinks.recorder.record(log);
    }
}

pub const CLIENT_CLOSED_REQUEST: u16 = 499;

impl Drop for Attempt {
    fn drop(&mut self) {
        let Some(mut log) = self.log.take() else {
            return;
        };
        // 客户端中断不算供应商失败，只释放半开探测名额
        let provider_id = log.provider_id.clone().unwrap_or_default();
        self.sinks.health.release(&provider_id, self.admission);
        self.sinks.events.publish(GatewayEvent::provider_status(
            &provider_id,
            ProviderStatus::Error,
            self.api_type,
        ));
        log.status = CLIENT_CLOSED_REQUEST;
        log.error_message = Some("client disconnected before completion".to_string());
        self.finish(log);
    }
}

/// Reported usage when present, otherwise a byte-based estimate.
pub fn settle_usage(reported: Option<Usage>, request_bytes: usize, response_bytes: usize) -> Usage {
    match reported {
        Some(usage) if !usage.is_empty() => usage,
        _ => Usage {
            input_tokens: estimate_tokens(request_bytes),
            output_tokens: estimate_tokens(response_bytes),
        },
    }
}

/// Relays an upstream SSE body unchanged while scanning it for usage.
/// The attempt is settled when the stream ends, errors, stalls for longer
/// than the provider timeout, or is dropped.
pub struct MeteredStream {
    inner: BoxStream<'static, Result<Bytes, String>>,
    scanner: UsageScanner,
    attempt: Option<Attempt>,
    status: u16,
    idle_timeout: Duration,
    deadline: Pin<Box<Sleep>>,
    done: bool,
}

impl MeteredStream {
    pub fn new(
        inner: BoxStream<'static, Result<Bytes, String>>,
        adapter: &'static dyn ProtocolAdapter,
        attempt: Attempt,
        status: u16,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            inner,
            scanner: UsageScanner::new(adapter),
            attempt: Some(attempt),
            status,
            idle_timeout,
            deadline: Box::pin(tokio::time::sleep(idle_timeout)),
            done: false,
        }
    }
}

impl Stream for MeteredStream {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        match this.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.scanner.feed(&chunk);
                let next = tokio::time::Instant::now() + this.idle_timeout;
                this.deadline.as_mut().reset(next);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.done = true;
                if let Some(attempt) = this.attempt.take() {
                    attempt.fail(&UpstreamFailure::Stream(e.clone()));
                }
                Poll::Ready(Some(Err(std::io::Error::other(e))))
            }
            Poll::Ready(None) => {
                this.done = true;
                if let Some(attempt) = this.attempt.take() {
                    let reported = this.scanner.finish();
                    let usage = settle_usage(
                        Some(reported),
                        attempt.request_bytes(),
                        this.scanner.bytes(),
                    );
                    attempt.succeed(this.status, usage, None);
                }
                Poll::Ready(None)
            }
            Poll::Pending => {
                if this.deadline.as_mut().poll(cx).is_pending() {
                    return Poll::Pending;
                }
                this.done = true;
                let failure = UpstreamFailure::Timeout(this.idle_timeout);
                if let Some(attempt) = this.attempt.take() {
                    attempt.fail(&failure);
                }
                Poll::Ready(Some(Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    failure.to_string(),
                ))))
            }
        }
    }
}
