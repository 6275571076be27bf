use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::http::{HeaderMap, StatusCode};

use super::attempt::{Attempt, AttemptSinks, MeteredStream, settle_usage};
use super::health::HealthTracker;
use super::registry::ProviderRegistry;
use crate::config::Provider;
use crate::error::{GatewayError, Result, UpstreamError, UpstreamFailure};
use crate::events::EventSink;
use crate::logging::{RequestLog, RequestRecorder};
use crate::providers::upstream::{forward_request_headers, join_url};
use crate::providers::{
    InboundRequest, ProtocolAdapter, ReplyBody, Upstream, UpstreamRequest, adapter_for,
};

pub enum OutcomeBody {
    Full(Bytes),
    Stream(MeteredStream),
}

/// The accepted reply of a routed request.
pub struct RouteOutcome {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: OutcomeBody,
    pub provider_id: String,
    pub provider_name: String,
    pub upstream_model: Option<String>,
}

/// Statuses that say "this provider cannot serve you right now" rather than
/// "your request is wrong".
pub fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || matches!(status.as_u16(), 401 | 402 | 403 | 410 | 429)
}

const MAX_ERROR_SNIPPET: usize = 512;

fn error_snippet(status: StatusCode, body: &ReplyBody) -> String {
    match body {
        ReplyBody::Full(bytes) if !bytes.is_empty() => {
            let text = String::from_utf8_lossy(bytes);
            let mut end = text.len().min(MAX_ERROR_SNIPPET);
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            text[..end].trim().to_string()
        }
        _ => status
            .canonical_reason()
            .unwrap_or("upstream error")
            .to_string(),
    }
}

pub struct Router {
    registry: Arc<ProviderRegistry>,
    upstream: Arc<dyn Upstream>,
    sinks: AttemptSinks,
    default_timeout: Duration,
}

impl Router {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        health: Arc<HealthTracker>,
        upstream: Arc<dyn Upstream>,
        recorder: RequestRecorder,
        events: Arc<dyn EventSink>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            upstream,
            sinks: AttemptSinks {
                health,
                recorder,
                events,
            },
            default_timeout,
        }
    }

    pub fn health(&self) -> &Arc<HealthTracker> {
        &self.sinks.health
    }

    pub fn recorder(&self) -> &RequestRecorder {
        &self.sinks.recorder
    }

    /// Enabled providers for the dialect, in registry order, minus those
    /// cooling down; truncated to one when fallback is off.
    pub fn candidates(&self, request: &InboundRequest) -> Vec<Provider> {
        let (providers, fallback_enabled) = self.registry.routable(request.api_type);
        let mut candidates: Vec<Provider> = providers
            .into_iter()
            .filter(|p| self.sinks.health.is_eligible(&p.id))
            .collect();
        if !fallback_enabled {
            candidates.truncate(1);
        }
        candidates
    }

    pub async fn route(&self, request: &InboundRequest) -> Result<RouteOutcome> {
        let candidates = self.candidates(request);
        let adapter = adapter_for(request.api_type);

        let mut attempts = 0usize;
        let mut last_error: Option<UpstreamError> = None;

        for provider in candidates {
            // 半开状态下探测名额可能已被并发请求占用
            let Some(admission) = self.sinks.health.admit(&provider.id) else {
                continue;
            };
            attempts += 1;

            let upstream_model = request
                .json
                .as_ref()
                .and(request.model.as_deref())
                .map(|m| provider.map_model(m));
            let attempt = Attempt::begin(
                self.sinks.clone(),
                &provider,
                admission,
                request,
                upstream_model.clone(),
            );

            let outbound = match build_request(adapter, &provider, request, upstream_model.as_deref()) {
                Ok(outbound) => outbound,
                Err(failure) => {
                    attempt.fail(&failure);
                    last_error = Some(UpstreamError {
                        provider_id: provider.id.clone(),
                        failure,
                    });
                    continue;
                }
            };

            let timeout = provider
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(self.default_timeout);
            tracing::debug!(
                provider = %provider.id,
                url = %outbound.url,
                model = upstream_model.as_deref().unwrap_or("-"),
                "dispatching upstream request"
            );
            let result = match tokio::time::timeout(timeout, self.upstream.send(outbound)).await {
                Ok(result) => result,
                Err(_) => Err(UpstreamFailure::Timeout(timeout)),
            };

            let reply = match result {
                Ok(reply) if is_retryable_status(reply.status) => {
                    let failure = UpstreamFailure::Status {
                        status: reply.status.as_u16(),
                        message: error_snippet(reply.status, &reply.body),
                    };
                    Err(failure)
                }
                other => other,
            };

            let reply = match reply {
                Ok(reply) => reply,
                Err(failure) => {
                    tracing::warn!(
                        provider = %provider.id,
                        api_type = %request.api_type,
                        error = %failure,
                        "upstream attempt failed"
                    );
                    attempt.fail(&failure);
                    last_error = Some(UpstreamError {
                        provider_id: provider.id.clone(),
                        failure,
                    });
                    continue;
                }
            };

            let status = reply.status;
            let body = match reply.body {
                ReplyBody::Full(bytes) => {
                    let reported = if status.is_success() && request.is_completion() {
                        serde_json::from_slice(&bytes)
                            .ok()
                            .and_then(|v| adapter.extract_usage(&v))
                    } else {
                        None
                    };
                    let usage = settle_usage(reported, request.body.len(), bytes.len());
                    let error_message = (!status.is_success())
                        .then(|| error_snippet(status, &ReplyBody::Full(bytes.clone())));
                    attempt.succeed(status.as_u16(), usage, error_message);
                    OutcomeBody::Full(bytes)
                }
                ReplyBody::Stream(stream) => OutcomeBody::Stream(MeteredStream::new(
                    stream,
                    adapter,
                    attempt,
                    status.as_u16(),
                    timeout,
                )),
            };

            return Ok(RouteOutcome {
                status,
                headers: reply.headers,
                body,
                provider_id: provider.id,
                provider_name: provider.name,
                upstream_model,
            });
        }

        match last_error {
            Some(last) => Err(GatewayError::AllProvidersFailed { attempts, last }),
            None => {
                let err = GatewayError::NoProviderAvailable(request.api_type);
                let mut log = RequestLog::new(
                    request.api_type,
                    request.method.as_str(),
                    &request.path,
                    &request.client,
                );
                log.model = request.model.clone();
                self.sinks.recorder.record_rejected(log, &err);
                Err(err)
            }
        }
    }
}

fn build_request(
    adapter: &dyn ProtocolAdapter,
    provider: &Provider,
    request: &InboundRequest,
    upstream_model: Option<&str>,
) -> std::result::Result<UpstreamRequest, UpstreamFailure> {
    let url = join_url(&provider.base_url, &request.path);
    let mut headers = forward_request_headers(&request.headers);
    adapter.apply_auth(&mut headers, &provider.api_key);

    let body = match &request.json {
        Some(json) => {
            let mut json = json.clone();
            adapter.prepare_body(&mut json, upstream_model, request.stream);
            serde_json::to_vec(&json)
                .map(Bytes::from)
                .map_err(|e| UpstreamFailure::Transport(format!("encode request body: {}", e)))?
        }
        None => request.body.clone(),
    };

    Ok(UpstreamRequest {
        method: request.method.clone(),
        url,
        headers,
        body,
        stream: request.stream,
    })
}
