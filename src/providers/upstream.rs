use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::{HeaderMap, Method, StatusCode, header};
use futures_util::StreamExt;
use futures_util::stream::BoxStream;

use crate::error::UpstreamFailure;
use crate::http_client::UpstreamClients;

/// One outbound call, fully prepared for a specific provider.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub stream: bool,
}

pub enum ReplyBody {
    Full(Bytes),
    Stream(BoxStream<'static, Result<Bytes, String>>),
}

impl std::fmt::Debug for ReplyBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplyBody::Full(b) => write!(f, "Full({} bytes)", b.len()),
            ReplyBody::Stream(_) => f.write_str("Stream"),
        }
    }
}

#[derive(Debug)]
pub struct UpstreamReply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ReplyBody,
}

/// Transport seam between the router and the network.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamReply, UpstreamFailure>;
}

// 逐跳头部以及由网关重新计算的头部
const SKIPPED_REQUEST_HEADERS: &[&str] = &[
    "host",
    "authorization",
    "x-api-key",
    "content-length",
    "accept-encoding",
    "connection",
    "keep-alive",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const SKIPPED_RESPONSE_HEADERS: &[&str] = &[
    "content-length",
    "connection",
    "keep-alive",
    "transfer-encoding",
    "trailer",
    "upgrade",
];

fn filter_headers(headers: &HeaderMap, skipped: &[&str]) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if skipped.contains(&name.as_str()) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Inbound headers minus credentials and hop-by-hop headers.
pub fn forward_request_headers(inbound: &HeaderMap) -> HeaderMap {
    filter_headers(inbound, SKIPPED_REQUEST_HEADERS)
}

pub fn relay_response_headers(upstream: &HeaderMap) -> HeaderMap {
    filter_headers(upstream, SKIPPED_RESPONSE_HEADERS)
}

/// Join a provider base URL with an inbound path, collapsing a doubled `/v1`.
pub fn join_url(base_url: &str, path_and_query: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let path = if path_and_query.starts_with('/') {
        path_and_query.to_string()
    } else {
        format!("/{}", path_and_query)
    };
    if base.ends_with("/v1") && (path == "/v1" || path.starts_with("/v1/") || path.starts_with("/v1?"))
    {
        return format!("{}{}", base, &path[3..]);
    }
    format!("{}{}", base, path)
}

fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("text/event-stream"))
}

/// reqwest-backed transport.
pub struct HttpUpstream {
    clients: UpstreamClients,
}

impl HttpUpstream {
    pub fn new(connect_timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            clients: UpstreamClients::new(connect_timeout)?,
        })
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamReply, UpstreamFailure> {
        let client = self.clients.for_url(&request.url);
        let response = client
            .request(request.method, &request.url)
            .headers(request.headers)
            .body(request.body)
            .send()
            .await
            .map_err(|e| UpstreamFailure::Transport(e.to_string()))?;

        let status = response.status();
        let headers = relay_response_headers(response.headers());

        let body = if status.is_success() && (request.stream || is_event_stream(&headers)) {
            let stream = response
                .bytes_stream()
                .map(|chunk| chunk.map_err(|e| e.to_string()))
                .boxed();
            ReplyBody::Stream(stream)
        } else {
            let bytes = response
                .bytes()
                .await
                .map_err(|e| UpstreamFailure::Transport(e.to_string()))?;
            ReplyBody::Full(bytes)
        };

        Ok(UpstreamReply {
            status,
            headers,
            body,
        })
    }
}
