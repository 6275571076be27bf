pub mod anthropic;
pub mod openai_chat;
pub mod openai_responses;
pub mod sse;
pub mod upstream;

use axum::http::{HeaderMap, Method, StatusCode, header};
use axum::body::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ApiType;
use crate::error::{GatewayError, Result};

pub use anthropic::AnthropicAdapter;
pub use openai_chat::OpenAiChatAdapter;
pub use openai_responses::OpenAiResponsesAdapter;
pub use upstream::{HttpUpstream, ReplyBody, Upstream, UpstreamReply, UpstreamRequest};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl Usage {
    pub fn is_empty(&self) -> bool {
        self.input_tokens == 0 && self.output_tokens == 0
    }
}

/// Rough token count for bodies whose upstream reported no usage.
pub fn estimate_tokens(bytes: usize) -> u32 {
    u32::try_from(bytes.div_ceil(4)).unwrap_or(u32::MAX)
}

pub(crate) fn read_u32(value: &Value, key: &str) -> Option<u32> {
    value
        .get(key)
        .and_then(Value::as_u64)
        .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
}

/// Dialect-specific knowledge: which paths are completions, how to
/// authenticate, where usage lives, and what an error looks like.
pub trait ProtocolAdapter: Send + Sync {
    fn api_type(&self) -> ApiType;

    fn completion_paths(&self) -> &'static [&'static str];

    fn is_completion_path(&self, path: &str) -> bool {
        let path = path.split('?').next().unwrap_or(path).trim_end_matches('/');
        self.completion_paths().contains(&path)
    }

    fn apply_auth(&self, headers: &mut HeaderMap, api_key: &str);

    /// Rewrite the outbound JSON body. The default only swaps the model.
    fn prepare_body(&self, body: &mut Value, upstream_model: Option<&str>, _stream: bool) {
        if let (Some(model), Some(obj)) = (upstream_model, body.as_object_mut()) {
            obj.insert("model".to_string(), Value::String(model.to_string()));
        }
    }

    fn extract_usage(&self, body: &Value) -> Option<Usage>;

    /// Fold one decoded SSE event into the running usage.
    fn scan_stream_event(&self, event: Option<&str>, data: &Value, usage: &mut Usage);

    fn error_body(&self, kind: &str, message: &str) -> Value;
}

pub fn adapter_for(api_type: ApiType) -> &'static dyn ProtocolAdapter {
    match api_type {
        ApiType::Anthropic => &AnthropicAdapter,
        ApiType::OpenaiResponses => &OpenAiResponsesAdapter,
        ApiType::OpenaiChat => &OpenAiChatAdapter,
    }
}

pub(crate) fn bearer(headers: &mut HeaderMap, api_key: &str) {
    if let Ok(value) = format!("Bearer {}", api_key).parse() {
        headers.insert(header::AUTHORIZATION, value);
    }
}

/// An inbound call decoded just far enough to route it.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub api_type: ApiType,
    pub method: Method,
    /// path plus query, as received
    pub path: String,
    pub headers: HeaderMap,
    pub client: String,
    pub body: Bytes,
    /// parsed body for completion requests
    pub json: Option<Value>,
    pub model: Option<String>,
    pub stream: bool,
}

impl InboundRequest {
    pub fn decode(
        api_type: ApiType,
        method: Method,
        path: String,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<Self> {
        let client = headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown")
            .to_string();

        let adapter = adapter_for(api_type);
        let mut json = None;
        if method == Method::POST && adapter.is_completion_path(&path) {
            let value: Value = serde_json::from_slice(&body)
                .map_err(|e| GatewayError::BadRequest(format!("invalid JSON body: {}", e)))?;
            if !value.is_object() {
                return Err(GatewayError::BadRequest(
                    "request body must be a JSON object".into(),
                ));
            }
            json = Some(value);
        }

        let model = json
            .as_ref()
            .and_then(|v| v.get("model"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let stream = json
            .as_ref()
            .and_then(|v| v.get("stream"))
            .and_then(Value::as_bool)
            .unwrap_or(false);

        Ok(Self {
            api_type,
            method,
            path,
            headers,
            client,
            body,
            json,
            model,
            stream,
        })
    }

    pub fn is_completion(&self) -> bool {
        self.json.is_some()
    }
}

/// Dialect-shaped error response.
pub fn error_response_body(api_type: ApiType, err: &GatewayError) -> (StatusCode, Value) {
    let body = adapter_for(api_type).error_body(err.kind(), &err.to_string());
    (err.status_code(), body)
}
