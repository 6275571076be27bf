use axum::http::{HeaderMap, HeaderName, HeaderValue};
use serde_json::{Value, json};

use super::{ProtocolAdapter, Usage, bearer, read_u32};
use crate::config::ApiType;

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicAdapter;

impl ProtocolAdapter for AnthropicAdapter {
    fn api_type(&self) -> ApiType {
        ApiType::Anthropic
    }

    fn completion_paths(&self) -> &'static [&'static str] {
        &["/v1/messages", "/messages"]
    }

    fn apply_auth(&self, headers: &mut HeaderMap, api_key: &str) {
        if let Ok(value) = HeaderValue::from_str(api_key) {
            headers.insert(HeaderName::from_static("x-api-key"), value);
        }
        // 有些兼容网关只认 Bearer
        bearer(headers, api_key);
        headers
            .entry(HeaderName::from_static("anthropic-version"))
            .or_insert(HeaderValue::from_static(ANTHROPIC_VERSION));
    }

    fn extract_usage(&self, body: &Value) -> Option<Usage> {
        let usage = body.get("usage")?;
        Some(Usage {
            input_tokens: input_tokens(usage),
            output_tokens: read_u32(usage, "output_tokens").unwrap_or(0),
        })
    }

    fn scan_stream_event(&self, event: Option<&str>, data: &Value, usage: &mut Usage) {
        let kind = event.or_else(|| data.get("type").and_then(Value::as_str));
        match kind {
            Some("message_start") => {
                if let Some(u) = data.get("message").and_then(|m| m.get("usage")) {
                    usage.input_tokens = input_tokens(u);
                    usage.output_tokens = read_u32(u, "output_tokens").unwrap_or(0);
                }
            }
            Some("message_delta") => {
                if let Some(u) = data.get("usage") {
                    // message_delta 中的 output_tokens 是累计值
                    if let Some(out) = read_u32(u, "output_tokens") {
                        usage.output_tokens = out;
                    }
                    let input = input_tokens(u);
                    if input > 0 {
                        usage.input_tokens = input;
                    }
                }
            }
            _ => {}
        }
    }

    fn error_body(&self, kind: &str, message: &str) -> Value {
        json!({
            "type": "error",
            "error": {
                "type": kind,
                "message": message,
            }
        })
    }
}

fn input_tokens(usage: &Value) -> u32 {
    ["input_tokens", "cache_creation_input_tokens", "cache_read_input_tokens"]
        .iter()
        .filter_map(|k| read_u32(usage, k))
        .fold(0u32, u32::saturating_add)
}
