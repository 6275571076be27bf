use axum::http::HeaderMap;
use serde_json::{Value, json};

use super::{ProtocolAdapter, Usage, bearer, read_u32};
use crate::config::ApiType;

pub struct OpenAiChatAdapter;

impl ProtocolAdapter for OpenAiChatAdapter {
    fn api_type(&self) -> ApiType {
        ApiType::OpenaiChat
    }

    fn completion_paths(&self) -> &'static [&'static str] {
        &["/v1/chat/completions", "/chat/completions"]
    }

    fn apply_auth(&self, headers: &mut HeaderMap, api_key: &str) {
        bearer(headers, api_key);
    }

    fn prepare_body(&self, body: &mut Value, upstream_model: Option<&str>, stream: bool) {
        let Some(obj) = body.as_object_mut() else {
            return;
        };
        if let Some(model) = upstream_model {
            obj.insert("model".to_string(), Value::String(model.to_string()));
        }
        // 流式请求默认不带 usage，主动要求上游在最后一个 chunk 返回
        if stream && !obj.contains_key("stream_options") {
            obj.insert("stream_options".to_string(), json!({"include_usage": true}));
        }
    }

    fn extract_usage(&self, body: &Value) -> Option<Usage> {
        let usage = body.get("usage").filter(|u| u.is_object())?;
        Some(Usage {
            input_tokens: read_u32(usage, "prompt_tokens").unwrap_or(0),
            output_tokens: read_u32(usage, "completion_tokens").unwrap_or(0),
        })
    }

    fn scan_stream_event(&self, _event: Option<&str>, data: &Value, usage: &mut Usage) {
        if let Some(found) = self.extract_usage(data) {
            *usage = found;
        }
    }

    fn error_body(&self, kind: &str, message: &str) -> Value {
        openai_error_body(kind, message)
    }
}

pub(crate) fn openai_error_body(kind: &str, message: &str) -> Value {
    json!({
        "error": {
            "message": message,
            "type": kind,
            "code": kind,
        }
    })
}
