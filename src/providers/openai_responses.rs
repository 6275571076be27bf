use axum::http::HeaderMap;
use serde_json::Value;

use super::openai_chat::openai_error_body;
use super::{ProtocolAdapter, Usage, bearer, read_u32};
use crate::config::ApiType;

pub struct OpenAiResponsesAdapter;

impl ProtocolAdapter for OpenAiResponsesAdapter {
    fn api_type(&self) -> ApiType {
        ApiType::OpenaiResponses
    }

    fn completion_paths(&self) -> &'static [&'static str] {
        &["/v1/responses", "/responses"]
    }

    fn apply_auth(&self, headers: &mut HeaderMap, api_key: &str) {
        bearer(headers, api_key);
    }

    fn extract_usage(&self, body: &Value) -> Option<Usage> {
        let usage = body.get("usage").filter(|u| u.is_object())?;
        Some(Usage {
            input_tokens: read_u32(usage, "input_tokens").unwrap_or(0),
            output_tokens: read_u32(usage, "output_tokens").unwrap_or(0),
        })
    }

    fn scan_stream_event(&self, event: Option<&str>, data: &Value, usage: &mut Usage) {
        let kind = event.or_else(|| data.get("type").and_then(Value::as_str));
        if !matches!(
            kind,
            Some("response.completed") | Some("response.incomplete") | Some("response.failed")
        ) {
            return;
        }
        if let Some(found) = data.get("response").and_then(|r| self.extract_usage(r)) {
            *usage = found;
        }
    }

    fn error_body(&self, kind: &str, message: &str) -> Value {
        openai_error_body(kind, message)
    }
}
