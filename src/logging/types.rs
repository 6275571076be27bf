use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ApiType;

/// One finished attempt (or a request that never reached a provider).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestLog {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub api_type: ApiType,
    pub client: String,
    pub method: String,
    pub path: String,
    pub model: Option<String>,
    pub upstream_model: Option<String>,
    pub provider_id: Option<String>,
    pub provider_name: Option<String>,
    pub status: u16,
    pub duration_ms: u64,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost: f64,
    pub cached: bool,
    pub error_message: Option<String>,
}

impl RequestLog {
    pub fn new(api_type: ApiType, method: &str, path: &str, client: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            api_type,
            client: client.to_string(),
            method: method.to_string(),
            path: path.to_string(),
            model: None,
            upstream_model: None,
            provider_id: None,
            provider_name: None,
            status: 0,
            duration_ms: 0,
            input_tokens: 0,
            output_tokens: 0,
            cost: 0.0,
            cached: false,
            error_message: None,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..400).contains(&self.status)
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens as u64 + self.output_tokens as u64
    }
}
