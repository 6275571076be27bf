use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::logging::RequestLog;
use crate::routing::ProviderHealth;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HourlyStat {
    /// start of the UTC hour
    pub hour: DateTime<Utc>,
    pub requests: u64,
    pub successful_requests: u64,
    pub cache_hits: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
}

impl HourlyStat {
    pub fn empty(hour: DateTime<Utc>) -> Self {
        Self {
            hour,
            requests: 0,
            successful_requests: 0,
            cache_hits: 0,
            input_tokens: 0,
            output_tokens: 0,
            cost: 0.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Totals {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_cost: f64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

/// Counters for one provider, without health.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProviderCounters {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub avg_latency_ms: f64,
    pub p95_latency_ms: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_cost: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderStats {
    pub provider_id: String,
    pub name: String,
    pub enabled: bool,
    pub health: ProviderHealth,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub p95_latency_ms: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GatewayStats {
    #[serde(flatten)]
    pub totals: Totals,
    pub total_tokens: u64,
    pub cache_hit_rate: f64,
    pub providers: Vec<ProviderStats>,
    pub recent: Vec<RequestLog>,
    pub hourly: Vec<HourlyStat>,
    pub generated_at: DateTime<Utc>,
}
