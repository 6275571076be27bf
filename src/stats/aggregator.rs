use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;

use super::types::{GatewayStats, HourlyStat, ProviderCounters, ProviderStats, Totals};
use crate::config::Provider;
use crate::config::settings::StatsConfig;
use crate::logging::RequestLog;
use crate::logging::time::hour_start;
use crate::routing::HealthTracker;

#[derive(Default)]
struct ProviderWindow {
    requests: u64,
    successful: u64,
    latency_sum_ms: u64,
    latencies: VecDeque<u64>,
    input_tokens: u64,
    output_tokens: u64,
    cost: f64,
}

#[derive(Default)]
struct Inner {
    totals: Totals,
    providers: HashMap<String, ProviderWindow>,
    hourly: BTreeMap<DateTime<Utc>, HourlyStat>,
    /// newest first
    recent: VecDeque<RequestLog>,
}

/// Folds every RequestLog into lifetime, per-provider and hourly counters.
///
/// One short critical section per record; nothing here awaits.
pub struct StatsAggregator {
    inner: Mutex<Inner>,
    config: StatsConfig,
}

impl StatsAggregator {
    pub fn new(config: StatsConfig) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            config,
        }
    }

    pub fn record(&self, log: &RequestLog) {
        let success = log.is_success();
        let mut inner = self.inner.lock();

        let totals = &mut inner.totals;
        totals.total_requests += 1;
        if success {
            totals.successful_requests += 1;
        } else {
            totals.failed_requests += 1;
        }
        totals.total_input_tokens += log.input_tokens as u64;
        totals.total_output_tokens += log.output_tokens as u64;
        totals.total_cost += log.cost;
        if log.cached {
            totals.cache_hits += 1;
        }

        let bucket = inner
            .hourly
            .entry(hour_start(log.timestamp))
            .or_insert_with_key(|hour| HourlyStat::empty(*hour));
        bucket.requests += 1;
        if success {
            bucket.successful_requests += 1;
        }
        if log.cached {
            bucket.cache_hits += 1;
        }
        bucket.input_tokens += log.input_tokens as u64;
        bucket.output_tokens += log.output_tokens as u64;
        bucket.cost += log.cost;

        // 缓存命中不计入供应商维度
        if let (false, Some(provider_id)) = (log.cached, log.provider_id.as_ref()) {
            let window = inner.providers.entry(provider_id.clone()).or_default();
            window.requests += 1;
            if success {
                window.successful += 1;
            }
            window.latency_sum_ms = window.latency_sum_ms.saturating_add(log.duration_ms);
            window.latencies.push_back(log.duration_ms);
            while window.latencies.len() > self.config.latency_window {
                window.latencies.pop_front();
            }
            window.input_tokens += log.input_tokens as u64;
            window.output_tokens += log.output_tokens as u64;
            window.cost += log.cost;
        }

        inner.recent.push_front(log.clone());
        inner.recent.truncate(self.config.recent_capacity);
    }

    pub fn record_cache_miss(&self) {
        self.inner.lock().totals.cache_misses += 1;
    }

    pub fn totals(&self) -> Totals {
        self.inner.lock().totals.clone()
    }

    pub fn provider_counters(&self, provider_id: &str) -> ProviderCounters {
        let inner = self.inner.lock();
        let Some(w) = inner.providers.get(provider_id) else {
            return ProviderCounters::default();
        };
        ProviderCounters {
            total_requests: w.requests,
            successful_requests: w.successful,
            avg_latency_ms: if w.requests == 0 {
                0.0
            } else {
                w.latency_sum_ms as f64 / w.requests as f64
            },
            p95_latency_ms: p95(&w.latencies),
            input_tokens: w.input_tokens,
            output_tokens: w.output_tokens,
            total_cost: w.cost,
        }
    }

    /// Newest first, at most `limit` entries.
    pub fn recent(&self, limit: usize) -> Vec<RequestLog> {
        self.inner.lock().recent.iter().take(limit).cloned().collect()
    }

    pub fn hourly(&self, hours: usize) -> Vec<HourlyStat> {
        self.hourly_at(hours, Utc::now())
    }

    /// Dense series of the `hours` buckets ending with the hour containing
    /// `now`, oldest first; hours without traffic are zero-filled.
    pub fn hourly_at(&self, hours: usize, now: DateTime<Utc>) -> Vec<HourlyStat> {
        if hours == 0 {
            return vec![];
        }
        let end = hour_start(now);
        let start = end - TimeDelta::hours(hours as i64 - 1);
        let inner = self.inner.lock();
        let mut out = Vec::with_capacity(hours);
        let mut hour = start;
        while hour <= end {
            out.push(
                inner
                    .hourly
                    .get(&hour)
                    .cloned()
                    .unwrap_or_else(|| HourlyStat::empty(hour)),
            );
            hour += TimeDelta::hours(1);
        }
        out
    }

    pub fn snapshot(&self, providers: &[Provider], health: &HealthTracker) -> GatewayStats {
        let provider_stats = providers
            .iter()
            .map(|p| {
                let c = self.provider_counters(&p.id);
                let failed = c.total_requests - c.successful_requests;
                ProviderStats {
                    provider_id: p.id.clone(),
                    name: p.name.clone(),
                    enabled: p.enabled,
                    health: health.snapshot(&p.id),
                    total_requests: c.total_requests,
                    successful_requests: c.successful_requests,
                    failed_requests: failed,
                    success_rate: ratio(c.successful_requests, c.total_requests),
                    avg_latency_ms: c.avg_latency_ms,
                    p95_latency_ms: c.p95_latency_ms,
                    total_tokens: c.input_tokens + c.output_tokens,
                    total_cost: c.total_cost,
                }
            })
            .collect();

        let totals = self.totals();
        GatewayStats {
            total_tokens: totals.total_input_tokens + totals.total_output_tokens,
            cache_hit_rate: ratio(totals.cache_hits, totals.cache_hits + totals.cache_misses),
            totals,
            providers: provider_stats,
            recent: self.recent(self.config.recent_capacity),
            hourly: self.hourly(self.config.hourly_snapshot_hours),
            generated_at: Utc::now(),
        }
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

// nearest-rank: idx = ceil(n * 0.95)
fn p95(window: &VecDeque<u64>) -> u64 {
    if window.is_empty() {
        return 0;
    }
    let mut sorted: Vec<u64> = window.iter().copied().collect();
    sorted.sort_unstable();
    let n = sorted.len();
    let idx = (n * 95).div_ceil(100);
    sorted[idx.clamp(1, n) - 1]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ApiType;
    use crate::config::settings::HealthConfig;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, h, m, 0).unwrap()
    }

    fn log(provider: &str, status: u16, ms: u64, ts: DateTime<Utc>) -> RequestLog {
        let mut log = RequestLog::new(ApiType::OpenaiChat, "POST", "/v1/chat/completions", "t");
        log.provider_id = Some(provider.to_string());
        log.status = status;
        log.duration_ms = ms;
        log.timestamp = ts;
        log.input_tokens = 10;
        log.output_tokens = 5;
        log.cost = 0.01;
        log
    }

    fn aggregator() -> StatsAggregator {
        StatsAggregator::new(StatsConfig::default())
    }

    #[test]
    fn hourly_buckets_split_on_hour_boundary() {
        let s = aggregator();
        s.record(&log("a", 200, 10, at(9, 0)));
        s.record(&log("a", 200, 10, at(9, 59)));
        s.record(&log("a", 500, 10, at(10, 0)));

        let series = s.hourly_at(3, at(10, 30));
        assert_eq!(series.len(), 3);
        assert_eq!(series[0].hour, at(8, 0));
        assert_eq!(series[0].requests, 0);
        assert_eq!(series[1].requests, 2);
        assert_eq!(series[1].input_tokens, 20);
        assert_eq!(series[2].requests, 1);
        assert_eq!(series[2].successful_requests, 0);
    }

    #[test]
    fn p95_uses_nearest_rank_over_window() {
        let s = StatsAggregator::new(StatsConfig {
            latency_window: 20,
            ..StatsConfig::default()
        });
        // 前 5 条会被窗口挤掉
        for ms in [10_000; 5] {
            s.record(&log("a", 200, ms, at(1, 0)));
        }
        for ms in 1..=20 {
            s.record(&log("a", 200, ms, at(1, 0)));
        }
        let c = s.provider_counters("a");
        assert_eq!(c.total_requests, 25);
        assert_eq!(c.p95_latency_ms, 19);
        assert_eq!(c.avg_latency_ms, (50_000.0 + 210.0) / 25.0);
    }

    #[test]
    fn cached_entries_skip_provider_counters() {
        let s = aggregator();
        let mut hit = log("a", 200, 0, at(2, 0));
        hit.cached = true;
        hit.input_tokens = 0;
        hit.output_tokens = 0;
        hit.cost = 0.0;
        s.record(&hit);
        s.record_cache_miss();

        let t = s.totals();
        assert_eq!(t.total_requests, 1);
        assert_eq!(t.cache_hits, 1);
        assert_eq!(t.cache_misses, 1);
        assert_eq!(s.provider_counters("a"), ProviderCounters::default());
    }

    #[test]
    fn recent_ring_is_bounded_and_newest_first() {
        let s = StatsAggregator::new(StatsConfig {
            recent_capacity: 3,
            ..StatsConfig::default()
        });
        for i in 0..5 {
            s.record(&log(&format!("p{}", i), 200, 1, at(3, i)));
        }
        let ids: Vec<_> = s
            .recent(10)
            .into_iter()
            .filter_map(|l| l.provider_id)
            .collect();
        assert_eq!(ids, ["p4", "p3", "p2"]);
        assert_eq!(s.totals().total_requests, 5);
    }

    #[test]
    fn snapshot_merges_health_and_counters() {
        let s = aggregator();
        let health = HealthTracker::new(HealthConfig::default());
        s.record(&log("a", 500, 30, Utc::now()));
        s.record(&log("a", 200, 10, Utc::now()));
        health.record_failure("a", crate::routing::Admission { probe: false }, "500");

        let provider: Provider = serde_json::from_value(serde_json::json!({
            "id": "a", "name": "A", "base_url": "http://127.0.0.1:1"
        }))
        .unwrap();
        let snap = s.snapshot(&[provider], &health);
        assert_eq!(snap.totals.total_requests, 2);
        assert_eq!(snap.totals.failed_requests, 1);
        assert_eq!(snap.total_tokens, 30);
        assert_eq!(snap.hourly.len(), 24);
        let a = &snap.providers[0];
        assert_eq!(a.success_rate, 0.5);
        assert_eq!(a.health.consecutive_failures, 1);
        assert_eq!(a.avg_latency_ms, 20.0);
    }
}
