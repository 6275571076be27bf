use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;

use crate::config::settings::HealthConfig;

/// Snapshot of one provider's health.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderHealth {
    pub provider_id: String,
    pub is_healthy: bool,
    pub consecutive_failures: u32,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub last_error_message: Option<String>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub times_tripped: u64,
}

impl ProviderHealth {
    fn fresh(provider_id: &str) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            is_healthy: true,
            consecutive_failures: 0,
            cooldown_until: None,
            last_error_message: None,
            last_failure_at: None,
            times_tripped: 0,
        }
    }
}

/// Permission to send one attempt to a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    /// true when this attempt is the single half-open trial after a cooldown
    pub probe: bool,
}

#[derive(Default)]
struct Detail {
    cooldown_until: Option<Instant>,
    last_error: Option<String>,
    last_failure_at: Option<DateTime<Utc>>,
    relapses: u32,
}

#[derive(Default)]
struct HealthCell {
    consecutive_failures: AtomicU32,
    unhealthy: AtomicBool,
    probe_in_flight: AtomicBool,
    times_tripped: AtomicU64,
    detail: Mutex<Detail>,
}

/// Per-provider circuit state: Healthy -> Unhealthy (cooldown) -> half-open -> Healthy.
pub struct HealthTracker {
    cells: DashMap<String, Arc<HealthCell>>,
    config: HealthConfig,
}

impl HealthTracker {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            cells: DashMap::new(),
            config,
        }
    }

    fn cell(&self, provider_id: &str) -> Arc<HealthCell> {
        if let Some(cell) = self.cells.get(provider_id) {
            return cell.clone();
        }
        self.cells
            .entry(provider_id.to_string())
            .or_default()
            .clone()
    }

    /// Whether the provider may appear in a candidate list right now.
    pub fn is_eligible(&self, provider_id: &str) -> bool {
        self.is_eligible_at(provider_id, Instant::now())
    }

    pub fn is_eligible_at(&self, provider_id: &str, now: Instant) -> bool {
        let Some(cell) = self.cells.get(provider_id).map(|c| c.clone()) else {
            return true;
        };
        if !cell.unhealthy.load(Ordering::Acquire) {
            return true;
        }
        let detail = cell.detail.lock();
        let cooled = detail.cooldown_until.is_none_or(|until| now >= until);
        cooled && !cell.probe_in_flight.load(Ordering::Acquire)
    }

    pub fn admit(&self, provider_id: &str) -> Option<Admission> {
        self.admit_at(provider_id, Instant::now())
    }

    /// Healthy providers are always admitted. An unhealthy provider past its
    /// cooldown admits exactly one probe at a time.
    pub fn admit_at(&self, provider_id: &str, now: Instant) -> Option<Admission> {
        let cell = self.cell(provider_id);
        if !cell.unhealthy.load(Ordering::Acquire) {
            return Some(Admission { probe: false });
        }
        let detail = cell.detail.lock();
        if !cell.unhealthy.load(Ordering::Acquire) {
            return Some(Admission { probe: false });
        }
        if detail.cooldown_until.is_some_and(|until| now < until) {
            return None;
        }
        cell.probe_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Admission { probe: true })
    }

    pub fn record_success(&self, provider_id: &str, admission: Admission) {
        let cell = self.cell(provider_id);
        // 计数和状态在同一把锁内变更，与 record_failure 串行
        let mut detail = cell.detail.lock();
        cell.consecutive_failures.store(0, Ordering::Release);
        if cell.unhealthy.swap(false, Ordering::AcqRel) {
            tracing::info!(provider_id, "provider recovered");
        }
        detail.cooldown_until = None;
        detail.relapses = 0;
        if admission.probe {
            cell.probe_in_flight.store(false, Ordering::Release);
        }
    }

    pub fn record_failure(&self, provider_id: &str, admission: Admission, error: &str) {
        self.record_failure_at(provider_id, admission, error, Instant::now())
    }

    pub fn record_failure_at(
        &self,
        provider_id: &str,
        admission: Admission,
        error: &str,
        now: Instant,
    ) {
        let cell = self.cell(provider_id);
        let mut detail = cell.detail.lock();
        let failures = cell.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        detail.last_error = Some(error.to_string());
        detail.last_failure_at = Some(Utc::now());

        if admission.probe {
            detail.relapses = detail.relapses.saturating_add(1);
            let cooldown = self.cooldown_for(detail.relapses);
            detail.cooldown_until = Some(now + cooldown);
            cell.unhealthy.store(true, Ordering::Release);
            cell.probe_in_flight.store(false, Ordering::Release);
            tracing::warn!(
                provider_id,
                cooldown_secs = cooldown.as_secs(),
                error,
                "half-open probe failed, cooling down again"
            );
        } else if failures >= self.config.failure_threshold
            && !cell.unhealthy.load(Ordering::Acquire)
        {
            let cooldown = self.config.cooldown();
            detail.cooldown_until = Some(now + cooldown);
            detail.relapses = 0;
            cell.unhealthy.store(true, Ordering::Release);
            cell.times_tripped.fetch_add(1, Ordering::AcqRel);
            tracing::warn!(
                provider_id,
                failures,
                cooldown_secs = cooldown.as_secs(),
                error,
                "provider marked unhealthy"
            );
        }
    }

    /// An attempt ended without a verdict (caller went away).
    pub fn release(&self, provider_id: &str, admission: Admission) {
        if admission.probe {
            self.cell(provider_id)
                .probe_in_flight
                .store(false, Ordering::Release);
        }
    }

    fn cooldown_for(&self, relapses: u32) -> Duration {
        let base = self.config.cooldown();
        if !self.config.relapse_backoff {
            return base;
        }
        let factor = 1u32.checked_shl(relapses.min(16)).unwrap_or(u32::MAX);
        base.saturating_mul(factor).min(self.config.max_cooldown())
    }

    pub fn reset(&self, provider_id: &str) {
        self.cells.remove(provider_id);
        tracing::info!(provider_id, "health state reset");
    }

    /// Drop state for providers that no longer exist.
    pub fn retain(&self, live_ids: &[String]) {
        self.cells.retain(|id, _| live_ids.iter().any(|l| l == id));
    }

    pub fn snapshot(&self, provider_id: &str) -> ProviderHealth {
        let Some(cell) = self.cells.get(provider_id).map(|c| c.clone()) else {
            return ProviderHealth::fresh(provider_id);
        };
        let detail = cell.detail.lock();
        let now = Instant::now();
        let wall = Utc::now();
        let cooldown_until = detail.cooldown_until.map(|until| {
            let remaining = until.saturating_duration_since(now);
            wall + chrono::Duration::from_std(remaining).unwrap_or_default()
        });
        ProviderHealth {
            provider_id: provider_id.to_string(),
            is_healthy: !cell.unhealthy.load(Ordering::Acquire),
            consecutive_failures: cell.consecutive_failures.load(Ordering::Acquire),
            cooldown_until,
            last_error_message: detail.last_error.clone(),
            last_failure_at: detail.last_failure_at,
            times_tripped: cell.times_tripped.load(Ordering::Acquire),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NORMAL: Admission = Admission { probe: false };

    fn tracker() -> HealthTracker {
        HealthTracker::new(HealthConfig::default())
    }

    #[test]
    fn trips_after_threshold_and_excludes_until_cooldown() {
        let t = tracker();
        let now = Instant::now();
        t.record_failure_at("a", NORMAL, "500", now);
        t.record_failure_at("a", NORMAL, "500", now);
        assert!(t.snapshot("a").is_healthy);
        assert!(t.is_eligible_at("a", now));

        t.record_failure_at("a", NORMAL, "boom", now);
        let h = t.snapshot("a");
        assert!(!h.is_healthy);
        assert_eq!(h.consecutive_failures, 3);
        assert_eq!(h.last_error_message.as_deref(), Some("boom"));
        assert!(h.cooldown_until.is_some());

        assert!(!t.is_eligible_at("a", now + Duration::from_secs(59)));
        assert_eq!(t.admit_at("a", now + Duration::from_secs(59)), None);
        assert!(t.is_eligible_at("a", now + Duration::from_secs(60)));
    }

    #[test]
    fn success_resets_counter() {
        let t = tracker();
        t.record_failure("a", NORMAL, "x");
        t.record_failure("a", NORMAL, "x");
        t.record_success("a", NORMAL);
        assert_eq!(t.snapshot("a").consecutive_failures, 0);
        t.record_failure("a", NORMAL, "x");
        t.record_failure("a", NORMAL, "x");
        assert!(t.snapshot("a").is_healthy);
    }

    #[test]
    fn late_success_closes_the_circuit() {
        let t = tracker();
        let now = Instant::now();
        for _ in 0..3 {
            t.record_failure_at("a", NORMAL, "x", now);
        }
        // 熔断前已放行的请求成功返回
        t.record_success("a", NORMAL);
        let h = t.snapshot("a");
        assert!(h.is_healthy);
        assert_eq!(h.consecutive_failures, 0);
        assert!(h.cooldown_until.is_none());

        t.record_failure_at("a", NORMAL, "x", now);
        let h = t.snapshot("a");
        assert!(h.is_healthy);
        assert_eq!(h.consecutive_failures, 1);
    }

    #[test]
    fn failures_while_open_do_not_rearm_cooldown() {
        let t = tracker();
        let now = Instant::now();
        for _ in 0..3 {
            t.record_failure_at("a", NORMAL, "x", now);
        }
        t.record_failure_at("a", NORMAL, "late", now + Duration::from_secs(30));
        assert_eq!(t.snapshot("a").times_tripped, 1);
        assert_eq!(t.snapshot("a").consecutive_failures, 4);
        assert!(t.is_eligible_at("a", now + Duration::from_secs(60)));
    }

    #[test]
    fn half_open_admits_a_single_probe() {
        let t = tracker();
        let now = Instant::now();
        for _ in 0..3 {
            t.record_failure_at("a", NORMAL, "x", now);
        }
        let later = now + Duration::from_secs(61);
        let probe = t.admit_at("a", later).unwrap();
        assert!(probe.probe);
        assert_eq!(t.admit_at("a", later), None);
        assert!(!t.is_eligible_at("a", later));

        t.record_success("a", probe);
        let h = t.snapshot("a");
        assert!(h.is_healthy);
        assert!(h.cooldown_until.is_none());
        assert_eq!(t.admit_at("a", later), Some(NORMAL));
    }

    #[test]
    fn failed_probe_rearms_cooldown_and_backs_off_when_enabled() {
        let t = HealthTracker::new(HealthConfig {
            relapse_backoff: true,
            ..HealthConfig::default()
        });
        let now = Instant::now();
        for _ in 0..3 {
            t.record_failure_at("a", NORMAL, "x", now);
        }
        let t1 = now + Duration::from_secs(60);
        let probe = t.admit_at("a", t1).unwrap();
        t.record_failure_at("a", probe, "still down", t1);

        // 第一次复发：冷却翻倍到 120s
        assert_eq!(t.admit_at("a", t1 + Duration::from_secs(119)), None);
        assert!(t.admit_at("a", t1 + Duration::from_secs(120)).is_some());
        assert_eq!(t.snapshot("a").times_tripped, 1);
    }

    #[test]
    fn backoff_is_capped() {
        let t = HealthTracker::new(HealthConfig {
            relapse_backoff: true,
            ..HealthConfig::default()
        });
        assert_eq!(t.cooldown_for(1), Duration::from_secs(120));
        assert_eq!(t.cooldown_for(10), Duration::from_secs(600));
        assert_eq!(tracker().cooldown_for(10), Duration::from_secs(60));
    }

    #[test]
    fn released_probe_frees_the_slot() {
        let t = tracker();
        let now = Instant::now();
        for _ in 0..3 {
            t.record_failure_at("a", NORMAL, "x", now);
        }
        let later = now + Duration::from_secs(60);
        let probe = t.admit_at("a", later).unwrap();
        t.release("a", probe);
        assert!(t.admit_at("a", later).unwrap().probe);
    }

    #[test]
    fn reset_forgets_state() {
        let t = tracker();
        for _ in 0..3 {
            t.record_failure("a", NORMAL, "x");
        }
        t.reset("a");
        assert_eq!(t.snapshot("a"), ProviderHealth::fresh("a"));
    }

    #[test]
    fn concurrent_failures_trip_exactly_once() {
        let t = Arc::new(tracker());
        let n = 64;
        let handles: Vec<_> = (0..n)
            .map(|_| {
                let t = t.clone();
                std::thread::spawn(move || t.record_failure("shared", NORMAL, "500"))
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let h = t.snapshot("shared");
        assert!(!h.is_healthy);
        assert_eq!(h.consecutive_failures, n);
        assert_eq!(h.times_tripped, 1);
    }

    #[test]
    fn mixed_outcomes_never_leave_an_open_circuit_below_threshold() {
        for _ in 0..200 {
            let t = Arc::new(tracker());
            let barrier = Arc::new(std::sync::Barrier::new(4));
            let handles: Vec<_> = (0..4)
                .map(|i| {
                    let t = t.clone();
                    let barrier = barrier.clone();
                    std::thread::spawn(move || {
                        barrier.wait();
                        for _ in 0..8 {
                            if i == 0 {
                                t.record_success("p", NORMAL);
                            } else {
                                t.record_failure("p", NORMAL, "500");
                            }
                        }
                    })
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }
            let h = t.snapshot("p");
            if !h.is_healthy {
                assert!(h.consecutive_failures >= 3, "{:?}", h);
            }
        }
    }
}
