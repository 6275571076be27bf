use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::cache::{CachedResponse, MemoryCache, ResponseCache, VARY_HEADERS, fingerprint};
use crate::config::{GatewayConfig, Provider, Settings};
use crate::error::{GatewayError, Result};
use crate::events::{BroadcastPublisher, GatewayEvent};
use crate::logging::database::DatabaseLogger;
use crate::logging::recorder::{replay_archive, spawn_archive_writer};
use crate::logging::{RequestLog, RequestRecorder};
use crate::providers::{HttpUpstream, InboundRequest, Upstream};
use crate::routing::router::OutcomeBody;
use crate::routing::{HealthTracker, ProviderHealth, ProviderRegistry, Router};
use crate::stats::{GatewayStats, HourlyStat, StatsAggregator};

pub const CACHE_HEADER: &str = "x-gateway-cache";

/// What a dialect listener sends back to its caller.
pub struct GatewayResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: OutcomeBody,
    pub cache_hit: bool,
}

/// Wires registry, health, router, cache, stats and events together and
/// exposes the operations used by the listeners and the management API.
pub struct Gateway {
    registry: Arc<ProviderRegistry>,
    health: Arc<HealthTracker>,
    router: Router,
    cache: Arc<dyn ResponseCache>,
    stats: Arc<StatsAggregator>,
    recorder: RequestRecorder,
    events: Arc<BroadcastPublisher>,
    settings: Settings,
}

impl Gateway {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        upstream: Arc<dyn Upstream>,
        cache: Arc<dyn ResponseCache>,
        recorder: RequestRecorder,
        events: Arc<BroadcastPublisher>,
        settings: Settings,
    ) -> Self {
        let health = Arc::new(HealthTracker::new(settings.health.clone()));
        let router = Router::new(
            registry.clone(),
            health.clone(),
            upstream,
            recorder.clone(),
            events.clone(),
            Duration::from_secs(settings.upstream.timeout_secs),
        );
        Self {
            registry,
            health,
            router,
            cache,
            stats: recorder.stats().clone(),
            recorder,
            events,
            settings,
        }
    }

    /// Build the production gateway: JSON config file, SQLite archive
    /// (replayed into the aggregator) and the reqwest transport.
    pub async fn from_settings(settings: Settings) -> Result<(Arc<Self>, Option<JoinHandle<()>>)> {
        let events = Arc::new(BroadcastPublisher::default());
        let registry = Arc::new(ProviderRegistry::open(
            &settings.gateway.config_path,
            events.clone(),
        )?);
        let stats = Arc::new(StatsAggregator::new(settings.stats.clone()));

        let (recorder, writer) = if settings.logging.persist_requests {
            let db = DatabaseLogger::new(&settings.logging.database_path).await?;
            match replay_archive(&db, &stats).await {
                Ok(replayed) => tracing::info!(replayed, "statistics restored from request archive"),
                Err(e) => tracing::warn!("request archive could not be replayed: {}", e),
            }
            let (tx, handle) = spawn_archive_writer(db, settings.logging.archive_queue);
            (RequestRecorder::with_archive(stats.clone(), tx), Some(handle))
        } else {
            (RequestRecorder::new(stats.clone()), None)
        };

        let upstream = Arc::new(HttpUpstream::new(Duration::from_secs(30))?);
        let cache = Arc::new(MemoryCache::from_config(&settings.cache));
        let gateway = Self::new(registry, upstream, cache, recorder, events, settings);
        Ok((Arc::new(gateway), writer))
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.events.subscribe()
    }

    pub fn recorder(&self) -> &RequestRecorder {
        &self.recorder
    }

    // ---- 请求处理 ----

    pub async fn handle(&self, request: InboundRequest) -> Result<GatewayResponse> {
        let cache_key = self.cache_key(&request);

        if let Some(key) = &cache_key {
            match self.cache.get(key).await {
                Ok(Some(hit)) => return Ok(self.serve_cached(&request, hit)),
                Ok(None) => self.stats.record_cache_miss(),
                Err(e) => {
                    tracing::warn!("cache lookup failed, treating as miss: {}", e);
                    self.stats.record_cache_miss();
                }
            }
        }

        let outcome = self.router.route(&request).await?;

        // 先复制出 Bytes，await 期间不持有对流式 body 的借用
        let cacheable = match (&cache_key, &outcome.body) {
            (Some(_), OutcomeBody::Full(body))
                if outcome.status.is_success()
                    && body.len() <= self.settings.cache.max_entry_bytes =>
            {
                Some(body.clone())
            }
            _ => None,
        };
        if let (Some(key), Some(body)) = (cache_key, cacheable) {
            let entry = CachedResponse {
                status: outcome.status.as_u16(),
                content_type: outcome
                    .headers
                    .get(header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string),
                body,
                provider_id: outcome.provider_id.clone(),
                provider_name: outcome.provider_name.clone(),
                upstream_model: outcome.upstream_model.clone(),
                stored_at: chrono::Utc::now(),
            };
            if let Err(e) = self.cache.put(key, entry).await {
                tracing::warn!("cache store failed: {}", e);
            }
        }

        let mut headers = outcome.headers;
        if cache_key_enabled(&self.settings, &request) {
            headers.insert(
                HeaderName::from_static(CACHE_HEADER),
                HeaderValue::from_static("miss"),
            );
        }
        Ok(GatewayResponse {
            status: outcome.status,
            headers,
            body: outcome.body,
            cache_hit: false,
        })
    }

    fn cache_key(&self, request: &InboundRequest) -> Option<String> {
        if !cache_key_enabled(&self.settings, request) {
            return None;
        }
        let json = request.json.as_ref()?;
        let mut variants = Vec::new();
        if let Some((_, query)) = request.path.split_once('?')
            && !query.is_empty()
        {
            variants.push(("query", query));
        }
        for name in VARY_HEADERS {
            if let Some(value) = request.headers.get(*name).and_then(|v| v.to_str().ok()) {
                variants.push((*name, value));
            }
        }
        Some(fingerprint(
            request.api_type,
            request.model.as_deref().unwrap_or_default(),
            &variants,
            json,
        ))
    }

    fn serve_cached(&self, request: &InboundRequest, hit: CachedResponse) -> GatewayResponse {
        let mut log = RequestLog::new(
            request.api_type,
            request.method.as_str(),
            &request.path,
            &request.client,
        );
        log.model = request.model.clone();
        log.upstream_model = hit.upstream_model.clone();
        log.provider_id = Some(hit.provider_id.clone());
        log.provider_name = Some(hit.provider_name.clone());
        log.status = hit.status;
        log.cached = true;
        self.recorder.record(log);

        let mut headers = HeaderMap::new();
        if let Some(ct) = hit.content_type.as_deref().and_then(|v| HeaderValue::from_str(v).ok()) {
            headers.insert(header::CONTENT_TYPE, ct);
        }
        headers.insert(
            HeaderName::from_static(CACHE_HEADER),
            HeaderValue::from_static("hit"),
        );
        GatewayResponse {
            status: StatusCode::from_u16(hit.status).unwrap_or(StatusCode::OK),
            headers,
            body: OutcomeBody::Full(hit.body),
            cache_hit: true,
        }
    }

    // ---- 配置管理 ----

    pub fn config(&self) -> GatewayConfig {
        GatewayConfig::clone(&self.registry.snapshot())
    }

    pub async fn replace_config(&self, config: GatewayConfig) -> Result<()> {
        self.registry.replace(config)?;
        self.after_config_change().await;
        Ok(())
    }

    pub fn providers(&self) -> Vec<Provider> {
        self.registry.list()
    }

    pub async fn add_provider(&self, provider: Provider) -> Result<String> {
        let id = self.registry.add(provider)?;
        self.after_config_change().await;
        Ok(id)
    }

    pub async fn update_provider(&self, id: &str, provider: Provider) -> Result<()> {
        self.registry.update(id, provider)?;
        self.after_config_change().await;
        Ok(())
    }

    pub async fn remove_provider(&self, id: &str) -> Result<Provider> {
        let removed = self.registry.remove(id)?;
        self.after_config_change().await;
        Ok(removed)
    }

    pub async fn reorder_providers(&self, ids: &[String]) -> Result<()> {
        self.registry.reorder(ids)?;
        self.after_config_change().await;
        Ok(())
    }

    async fn after_config_change(&self) {
        let live: Vec<String> = self.registry.list().into_iter().map(|p| p.id).collect();
        self.health.retain(&live);
        if let Err(e) = self.cache.clear().await {
            tracing::warn!("failed to clear response cache after config change: {}", e);
        }
    }

    // ---- 状态快照 ----

    pub fn stats(&self) -> GatewayStats {
        self.stats.snapshot(&self.registry.list(), &self.health)
    }

    pub fn hourly(&self, hours: usize) -> Vec<HourlyStat> {
        self.stats.hourly(hours)
    }

    pub fn recent(&self, limit: usize) -> Vec<RequestLog> {
        self.stats.recent(limit)
    }

    pub fn health(&self) -> Vec<ProviderHealth> {
        self.registry
            .list()
            .iter()
            .map(|p| self.health.snapshot(&p.id))
            .collect()
    }

    pub fn reset_health(&self, id: &str) -> Result<ProviderHealth> {
        if self.registry.get(id).is_none() {
            return Err(GatewayError::NotFound(format!("provider '{}'", id)));
        }
        self.health.reset(id);
        Ok(self.health.snapshot(id))
    }

    pub async fn clear_cache(&self) -> Result<usize> {
        let dropped = self.cache.len();
        self.cache.clear().await?;
        Ok(dropped)
    }
}

fn cache_key_enabled(settings: &Settings, request: &InboundRequest) -> bool {
    settings.cache.enabled
        && request.method == Method::POST
        && request.is_completion()
        && !request.stream
}
