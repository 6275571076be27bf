use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use crate::config::{GatewayConfig, Provider};
use crate::error::GatewayError;
use crate::gateway::Gateway;
use crate::logging::RequestLog;
use crate::routing::ProviderHealth;
use crate::stats::{GatewayStats, HourlyStat};

const MAX_HOURLY_WINDOW: usize = 24 * 30;
const DEFAULT_RECENT_LIMIT: usize = 50;

pub fn routes() -> Router<Arc<Gateway>> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/config", get(get_config).put(replace_config))
        .route("/api/providers", get(list_providers).post(create_provider))
        .route("/api/providers/reorder", post(reorder_providers))
        .route(
            "/api/providers/{id}",
            put(update_provider).delete(delete_provider),
        )
        .route("/api/stats", get(stats))
        .route("/api/stats/hourly", get(hourly))
        .route("/api/stats/recent", get(recent))
        .route("/api/health", get(health))
        .route("/api/health/{id}/reset", post(reset_health))
        .route("/api/cache", delete(clear_cache))
        .route("/api/events", get(events))
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

// ---- 配置 ----

async fn get_config(State(gateway): State<Arc<Gateway>>) -> Json<GatewayConfig> {
    Json(gateway.config().redacted())
}

async fn replace_config(
    State(gateway): State<Arc<Gateway>>,
    Json(config): Json<GatewayConfig>,
) -> Result<Json<GatewayConfig>, GatewayError> {
    gateway.replace_config(config).await?;
    Ok(Json(gateway.config().redacted()))
}

// ---- 供应商 ----

async fn list_providers(State(gateway): State<Arc<Gateway>>) -> Json<Vec<Provider>> {
    Json(gateway.providers().iter().map(Provider::redacted).collect())
}

async fn create_provider(
    State(gateway): State<Arc<Gateway>>,
    Json(provider): Json<Provider>,
) -> Result<Response, GatewayError> {
    let id = gateway.add_provider(provider).await?;
    let created = gateway
        .registry()
        .get(&id)
        .ok_or_else(|| GatewayError::NotFound(format!("provider '{}'", id)))?;
    Ok((StatusCode::CREATED, Json(created.redacted())).into_response())
}

async fn update_provider(
    State(gateway): State<Arc<Gateway>>,
    Path(id): Path<String>,
    Json(provider): Json<Provider>,
) -> Result<Json<Provider>, GatewayError> {
    gateway.update_provider(&id, provider).await?;
    let updated = gateway
        .registry()
        .get(&id)
        .ok_or_else(|| GatewayError::NotFound(format!("provider '{}'", id)))?;
    Ok(Json(updated.redacted()))
}

async fn delete_provider(
    State(gateway): State<Arc<Gateway>>,
    Path(id): Path<String>,
) -> Result<Json<Provider>, GatewayError> {
    let removed = gateway.remove_provider(&id).await?;
    Ok(Json(removed.redacted()))
}

#[derive(Debug, Deserialize)]
struct ReorderPayload {
    ids: Vec<String>,
}

async fn reorder_providers(
    State(gateway): State<Arc<Gateway>>,
    Json(payload): Json<ReorderPayload>,
) -> Result<Json<Vec<Provider>>, GatewayError> {
    gateway.reorder_providers(&payload.ids).await?;
    Ok(Json(gateway.providers().iter().map(Provider::redacted).collect()))
}

// ---- 统计 ----

async fn stats(State(gateway): State<Arc<Gateway>>) -> Json<GatewayStats> {
    Json(gateway.stats())
}

#[derive(Debug, Deserialize)]
struct HourlyQuery {
    hours: Option<usize>,
}

async fn hourly(
    State(gateway): State<Arc<Gateway>>,
    Query(query): Query<HourlyQuery>,
) -> Json<Vec<HourlyStat>> {
    let hours = query
        .hours
        .unwrap_or(gateway.settings().stats.hourly_snapshot_hours)
        .clamp(1, MAX_HOURLY_WINDOW);
    Json(gateway.hourly(hours))
}

#[derive(Debug, Deserialize)]
struct RecentQuery {
    limit: Option<usize>,
}

async fn recent(
    State(gateway): State<Arc<Gateway>>,
    Query(query): Query<RecentQuery>,
) -> Json<Vec<RequestLog>> {
    Json(gateway.recent(query.limit.unwrap_or(DEFAULT_RECENT_LIMIT)))
}

// ---- 健康 ----

async fn health(State(gateway): State<Arc<Gateway>>) -> Json<Vec<ProviderHealth>> {
    Json(gateway.health())
}

async fn reset_health(
    State(gateway): State<Arc<Gateway>>,
    Path(id): Path<String>,
) -> Result<Json<ProviderHealth>, GatewayError> {
    Ok(Json(gateway.reset_health(&id)?))
}

async fn clear_cache(
    State(gateway): State<Arc<Gateway>>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let cleared = gateway.clear_cache().await?;
    Ok(Json(json!({ "cleared": cleared })))
}

/// Live provider status and config-change notifications as SSE.
async fn events(State(gateway): State<Arc<Gateway>>) -> impl IntoResponse {
    let stream = BroadcastStream::new(gateway.subscribe()).filter_map(|item| match item {
        Ok(event) => Event::default()
            .event(event.name())
            .json_data(&event)
            .ok()
            .map(Ok::<_, Infallible>),
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            tracing::debug!(skipped, "event subscriber lagged");
            None
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::tests::gateway;
    use crate::routing::router::tests::provider;
    use crate::server::admin_app;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn call(app: Router, method: &str, uri: &str, body: Option<serde_json::Value>) -> (StatusCode, serde_json::Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn provider_crud_masks_keys() {
        let (gw, _) = gateway(vec![provider("a")]);
        let app = admin_app(Arc::new(gw));

        let (status, created) = call(
            app.clone(),
            "POST",
            "/api/providers",
            Some(json!({
                "name": "Zhipu",
                "base_url": "https://open.bigmodel.cn/api/anthropic",
                "api_key": "sk-abcdefghijklmnop",
                "api_types": ["anthropic"]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["api_key"], "sk-a****mnop");
        let id = created["id"].as_str().unwrap().to_string();
        assert!(!id.is_empty());

        let (_, list) = call(app.clone(), "GET", "/api/providers", None).await;
        assert_eq!(list.as_array().unwrap().len(), 2);

        let (status, _) = call(
            app.clone(),
            "POST",
            "/api/providers/reorder",
            Some(json!({ "ids": [id, "a"] })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, removed) = call(app.clone(), "DELETE", &format!("/api/providers/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(removed["name"], "Zhipu");

        let (status, err) = call(app, "DELETE", "/api/providers/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(err["error"]["type"], "not_found_error");
    }

    #[tokio::test]
    async fn masked_key_round_trip_keeps_stored_key() {
        let (gw, _) = gateway(vec![provider("alpha")]);
        let gw = Arc::new(gw);
        let app = admin_app(gw.clone());

        let (_, config) = call(app.clone(), "GET", "/api/config", None).await;
        assert_eq!(config["providers"][0]["api_key"], "key-****lpha");

        let (status, _) = call(app, "PUT", "/api/config", Some(config)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(gw.registry().get("alpha").unwrap().api_key, "key-alpha");
    }

    #[tokio::test]
    async fn invalid_provider_is_rejected() {
        let (gw, _) = gateway(vec![]);
        let app = admin_app(Arc::new(gw));
        let (status, err) = call(
            app,
            "POST",
            "/api/providers",
            Some(json!({ "name": "x", "base_url": "ftp://nope" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(err["error"]["type"], "validation_error");
    }

    #[tokio::test]
    async fn stats_and_health_endpoints() {
        let (gw, _) = gateway(vec![provider("a")]);
        let app = admin_app(Arc::new(gw));

        let (status, stats) = call(app.clone(), "GET", "/api/stats", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stats["total_requests"], 0);
        assert_eq!(stats["providers"][0]["provider_id"], "a");

        let (_, hourly) = call(app.clone(), "GET", "/api/stats/hourly?hours=6", None).await;
        assert_eq!(hourly.as_array().unwrap().len(), 6);

        let (_, health) = call(app.clone(), "GET", "/api/health", None).await;
        assert_eq!(health[0]["is_healthy"], true);

        let (status, _) = call(app.clone(), "POST", "/api/health/zzz/reset", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, cleared) = call(app, "DELETE", "/api/cache", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(cleared["cleared"], 0);
    }
}
