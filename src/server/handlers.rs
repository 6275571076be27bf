use axum::Json;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, Method, Uri};
use axum::response::{IntoResponse, Response};

use super::DialectState;
use crate::config::ApiType;
use crate::error::GatewayError;
use crate::gateway::GatewayResponse;
use crate::logging::RequestLog;
use crate::providers::{InboundRequest, error_response_body};
use crate::routing::router::OutcomeBody;

/// Catch-all for a dialect port: decode, route, relay.
pub async fn proxy(
    State(state): State<DialectState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string());

    let request = match InboundRequest::decode(state.api_type, method.clone(), path.clone(), headers, body) {
        Ok(request) => request,
        Err(err) => {
            let log = RequestLog::new(state.api_type, method.as_str(), &path, "unknown");
            state.gateway.recorder().record_rejected(log, &err);
            return dialect_error(state.api_type, &err);
        }
    };

    match state.gateway.handle(request).await {
        Ok(response) => relay(response),
        Err(err) => dialect_error(state.api_type, &err),
    }
}

fn relay(response: GatewayResponse) -> Response {
    let body = match response.body {
        OutcomeBody::Full(bytes) => Body::from(bytes),
        // 逐块透传，不缓冲
        OutcomeBody::Stream(stream) => Body::from_stream(stream),
    };
    let mut out = Response::new(body);
    *out.status_mut() = response.status;
    *out.headers_mut() = response.headers;
    out
}

fn dialect_error(api_type: ApiType, err: &GatewayError) -> Response {
    let (status, body) = error_response_body(api_type, err);
    (status, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::CACHE_HEADER;
    use crate::gateway::tests::{BODY, gateway};
    use crate::routing::router::tests::{Script, provider};
    use crate::server::dialect_app;
    use axum::http::{Request, StatusCode};
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post(path: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn proxies_completion_and_marks_cache_miss() {
        let (gw, upstream) = gateway(vec![provider("a")]);
        upstream.push("a.test", Script::Reply(200, BODY));
        let app = dialect_app(Arc::new(gw), ApiType::OpenaiChat);

        let response = app
            .oneshot(post("/v1/chat/completions", r#"{"model":"m","messages":[]}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CACHE_HEADER], "miss");
        assert_eq!(body_json(response).await["id"], "c1");
    }

    #[tokio::test]
    async fn invalid_json_gets_dialect_error_and_is_logged() {
        let (gw, upstream) = gateway(vec![provider("a")]);
        let gw = Arc::new(gw);
        let app = dialect_app(gw.clone(), ApiType::Anthropic);

        let response = app.oneshot(post("/v1/messages", "{not json")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["type"], "error");
        assert_eq!(body["error"]["type"], "invalid_request_error");

        assert!(upstream.calls.lock().is_empty());
        assert_eq!(gw.recent(10)[0].status, 400);
    }

    #[tokio::test]
    async fn exhausted_providers_answer_in_openai_shape() {
        let (gw, upstream) = gateway(vec![provider("a")]);
        upstream.push("a.test", Script::Reply(503, "overloaded"));
        let app = dialect_app(Arc::new(gw), ApiType::OpenaiChat);

        let response = app
            .oneshot(post("/v1/chat/completions", r#"{"model":"m"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(response).await;
        assert!(body["error"]["message"].as_str().unwrap().contains("overloaded"));
    }

    #[tokio::test]
    async fn non_completion_paths_are_forwarded_verbatim() {
        let (gw, upstream) = gateway(vec![provider("a")]);
        upstream.push("a.test", Script::Reply(200, r#"{"data":[]}"#));
        let app = dialect_app(Arc::new(gw), ApiType::OpenaiChat);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1/models?limit=5")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(CACHE_HEADER).is_none());
        let calls = upstream.calls.lock();
        assert_eq!(calls[0].method, Method::GET);
        assert_eq!(calls[0].url, "http://a.test/v1/models?limit=5");
    }

    #[tokio::test]
    async fn streamed_reply_is_relayed_chunk_for_chunk() {
        let (gw, upstream) = gateway(vec![provider("a")]);
        let gw = Arc::new(gw);
        upstream.push(
            "a.test",
            Script::Stream(vec![
                "data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n\n",
                "data: [DONE]\n\n",
            ]),
        );
        let app = dialect_app(gw.clone(), ApiType::OpenaiChat);

        let response = app
            .oneshot(post("/v1/chat/completions", r#"{"model":"m","stream":true}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(bytes.ends_with(b"data: [DONE]\n\n"));
        assert_eq!(gw.recent(1)[0].status, 200);
    }
}
