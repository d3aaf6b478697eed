use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, RawQuery, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use bytes::Bytes;
use gateway_core::{AppState, DialectAdapter, GeminiAdapter, OpenAiChatAdapter, ProxyOutcome, ProxyRequest, orchestrate};
use gateway_protocol::Dialect;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

const SSE_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const SSE_HEARTBEAT_FRAME: &[u8] = b": keep-alive\n\n";

/// The two upstream dialects this gateway proxies. No aggregation, no
/// provider prefix, no translation between them — each route
/// picks its adapter and calls straight into `gateway_core::orchestrate`.
pub fn proxy_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1beta/models/{*name}", post(gemini_post))
        .route("/v1/chat/completions", post(openai_chat_completions))
        .with_state(state)
}

struct GeminiRoute {
    model: String,
    action: String,
    is_stream: bool,
}

fn parse_gemini_name(name: &str) -> Option<GeminiRoute> {
    let (model, action) = name.split_once(':')?;
    let (model, action) = (model.trim(), action.trim());
    if model.is_empty() || action.is_empty() {
        return None;
    }
    let is_stream = match action {
        "generateContent" => false,
        "streamGenerateContent" => true,
        _ => return None,
    };
    Some(GeminiRoute { model: model.to_string(), action: action.to_string(), is_stream })
}

async fn gemini_post(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(route) = parse_gemini_name(&name) else {
        return (StatusCode::BAD_REQUEST, "bad_gemini_model_action").into_response();
    };

    let path = format!("/v1beta/models/{}:{}", route.model, route.action);
    let path_and_query = match query {
        Some(q) if !q.is_empty() => format!("{path}?{q}"),
        _ => path,
    };

    let req = ProxyRequest {
        dialect: Dialect::Gemini,
        path_and_query,
        body,
        is_stream: route.is_stream,
        model: Some(route.model),
    };
    run(&state, &GeminiAdapter, &headers, req).await
}

fn openai_request_meta(body: &[u8]) -> (bool, Option<String>) {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) else {
        return (false, None);
    };
    let is_stream = value.get("stream").and_then(|s| s.as_bool()).unwrap_or(false);
    let model = value.get("model").and_then(|m| m.as_str()).map(str::to_string);
    (is_stream, model)
}

async fn openai_chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let (is_stream, model) = openai_request_meta(&body);

    let req = ProxyRequest {
        dialect: Dialect::OpenaiChat,
        path_and_query: "/v1/chat/completions".to_string(),
        body,
        is_stream,
        model,
    };
    run(&state, &OpenAiChatAdapter, &headers, req).await
}

async fn run(state: &AppState, adapter: &dyn DialectAdapter, headers: &HeaderMap, req: ProxyRequest) -> Response {
    match orchestrate(state, adapter, headers, req).await {
        Ok(ProxyOutcome::Buffered { status, body }) => {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
            (status, [(header::CONTENT_TYPE, "application/json")], body).into_response()
        }
        Ok(ProxyOutcome::Streaming { status, receiver }) => {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
            let rx = wrap_sse_stream_with_heartbeat(receiver);
            let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
            let mut response = Response::builder()
                .status(status)
                .header(header::CONTENT_TYPE, "text/event-stream")
                .header(header::CACHE_CONTROL, "no-cache")
                .header("x-accel-buffering", "no")
                .body(Body::from_stream(stream))
                .unwrap_or_else(|_| (StatusCode::INTERNAL_SERVER_ERROR, "response_build_failed").into_response());
            response.headers_mut().remove(header::CONTENT_LENGTH);
            response
        }
        Err(err) => (err.status, [(header::CONTENT_TYPE, "application/json")], err.body).into_response(),
    }
}

fn wrap_sse_stream_with_heartbeat(mut upstream_rx: mpsc::Receiver<Bytes>) -> mpsc::Receiver<Bytes> {
    let (tx, rx) = mpsc::channel::<Bytes>(32);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SSE_HEARTBEAT_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                maybe_chunk = upstream_rx.recv() => {
                    let Some(chunk) = maybe_chunk else { break };
                    if tx.send(chunk).await.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if tx.send(Bytes::from_static(SSE_HEARTBEAT_FRAME)).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gemini_name_splits_model_and_action() {
        let route = parse_gemini_name("gemini-1.5-pro:generateContent").unwrap();
        assert_eq!(route.model, "gemini-1.5-pro");
        assert_eq!(route.action, "generateContent");
        assert!(!route.is_stream);
    }

    #[test]
    fn gemini_stream_action_sets_is_stream() {
        let route = parse_gemini_name("gemini-1.5-pro:streamGenerateContent").unwrap();
        assert!(route.is_stream);
    }

    #[test]
    fn gemini_name_rejects_missing_colon() {
        assert!(parse_gemini_name("gemini-1.5-pro").is_none());
    }

    #[test]
    fn gemini_name_rejects_unknown_action() {
        assert!(parse_gemini_name("gemini-1.5-pro:countTokens").is_none());
    }

    #[test]
    fn gemini_name_rejects_empty_model() {
        assert!(parse_gemini_name(":generateContent").is_none());
    }

    #[test]
    fn openai_meta_reads_stream_and_model() {
        let (is_stream, model) = openai_request_meta(br#"{"model":"gpt-test","stream":true}"#);
        assert!(is_stream);
        assert_eq!(model.as_deref(), Some("gpt-test"));
    }

    #[test]
    fn openai_meta_defaults_when_stream_absent() {
        let (is_stream, model) = openai_request_meta(br#"{"model":"gpt-test"}"#);
        assert!(!is_stream);
        assert_eq!(model.as_deref(), Some("gpt-test"));
    }

    #[test]
    fn openai_meta_tolerates_malformed_body() {
        let (is_stream, model) = openai_request_meta(b"not json");
        assert!(!is_stream);
        assert!(model.is_none());
    }

    #[tokio::test]
    async fn heartbeat_wrapper_forwards_chunks_until_upstream_closes() {
        let (tx, rx) = mpsc::channel::<Bytes>(4);
        tx.send(Bytes::from_static(b"chunk-1")).await.unwrap();
        drop(tx);

        let mut wrapped = wrap_sse_stream_with_heartbeat(rx);
        let first = wrapped.recv().await.unwrap();
        assert_eq!(first, Bytes::from_static(b"chunk-1"));
        assert!(wrapped.recv().await.is_none());
    }
}
