use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use gateway_common::GlobalConfig;
use gateway_core::{
    AdminAuth, AppState, GeminiAdapter, OpenAiChatAdapter, PrincipalAuthenticator, ProxyOutcome,
    ProxyRequest, UpstreamClientConfig, WreqUpstreamClient, orchestrate,
};
use gateway_keypool::{ConcurrencyGate, KeyPool, NewUpstreamKey, PoolConfig};
use gateway_protocol::Dialect;
use gateway_storage::{NewAuthPrincipal, SeaOrmStore, Store as _};
use http::HeaderMap;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn pool_config() -> PoolConfig {
    PoolConfig {
        base_cooldown_secs: 10,
        max_cooldown_secs: 80,
        failure_threshold: 3,
        rate_limit_default_wait_secs: 30,
        stuck_timeout_secs: 3600,
        sweep_interval_secs: 3600,
    }
}

fn global_config(upstream_base_url: String) -> GlobalConfig {
    GlobalConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        admin_key_hash: blake3::hash(b"test-admin").to_hex().to_string(),
        dsn: "sqlite::memory:".to_string(),
        upstream_base_url,
        upstream_proxy_url: None,
        max_concurrent_upstream: 16,
        acquire_timeout_secs: 2,
        request_timeout_secs: 5,
        stream_idle_timeout_secs: 5,
        base_cooldown_secs: 10,
        max_cooldown_secs: 80,
        failure_threshold: 3,
        rate_limit_default_wait_secs: 30,
        stuck_timeout_secs: 3600,
        sweep_interval_secs: 3600,
        client_rebuild_threshold: 5,
    }
}

async fn build_state(upstream_base_url: String, secrets: &[&str]) -> Arc<AppState> {
    let store = Arc::new(SeaOrmStore::connect("sqlite::memory:").await.expect("open in-memory sqlite"));
    store.sync().await.expect("sync schema");
    store
        .upsert_principal(NewAuthPrincipal { api_key: "client-key".to_string(), alias: "alice".to_string() })
        .await
        .expect("insert principal");

    let pool = KeyPool::bootstrap(pool_config(), Arc::clone(&store) as Arc<dyn gateway_keypool::KeyStore>)
        .await
        .expect("bootstrap pool");
    for secret in secrets {
        pool.insert_key(NewUpstreamKey { secret: secret.to_string() }).await.expect("insert key");
    }

    let gate = ConcurrencyGate::new(8);
    let upstream = WreqUpstreamClient::new(UpstreamClientConfig {
        proxy: None,
        connect_timeout: Duration::from_secs(2),
        request_timeout: Duration::from_secs(5),
        stream_idle_timeout: Duration::from_secs(2),
        rebuild_threshold: 5,
    })
    .expect("build upstream client");
    let principal_auth = PrincipalAuthenticator::new(Arc::clone(&store) as Arc<dyn gateway_storage::Store>);
    let admin_auth = AdminAuth::new(blake3::hash(b"test-admin").to_hex().to_string(), b"jwt-secret".to_vec(), 3600);

    Arc::new(AppState {
        global: ArcSwap::from_pointee(global_config(upstream_base_url)),
        pool,
        gate,
        store: Arc::clone(&store) as Arc<dyn gateway_storage::Store>,
        upstream,
        principal_auth,
        admin_auth,
    })
}

fn headers_with_bearer(token: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("authorization", format!("Bearer {token}").parse().unwrap());
    headers
}

fn chat_request(body: &str, is_stream: bool) -> ProxyRequest {
    ProxyRequest {
        dialect: Dialect::OpenaiChat,
        path_and_query: "/v1/chat/completions".to_string(),
        body: bytes::Bytes::from(body.to_string()),
        is_stream,
        model: Some("gpt-test".to_string()),
    }
}

#[tokio::test]
async fn buffered_success_logs_usage_and_returns_key_active() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(
                br#"{"choices":[],"usage":{"prompt_tokens":3,"completion_tokens":7,"total_tokens":10}}"#.to_vec(),
                "application/json",
            ),
        )
        .mount(&server)
        .await;

    let state = build_state(server.uri(), &["secret-a"]).await;
    let req = chat_request(r#"{"model":"gpt-test","messages":[]}"#, false);

    let outcome = orchestrate(&state, &OpenAiChatAdapter, &headers_with_bearer("client-key"), req).await.unwrap();
    match outcome {
        ProxyOutcome::Buffered { status, body } => {
            assert_eq!(status, 200);
            assert!(body.windows(5).any(|w| w == b"usage"));
        }
        ProxyOutcome::Streaming { .. } => panic!("expected buffered outcome"),
    }

    let status = state.pool.status();
    assert_eq!(status.active_count, 1);
    assert_eq!(status.leased_count, 0);

    let logs = state.store.query_request_logs(gateway_storage::LogFilter { limit: 10, ..Default::default() }).await.unwrap();
    assert_eq!(logs.rows.len(), 1);
    assert!(logs.rows[0].is_success);
    assert_eq!(logs.rows[0].total_tokens, Some(10));
}

#[tokio::test]
async fn missing_credential_is_rejected_before_any_key_is_leased() {
    let server = MockServer::start().await;
    let state = build_state(server.uri(), &["secret-a"]).await;
    let req = chat_request(r#"{"model":"gpt-test","messages":[]}"#, false);

    let err = orchestrate(&state, &OpenAiChatAdapter, &HeaderMap::new(), req).await.unwrap_err();
    assert_eq!(err.kind, gateway_core::ErrorKind::PrincipalRejected);

    let status = state.pool.status();
    assert_eq!(status.active_count, 1);
}

#[tokio::test]
async fn rate_limit_retries_once_on_a_different_key() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer secret-a"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer secret-b"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(br#"{"choices":[]}"#.to_vec(), "application/json"))
        .mount(&server)
        .await;

    let state = build_state(server.uri(), &["secret-a", "secret-b"]).await;
    let req = chat_request(r#"{"model":"gpt-test","messages":[]}"#, false);

    let outcome = orchestrate(&state, &OpenAiChatAdapter, &headers_with_bearer("client-key"), req).await.unwrap();
    match outcome {
        ProxyOutcome::Buffered { status, .. } => assert_eq!(status, 200),
        ProxyOutcome::Streaming { .. } => panic!("expected buffered outcome"),
    }

    let status = state.pool.status();
    assert_eq!(status.active_count + status.cooling_count, 2);
}

#[tokio::test]
async fn streaming_client_disconnect_returns_key_and_still_logs() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1beta/models/gemini-test:streamGenerateContent"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(
                    b"data: {\"usageMetadata\":{\"promptTokenCount\":1,\"candidatesTokenCount\":1,\"totalTokenCount\":2}}\n\n".to_vec(),
                    "text/event-stream",
                ),
        )
        .mount(&server)
        .await;

    let state = build_state(server.uri(), &["secret-a"]).await;
    let req = ProxyRequest {
        dialect: Dialect::Gemini,
        path_and_query: "/v1beta/models/gemini-test:streamGenerateContent".to_string(),
        body: bytes::Bytes::from_static(b"{}"),
        is_stream: true,
        model: Some("gemini-test".to_string()),
    };

    let outcome = orchestrate(&state, &GeminiAdapter, &headers_with_bearer("client-key"), req).await.unwrap();
    let receiver = match outcome {
        ProxyOutcome::Streaming { receiver, .. } => receiver,
        ProxyOutcome::Buffered { .. } => panic!("expected streaming outcome"),
    };
    // Simulate a client that hangs up without reading any chunk, then give the
    // forwarder task a bounded window to notice the closed channel and log.
    drop(receiver);
    let mut logs = gateway_storage::LogQueryResult { rows: Vec::new(), total_count: 0, min_time: None, max_time: None };
    for _ in 0..20 {
        logs = state.store.query_request_logs(gateway_storage::LogFilter { limit: 10, ..Default::default() }).await.unwrap();
        if !logs.rows.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert_eq!(logs.rows.len(), 1);
    assert!(logs.rows[0].streamed);

    let status = state.pool.status();
    assert_eq!(status.leased_count, 0, "disconnecting must not leave the key leased forever");
}
