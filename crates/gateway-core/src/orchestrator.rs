use std::sync::Arc;
use std::time::Duration as StdDuration;

use arc_swap::ArcSwap;
use bytes::Bytes;
use gateway_common::GlobalConfig;
use gateway_keypool::{ConcurrencyGate, FailureClass, KeyPool, Lease, OwnedGatePermit, ReturnOutcome};
use gateway_protocol::{Dialect, SseParser, UsageSummary};
use gateway_storage::{RequestLog, Store};
use http::HeaderMap;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::auth::{AdminAuth, PrincipalAuthenticator};
use crate::dispatch::DialectAdapter;
use crate::error::{ErrorKind, GatewayError};
use crate::upstream_client::{UpstreamBody, UpstreamFailure, UpstreamHttpResponse, UpstreamTransportErrorKind, WreqUpstreamClient};

/// Everything a request needs to reach an upstream dispatch and back. Held
/// behind `Arc` and handed to every inbound request; config is `ArcSwap` so
/// an admin config update takes effect on the next request without a
/// restart.
pub struct AppState {
    pub global: ArcSwap<GlobalConfig>,
    pub pool: KeyPool,
    pub gate: ConcurrencyGate,
    pub store: Arc<dyn Store>,
    pub upstream: WreqUpstreamClient,
    pub principal_auth: PrincipalAuthenticator,
    pub admin_auth: AdminAuth,
}

pub struct ProxyRequest {
    pub dialect: Dialect,
    pub path_and_query: String,
    pub body: Bytes,
    pub is_stream: bool,
    pub model: Option<String>,
}

pub enum ProxyOutcome {
    Buffered { status: u16, body: Bytes },
    Streaming { status: u16, receiver: mpsc::Receiver<Bytes> },
}

/// Runs the full per-request sequence: authenticate, admit, lease, dispatch,
/// forward, return, log.
pub async fn orchestrate(
    state: &AppState,
    adapter: &dyn DialectAdapter,
    headers: &HeaderMap,
    req: ProxyRequest,
) -> Result<ProxyOutcome, GatewayError> {
    let trace_id = Uuid::new_v4();
    let config = state.global.load_full();
    let started_at = std::time::Instant::now();

    let principal = state.principal_auth.authenticate(headers).await?;
    tracing::info!(
        event = "downstream_received",
        trace_id = %trace_id,
        dialect = %req.dialect,
        model = req.model.as_deref().unwrap_or(""),
        is_stream = req.is_stream,
        "request accepted"
    );

    let gate_timeout = StdDuration::from_secs(config.acquire_timeout_secs);
    let gate_permit = state
        .gate
        .acquire_owned(gate_timeout)
        .await
        .map_err(|_| GatewayError::new(ErrorKind::AdmissionTimeout, "concurrency gate saturated"))?;

    let acquire_timeout = StdDuration::from_secs(config.acquire_timeout_secs);
    let first_lease = state
        .pool
        .acquire(acquire_timeout)
        .await
        .map_err(|_| GatewayError::new(ErrorKind::NoKeyAvailable, "no active upstream key available"))?;

    let request_timeout = StdDuration::from_secs(config.request_timeout_secs);
    let attempt = dispatch_once(state, adapter, &req, &config.upstream_base_url, &first_lease, request_timeout).await;

    let (lease, response) = match attempt {
        Ok(response) if (200..300).contains(&response.status) => (first_lease, response),
        Ok(response) => {
            let kind = adapter.classify_status(response.status, b"");
            let retry_after = retry_after_from_headers(&response.headers);
            let first_identifier = first_lease.identifier.clone();
            let first_brief = first_lease.brief.clone();
            return_with_classification(state, first_lease, kind, retry_after).await;
            if kind.retry_policy() == crate::error::RetryPolicy::OnceDifferentKeyPreByte {
                if let Ok(retry_lease) = state.pool.acquire(acquire_timeout).await {
                    if retry_lease.identifier != first_identifier {
                        match dispatch_once(state, adapter, &req, &config.upstream_base_url, &retry_lease, request_timeout).await {
                            Ok(retry_response) if (200..300).contains(&retry_response.status) => (retry_lease, retry_response),
                            Ok(retry_response) => {
                                let retry_kind = adapter.classify_status(retry_response.status, b"");
                                let retry_retry_after = retry_after_from_headers(&retry_response.headers);
                                let (retry_identifier, retry_brief) = (retry_lease.identifier.clone(), retry_lease.brief.clone());
                                return_with_classification(state, retry_lease, retry_kind, retry_retry_after).await;
                                let err = GatewayError::new(retry_kind, "upstream rejected retry attempt");
                                log_failure(state, &req, &principal, &trace_id, retry_kind, Some((retry_identifier, retry_brief))).await;
                                return Err(err);
                            }
                            Err(failure) => {
                                let retry_kind = classify_transport_failure(&failure);
                                let (retry_identifier, retry_brief) = (retry_lease.identifier.clone(), retry_lease.brief.clone());
                                return_with_classification(state, retry_lease, retry_kind, None).await;
                                let err = GatewayError::new(retry_kind, failure.to_string());
                                log_failure(state, &req, &principal, &trace_id, retry_kind, Some((retry_identifier, retry_brief))).await;
                                return Err(err);
                            }
                        }
                    } else {
                        let (retry_identifier, retry_brief) = (retry_lease.identifier.clone(), retry_lease.brief.clone());
                        return_with_classification(state, retry_lease, kind, retry_after).await;
                        let err = GatewayError::new(kind, "no alternate upstream key available for retry");
                        log_failure(state, &req, &principal, &trace_id, kind, Some((retry_identifier, retry_brief))).await;
                        return Err(err);
                    }
                } else {
                    let err = GatewayError::new(kind, "no alternate upstream key available for retry");
                    log_failure(state, &req, &principal, &trace_id, kind, Some((first_identifier, first_brief))).await;
                    return Err(err);
                }
            } else {
                let err = GatewayError::new(kind, "upstream rejected request");
                log_failure(state, &req, &principal, &trace_id, kind, Some((first_identifier, first_brief))).await;
                return Err(err);
            }
        }
        Err(failure) => {
            let kind = classify_transport_failure(&failure);
            let (first_identifier, first_brief) = (first_lease.identifier.clone(), first_lease.brief.clone());
            return_with_classification(state, first_lease, kind, None).await;
            let err = GatewayError::new(kind, failure.to_string());
            log_failure(state, &req, &principal, &trace_id, kind, Some((first_identifier, first_brief))).await;
            return Err(err);
        }
    };

    let status = response.status;
    let (key_identifier, key_brief) = (lease.identifier.clone(), lease.brief.clone());
    match response.body {
        UpstreamBody::Bytes(body) => {
            let usage = adapter.extract_usage_from_json(&body);
            state.pool.return_lease(lease, ReturnOutcome::Success).await;
            write_log(
                state,
                &req,
                &principal,
                request_id(&trace_id),
                OffsetDateTime::now_utc(),
                true,
                None,
                false,
                usage,
                Some((key_identifier, key_brief)),
            )
            .await;
            tracing::info!(
                event = "downstream_responded",
                trace_id = %trace_id,
                status,
                elapsed_ms = started_at.elapsed().as_millis(),
                is_stream = false,
                "request completed"
            );
            Ok(ProxyOutcome::Buffered { status, body })
        }
        UpstreamBody::Stream(upstream_rx) => {
            let (out_tx, out_rx) = mpsc::channel::<Bytes>(16);
            spawn_stream_forwarder(state, req, principal, trace_id, lease, gate_permit, upstream_rx, out_tx, started_at);
            Ok(ProxyOutcome::Streaming { status, receiver: out_rx })
        }
    }
}

async fn dispatch_once(
    state: &AppState,
    adapter: &dyn DialectAdapter,
    req: &ProxyRequest,
    upstream_base_url: &str,
    lease: &Lease,
    request_timeout: StdDuration,
) -> Result<UpstreamHttpResponse, UpstreamFailure> {
    let upstream_req = adapter.build_upstream_request(req.body.clone(), upstream_base_url, &req.path_and_query, lease, req.is_stream);
    match tokio::time::timeout(request_timeout, state.upstream.send(upstream_req)).await {
        Ok(result) => result,
        Err(_) => Err(UpstreamFailure::Transport {
            kind: UpstreamTransportErrorKind::Timeout,
            message: "request timed out".to_string(),
        }),
    }
}

fn classify_transport_failure(failure: &UpstreamFailure) -> ErrorKind {
    match failure {
        UpstreamFailure::Transport { kind, .. } => match kind {
            UpstreamTransportErrorKind::Timeout | UpstreamTransportErrorKind::ReadTimeout => ErrorKind::RequestTimeout,
            _ => ErrorKind::Upstream5xx,
        },
    }
}

/// Reads `Retry-After`/`x-ratelimit-reset` off a 429 response, both
/// interpreted as a whole-second delay. Header-name matching is
/// case-insensitive since upstreams are inconsistent about casing.
fn retry_after_from_headers(headers: &crate::upstream_client::Headers) -> Option<StdDuration> {
    headers.iter().find_map(|(name, value)| {
        if name.eq_ignore_ascii_case("retry-after") || name.eq_ignore_ascii_case("x-ratelimit-reset") {
            value.trim().parse::<u64>().ok().map(StdDuration::from_secs)
        } else {
            None
        }
    })
}

async fn return_with_classification(state: &AppState, lease: Lease, kind: ErrorKind, retry_after: Option<StdDuration>) {
    let outcome = match kind.key_return_class(retry_after) {
        Some(class) => ReturnOutcome::Failure(class),
        None => ReturnOutcome::Failure(FailureClass::TransientClientOrNetwork),
    };
    state.pool.return_lease(lease, outcome).await;
}

async fn log_failure(
    state: &AppState,
    req: &ProxyRequest,
    principal: &gateway_storage::AuthPrincipal,
    trace_id: &Uuid,
    kind: ErrorKind,
    key: Option<(String, String)>,
) {
    write_log(
        state,
        req,
        principal,
        request_id(trace_id),
        OffsetDateTime::now_utc(),
        false,
        Some(kind.as_str().to_string()),
        false,
        None,
        key,
    )
    .await;
}

fn request_id(trace_id: &Uuid) -> String {
    trace_id.to_string()
}

#[allow(clippy::too_many_arguments)]
async fn write_log(
    state: &AppState,
    req: &ProxyRequest,
    principal: &gateway_storage::AuthPrincipal,
    request_id: String,
    request_time: OffsetDateTime,
    is_success: bool,
    error_kind: Option<String>,
    streamed: bool,
    usage: Option<UsageSummary>,
    key: Option<(String, String)>,
) {
    let (key_identifier, key_brief) = match key {
        Some((identifier, brief)) => (Some(identifier), Some(brief)),
        None => (None, None),
    };
    let log = RequestLog {
        request_id,
        request_time,
        principal_alias: Some(principal.alias.clone()),
        key_identifier,
        key_brief,
        model_name: req.model.clone(),
        prompt_tokens: usage.map(|u| u.prompt_tokens as i64),
        completion_tokens: usage.map(|u| u.completion_tokens as i64),
        total_tokens: usage.map(|u| u.total_tokens as i64),
        is_success,
        error_kind,
        dialect: req.dialect.as_str().to_string(),
        streamed,
    };
    if let Err(err) = state.store.insert_request_log(log).await {
        tracing::error!(error = %err, "failed to persist request log");
    }
}

/// Forwards upstream chunks to the client as they arrive while extracting the
/// running usage total from each frame's JSON payload. A `send` failure on
/// `out_tx` means the client disconnected — the lease comes back as
/// `transient_client_or_network`, never as an upstream failure, and the
/// terminal RequestLog is still written with whatever usage was last parsed.
#[allow(clippy::too_many_arguments)]
fn spawn_stream_forwarder(
    state: &AppState,
    req: ProxyRequest,
    principal: gateway_storage::AuthPrincipal,
    trace_id: Uuid,
    lease: Lease,
    gate_permit: OwnedGatePermit,
    mut upstream_rx: mpsc::Receiver<Bytes>,
    out_tx: mpsc::Sender<Bytes>,
    started_at: std::time::Instant,
) {
    let pool = state.pool.clone();
    let store = Arc::clone(&state.store);

    tokio::spawn(async move {
        let _gate_permit = gate_permit;
        let key_identifier = lease.identifier.clone();
        let key_brief = lease.brief.clone();
        let mut parser = SseParser::new();
        let mut last_usage: Option<UsageSummary> = None;
        let mut disconnected = false;

        while let Some(chunk) = upstream_rx.recv().await {
            for event in parser.push_bytes(&chunk) {
                if let Some(usage) = extract_usage_for_dialect(req.dialect, event.data.as_bytes()) {
                    last_usage = Some(usage);
                }
            }
            if out_tx.send(chunk).await.is_err() {
                disconnected = true;
                break;
            }
        }
        if !disconnected {
            for event in parser.finish() {
                if let Some(usage) = extract_usage_for_dialect(req.dialect, event.data.as_bytes()) {
                    last_usage = Some(usage);
                }
            }
        }

        let outcome = if disconnected {
            ReturnOutcome::Failure(FailureClass::TransientClientOrNetwork)
        } else {
            ReturnOutcome::Success
        };
        pool.return_lease(lease, outcome).await;

        let log = RequestLog {
            request_id: trace_id.to_string(),
            request_time: OffsetDateTime::now_utc(),
            principal_alias: Some(principal.alias.clone()),
            key_identifier: Some(key_identifier),
            key_brief: Some(key_brief),
            model_name: req.model.clone(),
            prompt_tokens: last_usage.map(|u| u.prompt_tokens as i64),
            completion_tokens: last_usage.map(|u| u.completion_tokens as i64),
            total_tokens: last_usage.map(|u| u.total_tokens as i64),
            is_success: true,
            error_kind: None,
            dialect: req.dialect.as_str().to_string(),
            streamed: true,
        };
        if let Err(err) = store.insert_request_log(log).await {
            tracing::error!(error = %err, "failed to persist streaming request log");
        }
        tracing::info!(
            event = "downstream_responded",
            trace_id = %trace_id,
            elapsed_ms = started_at.elapsed().as_millis(),
            is_stream = true,
            disconnected,
            "streaming request finished"
        );
    });
}

fn extract_usage_for_dialect(dialect: Dialect, json: &[u8]) -> Option<UsageSummary> {
    match dialect {
        Dialect::Gemini => gateway_protocol::gemini::extract_usage(json),
        Dialect::OpenaiChat => gateway_protocol::openai::extract_usage(json),
    }
}
