use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use gateway_common::GlobalConfig;
use tokio::sync::mpsc;
use wreq::{Client, Method, Proxy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

pub type Headers = Vec<(String, String)>;

pub struct UpstreamHttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Headers,
    pub body: Option<Bytes>,
    pub is_stream: bool,
}

pub enum UpstreamBody {
    Bytes(Bytes),
    Stream(mpsc::Receiver<Bytes>),
}

pub struct UpstreamHttpResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: UpstreamBody,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamTransportErrorKind {
    Connect,
    Dns,
    Tls,
    Timeout,
    ReadTimeout,
    Other,
}

#[derive(Debug)]
pub enum UpstreamFailure {
    Transport { kind: UpstreamTransportErrorKind, message: String },
}

impl std::fmt::Display for UpstreamFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpstreamFailure::Transport { kind, message } => write!(f, "upstream transport error ({kind:?}): {message}"),
        }
    }
}

impl std::error::Error for UpstreamFailure {}

#[derive(Debug, Clone)]
pub struct UpstreamClientConfig {
    pub proxy: Option<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub stream_idle_timeout: Duration,
    pub rebuild_threshold: u32,
}

impl UpstreamClientConfig {
    pub fn from_global(global: &GlobalConfig) -> Self {
        Self {
            proxy: global.upstream_proxy_url.clone(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(global.request_timeout_secs),
            stream_idle_timeout: Duration::from_secs(global.stream_idle_timeout_secs),
            rebuild_threshold: global.client_rebuild_threshold,
        }
    }
}

/// Long-lived HTTP client to the upstream provider. Caches one `wreq::Client`
/// per resolved proxy string and tears one down for rebuild once its
/// `FailureBurst` crosses `rebuild_threshold` — only one rebuild happens per
/// burst since the cache slot is removed the instant the threshold trips and
/// the rebuild lock serializes concurrent callers onto the same new client.
#[derive(Clone)]
pub struct WreqUpstreamClient {
    config: UpstreamClientConfig,
    clients: Arc<Mutex<HashMap<Option<String>, Client>>>,
    rebuild_lock: Arc<tokio::sync::Mutex<()>>,
    failure_burst: Arc<AtomicU32>,
}

impl WreqUpstreamClient {
    pub fn new(config: UpstreamClientConfig) -> Result<Self, wreq::Error> {
        let proxy = normalize_proxy(config.proxy.clone());
        let initial = build_client(&config, proxy.as_deref())?;
        let mut clients = HashMap::new();
        clients.insert(proxy, initial);
        Ok(Self {
            config,
            clients: Arc::new(Mutex::new(clients)),
            rebuild_lock: Arc::new(tokio::sync::Mutex::new(())),
            failure_burst: Arc::new(AtomicU32::new(0)),
        })
    }

    fn current_proxy(&self) -> Option<String> {
        normalize_proxy(self.config.proxy.clone())
    }

    async fn client_for_proxy(&self, proxy: Option<String>) -> Result<Client, UpstreamFailure> {
        if let Some(client) = self.clients.lock().unwrap().get(&proxy) {
            return Ok(client.clone());
        }
        let _guard = self.rebuild_lock.lock().await;
        if let Some(client) = self.clients.lock().unwrap().get(&proxy) {
            return Ok(client.clone());
        }
        let client = build_client(&self.config, proxy.as_deref()).map_err(map_wreq_error)?;
        self.clients.lock().unwrap().insert(proxy, client.clone());
        Ok(client)
    }

    fn note_failure(&self, proxy: &Option<String>) {
        let count = self.failure_burst.fetch_add(1, Ordering::SeqCst) + 1;
        if count >= self.config.rebuild_threshold {
            self.failure_burst.store(0, Ordering::SeqCst);
            self.clients.lock().unwrap().remove(proxy);
            tracing::warn!(rebuild_threshold = self.config.rebuild_threshold, "rebuilding upstream client after failure burst");
        }
    }

    fn note_success(&self) {
        self.failure_burst.store(0, Ordering::SeqCst);
    }

    pub async fn send(&self, req: UpstreamHttpRequest) -> Result<UpstreamHttpResponse, UpstreamFailure> {
        let proxy = self.current_proxy();
        let client = self.client_for_proxy(proxy.clone()).await?;

        let method = match req.method {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
        };
        let mut builder = client.request(method, &req.url);
        for (k, v) in &req.headers {
            builder = builder.header(k, v);
        }
        if let Some(body) = req.body {
            builder = builder.body(body);
        }

        let resp = match builder.send().await {
            Ok(resp) => resp,
            Err(err) => {
                self.note_failure(&proxy);
                return Err(map_wreq_error(err));
            }
        };
        match convert_response(resp, req.is_stream, self.config.stream_idle_timeout).await {
            Ok(resp) => {
                self.note_success();
                Ok(resp)
            }
            Err(err) => {
                self.note_failure(&proxy);
                Err(err)
            }
        }
    }
}

fn normalize_proxy(value: Option<String>) -> Option<String> {
    value.map(|item| item.trim().to_string()).filter(|item| !item.is_empty())
}

fn build_client(config: &UpstreamClientConfig, proxy: Option<&str>) -> Result<Client, wreq::Error> {
    let mut builder = Client::builder()
        .connect_timeout(config.connect_timeout)
        .timeout(config.request_timeout)
        .read_timeout(config.stream_idle_timeout);
    if let Some(proxy) = proxy {
        builder = builder.proxy(Proxy::all(proxy)?);
    }
    builder.build()
}

async fn convert_response(
    resp: wreq::Response,
    want_stream: bool,
    stream_idle_timeout: Duration,
) -> Result<UpstreamHttpResponse, UpstreamFailure> {
    let status = resp.status().as_u16();
    let headers = headers_from_wreq(resp.headers());

    let is_success = (200..300).contains(&status);
    if !is_success || !want_stream {
        let body = resp.bytes().await.map_err(map_wreq_error)?;
        return Ok(UpstreamHttpResponse { status, headers, body: UpstreamBody::Bytes(body) });
    }

    let (tx, rx) = mpsc::channel::<Bytes>(16);
    tokio::spawn(async move {
        let mut stream = resp.bytes_stream();
        loop {
            let next = tokio::time::timeout(stream_idle_timeout, stream.next()).await;
            let item = match next {
                Ok(item) => item,
                Err(_) => break,
            };
            let Some(item) = item else { break };
            let chunk = match item {
                Ok(chunk) => chunk,
                Err(_) => break,
            };
            if tx.send(chunk).await.is_err() {
                break;
            }
        }
    });

    Ok(UpstreamHttpResponse { status, headers, body: UpstreamBody::Stream(rx) })
}

fn headers_from_wreq(map: &wreq::header::HeaderMap) -> Headers {
    let mut out = Vec::new();
    for (k, v) in map {
        if let Ok(s) = v.to_str() {
            out.push((k.as_str().to_string(), s.to_string()));
        }
    }
    out
}

fn map_wreq_error(err: wreq::Error) -> UpstreamFailure {
    let kind = classify_wreq_error(&err);
    UpstreamFailure::Transport { kind, message: err.to_string() }
}

fn classify_wreq_error(err: &wreq::Error) -> UpstreamTransportErrorKind {
    let message = err.to_string().to_ascii_lowercase();
    if err.is_timeout() {
        if message.contains("read") || message.contains("idle") {
            return UpstreamTransportErrorKind::ReadTimeout;
        }
        return UpstreamTransportErrorKind::Timeout;
    }
    if err.is_connect() {
        if message.contains("dns") || message.contains("resolve") {
            return UpstreamTransportErrorKind::Dns;
        }
        if message.contains("tls") || message.contains("ssl") {
            return UpstreamTransportErrorKind::Tls;
        }
        return UpstreamTransportErrorKind::Connect;
    }
    if message.contains("tls") || message.contains("ssl") {
        return UpstreamTransportErrorKind::Tls;
    }
    UpstreamTransportErrorKind::Other
}
