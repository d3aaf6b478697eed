//! Per-request orchestration for the gateway: principal/admin auth, key
//! leasing, upstream dispatch with the pre-byte retry rule, SSE forwarding
//! with usage extraction, and request logging. `gateway-router` builds axum
//! handlers on top of this; `apps/gateway` wires bootstrap to a listener.

mod auth;
mod bootstrap;
mod dispatch;
mod error;
mod orchestrator;
mod upstream_client;

pub use auth::{AdminAuth, AdminClaims, PrincipalAuthenticator};
pub use bootstrap::{Bootstrap, CliArgs, bootstrap, bootstrap_from_env};
pub use dispatch::{DialectAdapter, GeminiAdapter, OpenAiChatAdapter};
pub use error::{ErrorKind, GatewayError, RetryPolicy};
pub use orchestrator::{AppState, ProxyOutcome, ProxyRequest, orchestrate};
pub use upstream_client::{
    HttpMethod, Headers, UpstreamBody, UpstreamClientConfig, UpstreamFailure, UpstreamHttpRequest,
    UpstreamHttpResponse, UpstreamTransportErrorKind, WreqUpstreamClient,
};
