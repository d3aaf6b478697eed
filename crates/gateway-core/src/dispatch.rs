use bytes::Bytes;
use gateway_keypool::Lease;
use gateway_protocol::{gemini, openai, usage::UsageSummary};

use crate::error::ErrorKind;
use crate::upstream_client::{Headers, HttpMethod, UpstreamHttpRequest};

/// Per-dialect request rewriting, usage extraction, and upstream status
/// classification. `gateway-protocol` holds the wire-format parsing; this
/// trait is just the seam the orchestrator dispatches through to pick the
/// route-selected dialect's behavior, scoped to exactly the two dialects this
/// gateway proxies — no cross-dialect translation.
pub trait DialectAdapter: Send + Sync {
    fn build_upstream_request(
        &self,
        client_body: Bytes,
        upstream_base_url: &str,
        path_and_query: &str,
        lease: &Lease,
        is_stream: bool,
    ) -> UpstreamHttpRequest;

    fn extract_usage_from_json(&self, value: &[u8]) -> Option<UsageSummary>;

    fn classify_status(&self, status: u16, _body: &[u8]) -> ErrorKind {
        match status {
            401 | 403 => ErrorKind::AuthRejected,
            429 => ErrorKind::RateLimited,
            500..=599 => ErrorKind::Upstream5xx,
            _ => ErrorKind::Internal,
        }
    }
}

pub struct GeminiAdapter;

impl DialectAdapter for GeminiAdapter {
    fn build_upstream_request(
        &self,
        client_body: Bytes,
        upstream_base_url: &str,
        path_and_query: &str,
        lease: &Lease,
        is_stream: bool,
    ) -> UpstreamHttpRequest {
        let url = format!("{}{}", upstream_base_url.trim_end_matches('/'), path_and_query);
        let headers: Headers = vec![
            (gemini::API_KEY_HEADER.to_string(), lease.secret().to_string()),
            ("content-type".to_string(), "application/json".to_string()),
        ];
        UpstreamHttpRequest {
            method: HttpMethod::Post,
            url,
            headers,
            body: Some(client_body),
            is_stream,
        }
    }

    fn extract_usage_from_json(&self, value: &[u8]) -> Option<UsageSummary> {
        gemini::extract_usage(value)
    }
}

pub struct OpenAiChatAdapter;

impl DialectAdapter for OpenAiChatAdapter {
    fn build_upstream_request(
        &self,
        client_body: Bytes,
        upstream_base_url: &str,
        path_and_query: &str,
        lease: &Lease,
        is_stream: bool,
    ) -> UpstreamHttpRequest {
        let url = format!("{}{}", upstream_base_url.trim_end_matches('/'), path_and_query);
        let headers: Headers = vec![
            ("authorization".to_string(), format!("Bearer {}", lease.secret())),
            ("content-type".to_string(), "application/json".to_string()),
        ];
        UpstreamHttpRequest {
            method: HttpMethod::Post,
            url,
            headers,
            body: Some(client_body),
            is_stream,
        }
    }

    fn extract_usage_from_json(&self, value: &[u8]) -> Option<UsageSummary> {
        openai::extract_usage(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gemini_adapter_extracts_usage_from_chunk() {
        let adapter = GeminiAdapter;
        let chunk = br#"{"usageMetadata":{"promptTokenCount":1,"candidatesTokenCount":2,"totalTokenCount":3}}"#;
        let usage = adapter.extract_usage_from_json(chunk).unwrap();
        assert_eq!(usage.total_tokens, 3);
    }

    #[test]
    fn openai_adapter_classifies_rate_limit() {
        let adapter = OpenAiChatAdapter;
        assert_eq!(adapter.classify_status(429, b""), ErrorKind::RateLimited);
        assert_eq!(adapter.classify_status(503, b""), ErrorKind::Upstream5xx);
        assert_eq!(adapter.classify_status(401, b""), ErrorKind::AuthRejected);
    }
}
