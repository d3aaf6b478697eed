use serde::Deserialize;

use crate::usage::UsageSummary;

/// Mirrors the upstream `usageMetadata` shape on both non-streaming
/// `generateContent` responses and each streamed chunk of
/// `streamGenerateContent`. Only the fields needed for the authoritative
/// token count are modeled — the rest of the body is forwarded untouched.
#[derive(Debug, Deserialize)]
struct UsageMetadata {
    #[serde(default, rename = "promptTokenCount")]
    prompt_token_count: u64,
    #[serde(default, rename = "candidatesTokenCount")]
    candidates_token_count: u64,
    #[serde(default, rename = "totalTokenCount")]
    total_token_count: u64,
}

#[derive(Debug, Deserialize)]
struct ResponseShape {
    #[serde(default, rename = "usageMetadata")]
    usage_metadata: Option<UsageMetadata>,
}

/// Parses one JSON object (a full response body, or a single decoded SSE
/// frame's `data:` payload) and returns its usage if present. Returns `None`
/// on anything that isn't a well-formed object with `usageMetadata` — this is
/// expected to be called on chunks the forwarding path never blocks on.
pub fn extract_usage(json: &[u8]) -> Option<UsageSummary> {
    let shape: ResponseShape = serde_json::from_slice(json).ok()?;
    let usage = shape.usage_metadata?;
    Some(UsageSummary {
        prompt_tokens: usage.prompt_token_count,
        completion_tokens: usage.candidates_token_count,
        total_tokens: usage.total_token_count,
    })
}

/// Where the upstream expects the credential: Gemini accepts either the
/// `x-goog-api-key` header or a `key=` query parameter. The adapter always
/// injects the header form, since it never collides with the rest of the
/// query string the client sent.
pub const API_KEY_HEADER: &str = "x-goog-api-key";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_usage_from_full_response() {
        let body = br#"{"candidates":[],"usageMetadata":{"promptTokenCount":10,"candidatesTokenCount":5,"totalTokenCount":15}}"#;
        let usage = extract_usage(body).unwrap();
        assert_eq!(usage.prompt_tokens, 10);
        assert_eq!(usage.completion_tokens, 5);
        assert_eq!(usage.total_tokens, 15);
    }

    #[test]
    fn missing_usage_metadata_yields_none() {
        let body = br#"{"candidates":[]}"#;
        assert!(extract_usage(body).is_none());
    }

    #[test]
    fn malformed_json_yields_none_without_panicking() {
        assert!(extract_usage(b"not json").is_none());
    }
}
