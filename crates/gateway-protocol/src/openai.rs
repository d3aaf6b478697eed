use serde::Deserialize;

use crate::usage::UsageSummary;

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ResponseShape {
    #[serde(default)]
    usage: Option<Usage>,
}

/// Parses one JSON object (a full response body, or a single decoded SSE
/// frame's `data:` payload) and returns its usage if present. OpenAI-Chat
/// only attaches `usage` on the final streamed chunk (or never, unless the
/// client asked for `stream_options.include_usage`), so most chunks return
/// `None` — that's expected, not an error.
pub fn extract_usage(json: &[u8]) -> Option<UsageSummary> {
    let shape: ResponseShape = serde_json::from_slice(json).ok()?;
    let usage = shape.usage?;
    Some(UsageSummary {
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        total_tokens: usage.total_tokens,
    })
}

pub const DONE_FRAME: &str = "data: [DONE]\n\n";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_usage_from_final_chunk() {
        let body = br#"{"choices":[],"usage":{"prompt_tokens":3,"completion_tokens":7,"total_tokens":10}}"#;
        let usage = extract_usage(body).unwrap();
        assert_eq!(usage.total_tokens, 10);
    }

    #[test]
    fn intermediate_chunk_without_usage_yields_none() {
        let body = br#"{"choices":[{"delta":{"content":"hi"}}]}"#;
        assert!(extract_usage(body).is_none());
    }
}
