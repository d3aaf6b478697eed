use serde::{Deserialize, Serialize};

/// Token usage as reported by whichever dialect produced it, normalized to a
/// single shape for logging and aggregation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dialect {
    Gemini,
    OpenaiChat,
}

impl Dialect {
    pub fn as_str(self) -> &'static str {
        match self {
            Dialect::Gemini => "gemini",
            Dialect::OpenaiChat => "openai-chat",
        }
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
