//! Wire-level types and parsers for the two upstream dialects this gateway
//! proxies (Gemini-style, OpenAI Chat Completions-style). This crate
//! intentionally holds no HTTP client, no credential state, and no axum
//! dependency — a higher layer performs IO and owns the request lifecycle.

pub mod gemini;
pub mod openai;
pub mod sse;
pub mod usage;

pub use sse::{SseEvent, SseParser};
pub use usage::{Dialect, UsageSummary};
