use bytes::Bytes;

/// One decoded `data: <payload>\n\n` style frame. `event` is the optional
/// `event:` line; OpenAI-Chat and Gemini streams never set it, but the parser
/// stays dialect-agnostic.
#[derive(Debug, Clone, Default)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental SSE frame decoder. Feed it raw upstream bytes as they arrive;
/// it never blocks on a full frame and never mutates what it's given — the
/// caller is expected to forward the original bytes to the client unchanged
/// and feed a second copy through this parser purely to extract usage
/// metrics, so a parse failure here must never interrupt forwarding.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    event: Option<String>,
    data_lines: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, chunk: &Bytes) -> Vec<SseEvent> {
        match std::str::from_utf8(chunk) {
            Ok(text) => self.push_str(text),
            Err(_) => Vec::new(),
        }
    }

    pub fn push_str(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let mut line = self.buffer[..pos].to_string();
            self.buffer.drain(..=pos);

            if line.ends_with('\r') {
                line.pop();
            }

            if line.is_empty() {
                self.finish_event(&mut events);
                continue;
            }
            if line.starts_with(':') {
                continue;
            }
            if let Some(value) = line.strip_prefix("event:") {
                let value = value.trim_start();
                self.event = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
                continue;
            }
            if let Some(value) = line.strip_prefix("data:") {
                let value = value.trim_start();
                self.data_lines.push(value.to_string());
                continue;
            }
        }

        events
    }

    pub fn finish(&mut self) -> Vec<SseEvent> {
        let mut events = Vec::new();
        if !self.buffer.is_empty() {
            let mut line = std::mem::take(&mut self.buffer);
            if line.ends_with('\r') {
                line.pop();
            }
            if let Some(value) = line.strip_prefix("data:") {
                self.data_lines.push(value.trim_start().to_string());
            }
        }
        self.finish_event(&mut events);
        events
    }

    fn finish_event(&mut self, events: &mut Vec<SseEvent>) {
        if self.event.is_none() && self.data_lines.is_empty() {
            return;
        }
        let data = self.data_lines.join("\n");
        events.push(SseEvent {
            event: self.event.take(),
            data,
        });
        self.data_lines.clear();
    }
}

/// Marks the OpenAI-Chat terminator frame (`data: [DONE]`).
pub fn is_done_sentinel(data: &str) -> bool {
    data.trim() == "[DONE]"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_multiple_frames_across_chunks() {
        let mut parser = SseParser::new();
        let mut events = parser.push_str("data: {\"a\":1}\n\ndata: {\"a\"");
        events.extend(parser.push_str(":2}\n\n"));
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "{\"a\":1}");
        assert_eq!(events[1].data, "{\"a\":2}");
    }

    #[test]
    fn recognizes_done_sentinel() {
        let mut parser = SseParser::new();
        let events = parser.push_str("data: [DONE]\n\n");
        assert!(is_done_sentinel(&events[0].data));
    }

    #[test]
    fn trailing_partial_frame_is_not_emitted_until_finish() {
        let mut parser = SseParser::new();
        let events = parser.push_str("data: {\"partial\":true}");
        assert!(events.is_empty());
        let events = parser.finish();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"partial\":true}");
    }
}
