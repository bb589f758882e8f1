//! SSE wire parsing and serialization.
//!
//! The upstream body is consumed as a raw byte stream. Messages are split on
//! the `\n\n` boundary; a partial trailing message is held in the buffer
//! until the next read or end-of-stream.

/// One decoded SSE message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SseMessage {
    pub event: Option<String>,
    pub data: Option<String>,
}

impl SseMessage {
    pub fn is_done(&self) -> bool {
        self.data.as_deref() == Some("[DONE]")
    }
}

/// Incremental SSE decoder with cross-read buffering.
pub struct SseParser {
    buffer: Vec<u8>,
}

impl SseParser {
    pub fn new() -> Self {
        SseParser { buffer: Vec::new() }
    }

    /// Feed bytes and return every message completed by this read.
    pub fn parse(&mut self, chunk: &[u8]) -> Vec<SseMessage> {
        self.buffer.extend_from_slice(chunk);

        let mut messages = Vec::new();
        while let Some(pos) = find_boundary(&self.buffer) {
            let segment: Vec<u8> = self.buffer.drain(..pos + 2).collect();
            let text = String::from_utf8_lossy(&segment[..pos]);
            if let Some(message) = parse_message(&text) {
                messages.push(message);
            }
        }
        messages
    }

    /// Flush whatever remains in the buffer as a final message, if any.
    /// Used at end-of-stream for upstreams that omit the trailing boundary.
    pub fn finish(&mut self) -> Option<SseMessage> {
        if self.buffer.is_empty() {
            return None;
        }
        let remainder = std::mem::take(&mut self.buffer);
        let text = String::from_utf8_lossy(&remainder);
        parse_message(&text)
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for SseParser {
    fn default() -> Self {
        Self::new()
    }
}

fn find_boundary(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\n\n")
}

fn parse_message(text: &str) -> Option<SseMessage> {
    let mut message = SseMessage::default();
    for line in text.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = line.split_once(':')?;
        let value = value.strip_prefix(' ').unwrap_or(value);
        match field {
            "event" => message.event = Some(value.to_string()),
            "data" => match message.data {
                Some(ref mut data) => {
                    data.push('\n');
                    data.push_str(value);
                }
                None => message.data = Some(value.to_string()),
            },
            _ => {}
        }
    }
    if message.event.is_some() || message.data.is_some() {
        Some(message)
    } else {
        None
    }
}

/// `data: <payload>\n\n`
pub fn format_sse_data(data: &str) -> String {
    format!("data: {}\n\n", data)
}

/// The stream terminator every client sees.
pub fn format_sse_done() -> String {
    "data: [DONE]\n\n".to_string()
}

/// Keep-alive comment for queued streaming clients.
pub fn format_sse_ping() -> String {
    ": ping\n\n".to_string()
}

/// `event: <name>\ndata: <payload>\n\n`
pub fn format_sse_event(event: &str, data: &str) -> String {
    format!("event: {}\ndata: {}\n\n", event, data)
}
