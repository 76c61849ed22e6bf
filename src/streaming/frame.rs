//! Frame parsers for the three streaming wire conventions.
//!
//! Parsers are pure: they take decoded text and return complete frames,
//! buffering partial input internally. They know nothing about event
//! semantics beyond the `[DONE]` sentinel.

use serde_json::Value;

use crate::types::Framing;

/// Completion sentinel shared by SSE and NDJSON backends.
pub const DONE_SENTINEL: &str = "[DONE]";

/// One unit extracted from a streaming body.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A decoded JSON payload plus the most recent `event:` name, if any.
    Json {
        event: Option<String>,
        payload: Value,
    },
    /// The `[DONE]` sentinel (or end of a chunked-text body).
    Done,
    /// A frame whose data was not valid JSON.
    Malformed { reason: String },
    /// The body ended with a partial frame still buffered.
    Incomplete { remainder: String },
    /// Raw text from a chunked-text body.
    Text(String),
}

/// Common interface of the three parsers.
pub trait FrameParser: Send {
    /// Feed decoded text, returning every frame it completes.
    fn push(&mut self, text: &str) -> Vec<Frame>;

    /// Signal end of input, returning any final frames.
    fn finish(&mut self) -> Vec<Frame>;
}

/// Create the parser for a declared framing.
pub fn parser_for(framing: Framing) -> Box<dyn FrameParser> {
    match framing {
        Framing::Sse => Box::new(SseParser::new()),
        Framing::Ndjson => Box::new(NdjsonParser::new()),
        Framing::ChunkedText => Box::new(ChunkedTextParser),
    }
}

fn parse_data(data: &str, event: Option<String>) -> Frame {
    let trimmed = data.trim();
    if trimmed == DONE_SENTINEL {
        return Frame::Done;
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(payload) => Frame::Json { event, payload },
        Err(e) => Frame::Malformed {
            reason: format!("invalid JSON in frame: {}", e),
        },
    }
}

// ============================================================================
// Server-sent events
// ============================================================================

/// Splits an SSE body into blocks separated by a blank line.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    fn parse_block(block: &str) -> Option<Frame> {
        let mut event = None;
        let mut data: Vec<&str> = Vec::new();

        for line in block.lines() {
            if line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => event = Some(value.trim().to_string()),
                "data" => data.push(value),
                _ => {}
            }
        }

        // Comment-only or keep-alive blocks carry no data.
        if data.is_empty() {
            return None;
        }
        Some(parse_data(&data.join("\n"), event))
    }
}

impl FrameParser for SseParser {
    fn push(&mut self, text: &str) -> Vec<Frame> {
        self.buffer.push_str(text);
        if self.buffer.contains('\r') {
            self.buffer = self.buffer.replace("\r\n", "\n");
        }

        let mut frames = Vec::new();
        while let Some(idx) = self.buffer.find("\n\n") {
            let block: String = self.buffer.drain(..idx + 2).collect();
            if let Some(frame) = Self::parse_block(&block) {
                frames.push(frame);
            }
        }
        frames
    }

    fn finish(&mut self) -> Vec<Frame> {
        let remainder = std::mem::take(&mut self.buffer);
        if remainder.trim().is_empty() {
            Vec::new()
        } else {
            vec![Frame::Incomplete { remainder }]
        }
    }
}

// ============================================================================
// Newline-delimited JSON
// ============================================================================

/// Splits an NDJSON body into lines.
#[derive(Debug, Default)]
pub struct NdjsonParser {
    buffer: String,
}

impl NdjsonParser {
    pub fn new() -> Self {
        Self::default()
    }

    fn parse_line(line: &str) -> Option<Frame> {
        let line = line.trim();
        if line.is_empty() {
            None
        } else {
            Some(parse_data(line, None))
        }
    }
}

impl FrameParser for NdjsonParser {
    fn push(&mut self, text: &str) -> Vec<Frame> {
        self.buffer.push_str(text);
        let mut frames = Vec::new();
        while let Some(idx) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..idx + 1).collect();
            frames.extend(Self::parse_line(&line));
        }
        frames
    }

    fn finish(&mut self) -> Vec<Frame> {
        let rest = std::mem::take(&mut self.buffer);
        Self::parse_line(&rest).into_iter().collect()
    }
}

// ============================================================================
// Chunked text
// ============================================================================

/// Emits every non-empty chunk verbatim and completes at end of input.
#[derive(Debug, Default)]
pub struct ChunkedTextParser;

impl FrameParser for ChunkedTextParser {
    fn push(&mut self, text: &str) -> Vec<Frame> {
        if text.is_empty() {
            Vec::new()
        } else {
            vec![Frame::Text(text.to_string())]
        }
    }

    fn finish(&mut self) -> Vec<Frame> {
        vec![Frame::Done]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sse_event_and_multiline_data() {
        let mut parser = SseParser::new();
        let frames = parser.push("event: message_start\ndata: {\"a\":\ndata: 1}\n\n");
        assert_eq!(
            frames,
            vec![Frame::Json {
                event: Some("message_start".into()),
                payload: json!({"a": 1}),
            }]
        );
    }

    #[test]
    fn test_sse_crlf_and_comments() {
        let mut parser = SseParser::new();
        let mut frames = parser.push(": keep-alive\r\n\r\ndata: {\"x\":1}\r");
        frames.extend(parser.push("\n\r\n"));
        assert_eq!(
            frames,
            vec![Frame::Json {
                event: None,
                payload: json!({"x": 1})
            }]
        );
        assert!(parser.finish().is_empty());
    }

    #[test]
    fn test_sse_done_sentinel() {
        let mut parser = SseParser::new();
        assert_eq!(parser.push("data: [DONE]\n\n"), vec![Frame::Done]);
    }

    #[test]
    fn test_sse_malformed_block_does_not_stop_parsing() {
        let mut parser = SseParser::new();
        let frames = parser.push("data: {bad}\n\ndata: {\"ok\":true}\n\n");
        assert!(matches!(frames[0], Frame::Malformed { .. }));
        assert_eq!(
            frames[1],
            Frame::Json {
                event: None,
                payload: json!({"ok": true})
            }
        );
    }

    #[test]
    fn test_sse_cut_off_frame_reports_incomplete() {
        let mut parser = SseParser::new();
        assert!(parser.push("data: {\"partial\":").is_empty());
        let frames = parser.finish();
        assert!(matches!(frames.as_slice(), [Frame::Incomplete { .. }]));
    }

    #[test]
    fn test_ndjson_lines_and_trailing_fragment() {
        let mut parser = NdjsonParser::new();
        let mut frames = parser.push("{\"n\":1}\n\n{\"n\":");
        frames.extend(parser.push("2}\n[DONE]\n{\"n\":3}"));
        frames.extend(parser.finish());
        assert_eq!(
            frames,
            vec![
                Frame::Json {
                    event: None,
                    payload: json!({"n": 1})
                },
                Frame::Json {
                    event: None,
                    payload: json!({"n": 2})
                },
                Frame::Done,
                Frame::Json {
                    event: None,
                    payload: json!({"n": 3})
                },
            ]
        );
    }

    #[test]
    fn test_chunked_text_passthrough() {
        let mut parser = ChunkedTextParser;
        assert!(parser.push("").is_empty());
        assert_eq!(parser.push("hel"), vec![Frame::Text("hel".into())]);
        assert_eq!(parser.finish(), vec![Frame::Done]);
    }
}
