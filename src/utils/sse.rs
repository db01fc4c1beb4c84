//! Incremental reader for `text/event-stream` bodies relayed from a backend.
//!
//! The relay never rewrites stream bytes; it only needs to see frame boundaries and
//! payloads to tell a completed stream (one ending in the done marker) from a truncated one.

pub const DONE_MARKER: &str = "[DONE]";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

impl SseFrame {
    pub fn is_done(&self) -> bool {
        self.data.trim() == DONE_MARKER
    }

    fn is_empty(&self) -> bool {
        self.event.is_none() && self.data.is_empty()
    }
}

/// Splits a byte stream into frames. Chunks may cut lines, line endings and UTF-8
/// sequences anywhere; unfinished input stays buffered until the next chunk.
#[derive(Debug, Default)]
pub struct SseParser {
    pending: Vec<u8>,
    frame: SseFrame,
    trailing_cr: bool,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        let mut frames = Vec::new();
        for &byte in chunk {
            // "\r\n" is one terminator; the "\r" already ended the line.
            if self.trailing_cr {
                self.trailing_cr = false;
                if byte == b'\n' {
                    continue;
                }
            }
            match byte {
                b'\n' | b'\r' => {
                    self.trailing_cr = byte == b'\r';
                    let line = std::mem::take(&mut self.pending);
                    if let Some(frame) = self.end_line(&String::from_utf8_lossy(&line)) {
                        frames.push(frame);
                    }
                }
                _ => self.pending.push(byte),
            }
        }
        frames
    }

    fn end_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            if self.frame.is_empty() {
                return None;
            }
            return Some(std::mem::take(&mut self.frame));
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.strip_prefix(' ').unwrap_or(value);
        match field {
            "data" => {
                if !self.frame.data.is_empty() {
                    self.frame.data.push('\n');
                }
                self.frame.data.push_str(value);
            }
            "event" => self.frame.event = Some(value.to_string()),
            _ => {}
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_chunks_and_done() {
        let mut parser = SseParser::new();
        let frames = parser.process(b"data: {\"choices\":[]}\n\ndata: [DONE]\n\n");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data, "{\"choices\":[]}");
        assert!(!frames[0].is_done());
        assert!(frames[1].is_done());
    }

    #[test]
    fn test_frame_split_across_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.process(b"data: hel").is_empty());
        assert!(parser.process(b"lo\n").is_empty());
        let frames = parser.process(b"\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "hello");
    }

    #[test]
    fn test_crlf_split_between_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.process(b"data: x\r").is_empty());
        let frames = parser.process(b"\n\r\n");
        assert_eq!(frames, vec![SseFrame { event: None, data: "x".to_string() }]);
    }

    #[test]
    fn test_event_name_multiline_data_and_comments() {
        let mut parser = SseParser::new();
        let frames = parser.process(b": keep-alive\n\nevent: error\ndata: a\ndata: b\nid: 9\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("error"));
        assert_eq!(frames[0].data, "a\nb");
    }

    #[test]
    fn test_utf8_split_inside_payload() {
        let mut parser = SseParser::new();
        let text = "data: héllo\n\n".as_bytes();
        let (head, tail) = text.split_at(8);
        assert!(parser.process(head).is_empty());
        assert_eq!(parser.process(tail)[0].data, "héllo");
    }
}
