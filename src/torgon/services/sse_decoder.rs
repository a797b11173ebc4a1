//! Incremental `text/event-stream` decoder.

use super::backend::SseFrame;

/// Turns arbitrary byte chunks into dispatched events.
///
/// Lines may be split across chunks (including in the middle of a UTF-8
/// sequence), so raw bytes are buffered until a full line is available.
#[derive(Debug, Default)]
pub struct SseDecoder {
    pending: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SseFrame> {
        self.pending.extend_from_slice(bytes);

        let mut frames = Vec::new();
        while let Some(line_end) = self.pending.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=line_end).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line).into_owned();
            if let Some(frame) = self.process_line(&line) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Flush whatever is left once the connection has ended.
    pub fn finish(&mut self) -> Option<SseFrame> {
        if !self.pending.is_empty() {
            let line = String::from_utf8_lossy(&std::mem::take(&mut self.pending)).into_owned();
            let line = line.trim_end_matches('\r').to_string();
            if let Some(frame) = self.process_line(&line) {
                return Some(frame);
            }
        }
        self.dispatch()
    }

    fn process_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            // `id` and `retry` carry nothing the client uses.
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseFrame { event, data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_event() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.feed(b"data: {\"content\":\"Hi\",\"isDone\":false}\n\n");
        assert_eq!(frames, vec![SseFrame::message("{\"content\":\"Hi\",\"isDone\":false}")]);
    }

    #[test]
    fn test_event_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"data: hel").is_empty());
        assert!(decoder.feed(b"lo\r\n").is_empty());
        let frames = decoder.feed(b"\r\n");
        assert_eq!(frames, vec![SseFrame::message("hello")]);
    }

    #[test]
    fn test_utf8_split_inside_character() {
        let bytes = "data: héllo\n\n".as_bytes();
        let split = bytes.iter().position(|b| *b == 0xC3).unwrap() + 1;

        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(&bytes[..split]).is_empty());
        assert_eq!(decoder.feed(&bytes[split..]), vec![SseFrame::message("héllo")]);
    }

    #[test]
    fn test_named_events_comments_and_multiline_data() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.feed(
            b": keepalive\nevent: connected\ndata: ok\n\ndata: line one\ndata: line two\nid: 7\n\n",
        );
        assert_eq!(
            frames,
            vec![
                SseFrame {
                    event: Some("connected".into()),
                    data: "ok".into(),
                },
                SseFrame::message("line one\nline two"),
            ]
        );
    }

    #[test]
    fn test_finish_flushes_unterminated_event() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"data: tail").is_empty());
        assert_eq!(decoder.finish(), Some(SseFrame::message("tail")));
        assert_eq!(decoder.finish(), None);
    }
}
