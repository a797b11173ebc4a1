//! Decoding of stream frame payloads.
//!
//! Frames are expected to carry `{"content": "...", "isDone": bool}` but some
//! proxies double-encode or quote the payload. Decoding falls through three
//! tiers and never discards a frame:
//!
//! 1. the payload is a JSON object;
//! 2. the payload is a quoted/escaped JSON object;
//! 3. the payload is plain text content.

use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamPayload {
    pub content: Option<String>,
    pub is_done: bool,
}

impl StreamPayload {
    pub fn content(&self) -> &str {
        self.content.as_deref().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseTier {
    Direct,
    Unwrapped,
    RawText,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFrame {
    pub payload: StreamPayload,
    pub tier: ParseTier,
}

pub fn parse_frame(data: &str) -> ParsedFrame {
    if let Some(payload) = payload_from_json(data) {
        return ParsedFrame {
            payload,
            tier: ParseTier::Direct,
        };
    }

    if let Some(payload) = payload_from_json(&unwrap_quoted(data)) {
        return ParsedFrame {
            payload,
            tier: ParseTier::Unwrapped,
        };
    }

    ParsedFrame {
        payload: StreamPayload {
            content: Some(data.to_string()),
            is_done: false,
        },
        tier: ParseTier::RawText,
    }
}

/// Only JSON objects count as payloads; bare strings or numbers fall through.
fn payload_from_json(text: &str) -> Option<StreamPayload> {
    let Value::Object(fields) = serde_json::from_str::<Value>(text).ok()? else {
        return None;
    };

    let content = match fields.get("content") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => Some(other.to_string()),
    };
    let is_done = matches!(fields.get("isDone"), Some(Value::Bool(true)));

    Some(StreamPayload { content, is_done })
}

/// Strip one pair of surrounding quotes and undo one level of escaping.
fn unwrap_quoted(data: &str) -> String {
    let data = data.strip_prefix('"').unwrap_or(data);
    let data = data.strip_suffix('"').unwrap_or(data);
    data.replace("\\\"", "\"").replace("\\\\", "\\")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_json() {
        let parsed = parse_frame(r#"{"content":"Hello","isDone":false}"#);
        assert_eq!(parsed.tier, ParseTier::Direct);
        assert_eq!(parsed.payload.content(), "Hello");
        assert!(!parsed.payload.is_done);

        let done = parse_frame(r#"{"isDone":true}"#);
        assert_eq!(done.payload.content, None);
        assert!(done.payload.is_done);
    }

    #[test]
    fn test_double_encoded_json() {
        let wrapped = serde_json::to_string(r#"{"content":"Hi \"there\"","isDone":true}"#).unwrap();
        let parsed = parse_frame(&wrapped);
        assert_eq!(parsed.tier, ParseTier::Unwrapped);
        assert_eq!(parsed.payload.content(), "Hi \"there\"");
        assert!(parsed.payload.is_done);
    }

    #[test]
    fn test_plain_text_is_content() {
        let parsed = parse_frame("just some words");
        assert_eq!(parsed.tier, ParseTier::RawText);
        assert_eq!(parsed.payload.content(), "just some words");
        assert!(!parsed.payload.is_done);
    }

    #[test]
    fn test_json_scalar_is_kept_verbatim() {
        let parsed = parse_frame("\"hello\"");
        assert_eq!(parsed.tier, ParseTier::RawText);
        assert_eq!(parsed.payload.content(), "\"hello\"");
    }

    #[test]
    fn test_only_boolean_true_finishes() {
        let parsed = parse_frame(r#"{"content":"x","isDone":"true"}"#);
        assert!(!parsed.payload.is_done);
        let parsed = parse_frame(r#"{"content":42}"#);
        assert_eq!(parsed.payload.content(), "42");
    }
}
