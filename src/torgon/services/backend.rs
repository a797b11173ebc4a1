use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::torgon::models::{Attachment, Message, MessageRole, MessageStatus, ModelParams};
use crate::torgon::repositories::BoxFuture;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Server returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Stream for thread {thread_id} is not connected")]
    NotConnected { thread_id: String },

    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    /// `event:` field; `None` means the default `message` event.
    pub event: Option<String>,
    pub data: String,
}

impl SseFrame {
    pub fn message(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
        }
    }

    pub fn is_message(&self) -> bool {
        matches!(self.event.as_deref(), None | Some("message"))
    }
}

pub type FrameStream = BoxStream<'static, Result<SseFrame, TransportError>>;

/// Attachment metadata sent alongside a message. Binaries are uploaded
/// separately through the file endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WireAttachment {
    pub id: String,
    #[serde(rename = "type")]
    pub mime_type: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    pub id: String,
    pub role: MessageRole,
    pub content: String,
    pub thread_id: String,
    pub created_at: DateTime<Utc>,
    pub status: MessageStatus,
    pub attachments: Vec<WireAttachment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_params: Option<ModelParams>,
}

impl From<&Attachment> for WireAttachment {
    fn from(attachment: &Attachment) -> Self {
        Self {
            id: attachment.id.clone(),
            mime_type: attachment.mime_type.clone(),
            name: attachment.name.clone(),
        }
    }
}

impl From<&Message> for WireMessage {
    fn from(message: &Message) -> Self {
        Self {
            id: message.id.clone(),
            role: message.role,
            content: message.content.clone(),
            thread_id: message.thread_id.clone(),
            created_at: message.created_at,
            status: message.status,
            attachments: message.attachments.iter().map(WireAttachment::from).collect(),
            model_params: message.model_params,
        }
    }
}

/// Body of the outbound send on the stream endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub messages: Vec<WireMessage>,
    pub thread_id: String,
    pub has_files: bool,
}

impl SendMessageRequest {
    pub fn new(messages: &[Message], thread_id: &str, has_files: bool) -> Self {
        Self {
            messages: messages.iter().map(WireMessage::from).collect(),
            thread_id: thread_id.to_string(),
            has_files,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionMessage {
    pub role: MessageRole,
    pub content: String,
}

/// Body of the non-streaming completion endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionRequest {
    pub messages: Vec<CompletionMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CompletionResponse {
    pub content: String,
}

/// Everything the client needs from the remote side.
///
/// `open_stream` resolves once the server-push channel is open (the
/// transport's "open" event); the returned stream ends or yields an error
/// when the connection drops.
pub trait ChatBackend: Send + Sync + 'static {
    fn open_stream(&self, thread_id: &str) -> BoxFuture<'static, Result<FrameStream, TransportError>>;

    /// Accepting the request is all that is awaited. The reply arrives on
    /// the stream opened for the same thread.
    fn send_messages(&self, request: SendMessageRequest) -> BoxFuture<'static, Result<(), TransportError>>;

    fn complete(
        &self,
        request: CompletionRequest,
    ) -> BoxFuture<'static, Result<CompletionResponse, TransportError>>;

    fn upload_file(
        &self,
        conversation_id: &str,
        attachment: &Attachment,
    ) -> BoxFuture<'static, Result<(), TransportError>>;

    fn delete_file(
        &self,
        conversation_id: &str,
        file_id: &str,
    ) -> BoxFuture<'static, Result<(), TransportError>>;

    fn delete_conversation(&self, conversation_id: &str) -> BoxFuture<'static, Result<(), TransportError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_request_wire_shape() {
        let mut msg = Message::new("t1", MessageRole::User, "hi", MessageStatus::Done);
        msg.add_attachment(Attachment {
            id: "a1".into(),
            name: "cat.png".into(),
            mime_type: "image/png".into(),
            binary: vec![9; 16],
        });

        let body = serde_json::to_value(SendMessageRequest::new(&[msg], "t1", true)).unwrap();

        assert_eq!(body["threadId"], "t1");
        assert_eq!(body["hasFiles"], true);
        let wire = &body["messages"][0];
        assert_eq!(wire["threadId"], "t1");
        assert_eq!(wire["role"], "user");
        assert_eq!(wire["status"], "done");
        assert!(wire.get("modelParams").is_none());
        assert_eq!(
            wire["attachments"][0],
            serde_json::json!({"id": "a1", "type": "image/png", "name": "cat.png"})
        );
    }

    #[test]
    fn test_completion_request_omits_missing_thread() {
        let body = serde_json::to_value(CompletionRequest {
            messages: vec![CompletionMessage {
                role: MessageRole::User,
                content: "title?".into(),
            }],
            thread_id: None,
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({"messages": [{"role": "user", "content": "title?"}]}));
    }
}
