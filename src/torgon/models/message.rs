use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::ModelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            other => Err(format!("unknown message role '{}'", other)),
        }
    }
}

/// Lifecycle of a message.
///
/// ```text
/// draft ──submit──▶ done
/// (new) ──placeholder──▶ streaming ──chunk──▶ streaming
///                        streaming ──final──▶ done
///                        streaming ──send failure──▶ error
/// ```
///
/// Nothing leaves `done` or `error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Draft,
    Streaming,
    Done,
    Error,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Streaming => "streaming",
            Self::Done => "done",
            Self::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }

    fn can_move_to(&self, next: MessageStatus) -> bool {
        matches!(
            (self, next),
            (Self::Draft, Self::Done)
                | (Self::Streaming, Self::Streaming)
                | (Self::Streaming, Self::Done)
                | (Self::Streaming, Self::Error)
        )
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "streaming" => Ok(Self::Streaming),
            "done" => Ok(Self::Done),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown message status '{}'", other)),
        }
    }
}

/// Sampling parameters the user picked for a message.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    pub temperature: f32,
    pub top_p: f32,
}

/// A file owned by exactly one message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub mime_type: String,
    #[serde(with = "binary_base64")]
    pub binary: Vec<u8>,
}

impl Attachment {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, binary: Vec<u8>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            mime_type: mime_type.into(),
            binary,
        }
    }

    /// Name used when uploading, falling back to `file_<id>`.
    pub fn file_name(&self) -> String {
        if self.name.is_empty() {
            format!("file_{}", self.id)
        } else {
            self.name.clone()
        }
    }
}

/// One turn in a thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub thread_id: String,
    pub role: MessageRole,
    pub content: String,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_params: Option<ModelParams>,
}

impl Message {
    pub fn new(
        thread_id: impl Into<String>,
        role: MessageRole,
        content: impl Into<String>,
        status: MessageStatus,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            thread_id: thread_id.into(),
            role,
            content: content.into(),
            status,
            created_at: Utc::now(),
            attachments: Vec::new(),
            model_params: None,
        }
    }

    /// Empty user message the input box keeps while the user is typing.
    pub fn draft(thread_id: impl Into<String>) -> Self {
        Self::new(thread_id, MessageRole::User, "", MessageStatus::Draft)
    }

    /// Empty assistant message created before any chunk arrives.
    pub fn assistant_placeholder(thread_id: impl Into<String>) -> Self {
        Self::new(thread_id, MessageRole::Assistant, "", MessageStatus::Streaming)
    }

    pub fn is_streaming_assistant(&self) -> bool {
        self.role == MessageRole::Assistant && self.status == MessageStatus::Streaming
    }

    pub fn transition(&mut self, next: MessageStatus) -> Result<(), ModelError> {
        if !self.status.can_move_to(next) {
            return Err(ModelError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Content only grows while the message is streaming.
    pub fn append_chunk(&mut self, chunk: &str) -> Result<(), ModelError> {
        self.transition(MessageStatus::Streaming)?;
        self.content.push_str(chunk);
        Ok(())
    }

    pub fn complete(&mut self) -> Result<(), ModelError> {
        self.transition(MessageStatus::Done)
    }

    /// Replaces whatever arrived so far with a user-facing error text.
    pub fn fail(&mut self, error_text: &str) -> Result<(), ModelError> {
        self.transition(MessageStatus::Error)?;
        self.content = error_text.to_string();
        Ok(())
    }

    pub fn edit(&mut self, new_content: &str) -> Result<(), ModelError> {
        if new_content.trim().is_empty() {
            return Err(ModelError::EmptyContent);
        }
        if self.role != MessageRole::User || self.status == MessageStatus::Streaming {
            return Err(ModelError::NotEditable);
        }
        self.content = new_content.to_string();
        Ok(())
    }

    /// Adds an attachment unless one with the same id is already present.
    pub fn add_attachment(&mut self, attachment: Attachment) -> &mut Self {
        if !self.attachments.iter().any(|a| a.id == attachment.id) {
            self.attachments.push(attachment);
        }
        self
    }
}

mod binary_base64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
