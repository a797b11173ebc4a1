use crate::torgon::models::{
    Message, MessageChange, MessageRole, MessageStatus, dedupe_by_id, diff_messages,
};

/// One rendered line of the message list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRow {
    pub id: String,
    pub role: MessageRole,
    pub status: MessageStatus,
    pub content: String,
    pub attachment_names: Vec<String>,
}

impl MessageRow {
    pub fn is_error(&self) -> bool {
        self.status == MessageStatus::Error
    }
}

/// Live text received for a streaming message ahead of persistence.
#[derive(Debug, Default)]
struct LiveOverlay {
    message_id: Option<String>,
    text: String,
}

/// Message list state for one thread.
///
/// Rows come from repository snapshots. Chunks pushed straight from the
/// stream only ever extend the persisted text of the streaming message, so
/// a chunk seen through both paths is shown once.
#[derive(Debug)]
pub struct MessageListView {
    thread_id: String,
    messages: Vec<Message>,
    overlay: LiveOverlay,
}

impl MessageListView {
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            messages: Vec::new(),
            overlay: LiveOverlay::default(),
        }
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    /// Replace the cached list with `snapshot`, returning the row changes.
    pub fn apply_snapshot(&mut self, snapshot: Vec<Message>) -> Vec<MessageChange> {
        let next = dedupe_by_id(
            snapshot
                .into_iter()
                .filter(|m| m.thread_id == self.thread_id && m.status != MessageStatus::Draft)
                .collect(),
        );
        let changes = diff_messages(&self.messages, &next);
        self.messages = next;

        let overlay_still_streaming = self.overlay.message_id.as_deref().is_some_and(|id| {
            self.messages
                .iter()
                .any(|m| m.id == id && m.is_streaming_assistant())
        });
        if !overlay_still_streaming {
            self.overlay = LiveOverlay::default();
        }

        changes
    }

    /// Optimistic text for the streaming message. Ignored when no streaming
    /// message is known yet; the persisted copy catches up either way.
    pub fn push_live_chunk(&mut self, content: &str) {
        let Some((id, persisted)) = self
            .streaming_message()
            .map(|m| (m.id.clone(), m.content.clone()))
        else {
            return;
        };
        if self.overlay.message_id.as_deref() != Some(id.as_str()) {
            self.overlay = LiveOverlay {
                message_id: Some(id),
                text: persisted,
            };
        }
        self.overlay.text.push_str(content);
    }

    pub fn streaming_message(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.is_streaming_assistant())
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn rows(&self) -> Vec<MessageRow> {
        self.messages
            .iter()
            .map(|message| MessageRow {
                id: message.id.clone(),
                role: message.role,
                status: message.status,
                content: self.display_content(message),
                attachment_names: message.attachments.iter().map(|a| a.file_name()).collect(),
            })
            .collect()
    }

    fn display_content(&self, message: &Message) -> String {
        let persisted = &message.content;
        if self.overlay.message_id.as_deref() == Some(message.id.as_str())
            && self.overlay.text.len() > persisted.len()
            && self.overlay.text.starts_with(persisted.as_str())
        {
            return self.overlay.text.clone();
        }
        persisted.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(content: &str) -> Message {
        Message::new("t1", MessageRole::User, content, MessageStatus::Done)
    }

    #[test]
    fn test_live_chunks_render_ahead_of_persistence() {
        let mut view = MessageListView::new("t1");
        let question = user("hi");
        let mut reply = Message::assistant_placeholder("t1");
        view.apply_snapshot(vec![question.clone(), reply.clone()]);

        view.push_live_chunk("Hel");
        view.push_live_chunk("lo");
        assert_eq!(view.rows()[1].content, "Hello");

        // Persistence catches up with the first chunk only.
        reply.append_chunk("Hel").unwrap();
        let changes = view.apply_snapshot(vec![question.clone(), reply.clone()]);
        assert_eq!(changes.len(), 1);
        assert_eq!(view.rows()[1].content, "Hello");

        reply.append_chunk("lo").unwrap();
        reply.complete().unwrap();
        view.apply_snapshot(vec![question, reply]);
        assert_eq!(view.rows()[1].content, "Hello");
        assert_eq!(view.rows()[1].status, MessageStatus::Done);
        assert!(view.streaming_message().is_none());
    }

    #[test]
    fn test_snapshot_duplicates_and_foreign_rows_are_dropped() {
        let mut view = MessageListView::new("t1");
        let a = user("a");
        let mut other = user("elsewhere");
        other.thread_id = "t2".into();

        let changes = view.apply_snapshot(vec![a.clone(), a.clone(), other, Message::draft("t1")]);

        assert_eq!(view.len(), 1);
        assert_eq!(
            changes,
            vec![MessageChange::Inserted {
                index: 0,
                message: a,
            }]
        );
    }

    #[test]
    fn test_chunk_without_streaming_message_is_ignored() {
        let mut view = MessageListView::new("t1");
        view.apply_snapshot(vec![user("hi")]);
        view.push_live_chunk("stray");
        assert_eq!(view.rows()[0].content, "hi");
    }

    #[test]
    fn test_error_rows_are_flagged() {
        let mut view = MessageListView::new("t1");
        let mut failed = Message::assistant_placeholder("t1");
        failed.fail("Sorry").unwrap();
        view.apply_snapshot(vec![failed]);
        assert!(view.rows()[0].is_error());
    }
}
