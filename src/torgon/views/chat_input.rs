use std::sync::Arc;

use tracing::debug;

use crate::torgon::models::{Attachment, ModelParams};
use crate::torgon::services::{ChatError, ChatService, SendOutcome, UserSend};

/// State for the chat input box and its attachment panel.
pub struct ChatInputView {
    service: Arc<ChatService>,
    thread_id: Option<String>,
    text: String,
    pending: Vec<Attachment>,
    model_params: Option<ModelParams>,
}

impl ChatInputView {
    pub fn new(service: Arc<ChatService>, thread_id: Option<String>) -> Self {
        Self {
            service,
            thread_id,
            text: String::new(),
            pending: Vec::new(),
            model_params: None,
        }
    }

    /// Restore text and attachments from the thread's saved draft, and the
    /// sampling parameters of the last user message.
    pub async fn load(&mut self) -> Result<(), ChatError> {
        let Some(thread_id) = self.thread_id.clone() else {
            return Ok(());
        };
        if let Some(draft) = self.service.get_draft_message(&thread_id).await? {
            self.text = draft.content;
            self.pending = draft.attachments;
        }
        self.model_params = self.service.get_model_params(&thread_id).await?;
        Ok(())
    }

    pub fn thread_id(&self) -> Option<&str> {
        self.thread_id.as_deref()
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn set_text(&mut self, text: impl Into<String>) {
        self.text = text.into();
    }

    pub fn model_params(&self) -> Option<ModelParams> {
        self.model_params
    }

    pub fn set_model_params(&mut self, params: ModelParams) {
        self.model_params = Some(params);
    }

    // ─── Attachment panel ───

    pub fn pending_attachments(&self) -> &[Attachment] {
        &self.pending
    }

    pub fn add_attachment(&mut self, attachment: Attachment) {
        if self.pending.iter().any(|a| a.id == attachment.id) {
            return;
        }
        debug!(name = %attachment.file_name(), "Attachment queued");
        self.pending.push(attachment);
    }

    pub fn remove_attachment(&mut self, attachment_id: &str) {
        self.pending.retain(|a| a.id != attachment_id);
    }

    /// Files already sent in this thread.
    pub async fn thread_attachments(&self) -> Result<Vec<Attachment>, ChatError> {
        match self.thread_id.as_deref() {
            Some(thread_id) => self.service.get_attachments(thread_id).await,
            None => Ok(Vec::new()),
        }
    }

    /// Removes a sent file from the server copy of the conversation.
    pub async fn delete_thread_attachment(&self, attachment_id: &str) -> Result<(), ChatError> {
        match self.thread_id.as_deref() {
            Some(thread_id) => self.service.delete_attachment(thread_id, attachment_id).await,
            None => Ok(()),
        }
    }

    // ─── Draft and submit ───

    /// Persist what has been typed so far as the thread's draft.
    pub async fn save_draft(&self) -> Result<(), ChatError> {
        let Some(thread_id) = self.thread_id.as_deref() else {
            return Ok(());
        };
        let mut draft = match self.service.get_draft_message(thread_id).await? {
            Some(draft) => draft,
            None => self.service.create_draft_message(thread_id)?,
        };
        draft.content = self.text.clone();
        draft.attachments.clear();
        for attachment in &self.pending {
            draft.add_attachment(attachment.clone());
        }
        self.service.save_message(draft).await
    }

    /// Sends the typed text. Returns `None` when there is nothing to send.
    pub async fn submit(&mut self) -> Result<Option<SendOutcome>, ChatError> {
        if self.text.trim().is_empty() && self.pending.is_empty() {
            return Ok(None);
        }

        let mut send = UserSend::new(self.text.clone()).with_attachments(self.pending.clone());
        if let Some(thread_id) = &self.thread_id {
            send = send.in_thread(thread_id.clone());
        }
        if let Some(params) = self.model_params {
            send = send.with_model_params(params);
        }

        let outcome = self.service.handle_user_send(send).await?;
        self.thread_id = Some(outcome.thread_id.clone());
        self.text.clear();
        self.pending.clear();
        Ok(Some(outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torgon::models::MessageStatus;
    use crate::torgon::test_support::chat_fixture;

    #[tokio::test]
    async fn test_submit_creates_thread_and_clears_input() {
        let (service, backend, _) = chat_fixture();
        let mut input = ChatInputView::new(service.clone(), None);

        input.set_text("hello there");
        input.add_attachment(Attachment::new("a.txt", "text/plain", b"a".to_vec()));
        let outcome = input.submit().await.unwrap().unwrap();

        assert_eq!(input.thread_id(), Some(outcome.thread_id.as_str()));
        assert!(input.text().is_empty());
        assert!(input.pending_attachments().is_empty());
        assert_eq!(backend.uploads().len(), 1);
        assert_eq!(input.thread_attachments().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_blank_submit_is_a_no_op() {
        let (service, backend, _) = chat_fixture();
        let mut input = ChatInputView::new(service, None);
        input.set_text("   ");

        assert!(input.submit().await.unwrap().is_none());
        assert!(backend.sent_requests().is_empty());
    }

    #[tokio::test]
    async fn test_draft_round_trips_through_the_service() {
        let (service, _, _) = chat_fixture();
        let thread_id = service.create_thread(None).await.unwrap();

        let mut input = ChatInputView::new(service.clone(), Some(thread_id.clone()));
        input.set_text("half a thought");
        let attachment = Attachment::new("b.png", "image/png", vec![1, 2]);
        input.add_attachment(attachment.clone());
        input.add_attachment(attachment);
        input.save_draft().await.unwrap();
        input.save_draft().await.unwrap();

        let drafts: Vec<_> = service
            .get_messages(&thread_id)
            .await
            .unwrap()
            .into_iter()
            .filter(|m| m.status == MessageStatus::Draft)
            .collect();
        assert_eq!(drafts.len(), 1);

        let mut restored = ChatInputView::new(service, Some(thread_id));
        restored.load().await.unwrap();
        assert_eq!(restored.text(), "half a thought");
        assert_eq!(restored.pending_attachments().len(), 1);
    }

    #[tokio::test]
    async fn test_deleting_sent_attachment_calls_backend() {
        let (service, backend, _) = chat_fixture();
        let thread_id = service.create_thread(None).await.unwrap();
        let input = ChatInputView::new(service, Some(thread_id.clone()));

        input.delete_thread_attachment("file-1").await.unwrap();

        assert_eq!(backend.deleted_files(), vec![(thread_id, "file-1".to_string())]);
    }
}
