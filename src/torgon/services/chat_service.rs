use std::sync::{Arc, Weak};

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::backend::{ChatBackend, TransportError};
use super::stream_service::{ChunkSink, StreamSessions};
use super::title_generator::generate_title;
use crate::settings::models::ClientSettings;
use crate::torgon::models::{
    Attachment, Message, MessageRole, MessageStatus, ModelError, ModelParams, Thread,
};
use crate::torgon::repositories::{
    BoxFuture, MessagesCallback, RepositoryError, Subscription, ThreadRepository,
    ThreadsCallback,
};

#[derive(Debug, Error)]
pub enum ChatError {
    #[error(transparent)]
    Validation(#[from] ModelError),

    #[error("Thread not found: {0}")]
    ThreadNotFound(String),

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Title generation failed: {0}")]
    TitleGeneration(String),
}

/// One inbound stream event routed to persistence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkUpdate {
    pub thread_id: String,
    pub chunk: Option<String>,
    /// Completion signal only; content is never taken from here.
    pub final_content: Option<String>,
}

impl ChunkUpdate {
    pub fn chunk(thread_id: &str, chunk: &str) -> Self {
        Self {
            thread_id: thread_id.to_string(),
            chunk: Some(chunk.to_string()),
            final_content: None,
        }
    }

    pub fn finished(thread_id: &str, final_content: &str) -> Self {
        Self {
            thread_id: thread_id.to_string(),
            chunk: None,
            final_content: Some(final_content.to_string()),
        }
    }
}

/// What the user submitted from the input box.
#[derive(Debug, Clone)]
pub struct UserSend {
    pub thread_id: Option<String>,
    pub content: String,
    pub role: MessageRole,
    pub attachments: Vec<Attachment>,
    pub model_params: Option<ModelParams>,
}

impl UserSend {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            thread_id: None,
            content: content.into(),
            role: MessageRole::User,
            attachments: Vec::new(),
            model_params: None,
        }
    }

    pub fn in_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn with_model_params(mut self, params: ModelParams) -> Self {
        self.model_params = Some(params);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOutcome {
    pub thread_id: String,
    pub user_message_id: String,
    pub assistant_message_id: String,
    /// Whether the server accepted the batch. On `false` the placeholder is
    /// already in `error` state.
    pub delivered: bool,
}

/// The only writer of thread and message state.
///
/// Read-modify-write sequences on streaming messages run under `write_gate`
/// and always start from a fresh repository read, so a chunk landing while a
/// send is suspended still sees the latest rows.
pub struct ChatService {
    repository: Arc<dyn ThreadRepository>,
    backend: Arc<dyn ChatBackend>,
    settings: ClientSettings,
    sessions: Arc<StreamSessions>,
    write_gate: tokio::sync::Mutex<()>,
    weak_self: Weak<ChatService>,
}

impl ChatService {
    pub fn new(
        repository: Arc<dyn ThreadRepository>,
        backend: Arc<dyn ChatBackend>,
        settings: ClientSettings,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self: &Weak<ChatService>| {
            let sink: Weak<dyn ChunkSink> = weak_self.clone();
            let sessions = Arc::new(StreamSessions::new(backend.clone(), settings.clone(), sink));
            Self {
                repository,
                backend,
                settings,
                sessions,
                write_gate: tokio::sync::Mutex::new(()),
                weak_self: weak_self.clone(),
            }
        })
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn stream_sessions(&self) -> &Arc<StreamSessions> {
        &self.sessions
    }

    // ─── Threads ───

    pub async fn create_thread(&self, title: Option<&str>) -> Result<String, ChatError> {
        let title = title
            .filter(|t| !t.trim().is_empty())
            .unwrap_or(self.settings.default_thread_title.as_str());
        let thread = Thread::new(title);
        let id = thread.id.clone();
        self.repository.save_thread(thread).await?;
        info!(thread_id = %id, "Thread created");
        Ok(id)
    }

    pub async fn get_thread(&self, thread_id: &str) -> Result<Option<Thread>, ChatError> {
        Ok(self.repository.get_thread_by_id(thread_id).await?)
    }

    pub async fn list_threads(&self) -> Result<Vec<Thread>, ChatError> {
        Ok(self.repository.list_threads().await?)
    }

    pub async fn rename_thread(&self, thread_id: &str, title: &str) -> Result<(), ChatError> {
        let mut thread = self.require_thread(thread_id).await?;
        thread.rename(title)?;
        self.repository.save_thread(thread).await?;
        debug!(thread_id = %thread_id, title = %title, "Thread renamed");
        Ok(())
    }

    /// Deletes the server-side conversation, then the local copy. A failed
    /// remote delete does not keep the local thread around.
    pub async fn delete_thread(&self, thread_id: &str) -> Result<(), ChatError> {
        if thread_id.is_empty() {
            return Err(ModelError::MissingId { what: "thread id" }.into());
        }
        if let Err(e) = self.backend.delete_conversation(thread_id).await {
            warn!(thread_id = %thread_id, error = %e, "Remote conversation delete failed");
        }
        self.repository.delete_thread_with_messages(thread_id).await?;

        if let Some(session) = self.sessions.current()
            && session.thread_id() == thread_id
        {
            self.sessions.close_if_current(&session);
        }
        info!(thread_id = %thread_id, "Thread deleted");
        Ok(())
    }

    /// Completion-based title for `thread_id`, applied through `rename_thread`.
    pub async fn generate_thread_name(&self, thread_id: &str, content: &str) -> Result<String, ChatError> {
        let title = match generate_title(self.backend.as_ref(), content).await {
            Ok(title) => title,
            Err(e) => {
                warn!(thread_id = %thread_id, error = ?e, "Title generation failed");
                return Err(ChatError::TitleGeneration(format!("{e:#}")));
            }
        };
        self.rename_thread(thread_id, &title).await?;
        Ok(title)
    }

    // ─── Messages ───

    pub async fn get_messages(&self, thread_id: &str) -> Result<Vec<Message>, ChatError> {
        Ok(self.repository.get_messages_by_thread_id(thread_id).await?)
    }

    /// Every attachment in the thread, in message order.
    pub async fn get_attachments(&self, thread_id: &str) -> Result<Vec<Attachment>, ChatError> {
        let messages = self.repository.get_messages_by_thread_id(thread_id).await?;
        Ok(messages
            .into_iter()
            .flat_map(|message| message.attachments)
            .collect())
    }

    /// Sampling parameters of the latest user message.
    pub async fn get_model_params(&self, thread_id: &str) -> Result<Option<ModelParams>, ChatError> {
        let messages = self.repository.get_messages_by_thread_id(thread_id).await?;
        Ok(messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .and_then(|m| m.model_params))
    }

    /// A fresh, unsaved draft for the input box.
    pub fn create_draft_message(&self, thread_id: &str) -> Result<Message, ChatError> {
        if thread_id.is_empty() {
            return Err(ModelError::MissingId { what: "thread id" }.into());
        }
        Ok(Message::draft(thread_id))
    }

    pub async fn get_draft_message(&self, thread_id: &str) -> Result<Option<Message>, ChatError> {
        let messages = self.repository.get_messages_by_thread_id(thread_id).await?;
        Ok(messages.into_iter().find(|m| m.status == MessageStatus::Draft))
    }

    pub async fn save_message(&self, message: Message) -> Result<(), ChatError> {
        if message.thread_id.is_empty() {
            return Err(ModelError::MissingId { what: "thread id" }.into());
        }
        Ok(self.repository.save_message(message).await?)
    }

    pub async fn edit_message(&self, message_id: &str, content: &str) -> Result<Message, ChatError> {
        let mut message = self
            .repository
            .get_message(message_id)
            .await?
            .ok_or_else(|| ChatError::MessageNotFound(message_id.to_string()))?;
        if !message.status.is_terminal() && message.status != MessageStatus::Draft {
            return Err(ModelError::NotEditable.into());
        }
        message.edit(content)?;
        self.repository.save_message(message.clone()).await?;
        Ok(message)
    }

    pub async fn upload_attachment(&self, thread_id: &str, attachment: &Attachment) -> Result<(), ChatError> {
        if thread_id.is_empty() {
            return Err(ModelError::MissingId { what: "thread id" }.into());
        }
        Ok(self
            .upload_attachments(thread_id, std::slice::from_ref(attachment))
            .await?)
    }

    pub async fn delete_attachment(&self, thread_id: &str, attachment_id: &str) -> Result<(), ChatError> {
        if thread_id.is_empty() || attachment_id.is_empty() {
            return Err(ModelError::MissingId { what: "attachment id" }.into());
        }
        self.backend.delete_file(thread_id, attachment_id).await?;
        Ok(())
    }

    pub fn subscribe_to_messages(&self, thread_id: &str, callback: MessagesCallback) -> Subscription {
        self.repository.subscribe_to_messages(thread_id, callback)
    }

    pub fn subscribe_to_threads(&self, callback: ThreadsCallback) -> Subscription {
        self.repository.subscribe_to_threads(callback)
    }

    // ─── Sending ───

    /// Persists the user message and an empty streaming placeholder, then
    /// posts the thread to the server. The reply arrives on the stream.
    ///
    /// A rejected send is not an error: the placeholder is flipped to
    /// `error` with the apology text and `delivered` is false.
    pub async fn handle_user_send(&self, send: UserSend) -> Result<SendOutcome, ChatError> {
        if send.content.trim().is_empty() && send.attachments.is_empty() {
            return Err(ModelError::EmptyContent.into());
        }

        let mut thread = match send.thread_id.as_deref() {
            Some("") => return Err(ModelError::MissingId { what: "thread id" }.into()),
            Some(id) => self.require_thread(id).await?,
            None => {
                let id = self.create_thread(None).await?;
                self.require_thread(&id).await?
            }
        };
        let thread_id = thread.id.clone();

        // First turn of a thread nobody has named yet.
        let needs_title = thread.title == self.settings.default_thread_title
            && self
                .repository
                .get_messages_by_thread_id(&thread_id)
                .await?
                .iter()
                .all(|m| m.status == MessageStatus::Draft);

        thread.update_last_message_time();
        self.repository.save_thread(thread).await?;

        if needs_title {
            self.spawn_title_generation(&thread_id, &send.content);
        }

        // The draft row, if any, becomes the sent message.
        let mut user_message = self
            .get_draft_message(&thread_id)
            .await?
            .unwrap_or_else(|| Message::draft(&thread_id));
        user_message.role = send.role;
        user_message.content = send.content;
        user_message.created_at = Utc::now();
        if send.model_params.is_some() {
            user_message.model_params = send.model_params;
        }
        for attachment in send.attachments {
            user_message.add_attachment(attachment);
        }
        user_message.transition(MessageStatus::Done)?;
        let user_message_id = user_message.id.clone();
        let uploads = user_message.attachments.clone();
        self.repository.save_message(user_message).await?;

        let assistant_message_id = self.create_placeholder(&thread_id).await?;

        let outgoing: Vec<Message> = self
            .repository
            .get_messages_by_thread_id(&thread_id)
            .await?
            .into_iter()
            .filter(|m| m.status.is_terminal())
            .collect();
        let has_files = outgoing.iter().any(|m| !m.attachments.is_empty());

        let sent = match self.upload_attachments(&thread_id, &uploads).await {
            Ok(()) => self.send_to_stream(&thread_id, &outgoing, has_files).await,
            Err(e) => Err(e),
        };
        let delivered = match sent {
            Ok(()) => true,
            Err(e) => {
                error!(thread_id = %thread_id, error = %e, "Send failed");
                self.fail_streaming_message(&thread_id).await?;
                false
            }
        };

        Ok(SendOutcome {
            thread_id,
            user_message_id,
            assistant_message_id,
            delivered,
        })
    }

    /// Routes one stream event to the streaming assistant message of its
    /// thread. A missing placeholder is logged and ignored.
    pub async fn handle_message_chunk(&self, update: ChunkUpdate) -> Result<(), ChatError> {
        let _gate = self.write_gate.lock().await;

        let messages = self
            .repository
            .get_messages_by_thread_id(&update.thread_id)
            .await?;
        let mut candidates: Vec<Message> = messages
            .into_iter()
            .filter(Message::is_streaming_assistant)
            .collect();
        if candidates.len() > 1 {
            error!(
                thread_id = %update.thread_id,
                count = candidates.len(),
                "More than one streaming assistant message, using the latest"
            );
        }
        let Some(mut message) = candidates.pop() else {
            warn!(thread_id = %update.thread_id, "Stream chunk arrived with no streaming placeholder");
            return Ok(());
        };

        if update.final_content.is_some() {
            message.complete()?;
            debug!(thread_id = %update.thread_id, message_id = %message.id, "Stream completed");
        } else {
            match update.chunk.as_deref() {
                Some(chunk) if !chunk.is_empty() => message.append_chunk(chunk)?,
                _ => return Ok(()),
            }
        }

        self.repository.save_message(message).await?;
        Ok(())
    }

    /// Files travel ahead of the batch; the batch itself only says `hasFiles`.
    async fn upload_attachments(&self, thread_id: &str, attachments: &[Attachment]) -> Result<(), TransportError> {
        for attachment in attachments {
            self.backend.upload_file(thread_id, attachment).await?;
            debug!(thread_id = %thread_id, attachment_id = %attachment.id, "Attachment uploaded");
        }
        Ok(())
    }

    async fn send_to_stream(
        &self,
        thread_id: &str,
        messages: &[Message],
        has_files: bool,
    ) -> Result<(), TransportError> {
        let stream = self.sessions.bind(thread_id);
        stream.reconnect_if_needed();

        if !stream.is_connected() {
            debug!(thread_id = %thread_id, "Stream not connected yet, waiting");
            if !stream.wait_connected(self.settings.connect_grace()).await {
                return Err(TransportError::NotConnected {
                    thread_id: thread_id.to_string(),
                });
            }
        }

        stream.send_message(messages, has_files).await
    }

    async fn create_placeholder(&self, thread_id: &str) -> Result<String, ChatError> {
        let _gate = self.write_gate.lock().await;

        // A reply that never finished must not leave a second streaming row.
        let lingering: Vec<Message> = self
            .repository
            .get_messages_by_thread_id(thread_id)
            .await?
            .into_iter()
            .filter(Message::is_streaming_assistant)
            .collect();
        for mut message in lingering {
            warn!(thread_id = %thread_id, message_id = %message.id, "Closing unfinished streaming message");
            message.complete()?;
            self.repository.save_message(message).await?;
        }

        let placeholder = Message::assistant_placeholder(thread_id);
        let id = placeholder.id.clone();
        self.repository.save_message(placeholder).await?;
        Ok(id)
    }

    async fn fail_streaming_message(&self, thread_id: &str) -> Result<(), ChatError> {
        let _gate = self.write_gate.lock().await;

        let messages = self.repository.get_messages_by_thread_id(thread_id).await?;
        let Some(mut message) = messages
            .into_iter()
            .filter(Message::is_streaming_assistant)
            .last()
        else {
            warn!(thread_id = %thread_id, "No streaming message to mark as failed");
            return Ok(());
        };

        message.fail(&self.settings.send_error_message)?;
        self.repository.save_message(message).await?;
        Ok(())
    }

    async fn require_thread(&self, thread_id: &str) -> Result<Thread, ChatError> {
        self.repository
            .get_thread_by_id(thread_id)
            .await?
            .ok_or_else(|| ChatError::ThreadNotFound(thread_id.to_string()))
    }

    fn spawn_title_generation(&self, thread_id: &str, content: &str) {
        let Some(service) = self.weak_self.upgrade() else {
            return;
        };
        if content.trim().is_empty() {
            return;
        }
        let thread_id = thread_id.to_string();
        let content = content.to_string();
        tokio::spawn(async move {
            // Failures are already logged.
            let _ = service.generate_thread_name(&thread_id, &content).await;
        });
    }
}

impl ChunkSink for ChatService {
    fn handle_message_chunk<'a>(&'a self, update: ChunkUpdate) -> BoxFuture<'a, Result<(), ChatError>> {
        Box::pin(ChatService::handle_message_chunk(self, update))
    }
}
