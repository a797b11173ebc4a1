//! Scripted backend and helpers shared by the unit tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::channel::mpsc;
use parking_lot::Mutex;

use crate::settings::models::{ClientSettings, StorageSettings};
use crate::torgon::models::Attachment;
use crate::torgon::repositories::{BoxFuture, InMemoryThreadRepository};
use crate::torgon::services::{
    ChatBackend, ChatService, CompletionRequest, CompletionResponse, FrameStream,
    SendMessageRequest, SseFrame, TransportError,
};

type FrameSender = mpsc::UnboundedSender<Result<SseFrame, TransportError>>;

#[derive(Default)]
struct Script {
    connections: HashMap<String, Vec<FrameSender>>,
    open_counts: HashMap<String, usize>,
    sent: Vec<SendMessageRequest>,
    completions: Vec<CompletionRequest>,
    uploads: Vec<(String, String)>,
    deleted_files: Vec<(String, String)>,
    deleted_conversations: Vec<String>,
    fail_sends: bool,
    fail_deletes: bool,
    refuse_connections: bool,
    completion: Option<String>,
}

/// In-process stand-in for the chat server. Each `open_stream` gets its own
/// channel; tests push frames into every live channel of a thread.
#[derive(Default)]
pub struct ScriptedBackend {
    script: Mutex<Script>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_frame(&self, thread_id: &str, data: &str) {
        self.push_event(thread_id, SseFrame::message(data));
    }

    pub fn push_event(&self, thread_id: &str, frame: SseFrame) {
        let mut script = self.script.lock();
        if let Some(senders) = script.connections.get_mut(thread_id) {
            senders.retain(|sender| sender.unbounded_send(Ok(frame.clone())).is_ok());
        }
    }

    /// Ends every open stream of the thread, as a dropped connection would.
    pub fn drop_connection(&self, thread_id: &str) {
        self.script.lock().connections.remove(thread_id);
    }

    pub fn open_count(&self, thread_id: &str) -> usize {
        self.script
            .lock()
            .open_counts
            .get(thread_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn sent_requests(&self) -> Vec<SendMessageRequest> {
        self.script.lock().sent.clone()
    }

    pub fn completion_requests(&self) -> Vec<CompletionRequest> {
        self.script.lock().completions.clone()
    }

    pub fn uploads(&self) -> Vec<(String, String)> {
        self.script.lock().uploads.clone()
    }

    pub fn deleted_files(&self) -> Vec<(String, String)> {
        self.script.lock().deleted_files.clone()
    }

    pub fn deleted_conversations(&self) -> Vec<String> {
        self.script.lock().deleted_conversations.clone()
    }

    pub fn fail_sends(&self, fail: bool) {
        self.script.lock().fail_sends = fail;
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.script.lock().fail_deletes = fail;
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.script.lock().refuse_connections = refuse;
    }

    pub fn set_completion(&self, content: &str) {
        self.script.lock().completion = Some(content.to_string());
    }
}

impl ChatBackend for ScriptedBackend {
    fn open_stream(&self, thread_id: &str) -> BoxFuture<'static, Result<FrameStream, TransportError>> {
        let mut script = self.script.lock();
        let result = if script.refuse_connections {
            Err(TransportError::Unavailable("connection refused".into()))
        } else {
            let (sender, receiver) = mpsc::unbounded();
            script
                .connections
                .entry(thread_id.to_string())
                .or_default()
                .push(sender);
            *script.open_counts.entry(thread_id.to_string()).or_default() += 1;
            Ok(receiver.boxed())
        };
        Box::pin(async move { result })
    }

    fn send_messages(&self, request: SendMessageRequest) -> BoxFuture<'static, Result<(), TransportError>> {
        let mut script = self.script.lock();
        let result = if script.fail_sends {
            Err(TransportError::Status {
                status: 500,
                body: "boom".into(),
            })
        } else {
            script.sent.push(request);
            Ok(())
        };
        Box::pin(async move { result })
    }

    fn complete(
        &self,
        request: CompletionRequest,
    ) -> BoxFuture<'static, Result<CompletionResponse, TransportError>> {
        let mut script = self.script.lock();
        script.completions.push(request);
        let result = match script.completion.clone() {
            Some(content) => Ok(CompletionResponse { content }),
            None => Err(TransportError::Unavailable("no completion scripted".into())),
        };
        Box::pin(async move { result })
    }

    fn upload_file(
        &self,
        conversation_id: &str,
        attachment: &Attachment,
    ) -> BoxFuture<'static, Result<(), TransportError>> {
        self.script
            .lock()
            .uploads
            .push((conversation_id.to_string(), attachment.id.clone()));
        Box::pin(async { Ok(()) })
    }

    fn delete_file(
        &self,
        conversation_id: &str,
        file_id: &str,
    ) -> BoxFuture<'static, Result<(), TransportError>> {
        self.script
            .lock()
            .deleted_files
            .push((conversation_id.to_string(), file_id.to_string()));
        Box::pin(async { Ok(()) })
    }

    fn delete_conversation(&self, conversation_id: &str) -> BoxFuture<'static, Result<(), TransportError>> {
        let mut script = self.script.lock();
        let result = if script.fail_deletes {
            Err(TransportError::Unavailable("delete refused".into()))
        } else {
            script.deleted_conversations.push(conversation_id.to_string());
            Ok(())
        };
        Box::pin(async move { result })
    }
}

pub fn test_settings() -> ClientSettings {
    ClientSettings {
        reconnect_delay_ms: 20,
        connect_grace_ms: 500,
        storage: StorageSettings::Memory,
        ..ClientSettings::default()
    }
}

pub fn chat_fixture() -> (Arc<ChatService>, Arc<ScriptedBackend>, InMemoryThreadRepository) {
    let backend = Arc::new(ScriptedBackend::new());
    let repository = InMemoryThreadRepository::new();
    let service = ChatService::new(
        Arc::new(repository.clone()),
        backend.clone(),
        test_settings(),
    );
    (service, backend, repository)
}

/// Polls `condition` until it holds or two seconds pass.
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
