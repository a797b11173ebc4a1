use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use super::backend::{ChatBackend, TransportError};
use super::chat_service::{ChatError, ChunkUpdate};
use super::stream_transport::{ConnectionState, StreamTransport};
use crate::settings::models::ClientSettings;
use crate::torgon::models::Message;
use crate::torgon::repositories::BoxFuture;

/// Receives every chunk for persistence, in arrival order.
pub trait ChunkSink: Send + Sync + 'static {
    fn handle_message_chunk<'a>(&'a self, update: ChunkUpdate) -> BoxFuture<'a, Result<(), ChatError>>;
}

/// UI-side chunk listener, `(content, is_done)`.
pub type UiChunkCallback = Arc<dyn Fn(&str, bool) + Send + Sync>;

enum PersistJob {
    Chunk(ChunkUpdate),
    Flush(oneshot::Sender<()>),
}

/// Binds one transport to one thread.
///
/// Each chunk goes to the UI callback first and is then queued for the
/// persistence worker, both from the reader task, so the two paths see the
/// same order.
pub struct StreamService {
    thread_id: String,
    transport: StreamTransport,
    ui_callback: Arc<RwLock<UiChunkCallback>>,
    jobs: mpsc::UnboundedSender<PersistJob>,
}

impl StreamService {
    pub fn new(
        thread_id: &str,
        backend: Arc<dyn ChatBackend>,
        settings: &ClientSettings,
        sink: Weak<dyn ChunkSink>,
        on_chunk: UiChunkCallback,
    ) -> Self {
        let transport = StreamTransport::new(backend, settings);
        let ui_callback = Arc::new(RwLock::new(on_chunk));
        let (jobs, receiver) = mpsc::unbounded_channel();
        tokio::spawn(persist_chunks(sink, receiver));

        let ui = ui_callback.clone();
        let queue = jobs.clone();
        let chunk_thread = thread_id.to_string();
        transport.on_message(Arc::new(move |content: &str, is_done: bool| {
            let callback = ui.read().clone();
            callback(content, is_done);
            enqueue(&queue, ChunkUpdate::chunk(&chunk_thread, content));
        }));

        let queue = jobs.clone();
        let done_thread = thread_id.to_string();
        transport.on_done(Arc::new(move |full_response: &str| {
            enqueue(&queue, ChunkUpdate::finished(&done_thread, full_response));
        }));

        transport.init(thread_id);

        Self {
            thread_id: thread_id.to_string(),
            transport,
            ui_callback,
            jobs,
        }
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    /// Last registration wins.
    pub fn set_chunk_callback(&self, callback: UiChunkCallback) {
        *self.ui_callback.write() = callback;
    }

    /// Re-opens the connection unless it is open or an attempt is in flight.
    /// Returns whether a new connection was started.
    pub fn reconnect_if_needed(&self) -> bool {
        if self.transport.is_connected() {
            return false;
        }
        if self.transport.connection_state() == ConnectionState::Connecting
            && self.transport.reader_alive()
        {
            debug!(thread_id = %self.thread_id, "Stream already connecting");
            return false;
        }
        info!(thread_id = %self.thread_id, "Stream not connected, reinitializing");
        self.transport.init(&self.thread_id);
        true
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.transport.connection_state()
    }

    /// Text accumulated for the reply in flight.
    pub fn buffered_response(&self) -> String {
        self.transport.buffered_response()
    }

    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        self.transport.wait_connected(timeout).await
    }

    pub async fn send_message(&self, messages: &[Message], has_files: bool) -> Result<(), TransportError> {
        self.transport
            .send_message(messages, &self.thread_id, has_files)
            .await
    }

    pub fn close_stream(&self) {
        info!(thread_id = %self.thread_id, "Closing stream");
        self.transport.close();
    }

    /// Resolves once every chunk received so far has been persisted.
    pub async fn flush(&self) {
        let (done, finished) = oneshot::channel();
        if self.jobs.send(PersistJob::Flush(done)).is_ok() {
            let _ = finished.await;
        }
    }
}

impl Drop for StreamService {
    fn drop(&mut self) {
        self.transport.close();
        // Drops the queue senders held by the callbacks so the worker drains and exits.
        self.transport.clear_callbacks();
    }
}

fn enqueue(queue: &mpsc::UnboundedSender<PersistJob>, update: ChunkUpdate) {
    if queue.send(PersistJob::Chunk(update)).is_err() {
        debug!("Persistence worker gone, chunk not persisted");
    }
}

async fn persist_chunks(sink: Weak<dyn ChunkSink>, mut jobs: mpsc::UnboundedReceiver<PersistJob>) {
    while let Some(job) = jobs.recv().await {
        match job {
            PersistJob::Chunk(update) => {
                let Some(sink) = sink.upgrade() else {
                    debug!(thread_id = %update.thread_id, "Chunk sink dropped, discarding chunk");
                    continue;
                };
                if let Err(e) = sink.handle_message_chunk(update).await {
                    error!(error = %e, "Failed to persist stream chunk");
                }
            }
            PersistJob::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

/// Registry holding the one live stream binding.
///
/// Owned by `ChatService` and handed to views explicitly, so every test (or
/// every window) gets an isolated session.
pub struct StreamSessions {
    backend: Arc<dyn ChatBackend>,
    settings: ClientSettings,
    sink: Weak<dyn ChunkSink>,
    active: Mutex<Option<Arc<StreamService>>>,
}

impl StreamSessions {
    pub fn new(backend: Arc<dyn ChatBackend>, settings: ClientSettings, sink: Weak<dyn ChunkSink>) -> Self {
        Self {
            backend,
            settings,
            sink,
            active: Mutex::new(None),
        }
    }

    /// Returns the stream for `thread_id`, rebinding the UI callback when it
    /// already exists. A stream bound to another thread is closed first.
    pub fn get_instance(&self, thread_id: &str, on_chunk: UiChunkCallback) -> Arc<StreamService> {
        let mut active = self.active.lock();
        if let Some(service) = active.as_ref().filter(|s| s.thread_id() == thread_id) {
            service.set_chunk_callback(on_chunk);
            return service.clone();
        }
        self.replace(&mut active, thread_id, on_chunk)
    }

    /// Like `get_instance` but keeps whatever UI callback is registered.
    pub fn bind(&self, thread_id: &str) -> Arc<StreamService> {
        let mut active = self.active.lock();
        if let Some(service) = active.as_ref().filter(|s| s.thread_id() == thread_id) {
            return service.clone();
        }
        self.replace(&mut active, thread_id, Arc::new(|_: &str, _: bool| {}))
    }

    pub fn current(&self) -> Option<Arc<StreamService>> {
        self.active.lock().clone()
    }

    pub fn close_stream(&self) {
        if let Some(service) = self.active.lock().take() {
            service.close_stream();
        }
    }

    /// Closes `service` only if it is still the bound stream. A stream that
    /// was already replaced by another thread's binding is left alone, and
    /// so is its replacement.
    pub fn close_if_current(&self, service: &Arc<StreamService>) -> bool {
        let mut active = self.active.lock();
        if !active.as_ref().is_some_and(|current| Arc::ptr_eq(current, service)) {
            debug!(thread_id = %service.thread_id(), "Stream no longer bound, nothing to close");
            return false;
        }
        if let Some(current) = active.take() {
            current.close_stream();
        }
        true
    }

    fn replace(
        &self,
        active: &mut Option<Arc<StreamService>>,
        thread_id: &str,
        on_chunk: UiChunkCallback,
    ) -> Arc<StreamService> {
        if let Some(previous) = active.take() {
            info!(from = %previous.thread_id(), to = %thread_id, "Switching stream binding");
            previous.close_stream();
        }
        let service = Arc::new(StreamService::new(
            thread_id,
            self.backend.clone(),
            &self.settings,
            self.sink.clone(),
            on_chunk,
        ));
        *active = Some(service.clone());
        service
    }
}
