use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::backend::{ChatBackend, SendMessageRequest, SseFrame, TransportError};
use super::frame_parser::{ParseTier, parse_frame};
use crate::settings::models::ClientSettings;
use crate::torgon::models::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        })
    }
}

/// Called for every content frame with `(content, is_done)`.
pub type ChunkCallback = Arc<dyn Fn(&str, bool) + Send + Sync>;
/// Called once per completed reply with the accumulated text.
pub type DoneCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct TransportState {
    thread_id: Option<String>,
    /// Bumped on every `init`/`close`; readers holding an older value are stale.
    generation: u64,
    reader: Option<JoinHandle<()>>,
    full_response: String,
    completed: bool,
    on_chunk: Option<ChunkCallback>,
    on_done: Option<DoneCallback>,
}

impl TransportState {
    fn reset_buffer(&mut self) {
        self.full_response.clear();
        self.completed = false;
    }
}

/// One inbound server-push connection plus the outbound send channel.
///
/// Frames are read by a single spawned task per connection generation, so
/// callbacks fire in the order the server sent them. A dropped connection is
/// retried after a fixed delay, forever, until `close` or the next `init`.
#[derive(Clone)]
pub struct StreamTransport {
    backend: Arc<dyn ChatBackend>,
    reconnect_delay: Duration,
    sentinel: String,
    state: Arc<Mutex<TransportState>>,
    connection: Arc<watch::Sender<ConnectionState>>,
}

impl StreamTransport {
    pub fn new(backend: Arc<dyn ChatBackend>, settings: &ClientSettings) -> Self {
        let (connection, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            backend,
            reconnect_delay: settings.reconnect_delay(),
            sentinel: settings.keepalive_sentinel.clone(),
            state: Arc::new(Mutex::new(TransportState::default())),
            connection: Arc::new(connection),
        }
    }

    /// Tear down any current connection and open a new one for `thread_id`.
    pub fn init(&self, thread_id: &str) {
        let generation = {
            let mut state = self.state.lock();
            if let Some(reader) = state.reader.take() {
                reader.abort();
            }
            state.generation += 1;
            state.thread_id = Some(thread_id.to_string());
            state.reset_buffer();
            state.generation
        };
        self.connection.send_replace(ConnectionState::Connecting);
        info!(thread_id = %thread_id, generation, "Opening stream");

        let reader = tokio::spawn(self.clone().run(thread_id.to_string(), generation));

        let mut state = self.state.lock();
        if state.generation == generation {
            state.reader = Some(reader);
        } else {
            reader.abort();
        }
    }

    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if let Some(reader) = state.reader.take() {
                reader.abort();
            }
            state.generation += 1;
            debug!(thread_id = ?state.thread_id, "Stream closed");
        }
        self.connection.send_replace(ConnectionState::Disconnected);
    }

    /// Replaces the chunk callback.
    pub fn on_message(&self, callback: ChunkCallback) {
        self.state.lock().on_chunk = Some(callback);
    }

    /// Replaces the completion callback.
    pub fn on_done(&self, callback: DoneCallback) {
        self.state.lock().on_done = Some(callback);
    }

    pub fn clear_callbacks(&self) {
        let mut state = self.state.lock();
        state.on_chunk = None;
        state.on_done = None;
    }

    /// Posts the batch. Resolves once the server accepted it; the reply
    /// arrives on the open stream.
    pub async fn send_message(
        &self,
        messages: &[Message],
        thread_id: &str,
        has_files: bool,
    ) -> Result<(), TransportError> {
        let rebind = {
            let mut state = self.state.lock();
            state.reset_buffer();
            state.thread_id.as_deref() != Some(thread_id)
        };
        if rebind {
            self.init(thread_id);
        }

        debug!(thread_id = %thread_id, count = messages.len(), has_files, "Sending messages");
        self.backend
            .send_messages(SendMessageRequest::new(messages, thread_id, has_files))
            .await
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected && self.reader_alive()
    }

    /// True while a reader task exists, including while it waits to reconnect.
    pub fn reader_alive(&self) -> bool {
        self.state
            .lock()
            .reader
            .as_ref()
            .is_some_and(|reader| !reader.is_finished())
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.connection.borrow()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe()
    }

    /// Waits up to `timeout` for the connection to open.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut receiver = self.connection.subscribe();
        let connected = async move {
            receiver
                .wait_for(|state| *state == ConnectionState::Connected)
                .await
                .is_ok()
        };
        tokio::time::timeout(timeout, connected)
            .await
            .unwrap_or(false)
    }

    pub fn thread_id(&self) -> Option<String> {
        self.state.lock().thread_id.clone()
    }

    pub fn buffered_response(&self) -> String {
        self.state.lock().full_response.clone()
    }

    fn is_current(&self, generation: u64) -> bool {
        self.state.lock().generation == generation
    }

    async fn run(self, thread_id: String, generation: u64) {
        loop {
            match self.backend.open_stream(&thread_id).await {
                Ok(mut frames) => {
                    if !self.is_current(generation) {
                        return;
                    }
                    self.connection.send_replace(ConnectionState::Connected);
                    info!(thread_id = %thread_id, "Stream connected");

                    while let Some(frame) = frames.next().await {
                        match frame {
                            Ok(frame) => {
                                if !self.handle_frame(generation, &frame) {
                                    return;
                                }
                            }
                            Err(e) => {
                                warn!(thread_id = %thread_id, error = %e, "Stream error");
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(thread_id = %thread_id, error = %e, "Failed to open stream");
                }
            }

            if !self.is_current(generation) {
                return;
            }
            self.connection.send_replace(ConnectionState::Disconnected);
            info!(
                thread_id = %thread_id,
                delay_ms = self.reconnect_delay.as_millis() as u64,
                "Stream disconnected, scheduling reconnect"
            );
            tokio::time::sleep(self.reconnect_delay).await;

            {
                let mut state = self.state.lock();
                if state.generation != generation {
                    return;
                }
                state.reset_buffer();
            }
            self.connection.send_replace(ConnectionState::Connecting);
            debug!(thread_id = %thread_id, "Reconnecting stream");
        }
    }

    /// Returns false when the frame belongs to an abandoned connection.
    fn handle_frame(&self, generation: u64, frame: &SseFrame) -> bool {
        if !frame.is_message() {
            debug!(event = ?frame.event, "Ignoring named event");
            return true;
        }

        let parsed = parse_frame(&frame.data);
        match parsed.tier {
            ParseTier::Direct => {}
            ParseTier::Unwrapped => debug!("Frame needed unwrapping before it parsed"),
            ParseTier::RawText => {
                warn!(len = frame.data.len(), "Frame is not JSON, using raw text as content")
            }
        }

        let payload = parsed.payload;
        let content = payload.content();
        if content == self.sentinel {
            debug!("Keepalive frame swallowed");
            return true;
        }

        let (on_chunk, finished) = {
            let mut state = self.state.lock();
            if state.generation != generation {
                return false;
            }
            state.full_response.push_str(content);

            let finished = if payload.is_done && !state.completed {
                state.completed = true;
                state
                    .on_done
                    .clone()
                    .map(|callback| (callback, state.full_response.clone()))
            } else {
                None
            };
            (state.on_chunk.clone(), finished)
        };

        if let Some(callback) = on_chunk {
            callback(content, payload.is_done);
        }
        if let Some((callback, full_response)) = finished {
            callback(&full_response);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torgon::test_support::{ScriptedBackend, test_settings, wait_until};

    fn recording_transport(
        backend: &Arc<ScriptedBackend>,
    ) -> (StreamTransport, Arc<Mutex<Vec<(String, bool)>>>, Arc<Mutex<Vec<String>>>) {
        let transport = StreamTransport::new(backend.clone(), &test_settings());
        let chunks = Arc::new(Mutex::new(Vec::new()));
        let done = Arc::new(Mutex::new(Vec::new()));

        let sink = chunks.clone();
        transport.on_message(Arc::new(move |content: &str, is_done: bool| {
            sink.lock().push((content.to_string(), is_done));
        }));
        let sink = done.clone();
        transport.on_done(Arc::new(move |full: &str| sink.lock().push(full.to_string())));

        (transport, chunks, done)
    }

    #[tokio::test]
    async fn test_init_connects_with_thread_id() {
        let backend = Arc::new(ScriptedBackend::new());
        let (transport, _, _) = recording_transport(&backend);

        transport.init("t1");
        assert_eq!(transport.connection_state(), ConnectionState::Connecting);
        assert!(transport.wait_connected(Duration::from_secs(1)).await);
        assert!(transport.is_connected());
        assert_eq!(backend.open_count("t1"), 1);
        assert_eq!(transport.thread_id().as_deref(), Some("t1"));
    }

    #[tokio::test]
    async fn test_raw_text_frame_yields_one_chunk() {
        let backend = Arc::new(ScriptedBackend::new());
        let (transport, chunks, _) = recording_transport(&backend);
        transport.init("t1");
        assert!(transport.wait_connected(Duration::from_secs(1)).await);

        backend.push_frame("t1", "not json at all");

        assert!(wait_until(|| !chunks.lock().is_empty()).await);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            *chunks.lock(),
            vec![("not json at all".to_string(), false)]
        );
    }

    #[tokio::test]
    async fn test_keepalive_is_swallowed_and_done_fires_once() {
        let backend = Arc::new(ScriptedBackend::new());
        let (transport, chunks, done) = recording_transport(&backend);
        transport.init("t1");
        assert!(transport.wait_connected(Duration::from_secs(1)).await);

        backend.push_frame("t1", r#"{"content":"torgonestjolie","isDone":false}"#);
        backend.push_frame("t1", r#"{"content":"Hel","isDone":false}"#);
        backend.push_frame("t1", r#"{"content":"lo","isDone":false}"#);
        backend.push_frame("t1", r#"{"content":"","isDone":true}"#);
        backend.push_frame("t1", r#"{"content":"","isDone":true}"#);

        assert!(wait_until(|| chunks.lock().len() == 4).await);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let seen: Vec<String> = chunks.lock().iter().map(|(c, _)| c.clone()).collect();
        assert_eq!(seen, vec!["Hel", "lo", "", ""]);
        assert_eq!(*done.lock(), vec!["Hello".to_string()]);
        assert_eq!(transport.buffered_response(), "Hello");
    }

    #[tokio::test]
    async fn test_reconnects_after_dropped_connection() {
        let backend = Arc::new(ScriptedBackend::new());
        let (transport, chunks, _) = recording_transport(&backend);
        transport.init("t1");
        assert!(transport.wait_connected(Duration::from_secs(1)).await);

        backend.drop_connection("t1");

        assert!(wait_until(|| backend.open_count("t1") == 2 && transport.is_connected()).await);
        backend.push_frame("t1", r#"{"content":"again"}"#);
        assert!(wait_until(|| chunks.lock().len() == 1).await);
    }

    #[tokio::test]
    async fn test_refused_connection_keeps_retrying() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.refuse_connections(true);
        let (transport, _, _) = recording_transport(&backend);
        transport.init("t1");

        assert!(!transport.wait_connected(Duration::from_millis(50)).await);
        assert!(transport.reader_alive());

        backend.refuse_connections(false);
        assert!(transport.wait_connected(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_close_stops_delivery() {
        let backend = Arc::new(ScriptedBackend::new());
        let (transport, chunks, _) = recording_transport(&backend);
        transport.init("t1");
        assert!(transport.wait_connected(Duration::from_secs(1)).await);

        transport.close();
        assert!(!transport.is_connected());
        backend.push_frame("t1", r#"{"content":"late"}"#);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(chunks.lock().is_empty());
        assert_eq!(backend.open_count("t1"), 1);
    }

    #[tokio::test]
    async fn test_send_to_other_thread_rebinds() {
        let backend = Arc::new(ScriptedBackend::new());
        let (transport, _, _) = recording_transport(&backend);
        transport.init("t1");
        assert!(transport.wait_connected(Duration::from_secs(1)).await);

        transport.send_message(&[], "t2", false).await.unwrap();

        assert_eq!(transport.thread_id().as_deref(), Some("t2"));
        assert!(wait_until(|| backend.open_count("t2") == 1).await);
        assert_eq!(backend.sent_requests()[0].thread_id, "t2");
    }
}
