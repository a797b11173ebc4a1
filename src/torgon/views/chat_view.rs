use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::chat_input::ChatInputView;
use super::message_list::{MessageListView, MessageRow};
use crate::torgon::repositories::Subscription;
use crate::torgon::services::{ChatService, StreamService};

/// A mounted conversation: message list fed by the repository, live chunks
/// fed by the thread's stream, and the input box.
///
/// Unmounting drops the subscription but leaves the stream running so a
/// remount of the same thread picks up where it left off. `close` is the
/// explicit teardown.
pub struct ChatView {
    service: Arc<ChatService>,
    list: Arc<Mutex<MessageListView>>,
    stream: Arc<StreamService>,
    subscription: Subscription,
    pub input: ChatInputView,
}

impl ChatView {
    pub fn open(service: Arc<ChatService>, thread_id: &str) -> Self {
        let list = Arc::new(Mutex::new(MessageListView::new(thread_id)));

        let snapshots = list.clone();
        let subscription = service.subscribe_to_messages(
            thread_id,
            Box::new(move |messages| {
                let changes = snapshots.lock().apply_snapshot(messages);
                if !changes.is_empty() {
                    debug!(changes = changes.len(), "Message list updated");
                }
            }),
        );

        let live = list.clone();
        let stream = service.stream_sessions().get_instance(
            thread_id,
            Arc::new(move |content: &str, _is_done: bool| live.lock().push_live_chunk(content)),
        );
        stream.reconnect_if_needed();

        let input = ChatInputView::new(service.clone(), Some(thread_id.to_string()));

        Self {
            service,
            list,
            stream,
            subscription,
            input,
        }
    }

    pub fn thread_id(&self) -> String {
        self.list.lock().thread_id().to_string()
    }

    pub fn rows(&self) -> Vec<MessageRow> {
        self.list.lock().rows()
    }

    pub fn stream(&self) -> &Arc<StreamService> {
        &self.stream
    }

    /// Navigating away: stop observing, keep the connection.
    pub fn unmount(self) {
        debug!(thread_id = %self.stream.thread_id(), "Chat view unmounted");
        self.subscription.unsubscribe();
    }

    /// The view is discarded for good: stop observing and close the stream,
    /// unless another view has since bound a different thread.
    pub fn close(self) {
        self.subscription.unsubscribe();
        self.service.stream_sessions().close_if_current(&self.stream);
    }
}
