use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::error::RepositoryResult;
use super::live_query::{LiveQueryHub, Subscription};
use super::thread_repository::{BoxFuture, MessagesCallback, ThreadRepository, ThreadsCallback};
use crate::torgon::models::{Message, Thread};

struct StoredMessage {
    /// Insertion order, the tie-break when two messages share a timestamp.
    seq: u64,
    message: Message,
}

#[derive(Default)]
struct MemoryState {
    threads: HashMap<String, Thread>,
    messages: HashMap<String, StoredMessage>,
    next_seq: u64,
}

impl MemoryState {
    fn messages_for(&self, thread_id: &str) -> Vec<Message> {
        let mut rows: Vec<&StoredMessage> = self
            .messages
            .values()
            .filter(|stored| stored.message.thread_id == thread_id)
            .collect();
        rows.sort_by(|a, b| {
            a.message
                .created_at
                .cmp(&b.message.created_at)
                .then(a.seq.cmp(&b.seq))
        });
        rows.into_iter().map(|stored| stored.message.clone()).collect()
    }

    fn sorted_threads(&self) -> Vec<Thread> {
        let mut threads: Vec<Thread> = self.threads.values().cloned().collect();
        threads.sort_by_key(|t| std::cmp::Reverse(t.activity_at()));
        threads
    }
}

/// In-memory repository for threads and messages.
/// Useful for testing and for sessions that should leave nothing on disk.
/// Live queries fire before the writing future resolves.
#[derive(Clone)]
pub struct InMemoryThreadRepository {
    state: Arc<Mutex<MemoryState>>,
    hub: LiveQueryHub,
}

impl InMemoryThreadRepository {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            hub: LiveQueryHub::new(),
        }
    }

    fn notify_messages(&self, thread_id: &str) {
        let revision = self.hub.next_revision();
        if self.hub.has_message_listeners(thread_id) {
            let snapshot = self.state.lock().messages_for(thread_id);
            self.hub.publish_messages(thread_id, revision, snapshot);
        }
    }

    fn notify_threads(&self) {
        let revision = self.hub.next_revision();
        if self.hub.has_thread_listeners() {
            let snapshot = self.state.lock().sorted_threads();
            self.hub.publish_threads(revision, snapshot);
        }
    }
}

impl Default for InMemoryThreadRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadRepository for InMemoryThreadRepository {
    fn get_messages_by_thread_id(
        &self,
        thread_id: &str,
    ) -> BoxFuture<'static, RepositoryResult<Vec<Message>>> {
        let messages = self.state.lock().messages_for(thread_id);
        Box::pin(async move { Ok(messages) })
    }

    fn get_message(&self, id: &str) -> BoxFuture<'static, RepositoryResult<Option<Message>>> {
        let message = self
            .state
            .lock()
            .messages
            .get(id)
            .map(|stored| stored.message.clone());
        Box::pin(async move { Ok(message) })
    }

    fn save_message(&self, message: Message) -> BoxFuture<'static, RepositoryResult<()>> {
        let repo = self.clone();

        Box::pin(async move {
            let thread_id = message.thread_id.clone();
            {
                let mut state = repo.state.lock();
                let seq = match state.messages.get(&message.id) {
                    Some(existing) => existing.seq,
                    None => {
                        state.next_seq += 1;
                        state.next_seq
                    }
                };
                state
                    .messages
                    .insert(message.id.clone(), StoredMessage { seq, message });
            }
            repo.notify_messages(&thread_id);
            Ok(())
        })
    }

    fn delete_thread_with_messages(
        &self,
        thread_id: &str,
    ) -> BoxFuture<'static, RepositoryResult<()>> {
        let repo = self.clone();
        let thread_id = thread_id.to_string();

        Box::pin(async move {
            {
                let mut state = repo.state.lock();
                state
                    .messages
                    .retain(|_, stored| stored.message.thread_id != thread_id);
                state.threads.remove(&thread_id);
            }
            repo.notify_messages(&thread_id);
            repo.notify_threads();
            Ok(())
        })
    }

    fn get_thread_by_id(&self, id: &str) -> BoxFuture<'static, RepositoryResult<Option<Thread>>> {
        let thread = self.state.lock().threads.get(id).cloned();
        Box::pin(async move { Ok(thread) })
    }

    fn list_threads(&self) -> BoxFuture<'static, RepositoryResult<Vec<Thread>>> {
        let threads = self.state.lock().sorted_threads();
        Box::pin(async move { Ok(threads) })
    }

    fn save_thread(&self, thread: Thread) -> BoxFuture<'static, RepositoryResult<()>> {
        let repo = self.clone();

        Box::pin(async move {
            repo.state.lock().threads.insert(thread.id.clone(), thread);
            repo.notify_threads();
            Ok(())
        })
    }

    fn subscribe_to_messages(&self, thread_id: &str, callback: MessagesCallback) -> Subscription {
        let revision = self.hub.current_revision();
        let subscription = self.hub.watch_messages(thread_id, callback);
        let snapshot = self.state.lock().messages_for(thread_id);
        self.hub
            .deliver_initial_messages(subscription.id(), revision, snapshot);
        subscription
    }

    fn subscribe_to_threads(&self, callback: ThreadsCallback) -> Subscription {
        let revision = self.hub.current_revision();
        let subscription = self.hub.watch_threads(callback);
        let snapshot = self.state.lock().sorted_threads();
        self.hub
            .deliver_initial_threads(subscription.id(), revision, snapshot);
        subscription
    }
}
