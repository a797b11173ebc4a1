use std::future::Future;
use std::pin::Pin;

use super::error::RepositoryResult;
use super::live_query::Subscription;
use crate::torgon::models::{Message, Thread};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub type MessagesCallback = Box<dyn Fn(Vec<Message>) + Send + Sync>;
pub type ThreadsCallback = Box<dyn Fn(Vec<Thread>) + Send + Sync>;

/// Domain-shaped access to the local record store.
///
/// Messages are always returned in creation order. Subscriptions deliver a
/// snapshot right after registration and again after every write that touches
/// the subscribed thread (or any thread, for `subscribe_to_threads`).
pub trait ThreadRepository: Send + Sync + 'static {
    fn get_messages_by_thread_id(
        &self,
        thread_id: &str,
    ) -> BoxFuture<'static, RepositoryResult<Vec<Message>>>;

    fn get_message(&self, id: &str) -> BoxFuture<'static, RepositoryResult<Option<Message>>>;

    /// Insert or replace by message id.
    fn save_message(&self, message: Message) -> BoxFuture<'static, RepositoryResult<()>>;

    fn delete_thread_with_messages(&self, thread_id: &str)
    -> BoxFuture<'static, RepositoryResult<()>>;

    fn get_thread_by_id(&self, id: &str) -> BoxFuture<'static, RepositoryResult<Option<Thread>>>;

    /// All threads, most recently active first.
    fn list_threads(&self) -> BoxFuture<'static, RepositoryResult<Vec<Thread>>>;

    /// Insert or replace by thread id.
    fn save_thread(&self, thread: Thread) -> BoxFuture<'static, RepositoryResult<()>>;

    fn subscribe_to_messages(&self, thread_id: &str, callback: MessagesCallback) -> Subscription;

    fn subscribe_to_threads(&self, callback: ThreadsCallback) -> Subscription;
}
