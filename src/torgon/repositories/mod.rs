pub mod error;
pub mod in_memory_repository;
pub mod live_query;
pub mod thread_repository;
pub mod thread_sqlite_repository;

pub use error::{RepositoryError, RepositoryResult};
pub use in_memory_repository::InMemoryThreadRepository;
pub use live_query::{LiveQueryHub, Subscription};
pub use thread_repository::{BoxFuture, MessagesCallback, ThreadRepository, ThreadsCallback};
pub use thread_sqlite_repository::ThreadSqliteRepository;
