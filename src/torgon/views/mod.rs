//! Headless view state. Views only read: every write goes through
//! `ChatService`, and rows are rebuilt from repository snapshots.

pub mod chat_input;
pub mod chat_view;
pub mod message_list;

pub use chat_input::ChatInputView;
pub use chat_view::ChatView;
pub use message_list::{MessageListView, MessageRow};
