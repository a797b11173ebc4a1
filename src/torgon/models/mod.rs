pub mod error;
pub mod message;
pub mod message_diff;
pub mod thread;

pub use error::ModelError;
pub use message::{Attachment, Message, MessageRole, MessageStatus, ModelParams};
pub use message_diff::{MessageChange, dedupe_by_id, diff_messages};
pub use thread::Thread;
