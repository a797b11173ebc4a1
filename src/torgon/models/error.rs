use thiserror::Error;

use super::message::MessageStatus;

/// Contract violations raised by the domain types themselves.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("Title cannot be empty")]
    EmptyTitle,

    #[error("Message content cannot be empty")]
    EmptyContent,

    #[error("{what} is required")]
    MissingId { what: &'static str },

    #[error("Cannot move a message from {from} to {to}")]
    InvalidTransition {
        from: MessageStatus,
        to: MessageStatus,
    },

    #[error("Only user messages can be edited")]
    NotEditable,
}
