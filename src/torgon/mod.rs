pub mod models;
pub mod repositories;
pub mod services;
pub mod views;

#[cfg(test)]
pub(crate) mod test_support;

pub use services::{ChatService, StreamService, StreamSessions};
