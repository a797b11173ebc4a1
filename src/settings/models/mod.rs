pub mod client_settings;

pub use client_settings::{ClientSettings, StorageSettings};
