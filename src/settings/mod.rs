pub mod models;
pub mod repositories;

pub use models::{ClientSettings, StorageSettings};
pub use repositories::{ClientSettingsJsonRepository, ClientSettingsRepository, SettingsError};
