use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

use crate::settings::models::ClientSettings;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Path error: {0}")]
    PathError(String),
}

pub type SettingsResult<T> = Result<T, SettingsError>;

pub trait ClientSettingsRepository: Send + Sync + 'static {
    /// Load client settings, falling back to defaults when nothing is stored
    fn load(&self) -> BoxFuture<'static, SettingsResult<ClientSettings>>;

    /// Save client settings to storage
    fn save(&self, settings: ClientSettings) -> BoxFuture<'static, SettingsResult<()>>;
}
