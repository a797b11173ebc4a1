use std::path::PathBuf;

use tracing::debug;

use super::client_settings_repository::{
    BoxFuture, ClientSettingsRepository, SettingsError, SettingsResult,
};
use crate::settings::models::ClientSettings;

pub struct ClientSettingsJsonRepository {
    file_path: PathBuf,
}

impl ClientSettingsJsonRepository {
    /// Create repository with XDG-compliant path
    pub fn new() -> SettingsResult<Self> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| SettingsError::PathError("Cannot determine config directory".into()))?;

        Ok(Self {
            file_path: config_dir.join("torgon").join("client_settings.json"),
        })
    }

    pub fn with_path(file_path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: file_path.into(),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.file_path
    }
}

impl ClientSettingsRepository for ClientSettingsJsonRepository {
    fn load(&self) -> BoxFuture<'static, SettingsResult<ClientSettings>> {
        let path = self.file_path.clone();

        Box::pin(async move {
            if !tokio::fs::try_exists(&path).await? {
                debug!(path = %path.display(), "No settings file, using defaults");
                return Ok(ClientSettings::default());
            }

            let contents = tokio::fs::read_to_string(&path).await?;
            let settings: ClientSettings = serde_json::from_str(&contents)?;
            Ok(settings)
        })
    }

    fn save(&self, settings: ClientSettings) -> BoxFuture<'static, SettingsResult<()>> {
        let path = self.file_path.clone();

        Box::pin(async move {
            let json = serde_json::to_string_pretty(&settings)?;

            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }

            // Write atomically using temp file + rename
            let temp_path = path.with_extension("json.tmp");
            tokio::fs::write(&temp_path, &json).await?;
            tokio::fs::rename(&temp_path, &path).await?;

            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::models::StorageSettings;

    #[tokio::test]
    async fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let repo = ClientSettingsJsonRepository::with_path(dir.path().join("absent.json"));

        let settings = repo.load().await.unwrap();
        assert_eq!(settings, ClientSettings::default());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let repo =
            ClientSettingsJsonRepository::with_path(dir.path().join("nested/client_settings.json"));

        let settings = ClientSettings {
            base_url: "https://chat.example.com".into(),
            storage: StorageSettings::Memory,
            ..ClientSettings::default()
        };
        repo.save(settings.clone()).await.unwrap();

        assert_eq!(repo.load().await.unwrap(), settings);
        assert!(!repo.path().with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client_settings.json");
        std::fs::write(&path, "{ not json").unwrap();

        let result = ClientSettingsJsonRepository::with_path(path).load().await;
        assert!(matches!(result, Err(SettingsError::SerializationError(_))));
    }
}
