use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Where threads and messages are kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StorageSettings {
    Memory,
    Sqlite {
        /// `None` resolves to `<config_dir>/torgon/chat.db`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<PathBuf>,
    },
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self::Sqlite { path: None }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub base_url: String,
    pub stream_path: String,
    pub completion_path: String,
    pub reconnect_delay_ms: u64,
    /// How long a send waits for a reconnecting stream before giving up.
    pub connect_grace_ms: u64,
    /// Content value the server pushes only to keep the channel open.
    pub keepalive_sentinel: String,
    pub default_thread_title: String,
    pub send_error_message: String,
    pub storage: StorageSettings,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            stream_path: "/chat-stream".to_string(),
            completion_path: "/send-message".to_string(),
            reconnect_delay_ms: 3000,
            connect_grace_ms: 500,
            keepalive_sentinel: "torgonestjolie".to_string(),
            default_thread_title: "New Thread".to_string(),
            send_error_message: "Sorry, I encountered an error processing your request."
                .to_string(),
            storage: StorageSettings::default(),
        }
    }
}

impl ClientSettings {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn connect_grace(&self) -> Duration {
        Duration::from_millis(self.connect_grace_ms)
    }

    /// Joins `path` onto the base URL without doubling the slash.
    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let settings: ClientSettings =
            serde_json::from_str(r#"{"base_url":"https://chat.example.com/"}"#).unwrap();
        assert_eq!(settings.base_url, "https://chat.example.com/");
        assert_eq!(settings.reconnect_delay(), Duration::from_secs(3));
        assert_eq!(settings.keepalive_sentinel, "torgonestjolie");
        assert_eq!(settings.storage, StorageSettings::Sqlite { path: None });
        assert_eq!(
            settings.endpoint("/chat-stream"),
            "https://chat.example.com/chat-stream"
        );
    }

    #[test]
    fn test_storage_tagging() {
        let memory: StorageSettings = serde_json::from_str(r#"{"kind":"memory"}"#).unwrap();
        assert_eq!(memory, StorageSettings::Memory);

        let json = serde_json::to_value(StorageSettings::Sqlite {
            path: Some(PathBuf::from("/tmp/chat.db")),
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"kind": "sqlite", "path": "/tmp/chat.db"}));
    }
}
