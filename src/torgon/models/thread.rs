use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::ModelError;

/// A persisted conversation container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thread {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<DateTime<Utc>>,
}

impl Thread {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.into(),
            created_at: Utc::now(),
            last_message_at: None,
        }
    }

    pub fn rename(&mut self, new_title: &str) -> Result<(), ModelError> {
        if new_title.trim().is_empty() {
            return Err(ModelError::EmptyTitle);
        }
        self.title = new_title.to_string();
        Ok(())
    }

    pub fn update_last_message_time(&mut self) {
        self.last_message_at = Some(Utc::now());
    }

    /// Most recent activity, used to order the thread list.
    pub fn activity_at(&self) -> DateTime<Utc> {
        self.last_message_at.unwrap_or(self.created_at)
    }
}
