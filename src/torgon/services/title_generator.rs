use anyhow::{Context, Result};
use tracing::debug;

use super::backend::{ChatBackend, CompletionMessage, CompletionRequest};
use crate::torgon::models::MessageRole;

const FALLBACK_TITLE: &str = "New Thread";

/// Truncate text to max length
fn truncate_text(text: &str, max_len: usize) -> String {
    text.chars().take(max_len).collect()
}

/// Clean and validate generated title
pub(crate) fn clean_title(raw_title: &str) -> String {
    let cleaned = raw_title
        .trim()
        .trim_matches('"')
        .trim_matches('\'')
        .lines()
        .next()
        .unwrap_or(FALLBACK_TITLE)
        .trim()
        .to_string();

    if cleaned.chars().count() > 100 {
        format!("{}...", truncate_text(&cleaned, 97))
    } else if cleaned.is_empty() {
        FALLBACK_TITLE.to_string()
    } else {
        cleaned
    }
}

/// Ask the completion endpoint for a short title summarizing the opening
/// message of a thread.
pub async fn generate_title(backend: &dyn ChatBackend, content: &str) -> Result<String> {
    let prompt = format!(
        "I want you to summarize the message below into 1 short sentence so it can serve as \
        the title of the conversation the message is opening.\n\
        Your response will be directly serving as the title, so please just respond with the \
        title and nothing else. The content might be in another language than english, so \
        please be careful with the language you use.\n\
        message:\n{}",
        truncate_text(content, 2000)
    );

    let response = backend
        .complete(CompletionRequest {
            messages: vec![CompletionMessage {
                role: MessageRole::User,
                content: prompt,
            }],
            thread_id: None,
        })
        .await
        .context("Title completion request failed")?;

    debug!(response = %response.content, "Title response received");
    Ok(clean_title(&response.content))
}
