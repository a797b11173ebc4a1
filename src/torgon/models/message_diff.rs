//! Reconciliation between a cached message list and a fresh snapshot from
//! the store, so observers can patch rows instead of re-rendering the list.

use std::collections::{HashMap, HashSet};

use super::message::Message;

#[derive(Debug, Clone, PartialEq)]
pub enum MessageChange {
    Inserted { index: usize, message: Message },
    Updated { index: usize, message: Message },
    Removed { id: String },
}

/// Collapse repeated ids, keeping the first position and the latest value.
pub fn dedupe_by_id(messages: Vec<Message>) -> Vec<Message> {
    let mut positions: HashMap<String, usize> = HashMap::with_capacity(messages.len());
    let mut result: Vec<Message> = Vec::with_capacity(messages.len());

    for message in messages {
        match positions.get(&message.id) {
            Some(&index) => result[index] = message,
            None => {
                positions.insert(message.id.clone(), result.len());
                result.push(message);
            }
        }
    }

    result
}

/// Changes that turn `previous` into `next`. Removals come first, in
/// `previous` order, followed by inserts and updates in `next` order.
pub fn diff_messages(previous: &[Message], next: &[Message]) -> Vec<MessageChange> {
    let before: HashMap<&str, &Message> = previous.iter().map(|m| (m.id.as_str(), m)).collect();
    let after: HashSet<&str> = next.iter().map(|m| m.id.as_str()).collect();

    let mut changes: Vec<MessageChange> = previous
        .iter()
        .filter(|m| !after.contains(m.id.as_str()))
        .map(|m| MessageChange::Removed { id: m.id.clone() })
        .collect();

    for (index, message) in next.iter().enumerate() {
        match before.get(message.id.as_str()) {
            None => changes.push(MessageChange::Inserted {
                index,
                message: message.clone(),
            }),
            Some(old) if *old != message => changes.push(MessageChange::Updated {
                index,
                message: message.clone(),
            }),
            Some(_) => {}
        }
    }

    changes
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;

    use super::*;
    use crate::torgon::models::{MessageRole, MessageStatus};

    /// Same id and content always build an equal message.
    fn msg(id: &str, content: &str) -> Message {
        let mut m = Message::new("t1", MessageRole::User, content, MessageStatus::Done);
        m.id = id.to_string();
        m.created_at = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        m
    }

    #[test]
    fn test_identical_snapshots_produce_no_changes() {
        let list = vec![msg("a", "1"), msg("b", "2")];
        assert!(diff_messages(&list, &list.clone()).is_empty());
    }

    #[test]
    fn test_detects_insert_update_and_remove() {
        let previous = vec![msg("a", "1"), msg("b", "2"), msg("c", "3")];
        let next = vec![msg("a", "1"), msg("c", "3!"), msg("d", "4")];

        let changes = diff_messages(&previous, &next);
        assert_eq!(
            changes,
            vec![
                MessageChange::Removed { id: "b".into() },
                MessageChange::Updated {
                    index: 1,
                    message: msg("c", "3!"),
                },
                MessageChange::Inserted {
                    index: 2,
                    message: msg("d", "4"),
                },
            ]
        );
    }

    #[test]
    fn test_streaming_growth_is_an_update_not_an_insert() {
        let mut placeholder = Message::assistant_placeholder("t1");
        placeholder.id = "p".into();
        let previous = vec![placeholder.clone()];
        placeholder.append_chunk("Hel").unwrap();

        let changes = diff_messages(&previous, &[placeholder.clone()]);
        assert_eq!(changes.len(), 1);
        assert!(matches!(&changes[0], MessageChange::Updated { index: 0, message } if message.content == "Hel"));
    }

    #[test]
    fn test_dedupe_keeps_first_position_and_latest_value() {
        let deduped = dedupe_by_id(vec![msg("a", "old"), msg("b", "2"), msg("a", "new")]);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].id, "a");
        assert_eq!(deduped[0].content, "new");
        assert_eq!(deduped[1].id, "b");
    }
}
