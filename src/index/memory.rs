//! HashMap-backed reference index used by the binary and the tests.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{EmailIndex, IndexError, MessagePatch};
use crate::types::StoredMessage;

#[derive(Default)]
pub struct MemoryIndex {
    messages: Mutex<HashMap<String, StoredMessage>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EmailIndex for MemoryIndex {
    async fn exists(&self, id: &str) -> Result<bool, IndexError> {
        Ok(self.messages.lock().unwrap().contains_key(id))
    }

    async fn insert(&self, message: StoredMessage) -> Result<(), IndexError> {
        let mut messages = self.messages.lock().unwrap();
        if messages.contains_key(&message.id) {
            return Err(IndexError::Conflict);
        }
        messages.insert(message.id.clone(), message);
        Ok(())
    }

    async fn update(&self, id: &str, patch: MessagePatch) -> Result<(), IndexError> {
        let mut messages = self.messages.lock().unwrap();
        let message = messages.get_mut(id).ok_or(IndexError::NotFound)?;
        if let Some(is_read) = patch.is_read {
            message.is_read = is_read;
        }
        if let Some(is_starred) = patch.is_starred {
            message.is_starred = is_starred;
        }
        if let Some(category) = patch.category {
            message.category = category;
        }
        message.updated_at = Utc::now();
        Ok(())
    }

    async fn get(&self, user_id: &str, id: &str) -> Result<StoredMessage, IndexError> {
        let messages = self.messages.lock().unwrap();
        messages
            .get(id)
            .filter(|m| m.user_id == user_id)
            .cloned()
            .ok_or(IndexError::NotFound)
    }

    async fn search(&self, user_id: &str, query: &str) -> Result<Vec<StoredMessage>, IndexError> {
        let needle = query.to_lowercase();
        let messages = self.messages.lock().unwrap();
        let mut hits: Vec<StoredMessage> = messages
            .values()
            .filter(|m| m.user_id == user_id)
            .filter(|m| {
                m.subject.to_lowercase().contains(&needle)
                    || m.body.to_lowercase().contains(&needle)
                    || m.from.to_lowercase().contains(&needle)
            })
            .cloned()
            .collect();
        hits.sort_by(|a, b| b.date.cmp(&a.date));
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{message_id, Category};

    fn sample(user_id: &str, email: &str, uid: u64, subject: &str) -> StoredMessage {
        let now = Utc::now();
        StoredMessage {
            id: message_id(user_id, email, uid),
            user_id: user_id.to_string(),
            email: email.to_string(),
            folder: "INBOX".to_string(),
            uid,
            subject: subject.to_string(),
            from: "peer@y.com".to_string(),
            to: vec![email.to_string()],
            date: now,
            body: "body text".to_string(),
            is_read: false,
            is_starred: false,
            category: Category::Uncategorized,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn second_insert_conflicts_and_keeps_one_record() {
        let index = MemoryIndex::new();
        let msg = sample("u1", "a@x.com", 42, "Hello");

        index.insert(msg.clone()).await.unwrap();
        assert!(matches!(index.insert(msg).await, Err(IndexError::Conflict)));
        assert_eq!(index.len(), 1);
    }

    #[tokio::test]
    async fn get_enforces_user_ownership() {
        let index = MemoryIndex::new();
        let msg = sample("u1", "a@x.com", 1, "private");
        let id = msg.id.clone();
        index.insert(msg).await.unwrap();

        assert!(index.get("u1", &id).await.is_ok());
        assert!(matches!(index.get("u2", &id).await, Err(IndexError::NotFound)));
    }

    #[tokio::test]
    async fn update_patches_only_given_fields() {
        let index = MemoryIndex::new();
        let msg = sample("u1", "a@x.com", 1, "patch me");
        let id = msg.id.clone();
        index.insert(msg).await.unwrap();

        index
            .update(
                &id,
                MessagePatch {
                    is_read: Some(true),
                    category: Some(Category::Interested),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let updated = index.get("u1", &id).await.unwrap();
        assert!(updated.is_read);
        assert!(!updated.is_starred);
        assert_eq!(updated.category, Category::Interested);

        assert!(matches!(
            index.update("missing", MessagePatch::default()).await,
            Err(IndexError::NotFound)
        ));
    }

    #[tokio::test]
    async fn search_is_scoped_and_matches_subject_or_body() {
        let index = MemoryIndex::new();
        index.insert(sample("u1", "a@x.com", 1, "quarterly report")).await.unwrap();
        index.insert(sample("u2", "b@x.com", 2, "quarterly report")).await.unwrap();

        let hits = index.search("u1", "quarterly").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].user_id, "u1");

        let hits = index.search("u1", "body text").await.unwrap();
        assert_eq!(hits.len(), 1);
    }
}
