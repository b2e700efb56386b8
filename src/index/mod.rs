//! Email index interface
//!
//! The full-text engine itself is external; the sync core only needs the
//! narrow idempotent surface below. The pipeline branches on the error
//! variants, so they form a closed set rather than strings.

mod memory;

pub use memory::MemoryIndex;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{Category, StoredMessage};

#[derive(Debug, Clone, Error)]
pub enum IndexError {
    /// A message with this id is already present. Inserts never overwrite.
    #[error("duplicate message id")]
    Conflict,

    #[error("message not found")]
    NotFound,

    /// The index is temporarily unavailable. Retryable.
    #[error("index unavailable: {0}")]
    Transient(String),
}

/// Partial update of the mutable message fields.
#[derive(Debug, Clone, Default)]
pub struct MessagePatch {
    pub is_read: Option<bool>,
    pub is_starred: Option<bool>,
    pub category: Option<Category>,
}

#[async_trait]
pub trait EmailIndex: Send + Sync {
    async fn exists(&self, id: &str) -> Result<bool, IndexError>;

    /// Insert a new message. Fails with [`IndexError::Conflict`] when the
    /// id is already present.
    async fn insert(&self, message: StoredMessage) -> Result<(), IndexError>;

    async fn update(&self, id: &str, patch: MessagePatch) -> Result<(), IndexError>;

    /// Point lookup scoped to the owning user.
    async fn get(&self, user_id: &str, id: &str) -> Result<StoredMessage, IndexError>;

    async fn search(&self, user_id: &str, query: &str) -> Result<Vec<StoredMessage>, IndexError>;
}
