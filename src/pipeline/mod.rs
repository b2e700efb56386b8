//! Ingestion pipeline
//!
//! Stateless per-message path: dedupe against the index, classify, insert,
//! publish. Callers serialize messages per agent; across agents the
//! pipeline runs with no coordination.

use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::bus::{BusEvent, EventBus};
use crate::classify::{Classifier, ClassifyInput};
use crate::index::{EmailIndex, IndexError};
use crate::types::{message_id, AccountKey, NewMessageEvent, RawMessage, StoredMessage};

/// Delays of the insert retry ladder for transient index failures.
const INSERT_RETRY_DELAYS: [Duration; 3] = [
    Duration::from_millis(200),
    Duration::from_millis(800),
    Duration::from_secs(3),
];

/// What happened to one raw message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Inserted and announced.
    Stored,
    /// Already indexed; silently dropped.
    Duplicate,
    /// Index stayed unavailable through the retry ladder.
    Abandoned,
}

pub struct IngestionPipeline {
    index: Arc<dyn EmailIndex>,
    classifier: Arc<dyn Classifier>,
    bus: Arc<EventBus>,
    duplicates: AtomicU64,
    abandoned: AtomicU64,
}

impl IngestionPipeline {
    pub fn new(
        index: Arc<dyn EmailIndex>,
        classifier: Arc<dyn Classifier>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            index,
            classifier,
            bus,
            duplicates: AtomicU64::new(0),
            abandoned: AtomicU64::new(0),
        }
    }

    /// Messages dropped as duplicates since startup.
    pub fn duplicate_count(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }

    /// Messages abandoned after retry exhaustion since startup.
    pub fn abandoned_count(&self) -> u64 {
        self.abandoned.load(Ordering::Relaxed)
    }

    /// Ingest one raw message for an account.
    pub async fn ingest(&self, key: &AccountKey, folder: &str, raw: RawMessage) -> IngestOutcome {
        let id = message_id(&key.user_id, &key.email, raw.uid);

        match self.index.exists(&id).await {
            Ok(true) => {
                debug!(%id, "Already indexed, dropping");
                self.duplicates.fetch_add(1, Ordering::Relaxed);
                return IngestOutcome::Duplicate;
            }
            Ok(false) => {}
            // Treat a failed existence probe as unknown; the insert below
            // resolves it either way.
            Err(e) => debug!(%id, error = %e, "Existence check failed, proceeding to insert"),
        }

        let body = String::from_utf8_lossy(&raw.source).into_owned();
        let category = self
            .classifier
            .classify(&ClassifyInput {
                subject: raw.envelope.subject.clone(),
                body: body.clone(),
                from: raw.envelope.from.clone(),
            })
            .await;

        let now = Utc::now();
        let message = StoredMessage {
            id: id.clone(),
            user_id: key.user_id.clone(),
            email: key.email.clone(),
            folder: folder.to_string(),
            uid: raw.uid,
            subject: raw.envelope.subject,
            from: raw.envelope.from,
            to: raw.envelope.to,
            date: raw.envelope.date,
            body,
            is_read: false,
            is_starred: false,
            category,
            created_at: now,
            updated_at: now,
        };

        match self.insert_with_retry(message.clone()).await {
            InsertResult::Inserted => {
                self.bus.publish(BusEvent::NewMessage(NewMessageEvent {
                    user_id: key.user_id.clone(),
                    email: key.email.clone(),
                    message,
                    at: Utc::now(),
                }));
                IngestOutcome::Stored
            }
            InsertResult::Duplicate => {
                self.duplicates.fetch_add(1, Ordering::Relaxed);
                IngestOutcome::Duplicate
            }
            InsertResult::GaveUp => {
                warn!(%id, "Index unavailable, message abandoned");
                self.abandoned.fetch_add(1, Ordering::Relaxed);
                IngestOutcome::Abandoned
            }
        }
    }

    async fn insert_with_retry(&self, message: StoredMessage) -> InsertResult {
        let mut delays = INSERT_RETRY_DELAYS.iter();
        loop {
            match self.index.insert(message.clone()).await {
                Ok(()) => return InsertResult::Inserted,
                Err(IndexError::Conflict) => return InsertResult::Duplicate,
                Err(IndexError::Transient(reason)) => match delays.next() {
                    Some(delay) => {
                        debug!(id = %message.id, %reason, ?delay, "Transient index failure, retrying");
                        tokio::time::sleep(*delay).await;
                    }
                    None => return InsertResult::GaveUp,
                },
                // Insert cannot return NotFound; treat it like a transient
                // oddity and give up without the ladder.
                Err(IndexError::NotFound) => return InsertResult::GaveUp,
            }
        }
    }
}

enum InsertResult {
    Inserted,
    Duplicate,
    GaveUp,
}
