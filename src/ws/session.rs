//! Session state and the outbound frame queue
//!
//! Every session owns one bounded outbound queue drained by a single
//! writer task, which makes client-observed frame order equal to publish
//! order. On overflow, stale `sync_status` frames are coalesced (only the
//! latest per email matters); `new_email` frames are never dropped, and a
//! queue full of them marks the session unhealthy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::types::StoredMessage;

/// Normal closure; also used for replacement and shutdown.
pub const CLOSE_NORMAL: u16 = 1000;
/// Policy violation: authentication failure on the upgrade.
pub const CLOSE_POLICY: u16 = 1008;
/// Internal error: outbound backpressure.
pub const CLOSE_OVERLOADED: u16 = 1011;

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// Outbound frames, encoded as `{"type": ..., "data": ...}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Frame {
    Connection(ConnectionData),
    NewEmail(NewEmailData),
    SyncStatus(SyncStatusData),
    Pong(PongData),
    TestMessage(MessageData),
    Broadcast(MessageData),
}

impl Frame {
    /// For `sync_status` frames, the email whose older frames this one
    /// supersedes in a full queue.
    fn coalesce_key(&self) -> Option<&str> {
        match self {
            Frame::SyncStatus(data) => Some(&data.email),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionData {
    pub user_id: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewEmailData {
    /// The stored message itself.
    pub email: StoredMessage,
    pub user_id: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatusData {
    pub user_id: String,
    pub email: String,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PongData {
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageData {
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Inbound client frames. Unknown types deserialize to `Unknown` and are
/// ignored.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    Ping,
    Subscribe {
        #[serde(default)]
        topics: Vec<String>,
    },
    #[serde(other)]
    Unknown,
}

// ---------------------------------------------------------------------------
// Outbound queue
// ---------------------------------------------------------------------------

/// Items the writer task drains. Control items jump the queue and are not
/// subject to the capacity limit.
#[derive(Debug, Clone)]
pub enum QueueItem {
    Frame(Frame),
    Ping,
    Close { code: u16, reason: String },
}

/// The queue refused a frame: it is at capacity and holds nothing
/// coalescable. The session should be closed with [`CLOSE_OVERLOADED`].
#[derive(Debug, PartialEq, Eq)]
pub struct QueueFull;

pub struct OutboundQueue {
    items: Mutex<VecDeque<QueueItem>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            capacity,
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueue an outbound frame, coalescing stale `sync_status` frames on
    /// overflow.
    pub fn push_frame(&self, frame: Frame) -> Result<(), QueueFull> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }

        let mut items = self.items.lock().unwrap();
        if items.len() < self.capacity {
            items.push_back(QueueItem::Frame(frame));
            drop(items);
            self.notify.notify_one();
            return Ok(());
        }

        // Overflow: make room by dropping the oldest sync_status, preferring
        // one this frame supersedes outright.
        let victim = frame
            .coalesce_key()
            .and_then(|email| {
                items.iter().position(
                    |item| matches!(item, QueueItem::Frame(f) if f.coalesce_key() == Some(email)),
                )
            })
            .or_else(|| {
                items
                    .iter()
                    .position(|item| matches!(item, QueueItem::Frame(f) if f.coalesce_key().is_some()))
            });

        match victim {
            Some(pos) => {
                items.remove(pos);
                items.push_back(QueueItem::Frame(frame));
                drop(items);
                self.notify.notify_one();
                Ok(())
            }
            None => Err(QueueFull),
        }
    }

    /// Enqueue a control item ahead of pending frames. Never fails.
    pub fn push_control(&self, item: QueueItem) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        self.items.lock().unwrap().push_front(item);
        self.notify.notify_one();
    }

    /// Take the next item; `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<QueueItem> {
        loop {
            {
                let mut items = self.items.lock().unwrap();
                if let Some(item) = items.pop_front() {
                    return Some(item);
                }
                if self.closed.load(Ordering::Acquire) {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Refuse further items and wake the writer.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One live WebSocket attached to one user.
pub struct Session {
    pub user_id: String,
    pub session_id: u64,
    pub queue: OutboundQueue,
    pub opened_at: DateTime<Utc>,
    pub cancel: CancellationToken,
    /// Set on the predecessor when a newer session takes the registry slot.
    pub replaced: AtomicBool,
    last_pong_millis: AtomicI64,
}

impl Session {
    pub fn new(user_id: String, session_id: u64, queue_capacity: usize) -> Self {
        let now = Utc::now();
        Self {
            user_id,
            session_id,
            queue: OutboundQueue::new(queue_capacity),
            opened_at: now,
            cancel: CancellationToken::new(),
            replaced: AtomicBool::new(false),
            last_pong_millis: AtomicI64::new(now.timestamp_millis()),
        }
    }

    pub fn touch_pong(&self) {
        self.last_pong_millis
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_pong_millis(&self) -> i64 {
        self.last_pong_millis.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Category;

    fn sync_status(email: &str, state: &str) -> Frame {
        Frame::SyncStatus(SyncStatusData {
            user_id: "u1".to_string(),
            email: email.to_string(),
            state: state.to_string(),
            error: None,
            at: Utc::now(),
        })
    }

    fn new_email(uid: u64) -> Frame {
        let now = Utc::now();
        Frame::NewEmail(NewEmailData {
            email: StoredMessage {
                id: format!("u1|a@x.com|{}", uid),
                user_id: "u1".to_string(),
                email: "a@x.com".to_string(),
                folder: "INBOX".to_string(),
                uid,
                subject: "s".to_string(),
                from: "f@y.com".to_string(),
                to: vec![],
                date: now,
                body: "b".to_string(),
                is_read: false,
                is_starred: false,
                category: Category::Uncategorized,
                created_at: now,
                updated_at: now,
            },
            user_id: "u1".to_string(),
            at: now,
        })
    }

    #[test]
    fn frames_encode_with_type_and_data() {
        let frame = sync_status("a@x.com", "idle");
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "sync_status");
        assert_eq!(value["data"]["email"], "a@x.com");
        assert_eq!(value["data"]["state"], "idle");
        assert!(value["data"].get("error").is_none());

        let frame = new_email(42);
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "new_email");
        assert_eq!(value["data"]["email"]["userId"], "u1");
        assert_eq!(value["data"]["userId"], "u1");
    }

    #[test]
    fn inbound_parses_known_and_unknown_types() {
        assert!(matches!(
            serde_json::from_str::<Inbound>(r#"{"type":"ping"}"#).unwrap(),
            Inbound::Ping
        ));
        match serde_json::from_str::<Inbound>(r#"{"type":"subscribe","topics":["a"]}"#).unwrap() {
            Inbound::Subscribe { topics } => assert_eq!(topics, vec!["a".to_string()]),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(matches!(
            serde_json::from_str::<Inbound>(r#"{"type":"mystery"}"#).unwrap(),
            Inbound::Unknown
        ));
    }

    #[tokio::test]
    async fn pop_preserves_push_order() {
        let queue = OutboundQueue::new(8);
        queue.push_frame(sync_status("a@x.com", "starting")).unwrap();
        queue.push_frame(sync_status("a@x.com", "syncing")).unwrap();

        match queue.pop().await.unwrap() {
            QueueItem::Frame(Frame::SyncStatus(data)) => assert_eq!(data.state, "starting"),
            other => panic!("unexpected: {:?}", other),
        }
        match queue.pop().await.unwrap() {
            QueueItem::Frame(Frame::SyncStatus(data)) => assert_eq!(data.state, "syncing"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn overflow_coalesces_oldest_sync_status_for_same_email() {
        let queue = OutboundQueue::new(2);
        queue.push_frame(sync_status("a@x.com", "starting")).unwrap();
        queue.push_frame(sync_status("b@x.com", "starting")).unwrap();

        // Full; the a@x.com frame is superseded, b@x.com survives.
        queue.push_frame(sync_status("a@x.com", "idle")).unwrap();

        let items = queue.items.lock().unwrap();
        let states: Vec<(String, String)> = items
            .iter()
            .map(|item| match item {
                QueueItem::Frame(Frame::SyncStatus(d)) => (d.email.clone(), d.state.clone()),
                other => panic!("unexpected: {:?}", other),
            })
            .collect();
        assert_eq!(
            states,
            vec![
                ("b@x.com".to_string(), "starting".to_string()),
                ("a@x.com".to_string(), "idle".to_string()),
            ]
        );
    }

    #[test]
    fn overflow_full_of_new_email_refuses() {
        let queue = OutboundQueue::new(2);
        queue.push_frame(new_email(1)).unwrap();
        queue.push_frame(new_email(2)).unwrap();

        assert_eq!(queue.push_frame(new_email(3)), Err(QueueFull));
        // A sync_status also has nothing to coalesce.
        assert_eq!(queue.push_frame(sync_status("a@x.com", "idle")), Err(QueueFull));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn new_email_overflow_may_coalesce_a_sync_status() {
        let queue = OutboundQueue::new(2);
        queue.push_frame(sync_status("a@x.com", "idle")).unwrap();
        queue.push_frame(new_email(1)).unwrap();

        queue.push_frame(new_email(2)).unwrap();
        let items = queue.items.lock().unwrap();
        assert_eq!(items.len(), 2);
        assert!(items
            .iter()
            .all(|item| matches!(item, QueueItem::Frame(Frame::NewEmail(_)))));
    }

    #[tokio::test]
    async fn controls_jump_the_queue_and_ignore_capacity() {
        let queue = OutboundQueue::new(1);
        queue.push_frame(new_email(1)).unwrap();
        queue.push_control(QueueItem::Close {
            code: CLOSE_OVERLOADED,
            reason: "backpressure".to_string(),
        });

        match queue.pop().await.unwrap() {
            QueueItem::Close { code, .. } => assert_eq!(code, CLOSE_OVERLOADED),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn closed_queue_drains_then_ends() {
        let queue = OutboundQueue::new(4);
        queue.push_frame(new_email(1)).unwrap();
        queue.close();

        assert!(queue.pop().await.is_some());
        assert!(queue.pop().await.is_none());
        // Pushes after close are silently dropped.
        assert!(queue.push_frame(new_email(2)).is_ok());
        assert!(queue.pop().await.is_none());
    }
}
