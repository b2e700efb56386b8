//! WebSocket session hub
//!
//! Authenticates upgrades on `/ws`, keeps one live session per user,
//! fans bus events out as JSON frames, heartbeats, and drives agent
//! auto-start / auto-stop through the supervisor.

mod session;

pub use session::{
    ConnectionData, Frame, Inbound, MessageData, NewEmailData, OutboundQueue, PongData, QueueFull,
    QueueItem, Session, SyncStatusData, CLOSE_NORMAL, CLOSE_OVERLOADED, CLOSE_POLICY,
};

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use async_trait::async_trait;

use crate::bus::{BusEvent, EventBus, Topic};
use crate::config::SyncSettings;
use crate::supervisor::Supervisor;

/// Resolves a bearer token from the upgrade query to a user id.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Option<String>;
}

/// Fixed token→user map, seeded from `WS_TOKENS` ("token:user,token:user").
pub struct StaticTokenVerifier {
    tokens: HashMap<String, String>,
}

impl StaticTokenVerifier {
    pub fn from_pairs(pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            tokens: pairs.into_iter().collect(),
        }
    }

    pub fn from_env() -> Self {
        let raw = std::env::var("WS_TOKENS").unwrap_or_default();
        let tokens = raw
            .split(',')
            .filter_map(|pair| {
                let (token, user) = pair.split_once(':')?;
                let (token, user) = (token.trim(), user.trim());
                if token.is_empty() || user.is_empty() {
                    None
                } else {
                    Some((token.to_string(), user.to_string()))
                }
            })
            .collect();
        Self { tokens }
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Option<String> {
        self.tokens.get(token).cloned()
    }
}

#[derive(Deserialize)]
struct WsQuery {
    token: Option<String>,
}

pub struct SessionHub {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    verifier: Arc<dyn TokenVerifier>,
    supervisor: Arc<Supervisor>,
    settings: SyncSettings,
    next_session_id: AtomicU64,
    cancel: CancellationToken,
}

impl SessionHub {
    pub fn new(
        verifier: Arc<dyn TokenVerifier>,
        supervisor: Arc<Supervisor>,
        settings: SyncSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            verifier,
            supervisor,
            settings,
            next_session_id: AtomicU64::new(1),
            cancel: CancellationToken::new(),
        })
    }

    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .with_state(self.clone())
    }

    /// Spawn the heartbeat and the bus→session pumps.
    pub fn start(self: &Arc<Self>, bus: &Arc<EventBus>) {
        let status_sub = bus.subscribe("session-hub", Topic::Status);
        let message_sub = bus.subscribe("session-hub", Topic::NewMessage);

        let hub = self.clone();
        tokio::spawn(async move {
            while let Ok(event) = status_sub.rx.recv_async().await {
                hub.dispatch(event);
            }
        });

        let hub = self.clone();
        tokio::spawn(async move {
            while let Ok(event) = message_sub.rx.recv_async().await {
                hub.dispatch(event);
            }
        });

        let hub = self.clone();
        tokio::spawn(async move {
            hub.run_heartbeat().await;
        });
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// Route one bus event to its user's session, if any.
    fn dispatch(&self, event: BusEvent) {
        let (user_id, frame) = match event {
            BusEvent::NewMessage(e) => (
                e.user_id.clone(),
                Frame::NewEmail(NewEmailData {
                    email: e.message,
                    user_id: e.user_id,
                    at: e.at,
                }),
            ),
            BusEvent::Status(e) => (
                e.user_id.clone(),
                Frame::SyncStatus(SyncStatusData {
                    user_id: e.user_id.clone(),
                    email: e.email,
                    state: e.state.label().to_string(),
                    error: e.state.error_message().map(String::from),
                    at: e.at,
                }),
            ),
        };

        let session = self.sessions.lock().unwrap().get(&user_id).cloned();
        if let Some(session) = session {
            self.deliver(&session, frame);
        }
    }

    /// Enqueue a frame; an unrelievable overflow marks the session
    /// unhealthy and closes it.
    fn deliver(&self, session: &Arc<Session>, frame: Frame) {
        if session.queue.push_frame(frame).is_err() {
            warn!(user = %session.user_id, "Outbound queue full of new_email frames, closing session");
            session.queue.push_control(QueueItem::Close {
                code: CLOSE_OVERLOADED,
                reason: "backpressure".to_string(),
            });
        }
    }

    /// Write a frame to every live session, swallowing per-session errors.
    pub fn broadcast_all(&self, frame: Frame) {
        let sessions: Vec<Arc<Session>> = self.sessions.lock().unwrap().values().cloned().collect();
        for session in sessions {
            self.deliver(&session, frame.clone());
        }
    }

    /// Admin path: send a test frame to one user's session.
    pub fn send_test_message(&self, user_id: &str, message: &str) -> bool {
        let session = self.sessions.lock().unwrap().get(user_id).cloned();
        match session {
            Some(session) => {
                self.deliver(
                    &session,
                    Frame::TestMessage(MessageData {
                        message: message.to_string(),
                        at: Utc::now(),
                    }),
                );
                true
            }
            None => false,
        }
    }

    async fn handle_socket(self: Arc<Self>, socket: WebSocket, token: Option<String>) {
        let user_id = match token {
            Some(token) => self.verifier.verify(&token).await,
            None => None,
        };
        let Some(user_id) = user_id else {
            let mut socket = socket;
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: CLOSE_POLICY,
                    reason: "invalid or missing token".into(),
                })))
                .await;
            return;
        };

        let session = Arc::new(Session::new(
            user_id.clone(),
            self.next_session_id.fetch_add(1, Ordering::Relaxed),
            self.settings.session_queue,
        ));

        // Register, replacing any predecessor.
        let prior = {
            let mut sessions = self.sessions.lock().unwrap();
            sessions.insert(user_id.clone(), session.clone())
        };
        if let Some(prior) = prior {
            info!(user = %user_id, "Session replaced by a newer connection");
            prior.replaced.store(true, Ordering::Release);
            prior.queue.push_control(QueueItem::Close {
                code: CLOSE_NORMAL,
                reason: "replaced".to_string(),
            });
        }

        info!(user = %user_id, session = session.session_id, "Session opened");

        self.deliver(
            &session,
            Frame::Connection(ConnectionData {
                user_id: user_id.clone(),
                message: "connected".to_string(),
                at: Utc::now(),
            }),
        );

        // Agent auto-start happens off the handshake path.
        {
            let supervisor = self.supervisor.clone();
            let user = user_id.clone();
            tokio::spawn(async move {
                match supervisor.ensure_for_user(&user).await {
                    Ok(started) => debug!(user = %user, started, "Agents ensured"),
                    Err(e) => warn!(user = %user, error = %e, "Agent auto-start failed"),
                }
            });
        }

        let (sender, receiver) = socket.split();
        let writer = tokio::spawn(run_writer(
            session.clone(),
            sender,
            self.settings.ws_write_timeout,
        ));

        self.run_reader(&session, receiver).await;

        session.cancel.cancel();
        session.queue.close();
        let _ = writer.await;

        self.deregister(&session).await;
    }

    async fn run_reader(
        &self,
        session: &Arc<Session>,
        mut receiver: futures::stream::SplitStream<WebSocket>,
    ) {
        loop {
            let message = tokio::select! {
                _ = session.cancel.cancelled() => break,
                msg = receiver.next() => msg,
            };
            match message {
                Some(Ok(Message::Text(text))) => self.handle_inbound(session, &text),
                Some(Ok(Message::Pong(_))) => session.touch_pong(),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(user = %session.user_id, error = %e, "Socket read failed");
                    break;
                }
            }
        }
    }

    fn handle_inbound(&self, session: &Arc<Session>, text: &str) {
        match serde_json::from_str::<Inbound>(text) {
            Ok(Inbound::Ping) => {
                self.deliver(session, Frame::Pong(PongData { at: Utc::now() }));
            }
            Ok(Inbound::Subscribe { topics }) => {
                // Advisory in this revision; every event is delivered.
                debug!(user = %session.user_id, ?topics, "Subscription acknowledged");
            }
            Ok(Inbound::Unknown) | Err(_) => {
                debug!(user = %session.user_id, "Ignoring unrecognized inbound frame");
            }
        }
    }

    /// Remove a closed session exactly once; stop the user's agents when no
    /// live session remains.
    async fn deregister(&self, session: &Arc<Session>) {
        let removed = {
            let mut sessions = self.sessions.lock().unwrap();
            match sessions.get(&session.user_id) {
                Some(current) if current.session_id == session.session_id => {
                    sessions.remove(&session.user_id);
                    true
                }
                _ => false,
            }
        };

        info!(user = %session.user_id, session = session.session_id, removed, "Session closed");

        if removed && !session.replaced.load(Ordering::Acquire) {
            info!(user = %session.user_id, "Last session gone, stopping agents");
            self.supervisor.stop_all(&session.user_id).await;
        }
    }

    /// Protocol-level PING every heartbeat interval; a session that missed
    /// a whole interval without a PONG is terminated.
    async fn run_heartbeat(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.settings.ws_heartbeat);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let cutoff = Utc::now().timestamp_millis() - self.settings.ws_heartbeat.as_millis() as i64;
            let sessions: Vec<Arc<Session>> =
                self.sessions.lock().unwrap().values().cloned().collect();

            for session in sessions {
                if session.last_pong_millis() < cutoff {
                    warn!(user = %session.user_id, "Heartbeat missed, terminating session");
                    session.queue.close();
                    session.cancel.cancel();
                } else {
                    session.queue.push_control(QueueItem::Ping);
                }
            }
        }
    }

    /// Close every session and stop the background tasks. Call after the
    /// supervisor has shut down so final status frames reach clients first.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let sessions: Vec<Arc<Session>> = {
            let mut map = self.sessions.lock().unwrap();
            map.drain().map(|(_, s)| s).collect()
        };
        for session in sessions {
            session.replaced.store(true, Ordering::Release);
            session.queue.push_control(QueueItem::Close {
                code: CLOSE_NORMAL,
                reason: "shutdown".to_string(),
            });
        }
    }
}

async fn ws_handler(
    State(hub): State<Arc<SessionHub>>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| hub.handle_socket(socket, query.token))
}

/// Single writer per session: drains the outbound queue in order, bounded
/// per frame; a slow or failing write closes the session.
async fn run_writer(
    session: Arc<Session>,
    mut sender: futures::stream::SplitSink<WebSocket, Message>,
    write_timeout: std::time::Duration,
) {
    while let Some(item) = session.queue.pop().await {
        let (message, last) = match item {
            QueueItem::Frame(frame) => match serde_json::to_string(&frame) {
                Ok(text) => (Message::Text(text), false),
                Err(e) => {
                    warn!(user = %session.user_id, error = %e, "Dropping unencodable frame");
                    continue;
                }
            },
            QueueItem::Ping => (Message::Ping(Vec::new()), false),
            QueueItem::Close { code, reason } => (
                Message::Close(Some(CloseFrame {
                    code,
                    reason: reason.into(),
                })),
                true,
            ),
        };

        match tokio::time::timeout(write_timeout, sender.send(message)).await {
            Ok(Ok(())) => {
                if last {
                    break;
                }
            }
            Ok(Err(e)) => {
                debug!(user = %session.user_id, error = %e, "Socket write failed");
                break;
            }
            Err(_) => {
                warn!(user = %session.user_id, "Frame write timed out, closing session");
                break;
            }
        }
    }
    session.cancel.cancel();
}
