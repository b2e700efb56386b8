//! Mailbox agent
//!
//! One long-lived worker per (user, mailbox): connect, backfill a bounded
//! window, then hold an RFC 2177 IDLE and feed new messages to the
//! ingestion pipeline one at a time. Recovers from transient failures via
//! an exponential backoff ladder; authorization failures park the agent
//! until it is stopped and restarted with a new credential.
//!
//! The agent task is the only writer of its state cell and the only sender
//! of its status events, so per-agent ordering needs no extra machinery.

mod connection;
mod fetch;

pub use connection::{connect, derive_host, logout_quietly, ImapSession, LOGOUT_TIMEOUT};
pub use fetch::{collect_tolerant, decode_rfc2047, imap_since_date, parse_raw_message, FETCH_QUERY};

use async_imap::extensions::idle::IdleResponse;
use chrono::{DateTime, Utc};
use imap_proto::{MailboxDatum, Response};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SyncSettings;
use crate::credentials::{CredentialError, CredentialStore};
use crate::error::OneboxError;
use crate::pipeline::IngestionPipeline;
use crate::types::{AccountKey, AgentState, RawMessage, StatusEvent};

/// The only folder an agent synchronizes.
pub const PRIMARY_FOLDER: &str = "INBOX";

/// Agent tunables, extracted from the shared settings at construction.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub backfill_window: Duration,
    pub idle_max: Duration,
    pub connect_timeout: Duration,
    pub fetch_timeout: Duration,
    pub retry_base: Duration,
    pub retry_cap: Duration,
    pub imap_host: Option<String>,
    pub imap_port: u16,
}

impl From<&SyncSettings> for AgentConfig {
    fn from(settings: &SyncSettings) -> Self {
        Self {
            backfill_window: settings.backfill_window,
            idle_max: settings.idle_max,
            connect_timeout: settings.connect_timeout,
            fetch_timeout: settings.fetch_timeout,
            retry_base: settings.retry_base,
            retry_cap: settings.retry_cap,
            imap_host: settings.imap_host.clone(),
            imap_port: settings.imap_port,
        }
    }
}

/// Exponential backoff ladder: `min(base * 2^attempt, cap)`, jitter applied
/// separately by [`with_jitter`].
pub(crate) fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt.min(16))).min(cap)
}

/// ±20% jitter so reconnecting agents don't stampede the server.
fn with_jitter(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.8..=1.2);
    delay.mul_f64(factor)
}

enum Phase {
    /// Stop was requested; the run loop exits cleanly.
    Stopped,
}

enum BackfillEnd {
    Done,
    Stopped,
}

pub struct MailboxAgent {
    key: AccountKey,
    config: AgentConfig,
    credentials: Arc<dyn CredentialStore>,
    pipeline: Arc<IngestionPipeline>,
    status_tx: flume::Sender<StatusEvent>,
    state: RwLock<AgentState>,
    cancel: CancellationToken,
}

impl MailboxAgent {
    pub fn new(
        key: AccountKey,
        config: AgentConfig,
        credentials: Arc<dyn CredentialStore>,
        pipeline: Arc<IngestionPipeline>,
        status_tx: flume::Sender<StatusEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            key,
            config,
            credentials,
            pipeline,
            status_tx,
            state: RwLock::new(AgentState::Starting),
            cancel: CancellationToken::new(),
        })
    }

    pub fn key(&self) -> &AccountKey {
        &self.key
    }

    /// Request the agent to stop. Always safe; idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Snapshot of the last published state.
    pub async fn state(&self) -> AgentState {
        self.state.read().await.clone()
    }

    /// Publish a state transition. Called only from the agent task (and the
    /// supervisor's panic handler once the task is gone), which keeps the
    /// event order equal to the transition order.
    pub(crate) async fn publish(&self, state: AgentState) {
        info!(account = %self.key, state = %state, "Agent state");
        {
            let mut cell = self.state.write().await;
            *cell = state.clone();
        }
        let _ = self.status_tx.send(StatusEvent {
            user_id: self.key.user_id.clone(),
            email: self.key.email.clone(),
            state,
            at: Utc::now(),
        });
    }

    /// Main loop: connect/sync/idle with autonomous recovery, until stopped.
    pub async fn run(self: Arc<Self>) {
        let mut attempt: u32 = 0;
        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            self.publish(AgentState::Starting).await;

            match self.connect_and_sync(&mut attempt).await {
                Ok(Phase::Stopped) => break,
                Err(OneboxError::Unauthorized) => {
                    self.publish(AgentState::Error("unauthorized".to_string())).await;
                    // A new credential plus a manual restart is required;
                    // park here so stop() still works.
                    self.cancel.cancelled().await;
                    break;
                }
                Err(e) => {
                    self.publish(AgentState::Error(e.to_string())).await;
                    let delay =
                        with_jitter(backoff_delay(attempt, self.config.retry_base, self.config.retry_cap));
                    attempt = attempt.saturating_add(1);
                    warn!(account = %self.key, error = %e, ?delay, "Agent error, backing off");
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        self.publish(AgentState::Stopped).await;
    }

    /// One connection lifetime: credential, connect, backfill, idle.
    /// `Ok(Stopped)` means stop was requested; every `Err` goes through the
    /// recovery ladder above.
    async fn connect_and_sync(&self, attempt: &mut u32) -> Result<Phase, OneboxError> {
        let credential = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(Phase::Stopped),
            cred = self.credentials.get_fresh(&self.key) => cred.map_err(|e| match e {
                CredentialError::NotAuthorized => OneboxError::Unauthorized,
                CredentialError::Unavailable(reason) => OneboxError::Network(reason),
            })?,
        };

        let host = self
            .config
            .imap_host
            .clone()
            .unwrap_or_else(|| derive_host(&self.key.email));

        let session = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(Phase::Stopped),
            conn = connect(
                &host,
                self.config.imap_port,
                &self.key.email,
                &credential.access_token,
                self.config.connect_timeout,
            ) => conn?,
        };

        // A stop that raced the connect must not leave a zombie connection,
        // and must not publish Syncing after the fact.
        if self.cancel.is_cancelled() {
            logout_quietly(session, &self.key.email).await;
            return Ok(Phase::Stopped);
        }

        self.publish(AgentState::Syncing).await;

        let mut session = session;
        let mailbox = session
            .select(PRIMARY_FOLDER)
            .await
            .map_err(map_imap_error)?;
        let last_exists = mailbox.exists;

        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.backfill_window)
                .unwrap_or_else(|_| chrono::Duration::hours(24));

        if let BackfillEnd::Stopped = self.backfill(&mut session, cutoff).await? {
            logout_quietly(session, &self.key.email).await;
            return Ok(Phase::Stopped);
        }

        self.publish(AgentState::Idle).await;
        *attempt = 0;

        self.idle_loop(session, last_exists).await
    }

    /// Fetch and ingest every inbox message inside the backfill window,
    /// oldest first. Messages older than the cutoff are skipped here even
    /// if the server returned them (SINCE has day granularity).
    async fn backfill(
        &self,
        session: &mut ImapSession,
        cutoff: DateTime<Utc>,
    ) -> Result<BackfillEnd, OneboxError> {
        let query = format!("SINCE {}", imap_since_date(cutoff));
        let uid_set = session
            .uid_search(&query)
            .await
            .map_err(map_imap_error)?;

        let mut uids: Vec<u32> = uid_set.into_iter().collect();
        uids.sort_unstable();

        info!(account = %self.key, candidates = uids.len(), "Backfill window selected");

        let mut ingested = 0usize;
        for uid in uids {
            if self.cancel.is_cancelled() {
                return Ok(BackfillEnd::Stopped);
            }

            let Some(raw) = self.fetch_one(session, FetchBy::Uid(uid)).await? else {
                continue;
            };
            if !within_backfill_window(raw.envelope.date, cutoff) {
                debug!(account = %self.key, uid, "Message predates backfill cutoff, skipping");
                continue;
            }
            self.hand_off(raw).await;
            ingested += 1;
        }

        info!(account = %self.key, ingested, "Backfill complete");
        Ok(BackfillEnd::Done)
    }

    /// Hold IDLE, cycling before the server-side timeout, fetching new
    /// messages as the mailbox grows.
    async fn idle_loop(&self, mut session: ImapSession, mut last_exists: u32) -> Result<Phase, OneboxError> {
        loop {
            let mut idle = session.idle();
            idle.init().await.map_err(map_imap_error)?;
            let (idle_wait, interrupt) = idle.wait_with_timeout(self.config.idle_max);

            // `idle_wait` borrows the handle, so the wait result is taken
            // out of the select before the handle is touched again.
            let waited = tokio::select! {
                _ = self.cancel.cancelled() => None,
                res = idle_wait => Some(res),
            };
            drop(interrupt);

            let response = match waited {
                None => {
                    // Stop requested: best-effort DONE + logout, bounded so
                    // the stop stays fast.
                    if let Ok(Ok(session)) = tokio::time::timeout(LOGOUT_TIMEOUT, idle.done()).await {
                        logout_quietly(session, &self.key.email).await;
                    }
                    return Ok(Phase::Stopped);
                }
                Some(res) => res.map_err(map_imap_error)?,
            };

            session = idle.done().await.map_err(map_imap_error)?;

            match response {
                IdleResponse::Timeout => {
                    debug!(account = %self.key, "IDLE held to refresh limit, cycling");
                    continue;
                }
                IdleResponse::ManualInterrupt => return Ok(Phase::Stopped),
                IdleResponse::NewData(data) => match parse_unsolicited(data.parsed()) {
                    Some(MailboxUpdate::Exists(count)) if count > last_exists => {
                        for seq in (last_exists + 1)..=count {
                            if self.cancel.is_cancelled() {
                                logout_quietly(session, &self.key.email).await;
                                return Ok(Phase::Stopped);
                            }
                            if let Some(raw) = self.fetch_one(&mut session, FetchBy::Seq(seq)).await? {
                                self.hand_off(raw).await;
                            }
                        }
                        last_exists = count;
                    }
                    Some(MailboxUpdate::Exists(count)) => last_exists = count,
                    Some(MailboxUpdate::Expunge) => {
                        last_exists = last_exists.saturating_sub(1);
                    }
                    None => {}
                },
            }
        }
    }

    /// Fetch a single message, bounded by the per-message FETCH timeout.
    async fn fetch_one(
        &self,
        session: &mut ImapSession,
        by: FetchBy,
    ) -> Result<Option<RawMessage>, OneboxError> {
        let fetch = async {
            let fetches = match by {
                FetchBy::Uid(uid) => {
                    let stream = session
                        .uid_fetch(uid.to_string(), FETCH_QUERY)
                        .await
                        .map_err(map_imap_error)?;
                    collect_tolerant(stream, "uid fetch").await
                }
                FetchBy::Seq(seq) => {
                    let stream = session
                        .fetch(seq.to_string(), FETCH_QUERY)
                        .await
                        .map_err(map_imap_error)?;
                    collect_tolerant(stream, "seq fetch").await
                }
            };
            Ok::<_, OneboxError>(fetches.iter().find_map(parse_raw_message))
        };

        tokio::select! {
            // A stop cancels an in-flight fetch; the caller notices the
            // cancellation on its next loop check.
            _ = self.cancel.cancelled() => Ok(None),
            res = tokio::time::timeout(self.config.fetch_timeout, fetch) => {
                res.map_err(|_| OneboxError::Network(format!("FETCH {:?} timed out", by)))?
            }
        }
    }

    /// Hand one message to the pipeline, serially, bounded so a stalled
    /// index cannot wedge the agent. A timed-out handoff abandons the
    /// message; it is logged but is not a state transition.
    async fn hand_off(&self, raw: RawMessage) {
        let uid = raw.uid;
        match tokio::time::timeout(
            self.config.fetch_timeout,
            self.pipeline.ingest(&self.key, PRIMARY_FOLDER, raw),
        )
        .await
        {
            Ok(outcome) => debug!(account = %self.key, uid, ?outcome, "Message handed off"),
            Err(_) => warn!(account = %self.key, uid, "Pipeline handoff timed out, message abandoned"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum FetchBy {
    Uid(u32),
    Seq(u32),
}

enum MailboxUpdate {
    Exists(u32),
    Expunge,
}

/// Inclusion predicate for the backfill window. The boundary instant itself
/// is included.
fn within_backfill_window(date: DateTime<Utc>, cutoff: DateTime<Utc>) -> bool {
    date >= cutoff
}

/// Pull the mailbox-size updates out of an unsolicited IDLE response.
fn parse_unsolicited(response: &Response<'_>) -> Option<MailboxUpdate> {
    match response {
        Response::MailboxData(MailboxDatum::Exists(count)) => Some(MailboxUpdate::Exists(*count)),
        Response::Expunge(_) => Some(MailboxUpdate::Expunge),
        _ => None,
    }
}

fn map_imap_error(err: async_imap::error::Error) -> OneboxError {
    match err {
        async_imap::error::Error::Io(e) => OneboxError::Network(e.to_string()),
        async_imap::error::Error::ConnectionLost => OneboxError::Network("connection lost".to_string()),
        other => OneboxError::Protocol(other.to_string()),
    }
}
