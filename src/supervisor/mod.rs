//! Agent supervision
//!
//! Owns every mailbox agent in the process. The registry is keyed by the
//! composite [`AccountKey`] and mutated only under one mutex; reads take
//! snapshots. Agents publish status into a shared channel; a single pump
//! task forwards to the event bus so per-agent ordering survives the
//! fan-in.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::agent::{AgentConfig, MailboxAgent};
use crate::bus::{BusEvent, EventBus};
use crate::config::SyncSettings;
use crate::credentials::{CredentialError, CredentialStore};
use crate::pipeline::IngestionPipeline;
use crate::types::{AccountKey, AgentState, StatusEvent};

/// How long a stopping agent may take before its task is orphaned.
const STOP_GRACE: Duration = Duration::from_secs(2);
/// Pause between stop and start during a rolling restart.
const RESTART_PAUSE: Duration = Duration::from_secs(2);
/// Panic policy: restarts allowed per rolling window before parking.
const MAX_PANIC_RESTARTS: usize = 5;
const PANIC_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Error)]
pub enum SupervisorError {
    #[error("agent already running for {0}")]
    AlreadyRunning(AccountKey),
}

struct AgentHandle {
    agent: Arc<MailboxAgent>,
    task: JoinHandle<()>,
}

pub struct Supervisor {
    settings: SyncSettings,
    credentials: Arc<dyn CredentialStore>,
    pipeline: Arc<IngestionPipeline>,
    agents: Mutex<HashMap<AccountKey, AgentHandle>>,
    status_tx: flume::Sender<StatusEvent>,
}

impl Supervisor {
    /// Build the supervisor and spawn the status fan-in pump.
    pub fn new(
        settings: SyncSettings,
        credentials: Arc<dyn CredentialStore>,
        pipeline: Arc<IngestionPipeline>,
        bus: Arc<EventBus>,
    ) -> Arc<Self> {
        let (status_tx, status_rx) = flume::unbounded::<StatusEvent>();

        tokio::spawn(async move {
            while let Ok(event) = status_rx.recv_async().await {
                bus.publish(BusEvent::Status(event));
            }
        });

        Arc::new(Self {
            settings,
            credentials,
            pipeline,
            agents: Mutex::new(HashMap::new()),
            status_tx,
        })
    }

    /// Start an agent for the account. `AlreadyRunning` when one exists in
    /// any non-Stopped state; a leftover Stopped handle is replaced.
    pub async fn start(&self, key: &AccountKey) -> Result<(), SupervisorError> {
        let mut agents = self.agents.lock().await;

        if let Some(handle) = agents.get(key) {
            if !handle.agent.state().await.is_terminal() {
                return Err(SupervisorError::AlreadyRunning(key.clone()));
            }
            agents.remove(key);
        }

        let agent = MailboxAgent::new(
            key.clone(),
            AgentConfig::from(&self.settings),
            self.credentials.clone(),
            self.pipeline.clone(),
            self.status_tx.clone(),
        );
        let task = tokio::spawn(Self::run_supervised(agent.clone()));
        agents.insert(key.clone(), AgentHandle { agent, task });

        info!(account = %key, "Agent started");
        Ok(())
    }

    /// Run an agent, restarting it after panics up to the policy limit,
    /// after which it parks in permanent Error pending a manual restart.
    async fn run_supervised(agent: Arc<MailboxAgent>) {
        let mut restarts: Vec<Instant> = Vec::new();
        loop {
            let run = tokio::spawn(agent.clone().run());
            match run.await {
                Ok(()) => return,
                Err(e) if e.is_panic() => {
                    restarts.retain(|t| t.elapsed() < PANIC_WINDOW);
                    restarts.push(Instant::now());
                    if restarts.len() > MAX_PANIC_RESTARTS {
                        error!(account = %agent.key(), "Agent panicked repeatedly, parking");
                        agent
                            .publish(AgentState::Error("agent panicked repeatedly".to_string()))
                            .await;
                        agent.cancel_token().cancelled().await;
                        agent.publish(AgentState::Stopped).await;
                        return;
                    }
                    warn!(account = %agent.key(), restarts = restarts.len(), "Agent panicked, restarting");
                }
                Err(_) => return,
            }
        }
    }

    /// Stop the agent for the account, if any. Idempotent.
    pub async fn stop(&self, key: &AccountKey) {
        let handle = { self.agents.lock().await.remove(key) };
        let Some(handle) = handle else { return };

        handle.agent.stop();

        let mut task = handle.task;
        if tokio::time::timeout(STOP_GRACE, &mut task).await.is_err() {
            warn!(account = %key, "Agent did not stop in time, orphaning");
            task.abort();
            if !handle.agent.state().await.is_terminal() {
                handle.agent.publish(AgentState::Stopped).await;
            }
        }
        info!(account = %key, "Agent stopped");
    }

    /// Stop every agent belonging to a user.
    pub async fn stop_all(&self, user_id: &str) {
        let keys: Vec<AccountKey> = {
            let agents = self.agents.lock().await;
            agents.keys().filter(|k| k.user_id == user_id).cloned().collect()
        };
        for key in keys {
            self.stop(&key).await;
        }
    }

    /// Per-email state snapshot for a user.
    pub async fn status(&self, user_id: &str) -> Vec<(String, AgentState)> {
        let handles: Vec<(String, Arc<MailboxAgent>)> = {
            let agents = self.agents.lock().await;
            agents
                .iter()
                .filter(|(k, _)| k.user_id == user_id)
                .map(|(k, h)| (k.email.clone(), h.agent.clone()))
                .collect()
        };

        let mut states = Vec::with_capacity(handles.len());
        for (email, agent) in handles {
            states.push((email, agent.state().await));
        }
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    /// Stop and restart every agent, one at a time. Failures are logged
    /// and do not abort the loop.
    pub async fn restart_all(&self) {
        let keys: Vec<AccountKey> = {
            let agents = self.agents.lock().await;
            agents.keys().cloned().collect()
        };

        info!(count = keys.len(), "Rolling restart");
        for key in keys {
            self.stop(&key).await;
            tokio::time::sleep(RESTART_PAUSE).await;
            if let Err(e) = self.start(&key).await {
                warn!(account = %key, error = %e, "Restart failed, continuing");
            }
        }
    }

    /// Start agents for every stored credential of a user, leaving the ones
    /// already running untouched. Returns how many were started.
    pub async fn ensure_for_user(&self, user_id: &str) -> Result<usize, CredentialError> {
        let emails = self.credentials.list(user_id).await?;

        let mut started = 0;
        for email in emails {
            let key = AccountKey::new(user_id, email);
            match self.start(&key).await {
                Ok(()) => started += 1,
                Err(SupervisorError::AlreadyRunning(_)) => {}
            }
        }
        Ok(started)
    }

    /// Stop everything in parallel within the shutdown deadline; whatever
    /// remains afterwards is force-terminated.
    pub async fn shutdown(&self) {
        let handles: Vec<(AccountKey, AgentHandle)> = {
            let mut agents = self.agents.lock().await;
            agents.drain().collect()
        };

        info!(count = handles.len(), "Supervisor shutdown");

        let mut tasks = Vec::with_capacity(handles.len());
        let mut agents = Vec::with_capacity(handles.len());
        for (_, handle) in handles {
            handle.agent.stop();
            tasks.push(handle.task);
            agents.push(handle.agent);
        }

        let all = futures::future::join_all(tasks.iter_mut());
        if tokio::time::timeout(self.settings.shutdown_deadline, all).await.is_err() {
            warn!("Shutdown deadline exceeded, force-terminating remaining agents");
            for task in &tasks {
                task.abort();
            }
            for agent in &agents {
                if !agent.state().await.is_terminal() {
                    agent.publish(AgentState::Stopped).await;
                }
            }
        }
    }

    /// Number of registered agents (any state).
    pub async fn agent_count(&self) -> usize {
        self.agents.lock().await.len()
    }
}
