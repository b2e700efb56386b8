//! Runtime configuration
//!
//! Every tunable has a compiled-in default matching the service contract;
//! each can be overridden through an environment variable. Durations are
//! given in whole seconds.

use std::time::Duration;

/// Settings shared by the supervisor, agents, and the session hub.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Window for the initial backfill fetch (`BACKFILL_WINDOW`, seconds).
    pub backfill_window: Duration,
    /// Forced IDLE refresh interval (`IDLE_MAX`, seconds).
    pub idle_max: Duration,
    /// IMAP connect timeout (`CONNECT_TIMEOUT`, seconds).
    pub connect_timeout: Duration,
    /// Per-message FETCH / pipeline handoff timeout (`FETCH_TIMEOUT`, seconds).
    pub fetch_timeout: Duration,
    /// Base delay of the reconnect ladder (`RETRY_BASE`, seconds).
    pub retry_base: Duration,
    /// Cap of the reconnect ladder (`RETRY_CAP`, seconds).
    pub retry_cap: Duration,
    /// WebSocket heartbeat interval (`WS_HEARTBEAT`, seconds).
    pub ws_heartbeat: Duration,
    /// Per-frame WebSocket write timeout (`WS_WRITE_TIMEOUT`, seconds).
    pub ws_write_timeout: Duration,
    /// Outbound frame queue capacity per session (`SESSION_QUEUE`).
    pub session_queue: usize,
    /// Total deadline for supervisor shutdown (`SHUTDOWN_DEADLINE`, seconds).
    pub shutdown_deadline: Duration,
    /// Fixed IMAP host (`IMAP_HOST`); when unset, `imap.<domain>` is derived
    /// from each account's email address.
    pub imap_host: Option<String>,
    /// IMAP port (`IMAP_PORT`).
    pub imap_port: u16,
    /// WebSocket listen address (`BIND_ADDR`).
    pub bind_addr: String,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            backfill_window: Duration::from_secs(24 * 60 * 60),
            idle_max: Duration::from_secs(28 * 60),
            connect_timeout: Duration::from_secs(15),
            fetch_timeout: Duration::from_secs(30),
            retry_base: Duration::from_secs(5),
            retry_cap: Duration::from_secs(60),
            ws_heartbeat: Duration::from_secs(30),
            ws_write_timeout: Duration::from_secs(5),
            session_queue: 256,
            shutdown_deadline: Duration::from_secs(10),
            imap_host: None,
            imap_port: 993,
            bind_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

impl SyncSettings {
    /// Build settings from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            backfill_window: env_secs("BACKFILL_WINDOW", defaults.backfill_window),
            idle_max: env_secs("IDLE_MAX", defaults.idle_max),
            connect_timeout: env_secs("CONNECT_TIMEOUT", defaults.connect_timeout),
            fetch_timeout: env_secs("FETCH_TIMEOUT", defaults.fetch_timeout),
            retry_base: env_secs("RETRY_BASE", defaults.retry_base),
            retry_cap: env_secs("RETRY_CAP", defaults.retry_cap),
            ws_heartbeat: env_secs("WS_HEARTBEAT", defaults.ws_heartbeat),
            ws_write_timeout: env_secs("WS_WRITE_TIMEOUT", defaults.ws_write_timeout),
            session_queue: std::env::var("SESSION_QUEUE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.session_queue),
            shutdown_deadline: env_secs("SHUTDOWN_DEADLINE", defaults.shutdown_deadline),
            imap_host: std::env::var("IMAP_HOST").ok().filter(|h| !h.is_empty()),
            imap_port: std::env::var("IMAP_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.imap_port),
            bind_addr: std::env::var("BIND_ADDR").unwrap_or(defaults.bind_addr),
        }
    }
}

fn env_secs(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let s = SyncSettings::default();
        assert_eq!(s.backfill_window, Duration::from_secs(86_400));
        assert_eq!(s.idle_max, Duration::from_secs(1_680));
        assert_eq!(s.connect_timeout, Duration::from_secs(15));
        assert_eq!(s.fetch_timeout, Duration::from_secs(30));
        assert_eq!(s.retry_base, Duration::from_secs(5));
        assert_eq!(s.retry_cap, Duration::from_secs(60));
        assert_eq!(s.ws_heartbeat, Duration::from_secs(30));
        assert_eq!(s.ws_write_timeout, Duration::from_secs(5));
        assert_eq!(s.session_queue, 256);
        assert_eq!(s.shutdown_deadline, Duration::from_secs(10));
        assert_eq!(s.imap_port, 993);
    }
}
