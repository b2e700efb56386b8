//! Onebox: sync core of a multi-tenant email aggregator
//!
//! For each (user, mailbox) pair a long-lived agent holds an IMAP IDLE
//! session, feeds new messages through an exactly-once ingestion pipeline
//! into the email index, and pushes live frames to connected WebSocket
//! clients.
//!
//! ## Module Organization
//!
//! - `types/`: core data types and wire shapes
//! - `credentials/`: credential store seam + in-memory token store
//! - `index/`: email index seam + in-memory reference index
//! - `classify/`: category classifier (keyword fallback + remote model)
//! - `pipeline/`: dedupe → classify → index → publish
//! - `agent/`: per-account IMAP worker (backfill, IDLE, recovery)
//! - `supervisor/`: agent registry and lifecycle
//! - `bus/`: typed in-process pub/sub
//! - `ws/`: WebSocket session hub
//! - `config`: runtime settings
//! - `error`: crate-wide error type

pub mod agent;
pub mod bus;
pub mod classify;
pub mod config;
pub mod credentials;
pub mod error;
pub mod index;
pub mod pipeline;
pub mod supervisor;
pub mod types;
pub mod ws;

pub use config::SyncSettings;
pub use error::OneboxError;
pub use types::{AccountKey, AgentState, Category, StoredMessage};
