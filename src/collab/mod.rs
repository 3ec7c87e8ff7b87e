//! Real-time collaboration: the shared replica, the socket protocol and the
//! session manager that keeps one replica per document in memory.

pub mod doc;
pub mod protocol;
mod session;

use std::time::Duration;

use thiserror::Error;

use crate::models::DiagramContent;

pub use doc::{Change, ChangeError, DiagramDoc, EditMark, LOCK_STALE_AFTER};
pub use protocol::{ClientFrame, FrameError, Participant, ServerFrame};
pub use session::{Outbound, OutboundSender, SessionHandle, SessionManager, SessionStats};

/// Socket close code sent to participants of a deleted document.
pub const CLOSE_DOCUMENT_DELETED: u16 = 4404;

/// Durable storage seen by the session manager.
///
/// Keys are learning-path ids. Implementations are synchronous; the manager
/// calls them on the blocking pool.
pub trait DocumentStore: Send + Sync + 'static {
    /// Stored graph for `key`, or `None` when no diagram exists yet.
    fn load_document(&self, key: &str) -> anyhow::Result<Option<DiagramContent>>;

    /// Writes the graph for `key`, creating the diagram if needed.
    fn save_document(&self, key: &str, content: &DiagramContent) -> anyhow::Result<()>;

    /// Whether a session may start an empty document for a `key` that has
    /// no stored diagram.
    fn can_create(&self, key: &str) -> anyhow::Result<bool>;
}

#[derive(Debug, Error)]
pub enum CollabError {
    #[error("document store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("update rejected: {0}")]
    Rejected(#[from] ChangeError),
    #[error("invalid document name: {0:?}")]
    InvalidDocument(String),
    #[error("no such document: {0}")]
    NotFound(String),
    #[error("session closed")]
    SessionClosed,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How often dirty replicas are written to the store.
    pub flush_interval: Duration,
    /// Attempts for a load or final write before giving up.
    pub retry_attempts: u32,
    /// First backoff delay; doubled after each failed attempt.
    pub retry_base_delay: Duration,
    /// Frames queued per participant before it is dropped as too slow.
    pub outbound_capacity: usize,
    /// Failed writes in a row after which an abandoned session is dropped.
    pub max_write_failures: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(2),
            retry_attempts: 3,
            retry_base_delay: Duration::from_millis(200),
            outbound_capacity: 256,
            max_write_failures: 5,
        }
    }
}

/// Store key of a document name: `<lpId>` or `<community>/<lpId>` both map
/// to `<lpId>`.
pub fn document_key(name: &str) -> Option<&str> {
    name.rsplit('/').next().map(str::trim).filter(|k| !k.is_empty())
}

/// Community prefix of a document name, if any.
pub fn document_community(name: &str) -> Option<&str> {
    let trimmed = name.trim_matches('/');
    trimmed
        .rsplit_once('/')
        .map(|(prefix, _)| prefix)
        .filter(|p| !p.is_empty())
}
