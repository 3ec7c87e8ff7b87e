//! WebSocket gateway for collaborative editing.
//!
//! `GET /ws/{*document}` upgrades the connection, authenticates it, and
//! attaches it to the document's session. One actor runs per connection.

pub mod actor;
pub mod handler;

/// Token missing, expired or invalid.
pub const CLOSE_UNAUTHORIZED: u16 = 4401;

/// Caller is not a member of the document's community.
pub const CLOSE_FORBIDDEN: u16 = 4403;

/// Document name has no usable key.
pub const CLOSE_BAD_DOCUMENT: u16 = 4400;

/// Document does not exist, or was deleted while connected.
pub const CLOSE_NOT_FOUND: u16 = crate::collab::CLOSE_DOCUMENT_DELETED;

/// Store could not load the document.
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Connection fell too far behind the session and was dropped.
pub const CLOSE_LAGGING: u16 = 1013;

/// Server ended the connection, e.g. after a missed pong.
pub const CLOSE_GOING_AWAY: u16 = 1001;
