//! Client-side diagram state.
//!
//! A [`DiagramStore`] is what an editor holds for one open document: a local
//! replica that mutations apply to immediately, plus an outbox of changes
//! waiting to go over the socket. It never does I/O itself.

pub mod placement;
mod store;

pub use crate::collab::LOCK_STALE_AFTER;
pub use store::{ClientError, DiagramStore, EditingIndicator, StoreContext};
