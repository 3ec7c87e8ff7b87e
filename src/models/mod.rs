//! Domain models for pathsync.
//!
//! # Core Concepts
//!
//! ## Durable Entities
//!
//! - [`Diagram`]: The graph of a learning path, an ordered list of [`Node`]s
//!   and the [`Edge`]s between them. Keyed by learning-path id and by name.
//! - [`LearningPath`]: Course metadata linked 1:1 to a diagram.
//! - [`Favorite`]: A user's bookmark on a learning path.
//!
//! ## Session Annotations
//!
//! [`Node::is_being_edited`] and [`Node::edited_by`] only exist while a
//! collaborative session is live. They are stripped before any write to the
//! store.
//!
//! Node payloads are typed per node kind ([`NodeBody`]), so a `topic` node
//! always carries a [`TopicData`] and so on.

mod diagram;
mod learning_path;
mod node;

pub use diagram::*;
pub use learning_path::*;
pub use node::*;
