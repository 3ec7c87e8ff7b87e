//! pathsync: collaborative editing server for learning-path diagrams.
//!
//! The REST layer ([`api`]) manages learning paths, favorites and diagrams in
//! the SQLite store ([`db`]). Live editing goes through the WebSocket gateway
//! ([`ws`]) into per-document sessions ([`collab`]), which merge concurrent
//! edits and write the result back to the store. [`client`] holds the
//! editor-side mirror of a session.

pub mod api;
pub mod auth;
pub mod client;
pub mod collab;
pub mod config;
pub mod db;
pub mod models;
pub mod ws;
