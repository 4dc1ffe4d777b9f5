//! Oriel API Library Crate
//!
//! This library contains the web-facing half of the voice gateway: the
//! application state, Postgres storage, prompt loading, the health endpoint,
//! WebSocket plumbing and routing. `bin/api.rs` is a thin wrapper around it.

pub mod config;
pub mod db;
pub mod handlers;
pub mod models;
pub mod prompts;
pub mod router;
pub mod state;
pub mod ws;
