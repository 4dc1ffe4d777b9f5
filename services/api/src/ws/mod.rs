//! WebSocket Voice Sessions
//!
//! The socket plumbing lives here; everything a voice session actually does
//! is in `oriel_core::bridge`.

pub mod session;

pub use session::ws_handler;
