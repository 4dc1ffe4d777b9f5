//! Gemini Live upstream for the voice bridge.

mod client;
pub mod types;

pub use client::{AUDIO_MIME_TYPE, DEFAULT_ENDPOINT, GeminiLiveProvider, GeminiLiveSession};
