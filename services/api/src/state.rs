//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds all shared,
//! clonable resources like the chat store and the upstream provider.

use crate::config::Config;
use oriel_core::{
    BridgeDeps, ConnectionRegistry, live::LiveProvider, prompt::PromptProvider, store::ChatStore,
};
use std::sync::Arc;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ChatStore>,
    pub provider: Arc<dyn LiveProvider>,
    pub prompts: Arc<dyn PromptProvider>,
    pub registry: ConnectionRegistry,
    pub config: Arc<Config>,
}

impl AppState {
    /// Everything a new voice connection needs.
    pub fn bridge_deps(&self) -> BridgeDeps {
        BridgeDeps {
            provider: self.provider.clone(),
            store: self.store.clone(),
            prompts: self.prompts.clone(),
            registry: self.registry.clone(),
            settings: self.config.bridge_settings(),
        }
    }
}
