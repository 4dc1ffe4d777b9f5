use async_trait::async_trait;
use std::collections::HashMap;

/// Supplies system-instruction text. The bridge never interprets it.
#[async_trait]
pub trait PromptProvider: Send + Sync {
    async fn prompt_by_title(&self, title: &str) -> Option<String>;
}

/// Prompts held in memory, keyed by title.
#[derive(Debug, Clone, Default)]
pub struct PromptLibrary {
    prompts: HashMap<String, String>,
}

impl PromptLibrary {
    pub fn new(prompts: HashMap<String, String>) -> Self {
        Self { prompts }
    }

    pub fn len(&self) -> usize {
        self.prompts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }
}

#[async_trait]
impl PromptProvider for PromptLibrary {
    async fn prompt_by_title(&self, title: &str) -> Option<String> {
        self.prompts.get(title).cloned()
    }
}
