//! Loads system prompts from a directory of Markdown files.

use anyhow::{Context, Result};
use oriel_core::prompt::PromptLibrary;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::warn;

/// Reads every `*.md` file in `prompts_path`, keyed by file stem.
///
/// A missing directory yields an empty library so the service can still run
/// without a system instruction.
pub fn load_prompts(prompts_path: &Path) -> Result<PromptLibrary> {
    if !prompts_path.is_dir() {
        warn!(path = %prompts_path.display(), "Prompts directory not found; continuing without prompts.");
        return Ok(PromptLibrary::default());
    }

    let mut prompts = HashMap::new();
    for entry in fs::read_dir(prompts_path)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_file() && path.extension().and_then(|s| s.to_str()) == Some("md") {
            let prompt_key = path
                .file_stem()
                .and_then(|s| s.to_str())
                .context("Could not get file stem")?
                .to_string();
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read prompt {}", path.display()))?;
            prompts.insert(prompt_key, content);
        }
    }
    Ok(PromptLibrary::new(prompts))
}
