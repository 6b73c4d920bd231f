//! Prompt text sent along with requests

use std::path::PathBuf;

/// System prompt used when no `system_prompt_file` is configured
pub const DEFAULT_SYSTEM_PROMPT: &str = "\
You are Stitch, an expert AI assistant and exceptional senior software developer \
with vast knowledge across multiple programming languages, frameworks, and best practices.

Answers may be longer than a single reply allows. When you are asked to continue, \
resume exactly where the previous reply stopped, mid-sentence or mid-code-block if \
necessary, and never repeat text that was already sent.

Use valid markdown for all responses. Be concise unless the user asks for detail.";

/// Remove per-line indentation and surrounding blank space.
///
/// Each line is trimmed, leading whitespace of the whole text is dropped
/// and at most one trailing line break is removed.
pub fn strip_indents(text: &str) -> String {
    let joined = text.lines().map(str::trim).collect::<Vec<_>>().join("\n");
    let trimmed = joined.trim_start();
    trimmed
        .strip_suffix('\n')
        .unwrap_or(trimmed)
        .to_string()
}

/// Wrap a user prompt in the instruction asking the model to improve it
pub fn enhancer_prompt(message: &str) -> String {
    strip_indents(&format!(
        "
        I want you to improve the user prompt that is wrapped in `<original_prompt>` tags.

        IMPORTANT: Only respond with the improved prompt and nothing else!

        <original_prompt>
          {message}
        </original_prompt>
        "
    ))
}

/// Read the system prompt from `path`, falling back to the built-in one.
///
/// A leading `~/` is expanded to the home directory.
pub fn load_system_prompt(path: Option<&str>) -> String {
    let Some(path) = path.map(str::trim).filter(|p| !p.is_empty()) else {
        return DEFAULT_SYSTEM_PROMPT.to_string();
    };

    let resolved = match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path)),
        None => PathBuf::from(path),
    };

    match std::fs::read_to_string(&resolved) {
        Ok(prompt) if !prompt.trim().is_empty() => {
            tracing::debug!("Loaded system prompt from {}", resolved.display());
            prompt
        }
        Ok(_) => {
            tracing::warn!("System prompt file {} is empty, using default", resolved.display());
            DEFAULT_SYSTEM_PROMPT.to_string()
        }
        Err(e) => {
            tracing::warn!(
                "Failed to read system prompt file {}: {}, using default",
                resolved.display(),
                e
            );
            DEFAULT_SYSTEM_PROMPT.to_string()
        }
    }
}
