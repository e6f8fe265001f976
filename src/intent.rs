//! Intent classification
//!
//! Maps free-text user input to one of three intents. The production
//! classifier short-circuits on unambiguous input (an explicit exit command,
//! a message carrying a URL) and otherwise asks the LLM for a single label.
//! Classification failure is non-fatal: the router falls back to [`Intent::Chat`].

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::error::{ArachneError, Result};
use crate::services::LlmService;

/// Classified intent of one user message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    /// Direct conversational reply
    Chat,
    /// Launch the research pipeline
    Search,
    /// Close the session
    Exit,
}

impl Intent {
    /// Parse a classifier label, tolerating case and surrounding noise.
    pub fn parse_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_uppercase().as_str() {
            "CHAT" => Some(Self::Chat),
            "SEARCH" => Some(Self::Search),
            "EXIT" => Some(Self::Exit),
            _ => None,
        }
    }
}

/// Classification seam, injectable so tests can supply fakes
#[async_trait]
pub trait IntentClassifier: Send + Sync {
    /// Classify one message. Errors are treated as degraded classification
    /// by the caller, never as session failures.
    async fn classify(&self, text: &str) -> Result<Intent>;
}

/// LLM-backed classifier with deterministic short-circuits
pub struct LlmIntentClassifier {
    llm: Arc<LlmService>,
}

impl LlmIntentClassifier {
    pub fn new(llm: Arc<LlmService>) -> Self {
        Self { llm }
    }

    /// Unambiguous inputs that never need a model call.
    fn shortcut(text: &str) -> Option<Intent> {
        let trimmed = text.trim();
        let lower = trimmed.to_ascii_lowercase();
        if matches!(lower.as_str(), "exit" | "quit" | "bye" | "goodbye") {
            return Some(Intent::Exit);
        }
        // A message carrying a URL is a research request.
        if lower.contains("http://") || lower.contains("https://") || lower.contains("www.") {
            return Some(Intent::Search);
        }
        None
    }
}

#[async_trait]
impl IntentClassifier for LlmIntentClassifier {
    async fn classify(&self, text: &str) -> Result<Intent> {
        if let Some(intent) = Self::shortcut(text) {
            debug!(?intent, "intent classified without model call");
            return Ok(intent);
        }

        let prompt = format!(
            "Classify the user message below into exactly one of these intents:\n\
             CHAT - a conversational question or statement to answer directly\n\
             SEARCH - a request to research, analyze or look something up on the web\n\
             EXIT - a request to end the conversation\n\n\
             Respond with only the label, nothing else.\n\n\
             Message: {}",
            text
        );

        let label = self.llm.complete_short(&prompt).await?;
        let intent = Intent::parse_label(&label).ok_or_else(|| {
            ArachneError::Classification(format!("unrecognized label '{}'", label.trim()))
        })?;

        debug!(?intent, "intent classified");
        Ok(intent)
    }
}
