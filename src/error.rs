//! Error types for the Arachne session bridge
//!
//! Structured error definitions with thiserror; anyhow is used for
//! propagation at the binary and server boundaries.
//!
//! Every variant that can surface to a client maps to a stable machine
//! readable code via [`ArachneError::reason_code`]. Stack detail and upstream
//! diagnostics are logged, never streamed.

use thiserror::Error;

/// Main error type for Arachne operations
#[derive(Error, Debug)]
pub enum ArachneError {
    /// Intent classification degraded (non-fatal, falls back to chat)
    #[error("Classification error: {0}")]
    Classification(String),

    /// Session already has an active request
    #[error("Session busy: {0}")]
    SessionBusy(String),

    /// A pipeline step (search, synthesis) failed; aborts the current run
    #[error("Pipeline step '{step}' failed: {message}")]
    PipelineStep { step: String, message: String },

    /// Client-side transport failure (disconnect); triggers cancellation
    #[error("Transport error: {0}")]
    Transport(String),

    /// Configuration error (missing API key etc.); fatal at startup only
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// LLM API request failed
    #[error("LLM API error: {0}")]
    LlmApi(String),

    /// Search provider request failed
    #[error("Search API error: {0}")]
    SearchApi(String),

    /// Event queue closed by a terminal event
    #[error("Event channel closed")]
    ChannelClosed,

    /// Crew definition (agents/tasks YAML) could not be parsed
    #[error("Crew definition error: {0}")]
    CrewDefinition(#[from] serde_yaml::Error),

    /// HTTP request error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl ArachneError {
    /// Stable machine-readable code carried by `error` protocol events.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Classification(_) => "classification_degraded",
            Self::SessionBusy(_) => "session_busy",
            Self::PipelineStep { .. } => "pipeline_step_failed",
            Self::Transport(_) => "transport_error",
            Self::Config(_) => "configuration_error",
            Self::LlmApi(_) => "llm_api_error",
            Self::SearchApi(_) => "search_api_error",
            Self::ChannelClosed => "channel_closed",
            Self::CrewDefinition(_) => "crew_definition_error",
            Self::Http(_) => "http_error",
            Self::Serialization(_) => "serialization_error",
            Self::Io(_) => "io_error",
            Self::Other(_) => "internal_error",
        }
    }
}

/// Result type alias for Arachne operations
pub type Result<T> = std::result::Result<T, ArachneError>;

/// Convert anyhow::Error to ArachneError
impl From<anyhow::Error> for ArachneError {
    fn from(err: anyhow::Error) -> Self {
        ArachneError::Other(err.to_string())
    }
}
