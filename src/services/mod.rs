//! External collaborator clients
//!
//! Process-wide clients shared by all sessions. They hold no per-session
//! state and are safe for concurrent use.

pub mod llm;
pub mod search;

pub use llm::{ChatResponder, LlmConfig, LlmService};
pub use search::{SearchHit, SearchProvider, SerperClient, SerperConfig};
