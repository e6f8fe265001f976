//! Arachne - Streaming Research Assistant
//!
//! An AI assistant that either answers directly or launches a multi-step
//! research pipeline (web search, then synthesis into a cited report),
//! streaming typed progress events to one client per session.
//!
//! # Architecture
//!
//! - **Protocol**: typed, sequenced events (`start`, `progress`, `source`,
//!   `report`, `complete`, `error`) delivered over SSE
//! - **Bus**: bounded per-request queue decoupling pipeline execution from
//!   the outbound stream
//! - **Session**: per-conversation state machine admitting one active
//!   request at a time
//! - **Pipeline**: adapter translating research steps into ordered events
//! - **Services**: process-wide LLM and web-search clients, injected
//!   explicitly so tests can fake them
//!
//! # Example
//!
//! ```ignore
//! use arachne_core::{ArachneConfig, SessionRouter};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ArachneConfig::from_env()?;
//!     let (router, _pipeline) = arachne_core::assemble(&config)?;
//!
//!     let (session_id, mut events) = router.send_message("", "research rust async").await;
//!     while let Some(event) = events.next().await {
//!         println!("{session_id}: {event:?}");
//!     }
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod bus;
pub mod config;
pub mod error;
pub mod intent;
pub mod pipeline;
pub mod protocol;
pub mod services;
pub mod session;

use std::sync::Arc;

// Re-export commonly used types
pub use config::{ArachneConfig, CrewConfig};
pub use error::{ArachneError, Result};
pub use intent::{Intent, IntentClassifier, LlmIntentClassifier};
pub use pipeline::{LlmSynthesizer, ResearchPipeline};
pub use protocol::{EventPayload, ProtocolEvent};
pub use services::{LlmService, SerperClient};
pub use session::{SessionRouter, SessionState};

/// Wire the production collaborators into a ready session router.
///
/// Fails fast on configuration problems (missing API keys, bad crew
/// definition); nothing here is recoverable per-request.
pub fn assemble(config: &ArachneConfig) -> Result<(Arc<SessionRouter>, Arc<ResearchPipeline>)> {
    let crew = config.load_crew()?;

    let llm = Arc::new(LlmService::new(config.into())?);
    let search = Arc::new(SerperClient::new(config.into())?);

    let classifier = Arc::new(LlmIntentClassifier::new(llm.clone()));
    let synthesizer = Arc::new(LlmSynthesizer::new(llm.clone(), crew.clone()));
    let pipeline = Arc::new(ResearchPipeline::new(search, synthesizer, crew));

    let router = Arc::new(SessionRouter::new(
        classifier,
        llm,
        pipeline.clone(),
        config.event_capacity,
    ));
    Ok((router, pipeline))
}
