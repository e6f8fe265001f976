//! Configuration for the Arachne session bridge
//!
//! Runtime settings come from the environment (API keys, bind address,
//! queue capacity); the research crew (agents and tasks) is declared in YAML
//! and read once at startup. Missing API keys are fatal when starting the
//! server, never per-request.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ArachneError, Result};

/// Crew definition shipped with the binary, used when no file is configured
const DEFAULT_CREW: &str = include_str!("../config/agents.yaml");

/// Process-wide runtime configuration
#[derive(Debug, Clone)]
pub struct ArachneConfig {
    /// Server bind address
    pub addr: SocketAddr,
    /// Per-request event queue capacity
    pub event_capacity: usize,
    /// Anthropic API key for classification, chat and synthesis
    pub anthropic_api_key: String,
    /// Serper API key for web search
    pub serper_api_key: String,
    /// Model used for all completions
    pub model: String,
    /// Optional path to a crew definition overriding the built-in one
    pub crew_path: Option<PathBuf>,
}

impl Default for ArachneConfig {
    fn default() -> Self {
        Self {
            addr: ([127, 0, 0, 1], 3000).into(),
            event_capacity: crate::bus::DEFAULT_CAPACITY,
            anthropic_api_key: String::new(),
            serper_api_key: String::new(),
            model: "claude-3-5-haiku-20241022".to_string(),
            crew_path: None,
        }
    }
}

impl ArachneConfig {
    /// Build configuration from the environment.
    ///
    /// `ANTHROPIC_API_KEY` and `SERPER_API_KEY` are required; everything else
    /// has a default. Optional overrides: `ARACHNE_ADDR`, `ARACHNE_MODEL`,
    /// `ARACHNE_EVENT_CAPACITY`, `ARACHNE_CREW_PATH`.
    pub fn from_env() -> Result<Self> {
        let anthropic_api_key = require_env("ANTHROPIC_API_KEY")?;
        let serper_api_key = require_env("SERPER_API_KEY")?;

        let mut config = Self {
            anthropic_api_key,
            serper_api_key,
            ..Self::default()
        };

        if let Ok(addr) = env::var("ARACHNE_ADDR") {
            config.addr = addr.parse().map_err(|_| {
                ArachneError::Config(config::ConfigError::Message(format!(
                    "Invalid ARACHNE_ADDR: {addr}"
                )))
            })?;
        }
        if let Ok(model) = env::var("ARACHNE_MODEL") {
            config.model = model;
        }
        if let Ok(capacity) = env::var("ARACHNE_EVENT_CAPACITY") {
            config.event_capacity = capacity.parse().map_err(|_| {
                ArachneError::Config(config::ConfigError::Message(format!(
                    "Invalid ARACHNE_EVENT_CAPACITY: {capacity}"
                )))
            })?;
        }
        if let Ok(path) = env::var("ARACHNE_CREW_PATH") {
            config.crew_path = Some(PathBuf::from(path));
        }

        debug!(addr = %config.addr, model = %config.model, "configuration loaded");
        Ok(config)
    }

    /// Load the crew definition, from `crew_path` when set, otherwise the
    /// built-in default.
    pub fn load_crew(&self) -> Result<CrewConfig> {
        let crew = match &self.crew_path {
            Some(path) => {
                debug!(path = %path.display(), "loading crew definition");
                CrewConfig::from_yaml(&std::fs::read_to_string(path)?)?
            }
            None => CrewConfig::from_yaml(DEFAULT_CREW)?,
        };
        Ok(crew)
    }
}

fn require_env(name: &str) -> Result<String> {
    match env::var(name) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(ArachneError::Config(config::ConfigError::Message(format!(
            "{name} environment variable is required"
        )))),
    }
}

/// One declared agent of the research crew
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    pub name: String,
    pub role: String,
    pub goal: String,
}

/// What a pipeline task actually does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Issue a web search and gather sources
    Search,
    /// Write the final report from gathered sources
    Synthesize,
}

/// One declared task of the research pipeline, bound to an agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    pub kind: TaskKind,
    pub agent: String,
    pub description: String,
    /// Message shown to the client while this task runs
    pub progress_message: String,
}

/// Declarative crew definition: agents plus the ordered task list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrewConfig {
    pub agents: Vec<AgentSpec>,
    pub tasks: Vec<TaskSpec>,
}

impl CrewConfig {
    /// Parse and validate a YAML crew definition.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let crew: Self = serde_yaml::from_str(yaml)?;
        crew.validate()?;
        Ok(crew)
    }

    /// The built-in crew definition.
    pub fn builtin() -> Result<Self> {
        Self::from_yaml(DEFAULT_CREW)
    }

    /// Find an agent by name.
    pub fn agent(&self, name: &str) -> Option<&AgentSpec> {
        self.agents.iter().find(|a| a.name == name)
    }

    fn validate(&self) -> Result<()> {
        if self.tasks.is_empty() {
            return Err(ArachneError::Config(config::ConfigError::Message(
                "crew definition declares no tasks".to_string(),
            )));
        }
        for task in &self.tasks {
            if self.agent(&task.agent).is_none() {
                return Err(ArachneError::Config(config::ConfigError::Message(format!(
                    "task '{}' references unknown agent '{}'",
                    task.name, task.agent
                ))));
            }
        }
        if !self.tasks.iter().any(|t| t.kind == TaskKind::Synthesize) {
            return Err(ArachneError::Config(config::ConfigError::Message(
                "crew definition declares no synthesize task".to_string(),
            )));
        }
        Ok(())
    }
}
