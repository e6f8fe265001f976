//! Research pipeline adapter
//!
//! Bridges the multi-step research execution (web search, then report
//! synthesis) to the ordered event model of [`crate::bus`]. The crew
//! definition drives step order, progress messages and the synthesis prompt;
//! the search and synthesis collaborators are injected so tests can fake
//! either side.
//!
//! Event discipline per run: `start`, then non-decreasing `progress`, one
//! `source` per newly discovered URL in discovery order, one or more `report`
//! chunks whose concatenation is the full report, then exactly one terminal
//! `complete` or `error`. A cancelled run stops emitting and never completes.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::EventSink;
use crate::config::{CrewConfig, TaskKind, TaskSpec};
use crate::error::{ArachneError, Result};
use crate::protocol::EventPayload;
use crate::services::{LlmService, SearchHit, SearchProvider};

/// Report text is streamed in chunks of at most this many bytes, split on
/// character boundaries.
const REPORT_CHUNK_BYTES: usize = 2048;

/// Report synthesis collaborator
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Produce the full report text for a query from gathered sources.
    async fn synthesize(&self, query: &str, sources: &[SearchHit]) -> Result<String>;
}

/// LLM-backed synthesizer, prompted from the crew's writer agent and task
pub struct LlmSynthesizer {
    llm: Arc<LlmService>,
    crew: CrewConfig,
}

impl LlmSynthesizer {
    pub fn new(llm: Arc<LlmService>, crew: CrewConfig) -> Self {
        Self { llm, crew }
    }

    fn build_prompt(&self, query: &str, sources: &[SearchHit]) -> String {
        let task = self
            .crew
            .tasks
            .iter()
            .find(|t| t.kind == TaskKind::Synthesize);
        let agent = task.and_then(|t| self.crew.agent(&t.agent));

        let mut prompt = String::new();
        if let Some(agent) = agent {
            prompt.push_str(&format!("You are a {}. {}\n\n", agent.role, agent.goal));
        }
        if let Some(task) = task {
            prompt.push_str(&format!("Task: {}\n\n", task.description));
        }
        prompt.push_str(&format!("Query: {}\n\nSources:\n", query));
        for (i, hit) in sources.iter().enumerate() {
            prompt.push_str(&format!(
                "{}. {} ({})\n   {}\n",
                i + 1,
                hit.title,
                hit.url,
                hit.snippet
            ));
        }
        if sources.is_empty() {
            prompt.push_str("(no sources found; say so and answer from general knowledge)\n");
        }
        prompt
    }
}

#[async_trait]
impl Synthesizer for LlmSynthesizer {
    async fn synthesize(&self, query: &str, sources: &[SearchHit]) -> Result<String> {
        let prompt = self.build_prompt(query, sources);
        self.llm.complete(&prompt).await
    }
}

/// Handle to one in-flight research run
pub struct PipelineHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl PipelineHandle {
    /// Stop the run: no further events are forwarded, no `complete` is
    /// emitted, underlying work is dropped at the next suspension point.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Wait for the run task to finish (used by the router's driver).
    pub async fn wait(self) {
        // Cancellation makes the task return promptly; a join error can only
        // be a panic inside the run, which the router reports as internal.
        if let Err(e) = self.join.await {
            warn!(error = %e, "pipeline task did not shut down cleanly");
        }
    }
}

/// The research pipeline adapter
pub struct ResearchPipeline {
    search: Arc<dyn SearchProvider>,
    synthesizer: Arc<dyn Synthesizer>,
    crew: CrewConfig,
}

impl ResearchPipeline {
    pub fn new(
        search: Arc<dyn SearchProvider>,
        synthesizer: Arc<dyn Synthesizer>,
        crew: CrewConfig,
    ) -> Self {
        Self {
            search,
            synthesizer,
            crew,
        }
    }

    /// Start a run for `query`, emitting into `sink`. The returned handle
    /// cancels through `token`; the router ties that token to the client
    /// stream's lifetime.
    pub fn start(&self, query: String, sink: EventSink, token: CancellationToken) -> PipelineHandle {
        let search = self.search.clone();
        let synthesizer = self.synthesizer.clone();
        let tasks = self.crew.tasks.clone();
        let run_token = token.clone();

        let join = tokio::spawn(async move {
            run(search, synthesizer, tasks, query, sink, run_token).await;
        });

        PipelineHandle { token, join }
    }
}

/// Monotone progress gate: percentages never regress within one run.
struct ProgressGate {
    last: f32,
}

impl ProgressGate {
    fn new() -> Self {
        Self { last: 0.0 }
    }

    fn advance(&mut self, pct: f32) -> f32 {
        self.last = self.last.max(pct.clamp(0.0, 100.0));
        self.last
    }
}

async fn run(
    search: Arc<dyn SearchProvider>,
    synthesizer: Arc<dyn Synthesizer>,
    tasks: Vec<TaskSpec>,
    query: String,
    sink: EventSink,
    token: CancellationToken,
) {
    if emit(&sink, &token, EventPayload::Start {}).await.is_err() {
        return;
    }

    let mut gate = ProgressGate::new();
    let mut seen_urls: HashSet<String> = HashSet::new();
    let mut sources: Vec<SearchHit> = Vec::new();
    let mut report: Option<String> = None;
    let total = tasks.len() as f32;

    for (i, task) in tasks.iter().enumerate() {
        let begin_pct = gate.advance(i as f32 / total * 100.0);
        if emit(
            &sink,
            &token,
            EventPayload::progress(task.progress_message.clone(), begin_pct),
        )
        .await
        .is_err()
        {
            return;
        }

        let outcome = match task.kind {
            TaskKind::Search => {
                run_search_task(&*search, &query, &sink, &token, &mut seen_urls, &mut sources).await
            }
            TaskKind::Synthesize => {
                run_synthesis_task(&*synthesizer, &query, &sources, &mut report).await
            }
        };

        if token.is_cancelled() {
            info!(task = %task.name, "research run cancelled");
            return;
        }

        if let Err(err) = outcome {
            warn!(task = %task.name, error = %err, "pipeline step failed, aborting run");
            let step_err = ArachneError::PipelineStep {
                step: task.name.clone(),
                message: err.to_string(),
            };
            let _ = sink.publish_error(&step_err).await;
            return;
        }

        let done_pct = gate.advance((i + 1) as f32 / total * 100.0);
        let done_msg = match task.kind {
            TaskKind::Search => format!("Found {} sources", sources.len()),
            TaskKind::Synthesize => "Report ready".to_string(),
        };
        if emit(&sink, &token, EventPayload::progress(done_msg, done_pct))
            .await
            .is_err()
        {
            return;
        }
    }

    if let Some(report) = report {
        for chunk in chunk_report(&report, REPORT_CHUNK_BYTES) {
            if emit(&sink, &token, EventPayload::report(chunk)).await.is_err() {
                return;
            }
        }
    }

    if token.is_cancelled() {
        return;
    }
    let target = extract_target(&query);
    let _ = sink.publish_complete(target).await;
    debug!("research run complete");
}

async fn run_search_task(
    search: &dyn SearchProvider,
    query: &str,
    sink: &EventSink,
    token: &CancellationToken,
    seen_urls: &mut HashSet<String>,
    sources: &mut Vec<SearchHit>,
) -> Result<()> {
    let hits = tokio::select! {
        _ = token.cancelled() => return Ok(()),
        hits = search.search(query) => hits?,
    };

    // Duplicates within a run are suppressed, first occurrence wins.
    for hit in hits {
        if !seen_urls.insert(hit.url.clone()) {
            continue;
        }
        emit(
            sink,
            token,
            EventPayload::source(hit.url.clone(), hit.title.clone(), hit.image.clone()),
        )
        .await?;
        sources.push(hit);
    }
    Ok(())
}

async fn run_synthesis_task(
    synthesizer: &dyn Synthesizer,
    query: &str,
    sources: &[SearchHit],
    report: &mut Option<String>,
) -> Result<()> {
    let text = synthesizer.synthesize(query, sources).await?;
    *report = Some(text);
    Ok(())
}

/// Publish one payload unless the run was cancelled; treat a closed channel
/// as an instruction to stop.
async fn emit(sink: &EventSink, token: &CancellationToken, payload: EventPayload) -> Result<()> {
    if token.is_cancelled() {
        return Err(ArachneError::ChannelClosed);
    }
    tokio::select! {
        _ = token.cancelled() => Err(ArachneError::ChannelClosed),
        res = sink.publish(payload) => res.map(|_| ()),
    }
}

/// Split report text into chunks on character boundaries. Concatenating the
/// chunks in order reproduces the input exactly.
fn chunk_report(text: &str, max_bytes: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        if current.len() + ch.len_utf8() > max_bytes && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }
        current.push(ch);
    }
    if !current.is_empty() || chunks.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Pull the research target out of the query, normalized to an https URL for
/// bare `www.` or domain-shaped tokens.
pub fn extract_target(query: &str) -> Option<String> {
    for word in query.split_whitespace() {
        let word = word.trim_matches(|c: char| matches!(c, ',' | ';' | ')' | '(' | '"' | '\''));
        let word = word.strip_suffix(['.', '?', '!']).unwrap_or(word);
        if word.starts_with("http://") || word.starts_with("https://") {
            return Some(word.to_string());
        }
        if word.starts_with("www.") || looks_like_domain(word) {
            return Some(format!("https://{}", word));
        }
    }
    None
}

fn looks_like_domain(word: &str) -> bool {
    if !word.contains('.') || word.contains('@') {
        return false;
    }
    let mut labels = word.split('.');
    let valid = |label: &str| {
        !label.is_empty()
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
    };
    let all_valid = labels.all(valid);
    // Last label has to look like a TLD, not a sentence-ending number.
    let tld_ok = word
        .rsplit('.')
        .next()
        .is_some_and(|tld| tld.len() >= 2 && tld.chars().all(|c| c.is_ascii_alphabetic()));
    all_valid && tld_ok
}
