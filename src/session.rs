//! Session lifecycle and request routing
//!
//! One [`Session`] per conversation, owned by the [`SessionRouter`]. The
//! session is a state machine:
//!
//! ```text
//! Idle -> Classifying -> {Chatting | Researching -> Streaming} -> Idle
//!                     -> Closed (on EXIT)
//! Error reachable from any state, returning to Idle
//! ```
//!
//! A session admits one active request at a time, gated by state rather than
//! by a lock held across awaits: a message arriving while a request is in
//! flight gets a one-event `session_busy` stream and changes nothing.
//! Sessions created for messages without a client-supplied id are anonymous
//! and are released from the registry as soon as their request stream ends;
//! named sessions live until an exit intent closes them.
//! Sessions are independent; the only shared resources are the process-wide
//! collaborator clients, which hold no per-session state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{self, EventStream};
use crate::error::ArachneError;
use crate::intent::{Intent, IntentClassifier};
use crate::pipeline::ResearchPipeline;
use crate::protocol::EventPayload;
use crate::services::ChatResponder;

/// Lifecycle state of one session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No active request
    Idle,
    /// Intent classification in flight
    Classifying,
    /// Producing a direct chat reply
    Chatting,
    /// Research pipeline starting
    Researching,
    /// Relaying pipeline events to the client
    Streaming,
    /// Session ended by an exit intent
    Closed,
    /// A request failed; the next message finds the session Idle again
    Error,
}

/// One logical conversation, identified by an opaque id
pub struct Session {
    id: String,
    /// Created for a message without a client-supplied id. The generated id
    /// travels back with the response; if the client never reuses it, the
    /// session is unaddressable once its stream ends and must be released.
    anonymous: bool,
    state: Mutex<SessionState>,
}

impl Session {
    fn new(id: String, anonymous: bool) -> Self {
        Self {
            id,
            anonymous,
            state: Mutex::new(SessionState::Idle),
        }
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
        debug!(session = %self.id, ?state, "session state changed");
    }

    /// Atomically admit a request: Idle -> Classifying, or refuse.
    fn try_begin(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state == SessionState::Idle {
            *state = SessionState::Classifying;
            true
        } else {
            false
        }
    }
}

type SessionMap = Arc<RwLock<HashMap<String, Arc<Session>>>>;

/// Routes messages to the right pipeline and owns all sessions
pub struct SessionRouter {
    sessions: SessionMap,
    classifier: Arc<dyn IntentClassifier>,
    chat: Arc<dyn ChatResponder>,
    pipeline: Arc<ResearchPipeline>,
    event_capacity: usize,
}

impl SessionRouter {
    pub fn new(
        classifier: Arc<dyn IntentClassifier>,
        chat: Arc<dyn ChatResponder>,
        pipeline: Arc<ResearchPipeline>,
        event_capacity: usize,
    ) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            classifier,
            chat,
            pipeline,
            event_capacity,
        }
    }

    /// Handle one inbound message, returning the session id and the event
    /// stream for this request.
    ///
    /// Never fails: refusals and execution failures arrive as `error` events
    /// on the returned stream. Dropping the stream cancels any research run
    /// bound to the request.
    pub async fn send_message(&self, session_id: &str, text: &str) -> (String, EventStream) {
        let (id, anonymous) = if session_id.trim().is_empty() {
            (uuid::Uuid::new_v4().to_string(), true)
        } else {
            (session_id.trim().to_string(), false)
        };

        let session = {
            let mut sessions = self.sessions.write().await;
            sessions
                .entry(id.clone())
                .or_insert_with(|| {
                    debug!(session = %id, anonymous, "session created");
                    Arc::new(Session::new(id.clone(), anonymous))
                })
                .clone()
        };

        if !session.try_begin() {
            info!(session = %id, state = ?session.state(), "rejecting message, session busy");
            let (sink, stream) = bus::channel(1);
            let _ = sink
                .publish_error(&ArachneError::SessionBusy(id.clone()))
                .await;
            return (id, stream);
        }

        let (sink, stream) = bus::channel(self.event_capacity);
        let token = CancellationToken::new();
        let stream = stream.with_cancel_guard(token.clone().drop_guard());

        let driver = RequestDriver {
            session,
            sessions: self.sessions.clone(),
            classifier: self.classifier.clone(),
            chat: self.chat.clone(),
            pipeline: self.pipeline.clone(),
            text: text.to_string(),
            sink,
            token,
        };
        tokio::spawn(driver.run());

        (id, stream)
    }

    /// State of a session, if it exists.
    pub async fn session_state(&self, session_id: &str) -> Option<SessionState> {
        let sessions = self.sessions.read().await;
        sessions.get(session_id).map(|s| s.state())
    }

    /// Number of live sessions.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

/// Drives one admitted request to a terminal event
struct RequestDriver {
    session: Arc<Session>,
    sessions: SessionMap,
    classifier: Arc<dyn IntentClassifier>,
    chat: Arc<dyn ChatResponder>,
    pipeline: Arc<ResearchPipeline>,
    text: String,
    sink: bus::EventSink,
    token: CancellationToken,
}

impl RequestDriver {
    async fn run(self) {
        let intent = match self.classifier.classify(&self.text).await {
            Ok(intent) => intent,
            Err(err) => {
                // Fail open: classification trouble degrades to chat, it
                // never kills the request.
                warn!(session = %self.session.id, error = %err, "classification degraded");
                let _ = self
                    .sink
                    .publish(EventPayload::progress(
                        "Intent classification degraded; treating message as chat",
                        0.0,
                    ))
                    .await;
                Intent::Chat
            }
        };

        match intent {
            Intent::Exit => {
                self.handle_exit().await;
                return;
            }
            Intent::Chat => self.handle_chat().await,
            Intent::Search => self.handle_search().await,
        }

        // An anonymous session cannot receive a second message once its
        // stream ends, so keeping the map entry would leak it.
        if self.session.anonymous {
            debug!(session = %self.session.id, "anonymous session released");
            self.sessions.write().await.remove(&self.session.id);
        }
    }

    async fn handle_exit(&self) {
        info!(session = %self.session.id, "exit intent, closing session");
        let _ = self.sink.publish_complete(None).await;
        self.session.set_state(SessionState::Closed);
        self.sessions.write().await.remove(&self.session.id);
    }

    async fn handle_chat(&self) {
        self.session.set_state(SessionState::Chatting);

        let reply = tokio::select! {
            _ = self.token.cancelled() => {
                debug!(session = %self.session.id, "chat request cancelled");
                self.session.set_state(SessionState::Idle);
                return;
            }
            reply = self.chat.reply(&self.text) => reply,
        };

        match reply {
            Ok(reply) => {
                let _ = self.sink.publish(EventPayload::report(reply)).await;
                let _ = self.sink.publish_complete(None).await;
                self.session.set_state(SessionState::Idle);
            }
            Err(err) => self.fail(err).await,
        }
    }

    async fn handle_search(&self) {
        self.session.set_state(SessionState::Researching);
        let handle =
            self.pipeline
                .start(self.text.clone(), self.sink.clone(), self.token.clone());
        self.session.set_state(SessionState::Streaming);

        handle.wait().await;

        // The adapter owns the terminal event on success, failure and
        // cancellation. A run that ended without one (task panic) still must
        // terminate the stream.
        if !self.sink.is_closed() && !self.token.is_cancelled() {
            let err = ArachneError::Other("research run ended unexpectedly".to_string());
            self.fail(err).await;
            return;
        }
        self.session.set_state(SessionState::Idle);
    }

    /// Unhandled failure: Error state, one terminal `error` event, back to
    /// Idle so the client may retry.
    async fn fail(&self, err: ArachneError) {
        warn!(session = %self.session.id, error = %err, code = err.reason_code(), "request failed");
        self.session.set_state(SessionState::Error);
        let _ = self.sink.publish_error(&err).await;
        self.session.set_state(SessionState::Idle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CrewConfig;
    use crate::error::Result;
    use crate::pipeline::Synthesizer;
    use crate::protocol::ProtocolEvent;
    use crate::services::{SearchHit, SearchProvider};
    use async_trait::async_trait;

    struct StaticClassifier(Intent);

    #[async_trait]
    impl IntentClassifier for StaticClassifier {
        async fn classify(&self, _text: &str) -> Result<Intent> {
            Ok(self.0)
        }
    }

    struct BrokenClassifier;

    #[async_trait]
    impl IntentClassifier for BrokenClassifier {
        async fn classify(&self, _text: &str) -> Result<Intent> {
            Err(ArachneError::Classification("model unavailable".to_string()))
        }
    }

    struct StaticChat(&'static str);

    #[async_trait]
    impl ChatResponder for StaticChat {
        async fn reply(&self, _message: &str) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    struct EmptySearch;

    #[async_trait]
    impl SearchProvider for EmptySearch {
        async fn search(&self, _query: &str) -> Result<Vec<SearchHit>> {
            Ok(vec![])
        }
    }

    struct StaticSynth;

    #[async_trait]
    impl Synthesizer for StaticSynth {
        async fn synthesize(&self, _query: &str, _sources: &[SearchHit]) -> Result<String> {
            Ok("report".to_string())
        }
    }

    fn router(classifier: Arc<dyn IntentClassifier>) -> SessionRouter {
        let pipeline = ResearchPipeline::new(
            Arc::new(EmptySearch),
            Arc::new(StaticSynth),
            CrewConfig::builtin().unwrap(),
        );
        SessionRouter::new(classifier, Arc::new(StaticChat("hello")), Arc::new(pipeline), 16)
    }

    fn payloads(events: &[ProtocolEvent]) -> Vec<&EventPayload> {
        events.iter().map(|e| &e.payload).collect()
    }

    #[tokio::test]
    async fn test_chat_intent_single_report_then_complete() {
        let router = router(Arc::new(StaticClassifier(Intent::Chat)));
        let (id, stream) = router.send_message("s1", "hi").await;
        assert_eq!(id, "s1");

        let events = stream.collect().await;
        let payloads = payloads(&events);
        assert_eq!(payloads.len(), 2);
        assert!(matches!(payloads[0], EventPayload::Report { content } if content == "hello"));
        assert!(matches!(payloads[1], EventPayload::Complete { .. }));

        assert_eq!(router.session_state("s1").await, Some(SessionState::Idle));
    }

    #[tokio::test]
    async fn test_exit_closes_and_forgets_session() {
        let router = router(Arc::new(StaticClassifier(Intent::Exit)));

        let (_, stream) = router.send_message("s1", "bye").await;
        let events = stream.collect().await;
        assert!(matches!(events[0].payload, EventPayload::Complete { .. }));

        // Session is gone; the same id starts fresh.
        assert_eq!(router.session_state("s1").await, None);
        let (_, stream) = router.send_message("s1", "bye").await;
        assert!(matches!(
            stream.collect().await[0].payload,
            EventPayload::Complete { .. }
        ));
    }

    #[tokio::test]
    async fn test_empty_session_id_gets_fresh_id() {
        let router = router(Arc::new(StaticClassifier(Intent::Chat)));
        let (id, stream) = router.send_message("", "hi").await;
        assert!(!id.is_empty());
        stream.collect().await;
        // Anonymous sessions are unaddressable after their stream ends.
        assert_eq!(router.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_anonymous_sessions_do_not_accumulate() {
        let router = router(Arc::new(StaticClassifier(Intent::Chat)));
        for _ in 0..100 {
            let (_, stream) = router.send_message("", "hi").await;
            let events = stream.collect().await;
            assert!(matches!(
                events.last().unwrap().payload,
                EventPayload::Complete { .. }
            ));
        }
        assert_eq!(router.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_named_session_survives_its_request() {
        let router = router(Arc::new(StaticClassifier(Intent::Chat)));
        let (_, stream) = router.send_message("kept", "hi").await;
        stream.collect().await;
        assert_eq!(router.session_count().await, 1);
        assert_eq!(router.session_state("kept").await, Some(SessionState::Idle));
    }

    #[tokio::test]
    async fn test_degraded_classification_falls_back_to_chat() {
        let router = router(Arc::new(BrokenClassifier));
        let (_, stream) = router.send_message("s1", "hi").await;

        let events = stream.collect().await;
        let payloads = payloads(&events);
        assert!(
            matches!(payloads[0], EventPayload::Progress { message, .. } if message.contains("degraded"))
        );
        assert!(matches!(payloads[1], EventPayload::Report { .. }));
        assert!(matches!(payloads[2], EventPayload::Complete { .. }));
    }

    #[tokio::test]
    async fn test_search_intent_runs_pipeline() {
        let router = router(Arc::new(StaticClassifier(Intent::Search)));
        let (_, stream) = router.send_message("s1", "research rust").await;

        let events = stream.collect().await;
        assert!(matches!(events[0].payload, EventPayload::Start {}));
        assert!(events.last().unwrap().is_terminal());
        assert_eq!(router.session_state("s1").await, Some(SessionState::Idle));
    }

    #[tokio::test]
    async fn test_busy_session_rejects_second_message() {
        struct SlowChat;

        #[async_trait]
        impl ChatResponder for SlowChat {
            async fn reply(&self, _message: &str) -> Result<String> {
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                Ok("slow".to_string())
            }
        }

        let pipeline = ResearchPipeline::new(
            Arc::new(EmptySearch),
            Arc::new(StaticSynth),
            CrewConfig::builtin().unwrap(),
        );
        let router = SessionRouter::new(
            Arc::new(StaticClassifier(Intent::Chat)),
            Arc::new(SlowChat),
            Arc::new(pipeline),
            16,
        );

        let (_, first) = router.send_message("s1", "hi").await;
        // Give the driver time to reach the Chatting state.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let (_, second) = router.send_message("s1", "again").await;
        let rejection = second.collect().await;
        assert_eq!(rejection.len(), 1);
        match &rejection[0].payload {
            EventPayload::Error { code, .. } => assert_eq!(code, "session_busy"),
            other => panic!("expected busy error, got {other:?}"),
        }

        // The first request is undisturbed and finishes normally.
        let events = first.collect().await;
        assert!(matches!(events.last().unwrap().payload, EventPayload::Complete { .. }));
        assert_eq!(router.session_state("s1").await, Some(SessionState::Idle));
    }

    #[tokio::test]
    async fn test_chat_failure_emits_error_and_recovers() {
        struct FailingChat;

        #[async_trait]
        impl ChatResponder for FailingChat {
            async fn reply(&self, _message: &str) -> Result<String> {
                Err(ArachneError::LlmApi("overloaded".to_string()))
            }
        }

        let pipeline = ResearchPipeline::new(
            Arc::new(EmptySearch),
            Arc::new(StaticSynth),
            CrewConfig::builtin().unwrap(),
        );
        let router = SessionRouter::new(
            Arc::new(StaticClassifier(Intent::Chat)),
            Arc::new(FailingChat),
            Arc::new(pipeline),
            16,
        );

        let (_, stream) = router.send_message("s1", "hi").await;
        let events = stream.collect().await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0].payload, EventPayload::Error { .. }));

        // Session survives the failure.
        assert_eq!(router.session_state("s1").await, Some(SessionState::Idle));
        let (_, retry) = router.send_message("s1", "hi").await;
        retry.collect().await;
    }
}
