//! HTTP API server with SSE support
//!
//! One frame per protocol event, delivered as Server-Sent Events so clients
//! read progress incrementally. Dropping the connection drops the event
//! stream, which cancels any research run bound to the request.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event as SseEvent, KeepAlive},
        IntoResponse, Response, Sse,
    },
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::StreamExt as _;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info};

use crate::bus;
use crate::pipeline::{extract_target, ResearchPipeline};
use crate::protocol::EventPayload;
use crate::session::SessionRouter;

/// API server configuration
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Server address
    pub addr: SocketAddr,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            addr: ([127, 0, 0, 1], 3000).into(),
        }
    }
}

/// API server state
#[derive(Clone)]
struct AppState {
    router: Arc<SessionRouter>,
    pipeline: Arc<ResearchPipeline>,
}

/// API server
pub struct ApiServer {
    config: ApiServerConfig,
    router: Arc<SessionRouter>,
    pipeline: Arc<ResearchPipeline>,
}

impl ApiServer {
    /// Create new API server
    pub fn new(
        config: ApiServerConfig,
        router: Arc<SessionRouter>,
        pipeline: Arc<ResearchPipeline>,
    ) -> Self {
        Self {
            config,
            router,
            pipeline,
        }
    }

    /// Build router
    fn build_router(state: AppState) -> Router {
        Router::new()
            .route("/chat", post(chat_handler))
            .route("/analyze", post(analyze_handler))
            .route("/health", get(health_handler))
            .route("/", get(root_handler))
            .with_state(state)
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
    }

    /// Start serving with dynamic port allocation
    ///
    /// Tries the configured address first, then attempts alternative ports
    /// if the primary port is unavailable.
    pub async fn serve(self) -> anyhow::Result<()> {
        let state = AppState {
            router: self.router,
            pipeline: self.pipeline,
        };
        let router = Self::build_router(state);

        match tokio::net::TcpListener::bind(self.config.addr).await {
            Ok(listener) => {
                info!("API server listening on http://{}", self.config.addr);
                axum::serve(listener, router).await?;
                return Ok(());
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                debug!(
                    "Port {} in use, trying alternative ports...",
                    self.config.addr.port()
                );
            }
            Err(e) => return Err(e.into()),
        }

        let base_port = self.config.addr.port();
        for offset in 1..=10 {
            // Fallback stops at the end of the port space.
            let Some(port) = base_port.checked_add(offset) else {
                break;
            };
            let alt_addr = SocketAddr::new(self.config.addr.ip(), port);
            match tokio::net::TcpListener::bind(alt_addr).await {
                Ok(listener) => {
                    info!("API server listening on http://{}", alt_addr);
                    axum::serve(listener, router).await?;
                    return Ok(());
                }
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(anyhow::anyhow!(
            "All ports ({}-{}) are in use. API server unavailable.",
            base_port,
            base_port.saturating_add(10)
        ))
    }
}

/// Chat request body
#[derive(Debug, Deserialize)]
struct ChatRequest {
    message: String,
    #[serde(default)]
    session_id: String,
}

/// Streaming chat handler: one SSE frame per protocol event.
///
/// The effective session id (generated when the request carried none) is
/// returned in the `x-session-id` header so the client can address the
/// session in follow-up messages.
async fn chat_handler(State(state): State<AppState>, Json(req): Json<ChatRequest>) -> Response {
    let (session_id, events) = state.router.send_message(&req.session_id, &req.message).await;
    debug!(session = %session_id, "chat stream opened");

    let frames = events.map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
        Ok::<_, Infallible>(SseEvent::default().id(event.sequence.to_string()).data(data))
    });

    (
        [("x-session-id", session_id)],
        Sse::new(frames).keep_alive(KeepAlive::default()),
    )
        .into_response()
}

/// Direct analysis request body
#[derive(Debug, Deserialize)]
struct AnalyzeRequest {
    url: String,
}

/// Direct analysis response (buffered convenience endpoint)
#[derive(Debug, Serialize)]
struct AnalyzeResponse {
    status: String,
    url: String,
    timestamp: chrono::DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    report: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Run the research pipeline to completion and return the report in one shot
async fn analyze_handler(
    State(state): State<AppState>,
    Json(req): Json<AnalyzeRequest>,
) -> (StatusCode, Json<AnalyzeResponse>) {
    let url = extract_target(&req.url).unwrap_or_else(|| req.url.clone());
    info!(url = %url, "direct analysis requested");

    let (sink, stream) = bus::channel(bus::DEFAULT_CAPACITY);
    let handle = state
        .pipeline
        .start(url.clone(), sink, CancellationToken::new());
    let collector = tokio::spawn(stream.collect());
    handle.wait().await;

    let events = collector.await.unwrap_or_default();
    let mut report = String::new();
    let mut error = None;
    for event in &events {
        match &event.payload {
            EventPayload::Report { content } => report.push_str(content),
            EventPayload::Error { message, .. } => error = Some(message.clone()),
            _ => {}
        }
    }

    match error {
        None => (
            StatusCode::OK,
            Json(AnalyzeResponse {
                status: "success".to_string(),
                url,
                timestamp: Utc::now(),
                report: Some(report),
                error: None,
            }),
        ),
        Some(message) => (
            StatusCode::BAD_GATEWAY,
            Json(AnalyzeResponse {
                status: "error".to_string(),
                url,
                timestamp: Utc::now(),
                report: None,
                error: Some(message),
            }),
        ),
    }
}

/// Health check handler
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    timestamp: chrono::DateTime<Utc>,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now(),
    })
}

/// Root endpoint with API information
async fn root_handler() -> impl IntoResponse {
    Json(json!({
        "name": "arachne",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Streaming research assistant",
        "endpoints": {
            "/health": "Health check",
            "/chat": "Streaming chat (SSE)",
            "/analyze": "Direct research analysis",
        }
    }))
}
