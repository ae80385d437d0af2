//! HTTP surface: the embedded chat page, session lifecycle endpoints,
//! and the SSE streaming endpoint the page reads replies from.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::Html;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use dashmap::DashMap;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::error::AppError;
use crate::llm::GeminiClient;
use crate::session::{ChatSession, Turn};

/// Shared state: the provider client and the table of live sessions.
///
/// Each session is an explicit object keyed by id, created when the page
/// loads and removed when it unloads. The per-session mutex serializes
/// exchanges so one submission runs to exhaustion before the next starts.
#[derive(Clone)]
pub struct AppState {
    pub client: Arc<GeminiClient>,
    pub sessions: Arc<DashMap<Uuid, Arc<Mutex<ChatSession>>>>,
}

impl AppState {
    pub fn new(client: GeminiClient) -> Self {
        Self {
            client: Arc::new(client),
            sessions: Arc::new(DashMap::new()),
        }
    }
}

/// Build the complete router with all routes and middleware
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(index))
        .route("/health", get(health_check))
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/{id}", delete(close_session))
        .route("/api/sessions/{id}/clear", post(clear_session))
        .route("/api/sessions/{id}/turns", get(list_turns))
        .route("/api/sessions/{id}/stream", post(stream_message))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET / - the embedded single-page chat UI
async fn index() -> Html<&'static str> {
    Html(include_str!("../assets/chat.html"))
}

/// GET /health - simple health check endpoint
async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// POST /api/sessions - create a freshly seeded session
async fn create_session(State(state): State<AppState>) -> Json<serde_json::Value> {
    let id = Uuid::new_v4();
    state
        .sessions
        .insert(id, Arc::new(Mutex::new(ChatSession::new())));
    tracing::info!(session_id = %id, "session created");

    Json(serde_json::json!({ "session_id": id }))
}

/// DELETE /api/sessions/{id} - tear a session down (page unload)
async fn close_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state
        .sessions
        .remove(&id)
        .ok_or(AppError::SessionNotFound)?;
    tracing::info!(session_id = %id, "session closed");

    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/sessions/{id}/clear - discard history back to the seed pair
async fn clear_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    let session = state
        .sessions
        .get(&id)
        .map(|entry| entry.value().clone())
        .ok_or(AppError::SessionNotFound)?;

    session.lock().await.reset();
    tracing::info!(session_id = %id, "session cleared");

    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/sessions/{id}/turns - the current transcript
async fn list_turns(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Turn>>, AppError> {
    let session = state
        .sessions
        .get(&id)
        .map(|entry| entry.value().clone())
        .ok_or(AppError::SessionNotFound)?;

    let turns = session.lock().await.turns().to_vec();
    Ok(Json(turns))
}

/// Request body for the streaming endpoint
#[derive(Debug, Deserialize)]
struct StreamMessageRequest {
    message: String,
}

/// POST /api/sessions/{id}/stream - submit a message, stream the reply.
///
/// SSE event types:
/// - `delta` — accumulated reply text so far: `{ "text": "..." }`
/// - `done` — exchange finished: `{}`
async fn stream_message(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<StreamMessageRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    if body.message.trim().is_empty() {
        return Err(AppError::Validation(
            "message must not be empty".to_string(),
        ));
    }

    let session = state
        .sessions
        .get(&id)
        .map(|entry| entry.value().clone())
        .ok_or(AppError::SessionNotFound)?;

    let client = state.client.clone();
    let message = body.message;

    let sse_stream = async_stream::stream! {
        // Hold the session lock for the whole exchange: exactly one
        // submission is in flight per session at a time.
        let mut session = session.lock().await;
        let updates = session.submit(client.as_ref(), message);
        let mut updates = std::pin::pin!(updates);

        while let Some(text) = updates.next().await {
            let data = serde_json::json!({ "text": text });
            yield Ok::<_, Infallible>(
                Event::default().event("delta").data(data.to_string()),
            );
        }

        yield Ok(Event::default().event("done").data("{}"));
    };

    Ok(Sse::new(sse_stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_state() -> AppState {
        AppState::new(GeminiClient::new(Config::default()).unwrap())
    }

    #[tokio::test]
    async fn session_lifecycle_create_list_close() {
        let state = test_state();

        let Json(created) = create_session(State(state.clone())).await;
        let id: Uuid = serde_json::from_value(created["session_id"].clone()).unwrap();

        let Json(turns) = list_turns(State(state.clone()), Path(id)).await.unwrap();
        assert_eq!(turns.len(), 2);

        let status = clear_session(State(state.clone()), Path(id)).await.unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);

        let status = close_session(State(state.clone()), Path(id)).await.unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);

        let err = list_turns(State(state), Path(id)).await;
        assert!(matches!(err, Err(AppError::SessionNotFound)));
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let state = test_state();
        let err = close_session(State(state), Path(Uuid::new_v4())).await;
        assert!(matches!(err, Err(AppError::SessionNotFound)));
    }

    #[tokio::test]
    async fn empty_message_is_rejected() {
        let state = test_state();
        let Json(created) = create_session(State(state.clone())).await;
        let id: Uuid = serde_json::from_value(created["session_id"].clone()).unwrap();

        let err = stream_message(
            State(state),
            Path(id),
            Json(StreamMessageRequest {
                message: "   ".to_string(),
            }),
        )
        .await;
        assert!(matches!(err, Err(AppError::Validation(_))));
    }
}
