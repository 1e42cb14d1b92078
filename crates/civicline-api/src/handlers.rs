//! Route handler functions for all API endpoints.
//!
//! Each handler extracts path parameters and JSON bodies via axum
//! extractors, calls into the orchestrator, and returns JSON responses.

use std::sync::atomic::Ordering;

use axum::body::Bytes;
use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use civicline_core::{
    ChannelKind, Conversation, ConversationState, EndReason, IntentCategory, LanguageProfile,
    Message,
};
use civicline_engine::{TurnRequest, TurnResponse};

use crate::error::ApiError;
use crate::state::AppState;

// =============================================================================
// Request types
// =============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct EndConversationRequest {
    #[serde(default)]
    pub reason: Option<EndReason>,
}

// =============================================================================
// Response types
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct CacheStatsResponse {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub hit_rate: f64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub supported_languages: Vec<String>,
    pub translation_cache: CacheStatsResponse,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConversationResponse {
    pub id: Uuid,
    pub user_id: Uuid,
    pub channel: ChannelKind,
    pub state: ConversationState,
    pub language: LanguageProfile,
    pub turn_count: u64,
    pub last_intent: Option<IntentCategory>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<EndReason>,
    pub version: u64,
    pub messages: Vec<Message>,
}

impl From<Conversation> for ConversationResponse {
    fn from(conv: Conversation) -> Self {
        Self {
            id: conv.id,
            user_id: conv.user_id,
            channel: conv.channel,
            state: conv.state,
            language: conv.language,
            turn_count: conv.context.turn_count,
            last_intent: conv.context.last_intent,
            created_at: conv.created_at,
            last_activity_at: conv.last_activity_at,
            ended_at: conv.ended_at,
            end_reason: conv.end_reason,
            version: conv.version,
            messages: conv.messages,
        }
    }
}

// =============================================================================
// Handler functions
// =============================================================================

/// GET /health - liveness plus translation cache statistics.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let stats = state.orchestrator.translation_cache_stats();
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        supported_languages: state
            .orchestrator
            .languages()
            .codes()
            .map(|c| c.as_str().to_string())
            .collect(),
        translation_cache: CacheStatsResponse {
            hits: stats.hits.load(Ordering::Relaxed),
            misses: stats.misses.load(Ordering::Relaxed),
            evictions: stats.evictions.load(Ordering::Relaxed),
            hit_rate: stats.hit_rate(),
        },
    })
}

/// POST /turn - run one inbound turn.
pub async fn turn(
    State(state): State<AppState>,
    body: Result<Json<TurnRequest>, JsonRejection>,
) -> Result<Json<TurnResponse>, ApiError> {
    let Json(request) = body?;
    let response = state.orchestrator.process_turn(request).await?;
    Ok(Json(response))
}

/// POST /webhook/{channel} - gateway callback for an inbound message.
pub async fn webhook(
    State(state): State<AppState>,
    Path(channel): Path<String>,
    body: Result<Json<serde_json::Value>, JsonRejection>,
) -> Result<Json<TurnResponse>, ApiError> {
    let channel: ChannelKind = channel.parse().map_err(ApiError::BadRequest)?;
    let Json(payload) = body?;
    let response = state.orchestrator.handle_webhook(channel, &payload).await?;
    Ok(Json(response))
}

/// GET /conversations/{id} - conversation summary with ordered messages.
pub async fn get_conversation(
    State(state): State<AppState>,
    id: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<ConversationResponse>, ApiError> {
    let Path(id) = id?;
    let conversation = state.orchestrator.get_conversation(id)?;
    Ok(Json(conversation.into()))
}

/// POST /conversations/{id}/end - explicit close. Reason defaults to user_closed.
pub async fn end_conversation(
    State(state): State<AppState>,
    id: Result<Path<Uuid>, PathRejection>,
    body: Bytes,
) -> Result<Json<ConversationResponse>, ApiError> {
    let Path(id) = id?;
    let request = if body.is_empty() {
        EndConversationRequest::default()
    } else {
        serde_json::from_slice::<EndConversationRequest>(&body)
            .map_err(|e| ApiError::BadRequest(format!("invalid request body: {}", e)))?
    };
    let reason = request.reason.unwrap_or(EndReason::UserClosed);
    let conversation = state.orchestrator.end_conversation(id, reason).await?;
    info!(conversation_id = %id, reason = %reason, "Conversation closed via API");
    Ok(Json(conversation.into()))
}

/// DELETE /users/{id} - remove a user and their conversations.
pub async fn delete_user(
    State(state): State<AppState>,
    id: Result<Path<Uuid>, PathRejection>,
) -> Result<StatusCode, ApiError> {
    let Path(id) = id?;
    if state.orchestrator.delete_user(id)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("user {}", id)))
    }
}
