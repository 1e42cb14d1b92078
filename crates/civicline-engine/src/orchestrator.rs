//! Inbound turn API.
//!
//! The single entry point the CLI, HTTP and gateway layers call into. Wires
//! every engine component from [`CivicConfig`] and a set of providers, maps
//! a request to a user and conversation, runs the turn, and converts
//! non-validation failures into the fixed apology response.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use civicline_core::{
    CatalogProvider, ChannelKind, CivicConfig, CivicError, Conversation, ConversationStore, DeliveryStatus,
    EndReason, IntentClassifier, LanguageCode, LanguageRegistry, MediaKind, MessagingGateway,
    RawInbound, SpeechProvider, SuggestedAction, TranslationProvider, User,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::channel::{ChannelRegistry, InboundMessage};
use crate::composer::{apology, ResponseComposer};
use crate::error::{ChannelError, SessionError};
use crate::fallback::FallbackCoordinator;
use crate::intent::IntentDispatcher;
use crate::language::LanguageStateTracker;
use crate::matcher::{ResourceMatcher, ScoredResource};
use crate::session::{SessionManager, SessionParts, TurnOutcome};
use crate::translation::{CacheStats, TranslationCache};

/// External collaborators the engine talks to.
#[derive(Clone)]
pub struct Providers {
    pub translation: Arc<dyn TranslationProvider>,
    pub primary_nlu: Arc<dyn IntentClassifier>,
    pub secondary_nlu: Arc<dyn IntentClassifier>,
    pub speech: Arc<dyn SpeechProvider>,
    pub catalog: Arc<dyn CatalogProvider>,
    pub gateway: Arc<dyn MessagingGateway>,
}

/// One inbound turn as submitted by a caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRequest {
    pub user_id: Uuid,
    #[serde(default)]
    pub message: String,
    /// Language the user selected, if any.
    #[serde(default)]
    pub language: Option<String>,
    pub channel: ChannelKind,
    #[serde(default)]
    pub voice_data_ref: Option<String>,
}

/// A matched resource as reported to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSummary {
    pub id: String,
    pub title: String,
    pub category: String,
    pub superseded: bool,
    /// Profile attributes that would confirm eligibility.
    pub missing_eligibility: Vec<String>,
}

impl From<&ScoredResource> for ResourceSummary {
    fn from(scored: &ScoredResource) -> Self {
        Self {
            id: scored.resource.id.clone(),
            title: scored.resource.title.clone(),
            category: scored.resource.category.clone(),
            superseded: scored.superseded,
            missing_eligibility: scored.missing.iter().map(|a| a.as_str().to_string()).collect(),
        }
    }
}

/// Result of one turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnResponse {
    pub response_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_audio_ref: Option<String>,
    pub suggested_actions: Vec<SuggestedAction>,
    pub resources: Vec<ResourceSummary>,
    /// Absent only when the turn failed before a conversation existed.
    pub conversation_id: Option<Uuid>,
    pub language: LanguageCode,
    pub degraded: bool,
    pub delivery_status: Option<DeliveryStatus>,
    pub conversation_ended: bool,
}

impl TurnResponse {
    fn from_outcome(outcome: TurnOutcome) -> Self {
        Self {
            response_text: outcome.response.text,
            response_audio_ref: outcome.response.audio_ref,
            suggested_actions: outcome.response.actions,
            resources: outcome.resources.iter().map(ResourceSummary::from).collect(),
            conversation_id: Some(outcome.conversation_id),
            language: outcome.response.language,
            degraded: outcome.degraded,
            delivery_status: Some(outcome.delivery),
            conversation_ended: outcome.ended,
        }
    }

    /// Whether no channel accepted the response.
    pub fn delivery_failed(&self) -> bool {
        self.delivery_status
            .as_ref()
            .is_some_and(DeliveryStatus::is_failed)
    }
}

/// Central coordinator over the session manager.
pub struct Orchestrator {
    sessions: SessionManager,
    registry: Arc<LanguageRegistry>,
    cache: Arc<TranslationCache>,
    gateway: Arc<dyn MessagingGateway>,
}

impl Orchestrator {
    /// Build every component from configuration. The config is expected to
    /// have passed [`CivicConfig::validate`].
    pub fn new(config: &CivicConfig, store: Arc<dyn ConversationStore>, providers: Providers) -> Self {
        let timeout = config.providers.timeout();
        let registry = Arc::new(LanguageRegistry::from_config(&config.language));
        let cache = Arc::new(TranslationCache::new(
            Duration::from_secs(config.language.cache_ttl_secs),
            config.language.cache_capacity,
        ));
        let tracker = Arc::new(LanguageStateTracker::new(
            Arc::clone(&registry),
            Arc::clone(&cache),
            providers.translation,
            config.language.translation_confidence_threshold,
            timeout,
        ));
        let intents = IntentDispatcher::new(
            providers.primary_nlu,
            providers.secondary_nlu,
            Arc::clone(&tracker),
            config.intent.primary_threshold,
            config.intent.secondary_threshold,
            timeout,
        );
        let composer = ResponseComposer::new(
            Arc::clone(&tracker),
            Arc::clone(&providers.speech),
            config.composer.clone(),
            timeout,
        );
        let channels = ChannelRegistry::standard(
            &config.channels,
            Arc::clone(&providers.gateway),
            config.session.max_message_chars,
        );
        let fallback = FallbackCoordinator::new(channels, config.channels.default_fallback_order.clone());

        let sessions = SessionManager::new(SessionParts {
            store,
            language: tracker,
            intents,
            matcher: ResourceMatcher::new(config.matcher.max_results),
            composer,
            fallback,
            catalog: providers.catalog,
            speech: providers.speech,
            gateway: Arc::clone(&providers.gateway),
            config: config.session.clone(),
            provider_timeout: timeout,
        });

        info!(
            languages = registry.len(),
            default_language = %registry.default_language(),
            "Orchestrator initialized"
        );

        Self {
            sessions,
            registry,
            cache,
            gateway: providers.gateway,
        }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn languages(&self) -> &LanguageRegistry {
        &self.registry
    }

    pub fn translation_cache_stats(&self) -> &CacheStats {
        &self.cache.stats
    }

    fn store(&self) -> &Arc<dyn ConversationStore> {
        self.sessions.store()
    }

    /// Process one turn from the inbound turn API.
    pub async fn process_turn(&self, request: TurnRequest) -> Result<TurnResponse, SessionError> {
        if request.message.trim().is_empty() && request.voice_data_ref.is_none() {
            return Err(SessionError::EmptyMessage);
        }
        let max_chars = self.sessions.config().max_message_chars;
        if request.message.chars().count() > max_chars {
            return Err(SessionError::MessageTooLong(max_chars));
        }
        let adapter = self
            .sessions
            .fallback()
            .channels()
            .get(request.channel)
            .ok_or(ChannelError::Unsupported(request.channel))?;

        let user = match self.store().get_user(request.user_id)? {
            Some(user) => user,
            None => {
                let user = User::new(request.user_id, request.user_id.to_string());
                self.store().upsert_user(&user)?;
                info!(user_id = %user.id, "User created on first contact");
                user
            }
        };

        let raw = RawInbound {
            sender: user.contact_handle.clone(),
            body: request.message,
            explicit_language: request.language.is_some(),
            language: request.language,
            media_kind: request.voice_data_ref.as_ref().map(|_| MediaKind::Audio),
            media_ref: request.voice_data_ref,
            received_at: Some(Utc::now()),
        };
        let inbound = adapter.normalize(raw);
        self.run_turn(user, inbound).await
    }

    /// Process a gateway webhook for `channel`.
    pub async fn handle_webhook(
        &self,
        channel: ChannelKind,
        payload: &serde_json::Value,
    ) -> Result<TurnResponse, SessionError> {
        let adapter = self
            .sessions
            .fallback()
            .channels()
            .get(channel)
            .ok_or(ChannelError::Unsupported(channel))?;
        let raw = self
            .gateway
            .parse_webhook(channel, payload)
            .map_err(|e| ChannelError::InvalidPayload(e.to_string()))?;
        let inbound = adapter.normalize(raw);
        if inbound.text.is_empty() && inbound.media_ref.is_none() {
            return Err(SessionError::EmptyMessage);
        }

        let user = self.user_for_contact(&inbound.sender, channel)?;
        self.run_turn(user, inbound).await
    }

    /// Find the user behind a contact handle, creating one on first contact.
    /// A concurrent first contact from the same sender joins the winner.
    fn user_for_contact(&self, contact: &str, channel: ChannelKind) -> Result<User, SessionError> {
        if let Some(user) = self.store().find_user_by_contact(contact)? {
            return Ok(user);
        }
        let user = User::new(Uuid::new_v4(), contact.to_string());
        match self.store().upsert_user(&user) {
            Ok(()) => {
                info!(user_id = %user.id, channel = %channel, "User created from webhook");
                Ok(user)
            }
            Err(CivicError::Conflict(_)) => {
                debug!(channel = %channel, "User created concurrently, joining");
                self.store().find_user_by_contact(contact)?.ok_or_else(|| {
                    CivicError::Conflict("contact handle released after conflict".to_string()).into()
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn drive_turn(&self, user_id: Uuid, inbound: &InboundMessage) -> Result<TurnOutcome, SessionError> {
        let handle = self
            .sessions
            .begin_or_join(user_id, inbound.channel, &inbound.language)
            .await?;
        match self.sessions.handle_turn(&handle, inbound.clone()).await {
            // Ended between lookup and turn: start over once.
            Err(SessionError::Ended(id)) => {
                debug!(conversation_id = %id, "Conversation ended mid-request, starting a new one");
                let handle = self
                    .sessions
                    .begin_or_join(user_id, inbound.channel, &inbound.language)
                    .await?;
                self.sessions.handle_turn(&handle, inbound.clone()).await
            }
            other => other,
        }
    }

    async fn run_turn(&self, user: User, inbound: InboundMessage) -> Result<TurnResponse, SessionError> {
        let channel = inbound.channel;
        let result = self.drive_turn(user.id, &inbound).await;

        match result {
            Ok(outcome) => {
                if outcome.delivery.is_failed() {
                    warn!(conversation_id = %outcome.conversation_id, "Turn completed but delivery failed");
                }
                Ok(TurnResponse::from_outcome(outcome))
            }
            Err(e) if e.is_validation() => Err(e),
            Err(e) => {
                error!(user_id = %user.id, channel = %channel, error = %e, "Turn could not complete");
                Ok(self.apology_response(&user, channel, &inbound))
            }
        }
    }

    fn apology_response(&self, user: &User, channel: ChannelKind, inbound: &InboundMessage) -> TurnResponse {
        let language = inbound
            .language
            .code
            .as_deref()
            .and_then(|raw| self.registry.lookup(raw))
            .or_else(|| {
                user.preferred_language
                    .clone()
                    .filter(|code| self.registry.is_supported(code))
            })
            .unwrap_or_else(|| self.registry.default_language().clone());
        let next = self
            .sessions
            .fallback()
            .next_channel(&user.fallback_channels, channel);
        TurnResponse {
            response_text: apology(&language, next),
            response_audio_ref: None,
            suggested_actions: Vec::new(),
            resources: Vec::new(),
            conversation_id: None,
            language,
            degraded: true,
            delivery_status: None,
            conversation_ended: false,
        }
    }

    pub fn get_conversation(&self, id: Uuid) -> Result<Conversation, SessionError> {
        self.store()
            .get_conversation(id)?
            .ok_or(SessionError::NotFound(id))
    }

    pub async fn end_conversation(&self, id: Uuid, reason: EndReason) -> Result<Conversation, SessionError> {
        self.sessions.end_conversation(id, reason).await
    }

    /// Explicitly delete a user, their conversations and messages.
    pub fn delete_user(&self, id: Uuid) -> Result<bool, SessionError> {
        let deleted = self.store().delete_user(id)?;
        if deleted {
            info!(user_id = %id, "User deleted");
        }
        Ok(deleted)
    }

    /// Run one idle sweep.
    pub async fn sweep_idle(&self) -> Result<usize, SessionError> {
        self.sessions.sweep_idle().await
    }
}
