//! Session Manager.
//!
//! Owns the conversation lifecycle and drives one turn end to end. Two
//! concurrency rules hold:
//!
//! - Creation of a conversation for a `(user, channel)` key is guarded. A
//!   second create attempt while one is in flight fails with
//!   [`SessionError::Conflict`]; [`SessionManager::begin_or_join`] waits for
//!   the winner and resumes its conversation instead.
//! - Turns of one conversation run strictly one at a time through a FIFO
//!   turn queue. The stored record is read at the start of a turn and
//!   written back with a version check at the end; no store lock is held
//!   while providers are called.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use civicline_core::config::SessionConfig;
use civicline_core::{
    with_timeout, CatalogProvider, ChannelKind, CivicError, Conversation, ConversationState,
    ConversationStore, DeliveryStatus, EndReason, IntentCategory, Interaction, InteractionAction,
    LanguageCode, LanguageProfile, LanguageSource, MessageKind, MessagingGateway, ProviderError,
    Sender, SpeechProvider, UserProfile,
};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channel::InboundMessage;
use crate::composer::{
    OutboundResponse, ResponseBody, ResponseComposer, GOODBYE_PROMPT, GREETING_PROMPT, HELP_PROMPT,
    LANGUAGE_ASK_PROMPT, LANGUAGE_CHANGED_PROMPT,
};
use crate::error::SessionError;
use crate::fallback::FallbackCoordinator;
use crate::intent::{
    clarification_prompt, profile_from_slots, IntentDispatcher, IntentHandler, IntentOutcome,
    UNHEARD_PROMPT,
};
use crate::language::{LanguageHint, LanguageStateTracker};
use crate::lifecycle;
use crate::matcher::{MatchQuery, ResourceMatcher, ScoredResource};

/// Transcripts below this confidence are treated as unheard.
const MIN_TRANSCRIPT_CONFIDENCE: f32 = 0.5;

type CreationKey = (Uuid, ChannelKind);
type TurnQueues = Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>;

/// Reference to an open conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConversationHandle {
    pub conversation_id: Uuid,
    pub user_id: Uuid,
    pub channel: ChannelKind,
    /// True if this call created the conversation.
    pub created: bool,
}

/// Result of one completed turn.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub conversation_id: Uuid,
    /// The response as delivered (or as last attempted).
    pub response: OutboundResponse,
    pub delivery: DeliveryStatus,
    pub resources: Vec<ScoredResource>,
    pub intent: Option<IntentCategory>,
    pub degraded: bool,
    pub ended: bool,
}

/// Everything the session manager coordinates.
pub struct SessionParts {
    pub store: Arc<dyn ConversationStore>,
    pub language: Arc<LanguageStateTracker>,
    pub intents: IntentDispatcher,
    pub matcher: ResourceMatcher,
    pub composer: ResponseComposer,
    pub fallback: FallbackCoordinator,
    pub catalog: Arc<dyn CatalogProvider>,
    pub speech: Arc<dyn SpeechProvider>,
    pub gateway: Arc<dyn MessagingGateway>,
    pub config: SessionConfig,
    pub provider_timeout: Duration,
}

/// Holds the creation slot for one key; frees it on drop.
struct CreationGuard<'a> {
    creating: &'a Mutex<HashMap<CreationKey, watch::Receiver<Option<Uuid>>>>,
    key: CreationKey,
    tx: watch::Sender<Option<Uuid>>,
}

impl CreationGuard<'_> {
    fn complete(&self, conversation_id: Uuid) {
        self.tx.send_replace(Some(conversation_id));
    }
}

impl Drop for CreationGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut creating) = self.creating.lock() {
            creating.remove(&self.key);
        }
    }
}

/// A handle on one conversation's turn queue. The queue entry is dropped
/// with the last handle.
struct TurnSlot<'a> {
    queues: &'a TurnQueues,
    conversation_id: Uuid,
    queue: Arc<tokio::sync::Mutex<()>>,
}

impl TurnSlot<'_> {
    async fn lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.queue.lock().await
    }

    fn try_lock(&self) -> Option<tokio::sync::MutexGuard<'_, ()>> {
        self.queue.try_lock().ok()
    }
}

impl Drop for TurnSlot<'_> {
    fn drop(&mut self) {
        // Handles are only cloned under the map lock, so a count of two
        // (map + self) means nobody else is queued.
        if let Ok(mut queues) = self.queues.lock() {
            let idle = queues
                .get(&self.conversation_id)
                .is_some_and(|q| Arc::ptr_eq(q, &self.queue) && Arc::strong_count(q) == 2);
            if idle {
                queues.remove(&self.conversation_id);
            }
        }
    }
}

pub struct SessionManager {
    store: Arc<dyn ConversationStore>,
    language: Arc<LanguageStateTracker>,
    intents: IntentDispatcher,
    matcher: ResourceMatcher,
    composer: ResponseComposer,
    fallback: FallbackCoordinator,
    catalog: Arc<dyn CatalogProvider>,
    speech: Arc<dyn SpeechProvider>,
    gateway: Arc<dyn MessagingGateway>,
    config: SessionConfig,
    provider_timeout: Duration,
    creating: Mutex<HashMap<CreationKey, watch::Receiver<Option<Uuid>>>>,
    turn_queues: TurnQueues,
}

impl SessionManager {
    pub fn new(parts: SessionParts) -> Self {
        Self {
            store: parts.store,
            language: parts.language,
            intents: parts.intents,
            matcher: parts.matcher,
            composer: parts.composer,
            fallback: parts.fallback,
            catalog: parts.catalog,
            speech: parts.speech,
            gateway: parts.gateway,
            config: parts.config,
            provider_timeout: parts.provider_timeout,
            creating: Mutex::new(HashMap::new()),
            turn_queues: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    pub fn language(&self) -> &LanguageStateTracker {
        &self.language
    }

    pub fn fallback(&self) -> &FallbackCoordinator {
        &self.fallback
    }

    pub fn composer(&self) -> &ResponseComposer {
        &self.composer
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn record(&self, interaction: Interaction) {
        if let Err(e) = self.store.record_interaction(&interaction) {
            warn!(action = interaction.action.as_str(), error = %e, "Failed to record interaction");
        }
    }

    fn turn_queue(&self, conversation_id: Uuid) -> Result<TurnSlot<'_>, SessionError> {
        let mut queues = self
            .turn_queues
            .lock()
            .map_err(|e| CivicError::Storage(format!("turn queue lock poisoned: {}", e)))?;
        let queue = Arc::clone(
            queues
                .entry(conversation_id)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        );
        Ok(TurnSlot {
            queues: &self.turn_queues,
            conversation_id,
            queue,
        })
    }

    fn handle_for(conversation: &Conversation, created: bool) -> ConversationHandle {
        ConversationHandle {
            conversation_id: conversation.id,
            user_id: conversation.user_id,
            channel: conversation.channel,
            created,
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Find the open conversation for `(user, channel)` or create one.
    pub async fn begin_or_resume(
        &self,
        user_id: Uuid,
        channel: ChannelKind,
        hint: &LanguageHint,
    ) -> Result<ConversationHandle, SessionError> {
        if let Some(existing) = self.store.find_open_conversation(user_id, channel)? {
            return Ok(Self::handle_for(&existing, false));
        }

        let key = (user_id, channel);
        let guard = {
            let mut creating = self
                .creating
                .lock()
                .map_err(|e| CivicError::Storage(format!("creation lock poisoned: {}", e)))?;
            if creating.contains_key(&key) {
                info!(user_id = %user_id, channel = %channel, "Concurrent create rejected");
                return Err(SessionError::Conflict { user_id, channel });
            }
            let (tx, rx) = watch::channel(None);
            creating.insert(key, rx);
            CreationGuard {
                creating: &self.creating,
                key,
                tx,
            }
        };

        // A create may have finished between the first lookup and taking the slot.
        if let Some(existing) = self.store.find_open_conversation(user_id, channel)? {
            guard.complete(existing.id);
            return Ok(Self::handle_for(&existing, false));
        }

        let user = self.store.get_user(user_id)?;
        let (language, source) = self.language.resolve_language(None, user.as_ref(), hint);
        let conversation = Conversation::new(user_id, channel, LanguageProfile::new(language, source));

        match self.store.insert_conversation(&conversation) {
            Ok(()) => {}
            Err(CivicError::Conflict(_)) => {
                // Lost a race with another process sharing the store.
                let existing = self
                    .store
                    .find_open_conversation(user_id, channel)?
                    .ok_or(SessionError::Conflict { user_id, channel })?;
                guard.complete(existing.id);
                return Ok(Self::handle_for(&existing, false));
            }
            Err(e) => return Err(e.into()),
        }

        guard.complete(conversation.id);
        info!(
            conversation_id = %conversation.id,
            channel = %channel,
            language = %conversation.language.resolved,
            "Conversation created"
        );
        self.record(
            Interaction::new(user_id, InteractionAction::ConversationStarted)
                .with_meta("channel", channel)
                .with_meta("language", &conversation.language.resolved),
        );
        Ok(Self::handle_for(&conversation, true))
    }

    /// Like [`begin_or_resume`](Self::begin_or_resume), but on a concurrent
    /// create waits for the winner and joins its conversation.
    pub async fn begin_or_join(
        &self,
        user_id: Uuid,
        channel: ChannelKind,
        hint: &LanguageHint,
    ) -> Result<ConversationHandle, SessionError> {
        match self.begin_or_resume(user_id, channel, hint).await {
            Err(SessionError::Conflict { .. }) => {}
            other => return other,
        }

        let rx = self
            .creating
            .lock()
            .map_err(|e| CivicError::Storage(format!("creation lock poisoned: {}", e)))?
            .get(&(user_id, channel))
            .cloned();

        if let Some(mut rx) = rx {
            let wait = Duration::from_millis(self.config.join_wait_ms);
            match tokio::time::timeout(wait, rx.wait_for(|v| v.is_some())).await {
                Ok(Ok(_)) => {}
                Ok(Err(_)) => debug!(user_id = %user_id, "Creator finished without a conversation"),
                Err(_) => return Err(SessionError::Conflict { user_id, channel }),
            }
        }

        info!(user_id = %user_id, channel = %channel, "Joining conversation created concurrently");
        self.begin_or_resume(user_id, channel, hint).await
    }

    /// Move a conversation to `Ended`.
    pub async fn end_conversation(
        &self,
        conversation_id: Uuid,
        reason: EndReason,
    ) -> Result<Conversation, SessionError> {
        let queue = self.turn_queue(conversation_id)?;
        let _permit = queue.lock().await;

        let mut conversation = self
            .store
            .get_conversation(conversation_id)?
            .ok_or(SessionError::NotFound(conversation_id))?;
        if conversation.state == ConversationState::Ended {
            return Err(SessionError::Ended(conversation_id));
        }
        lifecycle::end(&mut conversation, reason, Utc::now())?;
        conversation.version += 1;
        self.store.save_conversation(&conversation)?;

        info!(conversation_id = %conversation_id, reason = %reason, "Conversation ended");
        self.record(
            Interaction::new(conversation.user_id, InteractionAction::ConversationEnded)
                .with_meta("channel", conversation.channel)
                .with_meta("reason", reason)
                .with_meta("turns", conversation.context.turn_count),
        );
        Ok(conversation)
    }

    /// Mark quiet active conversations idle. Expiry is also checked lazily on
    /// the next turn, so this only keeps stored state tidy.
    pub async fn sweep_idle(&self) -> Result<usize, SessionError> {
        let now = Utc::now();
        let timeout = self.config.idle_timeout();
        let mut swept = 0;
        for candidate in self.store.list_open_conversations()? {
            if !lifecycle::is_idle_expired(&candidate, timeout, now) {
                continue;
            }
            let queue = self.turn_queue(candidate.id)?;
            // Mid-turn conversations are not idle.
            let Some(_permit) = queue.try_lock() else {
                continue;
            };
            let Some(mut conversation) = self.store.get_conversation(candidate.id)? else {
                continue;
            };
            if !lifecycle::is_idle_expired(&conversation, timeout, now) {
                continue;
            }
            lifecycle::transition(&mut conversation, ConversationState::Idle)?;
            conversation.version += 1;
            match self.store.save_conversation(&conversation) {
                Ok(()) => swept += 1,
                Err(CivicError::StaleWrite { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        if swept > 0 {
            info!(count = swept, "Idle sweep completed");
        }
        Ok(swept)
    }

    // =========================================================================
    // Turn handling
    // =========================================================================

    async fn transcribe(&self, inbound: &InboundMessage, language: &LanguageCode) -> Option<String> {
        let media_ref = inbound.media_ref.as_deref()?;
        let audio = match with_timeout(self.provider_timeout, self.gateway.fetch_media(media_ref)).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(component = "speech", error = %e, "Fallback event: media fetch failed");
                return None;
            }
        };
        let result = with_timeout(self.provider_timeout, self.speech.transcribe(&audio, language))
            .await
            .and_then(|t| {
                if t.confidence < MIN_TRANSCRIPT_CONFIDENCE {
                    Err(ProviderError::LowConfidence(t.confidence))
                } else {
                    Ok(t)
                }
            });
        match result {
            Ok(t) if !t.text.trim().is_empty() => Some(t.text),
            Ok(_) => None,
            Err(e) => {
                warn!(component = "speech", error = %e, "Fallback event: transcription failed");
                None
            }
        }
    }

    /// Rank the active catalog for `query`. Retired entries are only fetched
    /// when nothing active survives eligibility.
    async fn lookup(&self, query: &MatchQuery, profile: &UserProfile) -> Vec<ScoredResource> {
        let category = query.category;
        let slug = category.catalog_category();
        let active = match with_timeout(self.provider_timeout, self.catalog.list_active_resources(slug)).await {
            Ok(resources) => resources,
            Err(e) => {
                warn!(component = "catalog", category = %category, error = %e, "Fallback event: catalog unavailable");
                Vec::new()
            }
        };
        let ranked = self.matcher.find_matches(query, profile, &active, &[]);
        if !ranked.is_empty() {
            return ranked;
        }

        let retired = match with_timeout(self.provider_timeout, self.catalog.list_retired_resources(slug)).await {
            Ok(resources) => resources,
            Err(e) => {
                warn!(component = "catalog", category = %category, error = %e, "Fallback event: retired catalog unavailable");
                Vec::new()
            }
        };
        self.matcher.find_matches(query, profile, &active, &retired)
    }

    /// Drive one full turn and persist it atomically with the context update.
    pub async fn handle_turn(
        &self,
        handle: &ConversationHandle,
        inbound: InboundMessage,
    ) -> Result<TurnOutcome, SessionError> {
        if inbound.text.trim().is_empty() && inbound.media_ref.is_none() {
            return Err(SessionError::EmptyMessage);
        }
        if inbound.text.chars().count() > self.config.max_message_chars {
            return Err(SessionError::MessageTooLong(self.config.max_message_chars));
        }

        let queue = self.turn_queue(handle.conversation_id)?;
        let _permit = queue.lock().await;

        let mut conversation = self
            .store
            .get_conversation(handle.conversation_id)?
            .ok_or(SessionError::NotFound(handle.conversation_id))?;
        if conversation.state == ConversationState::Ended {
            return Err(SessionError::Ended(conversation.id));
        }

        let now = Utc::now();
        if lifecycle::is_idle_expired(&conversation, self.config.idle_timeout(), now) {
            debug!(conversation_id = %conversation.id, "Conversation expired to idle");
            lifecycle::transition(&mut conversation, ConversationState::Idle)?;
        }
        match conversation.state {
            ConversationState::Created | ConversationState::Idle => {
                if conversation.state == ConversationState::Idle {
                    info!(conversation_id = %conversation.id, "Resuming idle conversation");
                }
                lifecycle::transition(&mut conversation, ConversationState::Active)?;
            }
            _ => {}
        }

        let mut user = self.store.get_user(conversation.user_id)?;
        let (language, source) =
            self.language
                .resolve_language(Some(&conversation), user.as_ref(), &inbound.language);
        conversation.language.record(language.clone(), source, now);

        let mut degraded = false;
        let utterance = match inbound.kind {
            MessageKind::AudioReference => match self.transcribe(&inbound, &language).await {
                Some(text) => Some(text),
                None if !inbound.text.trim().is_empty() => Some(inbound.text.clone()),
                None => {
                    degraded = true;
                    None
                }
            },
            _ => Some(inbound.text.clone()),
        };

        let mut resources = Vec::new();
        let mut intent = None;
        let mut end_after = false;
        let mut reply_language = language.clone();

        let body = match utterance {
            None => ResponseBody::Prompt(UNHEARD_PROMPT.to_string()),
            Some(text) => match self.intents.classify(&text, &language).await {
                IntentOutcome::Unknown { best_confidence } => {
                    let attempt = conversation.context.clarification_attempts;
                    conversation.context.clarification_attempts += 1;
                    debug!(conversation_id = %conversation.id, best_confidence, attempt, "Unknown intent");
                    self.record(
                        Interaction::new(conversation.user_id, InteractionAction::ClarificationRequested)
                            .with_meta("channel", conversation.channel)
                            .with_meta("attempt", attempt),
                    );
                    ResponseBody::Prompt(clarification_prompt(attempt).to_string())
                }
                IntentOutcome::Recognized(recognized) => {
                    intent = Some(recognized.category);
                    conversation.context.last_intent = Some(recognized.category);
                    conversation.context.clarification_attempts = 0;
                    match recognized.handler {
                        IntentHandler::ResourceLookup(category) => {
                            let stated = profile_from_slots(&recognized.slots);
                            conversation.context.stated_profile =
                                conversation.context.stated_profile.merged_with(&stated);
                            conversation.context.active_category = Some(category);
                            conversation.context.keywords = recognized.keywords.clone();

                            let base = user.as_ref().map(|u| u.profile.clone()).unwrap_or_default();
                            let profile = base.merged_with(&conversation.context.stated_profile);
                            let query = MatchQuery {
                                category,
                                keywords: recognized.keywords,
                            };
                            resources = self.lookup(&query, &profile).await;
                            conversation.context.last_offered_resources =
                                resources.iter().map(|r| r.resource.id.clone()).collect();
                            if resources.is_empty() {
                                ResponseBody::NoMatches(category)
                            } else {
                                ResponseBody::Resources(resources.clone())
                            }
                        }
                        IntentHandler::Greeting => ResponseBody::Prompt(GREETING_PROMPT.to_string()),
                        IntentHandler::Help => ResponseBody::Prompt(HELP_PROMPT.to_string()),
                        IntentHandler::ChangeLanguage => {
                            let requested = recognized
                                .slots
                                .get("language")
                                .and_then(|raw| self.language.registry().lookup(raw));
                            match requested {
                                Some(code) => {
                                    conversation.language.record(code.clone(), LanguageSource::Explicit, now);
                                    if let Some(u) = user.as_mut() {
                                        u.preferred_language = Some(code.clone());
                                    }
                                    reply_language = code;
                                    ResponseBody::Prompt(LANGUAGE_CHANGED_PROMPT.to_string())
                                }
                                None => ResponseBody::Prompt(LANGUAGE_ASK_PROMPT.to_string()),
                            }
                        }
                        IntentHandler::EndConversation => {
                            end_after = true;
                            ResponseBody::Prompt(GOODBYE_PROMPT.to_string())
                        }
                    }
                }
            },
        };

        let caps = match self.fallback.channels().get(conversation.channel) {
            Some(adapter) => adapter.capabilities().clone(),
            None => {
                return Err(CivicError::Config(format!(
                    "no adapter registered for {}",
                    conversation.channel
                ))
                .into())
            }
        };
        let initial = self
            .composer
            .compose(&body, &reply_language, conversation.channel, &caps)
            .await;

        let recipient = user
            .as_ref()
            .map(|u| u.contact_handle.clone())
            .unwrap_or_else(|| conversation.user_id.to_string());
        let fallback_order = user
            .as_ref()
            .map(|u| u.fallback_channels.clone())
            .unwrap_or_default();
        let delivered = self
            .fallback
            .deliver(
                &self.composer,
                &body,
                &reply_language,
                &recipient,
                &fallback_order,
                initial,
            )
            .await;
        let response = delivered.response;
        let status = delivered.status;
        degraded |= response.degraded();

        // Commit inbound, outbound and context as one versioned write.
        let inbound_content = match (&inbound.kind, &inbound.media_ref) {
            (MessageKind::Text, _) | (_, None) => inbound.text.clone(),
            (_, Some(media_ref)) => media_ref.clone(),
        };
        conversation.append_message(
            Sender::User,
            inbound.kind,
            inbound_content,
            language.clone(),
            None,
        );
        conversation.append_message(
            Sender::System,
            MessageKind::Text,
            response.text.clone(),
            response.language.clone(),
            Some(status.clone()),
        );
        conversation.context.turn_count += 1;
        conversation.context.revision += 1;
        conversation.context.last_delivery = Some(status.clone());
        conversation.last_activity_at = Utc::now();
        if end_after {
            let ended_at = conversation.last_activity_at;
            lifecycle::end(&mut conversation, EndReason::UserClosed, ended_at)?;
        }
        conversation.version += 1;
        self.store.save_conversation(&conversation)?;

        if let Some(mut u) = user {
            u.last_active_at = conversation.last_activity_at;
            if let Err(e) = self.store.upsert_user(&u) {
                warn!(user_id = %u.id, error = %e, "Failed to update user activity");
            }
        }

        self.record_turn(&conversation, intent, &resources, &response, &status, degraded);
        if end_after {
            self.record(
                Interaction::new(conversation.user_id, InteractionAction::ConversationEnded)
                    .with_meta("channel", conversation.channel)
                    .with_meta("reason", EndReason::UserClosed)
                    .with_meta("turns", conversation.context.turn_count),
            );
        }

        Ok(TurnOutcome {
            conversation_id: conversation.id,
            response,
            delivery: status,
            resources,
            intent,
            degraded,
            ended: end_after,
        })
    }

    fn record_turn(
        &self,
        conversation: &Conversation,
        intent: Option<IntentCategory>,
        resources: &[ScoredResource],
        response: &OutboundResponse,
        status: &DeliveryStatus,
        degraded: bool,
    ) {
        let user_id = conversation.user_id;
        let intent_label = intent.map_or("unknown", |i| i.as_str());
        self.record(
            Interaction::new(user_id, InteractionAction::TurnCompleted)
                .with_meta("channel", conversation.channel)
                .with_meta("language", &response.language)
                .with_meta("intent", intent_label)
                .with_meta("degraded", degraded),
        );
        for scored in resources {
            self.record(
                Interaction::new(user_id, InteractionAction::ResourceOffered)
                    .with_resource(&scored.resource.id)
                    .with_meta("intent", intent_label)
                    .with_meta("superseded", scored.superseded),
            );
        }
        if response
            .degradations
            .contains(&crate::composer::Degradation::Translation)
        {
            self.record(
                Interaction::new(user_id, InteractionAction::TranslationDegraded)
                    .with_meta("target_language", &conversation.language.resolved),
            );
        }
        match status {
            DeliveryStatus::Delivered { .. } => {}
            DeliveryStatus::FellBack { from, to } => self.record(
                Interaction::new(user_id, InteractionAction::ChannelFallback)
                    .with_meta("from", from)
                    .with_meta("to", to),
            ),
            DeliveryStatus::DeliveryFailed { attempted } => {
                let attempted: Vec<&str> = attempted.iter().map(|c| c.as_str()).collect();
                self.record(
                    Interaction::new(user_id, InteractionAction::DeliveryFailed)
                        .with_meta("attempted", attempted.join(",")),
                );
            }
        }
    }
}
