//! Conversation orchestration engine for civicline.
//!
//! Takes an inbound message from any channel, resolves the conversation and
//! its language, classifies intent, matches public-service resources against
//! the user's eligibility profile, composes a channel-appropriate reply and
//! delivers it with a single fallback retry.

pub mod channel;
pub mod composer;
pub mod error;
pub mod fallback;
pub mod intent;
pub mod language;
pub mod lifecycle;
pub mod matcher;
pub mod memory_store;
pub mod orchestrator;
pub mod session;
pub mod translation;

pub use channel::{
    ChannelAdapter, ChannelRegistry, InboundMessage, InteractiveWebAdapter, StoreAndForwardAdapter,
    VoiceAdapter,
};
pub use composer::{Degradation, OutboundResponse, ResponseBody, ResponseComposer};
pub use error::{ChannelError, SessionError};
pub use fallback::{DeliveryAttempt, DeliveryOutcome, FallbackCoordinator};
pub use intent::{IntentDispatcher, IntentHandler, IntentOutcome, KeywordClassifier, RecognizedIntent};
pub use language::{LanguageHint, LanguageStateTracker, TranslatedText};
pub use matcher::{CriterionOutcome, MatchQuery, ResourceMatcher, ScoredResource};
pub use memory_store::InMemoryConversationStore;
pub use orchestrator::{Orchestrator, Providers, ResourceSummary, TurnRequest, TurnResponse};
pub use session::{ConversationHandle, SessionManager, SessionParts, TurnOutcome};
pub use translation::{CacheStats, TranslationCache};
