use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Channels
// =============================================================================

/// Transport a conversation runs over.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// Browser or app session with a live connection.
    InteractiveWeb,
    /// Phone call: input is transcribed, output is synthesized.
    Voice,
    /// Store-and-forward messaging with media and buttons.
    RichMessaging,
    /// Store-and-forward plain short text.
    ShortText,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 4] = [
        ChannelKind::InteractiveWeb,
        ChannelKind::Voice,
        ChannelKind::RichMessaging,
        ChannelKind::ShortText,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::InteractiveWeb => "interactive_web",
            ChannelKind::Voice => "voice",
            ChannelKind::RichMessaging => "rich_messaging",
            ChannelKind::ShortText => "short_text",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "interactive_web" | "web" => Ok(ChannelKind::InteractiveWeb),
            "voice" | "ivr" => Ok(ChannelKind::Voice),
            "rich_messaging" | "messaging" | "whatsapp" => Ok(ChannelKind::RichMessaging),
            "short_text" | "sms" => Ok(ChannelKind::ShortText),
            other => Err(format!("unknown channel: {}", other)),
        }
    }
}

/// Expected response latency of a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LatencyClass {
    /// Caller is waiting on the line.
    Realtime,
    /// User is looking at a screen.
    Interactive,
    /// Delivery may take minutes.
    StoreAndForward,
}

/// Declared limits of a transport.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelCapabilities {
    pub max_payload_bytes: usize,
    pub supports_media: bool,
    pub supports_voice: bool,
    pub supports_interactive_buttons: bool,
    /// Whether a "more info" link can be followed from this channel.
    pub supports_links: bool,
    pub latency_class: LatencyClass,
}

impl ChannelCapabilities {
    pub fn interactive_web() -> Self {
        Self {
            max_payload_bytes: 4096,
            supports_media: true,
            supports_voice: false,
            supports_interactive_buttons: true,
            supports_links: true,
            latency_class: LatencyClass::Interactive,
        }
    }

    pub fn voice() -> Self {
        Self {
            max_payload_bytes: 1024,
            supports_media: false,
            supports_voice: true,
            supports_interactive_buttons: false,
            supports_links: false,
            latency_class: LatencyClass::Realtime,
        }
    }

    pub fn rich_messaging() -> Self {
        Self {
            max_payload_bytes: 1600,
            supports_media: true,
            supports_voice: false,
            supports_interactive_buttons: true,
            supports_links: true,
            latency_class: LatencyClass::StoreAndForward,
        }
    }

    pub fn short_text() -> Self {
        Self {
            max_payload_bytes: 160,
            supports_media: false,
            supports_voice: false,
            supports_interactive_buttons: false,
            supports_links: false,
            latency_class: LatencyClass::StoreAndForward,
        }
    }
}

// =============================================================================
// Language
// =============================================================================

/// Lowercase BCP-47 primary language subtag, e.g. `en`, `hi`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LanguageCode(String);

impl LanguageCode {
    pub fn new(code: &str) -> Self {
        Self(code.trim().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LanguageCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LanguageCode {
    fn from(code: &str) -> Self {
        LanguageCode::new(code)
    }
}

/// How a conversation's language was decided.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LanguageSource {
    /// The user stated it this turn.
    Explicit,
    /// Carried over from an earlier turn of the conversation.
    Negotiated,
    /// The user's stored preference.
    UserPreference,
    /// A non-explicit hint from the transport.
    Inferred,
    /// Nothing else was available.
    SystemDefault,
}

/// One entry of a conversation's language negotiation history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LanguageNegotiation {
    pub language: LanguageCode,
    pub source: LanguageSource,
    pub at: DateTime<Utc>,
}

/// Per-conversation resolved language with its negotiation history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LanguageProfile {
    pub resolved: LanguageCode,
    pub source: LanguageSource,
    pub history: Vec<LanguageNegotiation>,
}

/// Oldest entries are dropped past this length.
const MAX_LANGUAGE_HISTORY: usize = 32;

impl LanguageProfile {
    pub fn new(language: LanguageCode, source: LanguageSource) -> Self {
        let at = Utc::now();
        Self {
            history: vec![LanguageNegotiation {
                language: language.clone(),
                source,
                at,
            }],
            resolved: language,
            source,
        }
    }

    /// Record a resolution. History only grows when the language changes.
    pub fn record(&mut self, language: LanguageCode, source: LanguageSource, at: DateTime<Utc>) {
        let changed = language != self.resolved;
        self.resolved = language.clone();
        self.source = source;
        if changed {
            self.history.push(LanguageNegotiation {
                language,
                source,
                at,
            });
            if self.history.len() > MAX_LANGUAGE_HISTORY {
                let excess = self.history.len() - MAX_LANGUAGE_HISTORY;
                self.history.drain(..excess);
            }
        }
    }
}

// =============================================================================
// Users and profiles
// =============================================================================

/// Accessibility preferences that influence rendering.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessibilitySettings {
    pub prefers_voice: bool,
    pub screen_reader: bool,
    pub simplified_language: bool,
}

/// Profile attributes that eligibility criteria can test.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileAttribute {
    Age,
    AnnualIncome,
    Region,
    Occupation,
    Gender,
    Disability,
    HouseholdSize,
    BelowPovertyLine,
}

impl ProfileAttribute {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileAttribute::Age => "age",
            ProfileAttribute::AnnualIncome => "annual_income",
            ProfileAttribute::Region => "region",
            ProfileAttribute::Occupation => "occupation",
            ProfileAttribute::Gender => "gender",
            ProfileAttribute::Disability => "disability",
            ProfileAttribute::HouseholdSize => "household_size",
            ProfileAttribute::BelowPovertyLine => "below_poverty_line",
        }
    }

    /// Parse a raw slot value into the typed value this attribute expects.
    pub fn parse_value(&self, raw: &str) -> Option<AttributeValue> {
        let raw = raw.trim();
        match self {
            ProfileAttribute::Age | ProfileAttribute::AnnualIncome | ProfileAttribute::HouseholdSize => {
                raw.replace([',', '_'], "").parse::<f64>().ok().map(AttributeValue::Number)
            }
            ProfileAttribute::Disability | ProfileAttribute::BelowPovertyLine => {
                match raw.to_lowercase().as_str() {
                    "yes" | "y" | "true" | "haan" | "han" | "हाँ" | "हां" => {
                        Some(AttributeValue::Flag(true))
                    }
                    "no" | "n" | "false" | "nahi" | "nahin" | "नहीं" => {
                        Some(AttributeValue::Flag(false))
                    }
                    _ => None,
                }
            }
            ProfileAttribute::Region | ProfileAttribute::Occupation | ProfileAttribute::Gender => {
                if raw.is_empty() {
                    None
                } else {
                    Some(AttributeValue::Text(raw.to_lowercase()))
                }
            }
        }
    }
}

impl fmt::Display for ProfileAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProfileAttribute {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "age" => Ok(ProfileAttribute::Age),
            "annual_income" | "income" => Ok(ProfileAttribute::AnnualIncome),
            "region" | "state" | "district" => Ok(ProfileAttribute::Region),
            "occupation" => Ok(ProfileAttribute::Occupation),
            "gender" => Ok(ProfileAttribute::Gender),
            "disability" | "has_disability" => Ok(ProfileAttribute::Disability),
            "household_size" => Ok(ProfileAttribute::HouseholdSize),
            "below_poverty_line" | "bpl" => Ok(ProfileAttribute::BelowPovertyLine),
            other => Err(format!("unknown profile attribute: {}", other)),
        }
    }
}

/// Typed value of a profile attribute.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Flag(bool),
    Number(f64),
    Text(String),
}

/// Attributes known about a user, either stored or stated during a conversation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserProfile {
    pub attributes: BTreeMap<ProfileAttribute, AttributeValue>,
}

impl UserProfile {
    pub fn get(&self, attribute: ProfileAttribute) -> Option<&AttributeValue> {
        self.attributes.get(&attribute)
    }

    pub fn set(&mut self, attribute: ProfileAttribute, value: AttributeValue) {
        self.attributes.insert(attribute, value);
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// Returns `self` overlaid with `overrides`; values in `overrides` win.
    pub fn merged_with(&self, overrides: &UserProfile) -> UserProfile {
        let mut merged = self.clone();
        for (attribute, value) in &overrides.attributes {
            merged.attributes.insert(*attribute, value.clone());
        }
        merged
    }
}

/// A citizen known to the system.
///
/// Never deleted implicitly; removal happens only through an explicit
/// deletion request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    /// Phone number or other transport address.
    pub contact_handle: String,
    pub preferred_language: Option<LanguageCode>,
    #[serde(default)]
    pub accessibility: AccessibilitySettings,
    /// Preferred delivery fallback order. Empty means the system default.
    #[serde(default)]
    pub fallback_channels: Vec<ChannelKind>,
    #[serde(default)]
    pub profile: UserProfile,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

impl User {
    pub fn new(id: Uuid, contact_handle: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            contact_handle: contact_handle.into(),
            preferred_language: None,
            accessibility: AccessibilitySettings::default(),
            fallback_channels: Vec::new(),
            profile: UserProfile::default(),
            created_at: now,
            last_active_at: now,
        }
    }
}

// =============================================================================
// Intents
// =============================================================================

/// Supported intent categories.
///
/// Resource categories map one-to-one to catalog categories; the remaining
/// variants are conversational and never reach the Resource Matcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentCategory {
    HealthcareScheme,
    HealthFacility,
    Vaccination,
    MaternalHealth,
    MentalHealth,
    FoodSecurity,
    Pension,
    Housing,
    Education,
    Employment,
    Agriculture,
    DisabilitySupport,
    WomenWelfare,
    IdentityDocuments,
    Taxation,
    Utilities,
    DisasterRelief,
    LegalAid,
    Grievance,
    Transport,
    Emergency,
    Greeting,
    Help,
    ChangeLanguage,
    EndConversation,
}

impl IntentCategory {
    pub const ALL: [IntentCategory; 25] = [
        IntentCategory::HealthcareScheme,
        IntentCategory::HealthFacility,
        IntentCategory::Vaccination,
        IntentCategory::MaternalHealth,
        IntentCategory::MentalHealth,
        IntentCategory::FoodSecurity,
        IntentCategory::Pension,
        IntentCategory::Housing,
        IntentCategory::Education,
        IntentCategory::Employment,
        IntentCategory::Agriculture,
        IntentCategory::DisabilitySupport,
        IntentCategory::WomenWelfare,
        IntentCategory::IdentityDocuments,
        IntentCategory::Taxation,
        IntentCategory::Utilities,
        IntentCategory::DisasterRelief,
        IntentCategory::LegalAid,
        IntentCategory::Grievance,
        IntentCategory::Transport,
        IntentCategory::Emergency,
        IntentCategory::Greeting,
        IntentCategory::Help,
        IntentCategory::ChangeLanguage,
        IntentCategory::EndConversation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IntentCategory::HealthcareScheme => "healthcare_scheme",
            IntentCategory::HealthFacility => "health_facility",
            IntentCategory::Vaccination => "vaccination",
            IntentCategory::MaternalHealth => "maternal_health",
            IntentCategory::MentalHealth => "mental_health",
            IntentCategory::FoodSecurity => "food_security",
            IntentCategory::Pension => "pension",
            IntentCategory::Housing => "housing",
            IntentCategory::Education => "education",
            IntentCategory::Employment => "employment",
            IntentCategory::Agriculture => "agriculture",
            IntentCategory::DisabilitySupport => "disability_support",
            IntentCategory::WomenWelfare => "women_welfare",
            IntentCategory::IdentityDocuments => "identity_documents",
            IntentCategory::Taxation => "taxation",
            IntentCategory::Utilities => "utilities",
            IntentCategory::DisasterRelief => "disaster_relief",
            IntentCategory::LegalAid => "legal_aid",
            IntentCategory::Grievance => "grievance",
            IntentCategory::Transport => "transport",
            IntentCategory::Emergency => "emergency",
            IntentCategory::Greeting => "greeting",
            IntentCategory::Help => "help",
            IntentCategory::ChangeLanguage => "change_language",
            IntentCategory::EndConversation => "end_conversation",
        }
    }

    /// Catalog category served by this intent, if it is a resource query.
    pub fn catalog_category(&self) -> Option<&'static str> {
        match self {
            IntentCategory::Greeting
            | IntentCategory::Help
            | IntentCategory::ChangeLanguage
            | IntentCategory::EndConversation => None,
            other => Some(other.as_str()),
        }
    }

    pub fn is_resource_query(&self) -> bool {
        self.catalog_category().is_some()
    }
}

impl fmt::Display for IntentCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IntentCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let label = s.trim().to_ascii_lowercase();
        IntentCategory::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == label)
            .ok_or_else(|| format!("unsupported intent: {}", label))
    }
}

// =============================================================================
// Resources
// =============================================================================

/// Comparison applied to a profile attribute.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "snake_case")]
pub enum EligibilityRule {
    AtLeast(f64),
    AtMost(f64),
    OneOf(Vec<String>),
    IsTrue,
}

/// A condition a user profile must satisfy for a resource to match.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EligibilityCriterion {
    pub attribute: ProfileAttribute,
    pub rule: EligibilityRule,
}

/// How to reach the office running a resource.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContactInfo {
    pub phone: Option<String>,
    pub website: Option<String>,
    pub office_address: Option<String>,
}

impl ContactInfo {
    pub fn is_empty(&self) -> bool {
        self.phone.is_none() && self.website.is_none() && self.office_address.is_none()
    }
}

/// A catalog entry owned by the external source of record. Read-only here.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Catalog identifier, stable across refreshes.
    pub id: String,
    pub title: String,
    pub description: String,
    pub category: String,
    #[serde(default)]
    pub eligibility: Vec<EligibilityCriterion>,
    /// Offered regardless of eligibility outcome.
    #[serde(default)]
    pub informational_only: bool,
    #[serde(default)]
    pub application_process: String,
    #[serde(default)]
    pub contact: ContactInfo,
    #[serde(default)]
    pub source_reference: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    pub active: bool,
    #[serde(default)]
    pub superseded_by: Option<String>,
    pub last_updated: DateTime<Utc>,
}

// =============================================================================
// Conversations and messages
// =============================================================================

/// Lifecycle state of a conversation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    Created,
    Active,
    Idle,
    Ended,
}

impl ConversationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationState::Created => "created",
            ConversationState::Active => "active",
            ConversationState::Idle => "idle",
            ConversationState::Ended => "ended",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ConversationState::Ended)
    }
}

impl fmt::Display for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConversationState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(ConversationState::Created),
            "active" => Ok(ConversationState::Active),
            "idle" => Ok(ConversationState::Idle),
            "ended" => Ok(ConversationState::Ended),
            other => Err(format!("unknown conversation state: {}", other)),
        }
    }
}

/// Why a conversation ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    UserClosed,
    Timeout,
    ChannelTerminated,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EndReason::UserClosed => "user_closed",
            EndReason::Timeout => "timeout",
            EndReason::ChannelTerminated => "channel_terminated",
        };
        f.write_str(s)
    }
}

/// Who produced a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    User,
    System,
}

/// Payload type of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    AudioReference,
    ImageReference,
}

/// Where the outbound message of a turn ended up.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeliveryStatus {
    Delivered { channel: ChannelKind },
    FellBack { from: ChannelKind, to: ChannelKind },
    DeliveryFailed { attempted: Vec<ChannelKind> },
}

impl DeliveryStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, DeliveryStatus::DeliveryFailed { .. })
    }
}

/// One immutable entry of a conversation's append-only log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender: Sender,
    pub kind: MessageKind,
    pub content: String,
    pub language: LanguageCode,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub delivery: Option<DeliveryStatus>,
}

pub const CONTEXT_SCHEMA_VERSION: u32 = 1;

/// Slots collected across turns.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationContext {
    pub schema_version: u32,
    /// Incremented on every committed turn.
    pub revision: u64,
    pub last_intent: Option<IntentCategory>,
    /// Most recent resource category the user asked about.
    pub active_category: Option<IntentCategory>,
    pub keywords: Vec<String>,
    /// Attributes the user stated during this conversation.
    pub stated_profile: UserProfile,
    pub clarification_attempts: u32,
    pub last_offered_resources: Vec<String>,
    pub turn_count: u64,
    pub last_delivery: Option<DeliveryStatus>,
}

impl Default for ConversationContext {
    fn default() -> Self {
        Self {
            schema_version: CONTEXT_SCHEMA_VERSION,
            revision: 0,
            last_intent: None,
            active_category: None,
            keywords: Vec::new(),
            stated_profile: UserProfile::default(),
            clarification_attempts: 0,
            last_offered_resources: Vec::new(),
            turn_count: 0,
            last_delivery: None,
        }
    }
}

/// One ongoing exchange between a user and the system on one channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub user_id: Uuid,
    pub channel: ChannelKind,
    pub state: ConversationState,
    pub language: LanguageProfile,
    pub messages: Vec<Message>,
    pub context: ConversationContext,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<EndReason>,
    /// Optimistic concurrency version, bumped on every save.
    pub version: u64,
}

impl Conversation {
    pub fn new(user_id: Uuid, channel: ChannelKind, language: LanguageProfile) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            channel,
            state: ConversationState::Created,
            language,
            messages: Vec::new(),
            context: ConversationContext::default(),
            created_at: now,
            last_activity_at: now,
            ended_at: None,
            end_reason: None,
            version: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        !self.state.is_terminal()
    }

    /// Timestamp for the next appended message, strictly after the last one.
    pub fn next_message_time(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.messages.last() {
            Some(last) if now <= last.created_at => last.created_at + Duration::microseconds(1),
            _ => now,
        }
    }

    /// Append a message, stamping it so the log stays strictly time-ordered.
    pub fn append_message(
        &mut self,
        sender: Sender,
        kind: MessageKind,
        content: impl Into<String>,
        language: LanguageCode,
        delivery: Option<DeliveryStatus>,
    ) -> &Message {
        let created_at = self.next_message_time(Utc::now());
        self.messages.push(Message {
            id: Uuid::new_v4(),
            conversation_id: self.id,
            sender,
            kind,
            content: content.into(),
            language,
            created_at,
            delivery,
        });
        &self.messages[self.messages.len() - 1]
    }
}

// =============================================================================
// Transport payloads
// =============================================================================

/// Media attached to an inbound message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Audio,
    Image,
}

/// Inbound event as parsed from a gateway webhook, before normalization.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawInbound {
    /// Transport address of the sender.
    pub sender: String,
    pub body: String,
    pub language: Option<String>,
    /// True when the user picked the language rather than the transport guessing it.
    pub explicit_language: bool,
    pub media_ref: Option<String>,
    pub media_kind: Option<MediaKind>,
    pub received_at: Option<DateTime<Utc>>,
}

/// What a suggested action does when chosen.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionKind {
    Call { number: String },
    OpenLink { url: String },
    Reply { text: String },
}

/// A structured follow-up offered with a response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuggestedAction {
    pub label: String,
    pub action: ActionKind,
}

/// Payload handed to the messaging gateway.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OutboundPayload {
    pub text: String,
    pub audio_ref: Option<String>,
    pub actions: Vec<SuggestedAction>,
}

// =============================================================================
// Analytics
// =============================================================================

/// Kind of anonymized analytics event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionAction {
    ConversationStarted,
    TurnCompleted,
    ResourceOffered,
    ClarificationRequested,
    TranslationDegraded,
    ChannelFallback,
    DeliveryFailed,
    ConversationEnded,
}

impl InteractionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            InteractionAction::ConversationStarted => "conversation_started",
            InteractionAction::TurnCompleted => "turn_completed",
            InteractionAction::ResourceOffered => "resource_offered",
            InteractionAction::ClarificationRequested => "clarification_requested",
            InteractionAction::TranslationDegraded => "translation_degraded",
            InteractionAction::ChannelFallback => "channel_fallback",
            InteractionAction::DeliveryFailed => "delivery_failed",
            InteractionAction::ConversationEnded => "conversation_ended",
        }
    }
}

impl FromStr for InteractionAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            InteractionAction::ConversationStarted,
            InteractionAction::TurnCompleted,
            InteractionAction::ResourceOffered,
            InteractionAction::ClarificationRequested,
            InteractionAction::TranslationDegraded,
            InteractionAction::ChannelFallback,
            InteractionAction::DeliveryFailed,
            InteractionAction::ConversationEnded,
        ]
        .into_iter()
        .find(|a| a.as_str() == s)
        .ok_or_else(|| format!("unknown interaction action: {}", s))
    }
}

/// Write-once analytics record.
///
/// Metadata holds only categorical values (channel, language, intent label,
/// counts); raw message text is never copied here.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    pub id: Uuid,
    /// `None` once the user has been deleted.
    pub user_id: Option<Uuid>,
    pub action: InteractionAction,
    pub resource_id: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl Interaction {
    pub fn new(user_id: Uuid, action: InteractionAction) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: Some(user_id),
            action,
            resource_id: None,
            metadata: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_resource(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn with_meta(mut self, key: &str, value: impl ToString) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_kind_parse_aliases() {
        assert_eq!("sms".parse::<ChannelKind>().unwrap(), ChannelKind::ShortText);
        assert_eq!("web".parse::<ChannelKind>().unwrap(), ChannelKind::InteractiveWeb);
        assert_eq!(
            "rich_messaging".parse::<ChannelKind>().unwrap(),
            ChannelKind::RichMessaging
        );
        assert!("pigeon".parse::<ChannelKind>().is_err());
    }

    #[test]
    fn test_channel_kind_display_round_trips() {
        for kind in ChannelKind::ALL {
            assert_eq!(kind.to_string().parse::<ChannelKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_language_code_normalizes() {
        assert_eq!(LanguageCode::new(" HI ").as_str(), "hi");
        assert_eq!(LanguageCode::from("En"), LanguageCode::new("en"));
    }

    #[test]
    fn test_language_profile_history_only_on_change() {
        let mut profile = LanguageProfile::new(LanguageCode::new("en"), LanguageSource::SystemDefault);
        profile.record(LanguageCode::new("en"), LanguageSource::Negotiated, Utc::now());
        assert_eq!(profile.history.len(), 1);
        assert_eq!(profile.source, LanguageSource::Negotiated);

        profile.record(LanguageCode::new("hi"), LanguageSource::Explicit, Utc::now());
        assert_eq!(profile.history.len(), 2);
        assert_eq!(profile.resolved.as_str(), "hi");
    }

    #[test]
    fn test_language_profile_history_bounded() {
        let mut profile = LanguageProfile::new(LanguageCode::new("en"), LanguageSource::SystemDefault);
        for i in 0..100 {
            let code = if i % 2 == 0 { "hi" } else { "en" };
            profile.record(LanguageCode::new(code), LanguageSource::Explicit, Utc::now());
        }
        assert_eq!(profile.history.len(), MAX_LANGUAGE_HISTORY);
    }

    #[test]
    fn test_intent_category_has_at_least_twenty_resource_categories() {
        let resource_count = IntentCategory::ALL
            .iter()
            .filter(|c| c.is_resource_query())
            .count();
        assert!(resource_count >= 20);
    }

    #[test]
    fn test_intent_category_labels_round_trip() {
        for category in IntentCategory::ALL {
            assert_eq!(category.as_str().parse::<IntentCategory>().unwrap(), category);
        }
        assert!("weather_forecast".parse::<IntentCategory>().is_err());
    }

    #[test]
    fn test_conversational_intents_have_no_catalog_category() {
        assert!(IntentCategory::Greeting.catalog_category().is_none());
        assert!(IntentCategory::EndConversation.catalog_category().is_none());
        assert_eq!(
            IntentCategory::HealthcareScheme.catalog_category(),
            Some("healthcare_scheme")
        );
    }

    #[test]
    fn test_profile_attribute_parse_values() {
        assert_eq!(
            ProfileAttribute::Age.parse_value("67"),
            Some(AttributeValue::Number(67.0))
        );
        assert_eq!(
            ProfileAttribute::AnnualIncome.parse_value("1,20,000"),
            Some(AttributeValue::Number(120000.0))
        );
        assert_eq!(
            ProfileAttribute::BelowPovertyLine.parse_value("haan"),
            Some(AttributeValue::Flag(true))
        );
        assert_eq!(ProfileAttribute::Disability.parse_value("maybe"), None);
        assert_eq!(
            ProfileAttribute::Region.parse_value("Bihar"),
            Some(AttributeValue::Text("bihar".to_string()))
        );
        assert_eq!(ProfileAttribute::Age.parse_value("old"), None);
    }

    #[test]
    fn test_profile_merge_overrides_win() {
        let mut stored = UserProfile::default();
        stored.set(ProfileAttribute::Age, AttributeValue::Number(30.0));
        stored.set(ProfileAttribute::Region, AttributeValue::Text("bihar".into()));

        let mut stated = UserProfile::default();
        stated.set(ProfileAttribute::Age, AttributeValue::Number(31.0));

        let merged = stored.merged_with(&stated);
        assert_eq!(merged.get(ProfileAttribute::Age), Some(&AttributeValue::Number(31.0)));
        assert_eq!(
            merged.get(ProfileAttribute::Region),
            Some(&AttributeValue::Text("bihar".into()))
        );
    }

    #[test]
    fn test_profile_serializes_as_flat_map() {
        let mut profile = UserProfile::default();
        profile.set(ProfileAttribute::Age, AttributeValue::Number(40.0));
        profile.set(ProfileAttribute::Disability, AttributeValue::Flag(true));
        let json = serde_json::to_value(&profile).unwrap();
        assert_eq!(json["age"], 40.0);
        assert_eq!(json["disability"], true);
        let back: UserProfile = serde_json::from_value(json).unwrap();
        assert_eq!(back, profile);
    }

    #[test]
    fn test_append_message_strictly_ordered() {
        let lang = LanguageCode::new("en");
        let mut conv = Conversation::new(
            Uuid::new_v4(),
            ChannelKind::ShortText,
            LanguageProfile::new(lang.clone(), LanguageSource::SystemDefault),
        );
        for i in 0..50 {
            conv.append_message(Sender::User, MessageKind::Text, format!("m{}", i), lang.clone(), None);
        }
        for pair in conv.messages.windows(2) {
            assert!(pair[0].created_at < pair[1].created_at);
        }
    }

    #[test]
    fn test_next_message_time_after_future_last() {
        let lang = LanguageCode::new("en");
        let mut conv = Conversation::new(
            Uuid::new_v4(),
            ChannelKind::Voice,
            LanguageProfile::new(lang.clone(), LanguageSource::SystemDefault),
        );
        conv.append_message(Sender::User, MessageKind::Text, "hi", lang, None);
        let last = conv.messages[0].created_at;
        let earlier = last - Duration::seconds(10);
        assert!(conv.next_message_time(earlier) > last);
    }

    #[test]
    fn test_new_conversation_is_created_and_open() {
        let conv = Conversation::new(
            Uuid::new_v4(),
            ChannelKind::InteractiveWeb,
            LanguageProfile::new(LanguageCode::new("en"), LanguageSource::SystemDefault),
        );
        assert_eq!(conv.state, ConversationState::Created);
        assert!(conv.is_open());
        assert_eq!(conv.context.schema_version, CONTEXT_SCHEMA_VERSION);
        assert_eq!(conv.version, 0);
    }

    #[test]
    fn test_eligibility_rule_serialization() {
        let criterion = EligibilityCriterion {
            attribute: ProfileAttribute::Age,
            rule: EligibilityRule::AtLeast(60.0),
        };
        let json = serde_json::to_value(&criterion).unwrap();
        assert_eq!(json["attribute"], "age");
        assert_eq!(json["rule"]["op"], "at_least");
        assert_eq!(json["rule"]["value"], 60.0);

        let is_true: EligibilityRule = serde_json::from_str(r#"{"op":"is_true"}"#).unwrap();
        assert_eq!(is_true, EligibilityRule::IsTrue);
    }

    #[test]
    fn test_delivery_status_tagging() {
        let status = DeliveryStatus::DeliveryFailed {
            attempted: vec![ChannelKind::InteractiveWeb, ChannelKind::RichMessaging],
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["status"], "delivery_failed");
        assert!(status.is_failed());
    }

    #[test]
    fn test_interaction_builder_carries_no_text() {
        let user = Uuid::new_v4();
        let interaction = Interaction::new(user, InteractionAction::ResourceOffered)
            .with_resource("res-1")
            .with_meta("channel", ChannelKind::ShortText);
        assert_eq!(interaction.user_id, Some(user));
        assert_eq!(interaction.resource_id.as_deref(), Some("res-1"));
        assert_eq!(interaction.metadata["channel"], "short_text");
    }

    #[test]
    fn test_interaction_action_round_trip() {
        let action: InteractionAction = "delivery_failed".parse().unwrap();
        assert_eq!(action, InteractionAction::DeliveryFailed);
        assert!("nope".parse::<InteractionAction>().is_err());
    }

    #[test]
    fn test_short_text_capabilities() {
        let caps = ChannelCapabilities::short_text();
        assert_eq!(caps.max_payload_bytes, 160);
        assert!(!caps.supports_links);
        assert!(!caps.supports_interactive_buttons);
    }
}
