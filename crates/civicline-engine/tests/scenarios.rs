//! End-to-end turn scenarios against the public engine API.
//!
//! Every provider is a scripted fake; each test builds its own orchestrator
//! over a fresh in-memory store.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use uuid::Uuid;

use civicline_core::providers::parse_standard_webhook;
use civicline_core::{
    CatalogProvider, ChannelKind, CivicConfig, Conversation, ConversationStore, DeliveryError,
    DeliveryReceipt, DeliveryStatus, EligibilityCriterion, EligibilityRule, Interaction,
    InteractionAction, LanguageCode, MessagingGateway, OutboundPayload, ProfileAttribute,
    ProviderError, RawInbound, Resource, SpeechProvider, Transcript, Translation,
    TranslationProvider, User,
};
use civicline_engine::{
    InMemoryConversationStore, KeywordClassifier, LanguageHint, Orchestrator, Providers,
    SessionError, TurnRequest,
};

// =============================================================================
// Fakes
// =============================================================================

/// Prefixes the target language code.
struct TaggingTranslator;

#[async_trait]
impl TranslationProvider for TaggingTranslator {
    async fn translate(
        &self,
        text: &str,
        _source: &LanguageCode,
        target: &LanguageCode,
    ) -> Result<Translation, ProviderError> {
        Ok(Translation {
            text: format!("[{}] {}", target, text),
            confidence: 0.95,
        })
    }
}

struct UnavailableTranslator;

#[async_trait]
impl TranslationProvider for UnavailableTranslator {
    async fn translate(
        &self,
        _text: &str,
        _source: &LanguageCode,
        _target: &LanguageCode,
    ) -> Result<Translation, ProviderError> {
        Err(ProviderError::Unavailable("translation service down".into()))
    }
}

struct SilentSpeech;

#[async_trait]
impl SpeechProvider for SilentSpeech {
    async fn transcribe(&self, _audio: &[u8], _hint: &LanguageCode) -> Result<Transcript, ProviderError> {
        Err(ProviderError::Unavailable("no speech".into()))
    }

    async fn synthesize(&self, _text: &str, language: &LanguageCode) -> Result<String, ProviderError> {
        Ok(format!("audio://{}", language))
    }
}

struct StaticCatalog(Vec<Resource>);

#[async_trait]
impl CatalogProvider for StaticCatalog {
    async fn list_active_resources(&self, category: Option<&str>) -> Result<Vec<Resource>, ProviderError> {
        Ok(self
            .0
            .iter()
            .filter(|r| r.active && category.map_or(true, |c| r.category == c))
            .cloned()
            .collect())
    }

    async fn list_retired_resources(&self, category: Option<&str>) -> Result<Vec<Resource>, ProviderError> {
        Ok(self
            .0
            .iter()
            .filter(|r| !r.active && category.map_or(true, |c| r.category == c))
            .cloned()
            .collect())
    }
}

/// Pops one scripted outcome per delivery, succeeding once the script runs out.
#[derive(Default)]
struct ScriptedGateway {
    outcomes: Mutex<VecDeque<Result<(), DeliveryError>>>,
    sent: Mutex<Vec<(ChannelKind, OutboundPayload)>>,
}

impl ScriptedGateway {
    fn with_outcomes(outcomes: Vec<Result<(), DeliveryError>>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
            sent: Mutex::new(Vec::new()),
        }
    }

    fn attempts(&self) -> Vec<ChannelKind> {
        self.sent.lock().unwrap().iter().map(|(c, _)| *c).collect()
    }
}

#[async_trait]
impl MessagingGateway for ScriptedGateway {
    async fn deliver(
        &self,
        channel: ChannelKind,
        _recipient: &str,
        payload: &OutboundPayload,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        self.sent.lock().unwrap().push((channel, payload.clone()));
        let outcome = self.outcomes.lock().unwrap().pop_front().unwrap_or(Ok(()));
        outcome.map(|()| DeliveryReceipt {
            channel,
            gateway_message_id: None,
        })
    }

    fn parse_webhook(&self, _channel: ChannelKind, body: &serde_json::Value) -> Result<RawInbound, ProviderError> {
        parse_standard_webhook(body)
    }
}

/// Store whose conversation inserts block until released.
#[derive(Default)]
struct GatedStore {
    inner: InMemoryConversationStore,
    entered: AtomicBool,
    released: AtomicBool,
}

impl ConversationStore for GatedStore {
    fn get_user(&self, id: Uuid) -> civicline_core::Result<Option<User>> {
        self.inner.get_user(id)
    }

    fn find_user_by_contact(&self, handle: &str) -> civicline_core::Result<Option<User>> {
        self.inner.find_user_by_contact(handle)
    }

    fn upsert_user(&self, user: &User) -> civicline_core::Result<()> {
        self.inner.upsert_user(user)
    }

    fn delete_user(&self, id: Uuid) -> civicline_core::Result<bool> {
        self.inner.delete_user(id)
    }

    fn find_open_conversation(
        &self,
        user_id: Uuid,
        channel: ChannelKind,
    ) -> civicline_core::Result<Option<Conversation>> {
        self.inner.find_open_conversation(user_id, channel)
    }

    fn get_conversation(&self, id: Uuid) -> civicline_core::Result<Option<Conversation>> {
        self.inner.get_conversation(id)
    }

    fn insert_conversation(&self, conversation: &Conversation) -> civicline_core::Result<()> {
        self.entered.store(true, Ordering::SeqCst);
        while !self.released.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(1));
        }
        self.inner.insert_conversation(conversation)
    }

    fn save_conversation(&self, conversation: &Conversation) -> civicline_core::Result<()> {
        self.inner.save_conversation(conversation)
    }

    fn list_open_conversations(&self) -> civicline_core::Result<Vec<Conversation>> {
        self.inner.list_open_conversations()
    }

    fn record_interaction(&self, interaction: &Interaction) -> civicline_core::Result<()> {
        self.inner.record_interaction(interaction)
    }

    fn interactions_for_user(&self, user_id: Uuid) -> civicline_core::Result<Vec<Interaction>> {
        self.inner.interactions_for_user(user_id)
    }
}

// =============================================================================
// Helpers
// =============================================================================

const LONG_DESCRIPTION: &str = "This scheme provides cashless hospital treatment for serious illnesses \
    at empanelled public and private hospitals across the country. It covers pre-existing conditions \
    from the first day, including diagnostics, medicines, surgery and follow-up care for up to fifteen \
    days after discharge. Families enrolled through the household survey do not need to pay any premium, \
    and the card can be used in any state without registering again.";

fn health_resource(id: &str, day: u32) -> Resource {
    Resource {
        id: id.to_string(),
        title: format!("Health Cover {}", id),
        description: LONG_DESCRIPTION.to_string(),
        category: "healthcare_scheme".to_string(),
        eligibility: vec![
            EligibilityCriterion {
                attribute: ProfileAttribute::AnnualIncome,
                rule: EligibilityRule::AtMost(250_000.0),
            },
            EligibilityCriterion {
                attribute: ProfileAttribute::BelowPovertyLine,
                rule: EligibilityRule::IsTrue,
            },
        ],
        informational_only: false,
        application_process: "Bring your ration card to the district hospital help desk.".to_string(),
        contact: civicline_core::ContactInfo {
            phone: Some("14555".to_string()),
            ..Default::default()
        },
        source_reference: "health-ministry".to_string(),
        keywords: vec!["hospital".to_string(), "insurance".to_string()],
        active: true,
        superseded_by: None,
        last_updated: Utc.with_ymd_and_hms(2025, 3, day, 0, 0, 0).unwrap(),
    }
}

fn pension_resource() -> Resource {
    Resource {
        id: "old-age-pension".to_string(),
        title: "Old Age Pension".to_string(),
        description: "Monthly support for senior citizens.".to_string(),
        category: "pension".to_string(),
        eligibility: vec![EligibilityCriterion {
            attribute: ProfileAttribute::Age,
            rule: EligibilityRule::AtLeast(60.0),
        }],
        informational_only: false,
        application_process: "Apply at the block office.".to_string(),
        contact: civicline_core::ContactInfo {
            phone: Some("1800-111-555".to_string()),
            ..Default::default()
        },
        source_reference: "social-welfare".to_string(),
        keywords: Vec::new(),
        active: true,
        superseded_by: None,
        last_updated: Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap(),
    }
}

fn retired_pension_resource() -> Resource {
    let mut retired = pension_resource();
    retired.id = "old-pension-v1".to_string();
    retired.title = "Old Age Pension (2019 rules)".to_string();
    retired.eligibility = Vec::new();
    retired.active = false;
    retired.superseded_by = Some("old-age-pension".to_string());
    retired.last_updated = Utc.with_ymd_and_hms(2019, 6, 1, 0, 0, 0).unwrap();
    retired
}

fn catalog() -> Arc<StaticCatalog> {
    Arc::new(StaticCatalog(vec![
        health_resource("a", 10),
        health_resource("b", 20),
        pension_resource(),
        retired_pension_resource(),
    ]))
}

fn providers(translation: Arc<dyn TranslationProvider>, gateway: Arc<ScriptedGateway>) -> Providers {
    Providers {
        translation,
        primary_nlu: Arc::new(KeywordClassifier::new()),
        secondary_nlu: Arc::new(KeywordClassifier::new()),
        speech: Arc::new(SilentSpeech),
        catalog: catalog(),
        gateway,
    }
}

fn orchestrator_with(
    translation: Arc<dyn TranslationProvider>,
    gateway: Arc<ScriptedGateway>,
) -> (Orchestrator, Arc<InMemoryConversationStore>) {
    let store = Arc::new(InMemoryConversationStore::new());
    let orchestrator = Orchestrator::new(&CivicConfig::default(), store.clone(), providers(translation, gateway));
    (orchestrator, store)
}

fn turn(user_id: Uuid, message: &str, language: Option<&str>, channel: ChannelKind) -> TurnRequest {
    TurnRequest {
        user_id,
        message: message.to_string(),
        language: language.map(str::to_string),
        channel,
        voice_data_ref: None,
    }
}

// =============================================================================
// Scenario A: Hindi query, no eligibility data
// =============================================================================

#[tokio::test]
async fn test_scenario_a_hindi_matches_with_missing_eligibility() {
    let gateway = Arc::new(ScriptedGateway::default());
    let (orchestrator, _) = orchestrator_with(Arc::new(TaggingTranslator), gateway.clone());

    let response = orchestrator
        .process_turn(turn(
            Uuid::new_v4(),
            "स्वास्थ्य योजना खोजें",
            Some("hi"),
            ChannelKind::InteractiveWeb,
        ))
        .await
        .unwrap();

    assert_eq!(response.language, LanguageCode::new("hi"));
    assert!(!response.degraded);
    assert_eq!(response.resources.len(), 2);
    // Equal completeness: most recently updated first.
    assert_eq!(response.resources[0].id, "b");
    assert_eq!(response.resources[1].id, "a");
    for resource in &response.resources {
        assert_eq!(
            resource.missing_eligibility,
            vec!["annual_income".to_string(), "below_poverty_line".to_string()]
        );
    }
    assert!(response.response_text.starts_with("[hi] "));
    assert!(response.response_text.contains("Eligibility not confirmed"));
    assert!(response.suggested_actions.len() <= 3);
    assert!(matches!(
        response.delivery_status,
        Some(DeliveryStatus::Delivered {
            channel: ChannelKind::InteractiveWeb
        })
    ));
}

// =============================================================================
// Scenario B: 160-byte store-and-forward channel
// =============================================================================

#[tokio::test]
async fn test_scenario_b_short_text_truncates_contact_first() {
    let gateway = Arc::new(ScriptedGateway::default());
    let (orchestrator, _) = orchestrator_with(Arc::new(TaggingTranslator), gateway.clone());

    let response = orchestrator
        .process_turn(turn(Uuid::new_v4(), "health insurance card", None, ChannelKind::ShortText))
        .await
        .unwrap();

    let sent = gateway.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    let (channel, payload) = &sent[0];
    assert_eq!(*channel, ChannelKind::ShortText);
    assert!(payload.text.len() <= 160, "{} bytes", payload.text.len());
    assert_eq!(payload.text, response.response_text);
    assert!(payload.text.starts_with("Health Cover b: call 14555"));
    assert!(payload.actions.is_empty());
    assert!(!payload.text.contains("http"));

    // Every word is whole: it appears as a word of the full answer.
    let source_words: Vec<&str> = [
        "Health Cover b: call 14555",
        "Health Cover a: call 14555",
        "Next step: Bring your ration card to the district hospital help desk.",
        "Eligibility not confirmed for Health Cover b: we need your annual income, below poverty line.",
        LONG_DESCRIPTION,
    ]
    .iter()
    .flat_map(|s| s.split_whitespace())
    .collect();
    for word in payload.text.split_whitespace() {
        let word = word.trim_end_matches("...");
        if word.is_empty() {
            continue;
        }
        assert!(
            source_words
                .iter()
                .any(|w| w.trim_end_matches(['.', ',', ':']) == word.trim_end_matches(['.', ',', ':'])),
            "word cut: {:?}",
            word
        );
    }
}

// =============================================================================
// Scenario C: translation provider down mid-turn
// =============================================================================

#[tokio::test]
async fn test_scenario_c_translation_outage_degrades() {
    let gateway = Arc::new(ScriptedGateway::default());
    let (orchestrator, store) = orchestrator_with(Arc::new(UnavailableTranslator), gateway);
    let user_id = Uuid::new_v4();

    let response = orchestrator
        .process_turn(turn(user_id, "old age pension", Some("ta"), ChannelKind::InteractiveWeb))
        .await
        .unwrap();

    assert!(response.degraded);
    assert_eq!(response.language, LanguageCode::new("en"));
    assert!(response.response_text.starts_with("Old Age Pension: call 1800-111-555"));
    assert_eq!(response.resources[0].id, "old-age-pension");

    let conversation = orchestrator
        .get_conversation(response.conversation_id.unwrap())
        .unwrap();
    assert_eq!(conversation.messages.len(), 2);
    assert_eq!(conversation.language.resolved, LanguageCode::new("ta"));
    assert!(store
        .interactions_for_user(user_id)
        .unwrap()
        .iter()
        .any(|i| i.action == InteractionAction::TranslationDegraded));
}

// =============================================================================
// Scenario D: transient delivery failures
// =============================================================================

#[tokio::test]
async fn test_scenario_d_transient_failure_falls_back_once() {
    let gateway = Arc::new(ScriptedGateway::with_outcomes(vec![Err(DeliveryError::Transient(
        "gateway 503".into(),
    ))]));
    let (orchestrator, _) = orchestrator_with(Arc::new(TaggingTranslator), gateway.clone());

    let response = orchestrator
        .process_turn(turn(Uuid::new_v4(), "old age pension", None, ChannelKind::InteractiveWeb))
        .await
        .unwrap();

    assert_eq!(
        response.delivery_status,
        Some(DeliveryStatus::FellBack {
            from: ChannelKind::InteractiveWeb,
            to: ChannelKind::RichMessaging,
        })
    );
    assert!(!response.delivery_failed());
    assert_eq!(
        gateway.attempts(),
        vec![ChannelKind::InteractiveWeb, ChannelKind::RichMessaging]
    );
    // Re-rendered for the 1600-byte channel.
    let sent = gateway.sent.lock().unwrap();
    assert!(sent[1].1.text.len() <= 1600);
}

#[tokio::test]
async fn test_scenario_d_second_failure_marks_delivery_failed() {
    let gateway = Arc::new(ScriptedGateway::with_outcomes(vec![
        Err(DeliveryError::Transient("gateway 503".into())),
        Err(DeliveryError::Transient("gateway 503".into())),
    ]));
    let (orchestrator, store) = orchestrator_with(Arc::new(TaggingTranslator), gateway.clone());
    let user_id = Uuid::new_v4();

    let response = orchestrator
        .process_turn(turn(user_id, "old age pension", None, ChannelKind::InteractiveWeb))
        .await
        .unwrap();

    assert!(response.delivery_failed());
    assert_eq!(
        response.delivery_status,
        Some(DeliveryStatus::DeliveryFailed {
            attempted: vec![ChannelKind::InteractiveWeb, ChannelKind::RichMessaging],
        })
    );
    // No third attempt.
    assert_eq!(gateway.attempts().len(), 2);

    let failures: Vec<_> = store
        .interactions_for_user(user_id)
        .unwrap()
        .into_iter()
        .filter(|i| i.action == InteractionAction::DeliveryFailed)
        .collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(
        failures[0].metadata.get("attempted").map(String::as_str),
        Some("interactive_web,rich_messaging")
    );
}

// =============================================================================
// Scenario E: concurrent first contact
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_scenario_e_concurrent_create_conflicts_then_joins() {
    let store = Arc::new(GatedStore::default());
    let gateway = Arc::new(ScriptedGateway::default());
    let orchestrator = Arc::new(Orchestrator::new(
        &CivicConfig::default(),
        store.clone(),
        providers(Arc::new(TaggingTranslator), gateway),
    ));
    let user = User::new(Uuid::new_v4(), "+919800000042");
    store.upsert_user(&user).unwrap();
    let channel = ChannelKind::RichMessaging;

    // First request: blocks inside the insert while holding the create slot.
    let first = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            orchestrator
                .sessions()
                .begin_or_resume(user.id, channel, &LanguageHint::none())
                .await
        })
    };
    while !store.entered.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    // Second request for the same key is rejected.
    let second = orchestrator
        .sessions()
        .begin_or_resume(user.id, channel, &LanguageHint::none())
        .await;
    assert!(matches!(second, Err(SessionError::Conflict { .. })));

    // A joiner waits for the winner.
    let joiner = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            orchestrator
                .sessions()
                .begin_or_join(user.id, channel, &LanguageHint::none())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    store.released.store(true, Ordering::SeqCst);

    let created = first.await.unwrap().unwrap();
    let joined = joiner.await.unwrap().unwrap();
    assert!(created.created);
    assert!(!joined.created);
    assert_eq!(created.conversation_id, joined.conversation_id);
    assert_eq!(store.inner.conversation_count().unwrap(), 1);
}

#[tokio::test]
async fn test_scenario_e_concurrent_webhooks_share_one_conversation() {
    let gateway = Arc::new(ScriptedGateway::default());
    let (orchestrator, store) = orchestrator_with(Arc::new(TaggingTranslator), gateway);
    let orchestrator = Arc::new(orchestrator);
    let payload = serde_json::json!({"from": "+919800000077", "text": "pension"});

    // Seed the user so both requests resolve to the same id.
    store.upsert_user(&User::new(Uuid::new_v4(), "+919800000077")).unwrap();

    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let orchestrator = Arc::clone(&orchestrator);
            let payload = payload.clone();
            tokio::spawn(async move { orchestrator.handle_webhook(ChannelKind::ShortText, &payload).await })
        })
        .collect();

    let mut ids = Vec::new();
    for task in tasks {
        let response = task.await.unwrap().unwrap();
        ids.push(response.conversation_id.unwrap());
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);
    assert_eq!(store.conversation_count().unwrap(), 1);

    let conversation = orchestrator.get_conversation(ids[0]).unwrap();
    assert_eq!(conversation.messages.len(), 8);
    assert!(conversation
        .messages
        .windows(2)
        .all(|w| w[0].created_at < w[1].created_at));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_scenario_e_unseen_sender_webhooks_create_one_user() {
    let gateway = Arc::new(ScriptedGateway::default());
    let (orchestrator, store) = orchestrator_with(Arc::new(TaggingTranslator), gateway);
    let orchestrator = Arc::new(orchestrator);
    let payload = serde_json::json!({"from": "+919800000088", "text": "pension"});

    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let orchestrator = Arc::clone(&orchestrator);
            let payload = payload.clone();
            tokio::spawn(async move { orchestrator.handle_webhook(ChannelKind::ShortText, &payload).await })
        })
        .collect();

    let mut ids = Vec::new();
    for task in tasks {
        let response = task.await.unwrap().unwrap();
        ids.push(response.conversation_id.unwrap());
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);
    assert_eq!(store.conversation_count().unwrap(), 1);

    let user = store.find_user_by_contact("+919800000088").unwrap().unwrap();
    let conversation = orchestrator.get_conversation(ids[0]).unwrap();
    assert_eq!(conversation.user_id, user.id);
    assert_eq!(conversation.messages.len(), 8);
}

// =============================================================================
// Superseded near-matches
// =============================================================================

#[tokio::test]
async fn test_ineligible_active_resources_fall_back_to_superseded() {
    let gateway = Arc::new(ScriptedGateway::default());
    let (orchestrator, _) = orchestrator_with(Arc::new(TaggingTranslator), gateway);

    let response = orchestrator
        .process_turn(turn(Uuid::new_v4(), "pension for 30 years old", None, ChannelKind::InteractiveWeb))
        .await
        .unwrap();

    assert_eq!(response.resources.len(), 1);
    assert_eq!(response.resources[0].id, "old-pension-v1");
    assert!(response.resources[0].superseded);
}
