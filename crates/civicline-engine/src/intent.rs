//! Intent Dispatcher and the built-in keyword classifier.
//!
//! The primary classifier is consulted first. When its best supported
//! candidate is below T1 (or it fails) the secondary classifier is asked
//! with the utterance translated to the default language. The better of the
//! two tops is accepted if it reaches T2; anything else is unknown.

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use civicline_core::{
    with_timeout, IntentCandidate, IntentCategory, IntentClassifier, LanguageCode,
    ProfileAttribute, ProviderError, UserProfile,
};
use regex::Regex;
use tracing::{debug, warn};

use crate::language::LanguageStateTracker;

/// What the session does with a recognized intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentHandler {
    ResourceLookup(IntentCategory),
    Greeting,
    Help,
    ChangeLanguage,
    EndConversation,
}

impl IntentHandler {
    pub fn for_category(category: IntentCategory) -> Self {
        match category {
            IntentCategory::Greeting => IntentHandler::Greeting,
            IntentCategory::Help => IntentHandler::Help,
            IntentCategory::ChangeLanguage => IntentHandler::ChangeLanguage,
            IntentCategory::EndConversation => IntentHandler::EndConversation,
            resource => IntentHandler::ResourceLookup(resource),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecognizedIntent {
    pub category: IntentCategory,
    pub handler: IntentHandler,
    pub confidence: f32,
    pub slots: BTreeMap<String, String>,
    /// Lowercased content words of the utterance, for category matching.
    pub keywords: Vec<String>,
    pub from_secondary: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IntentOutcome {
    Recognized(RecognizedIntent),
    /// Not an error: the session answers with a clarification prompt.
    Unknown { best_confidence: f32 },
}

const CLARIFICATION_TEMPLATES: [&str; 3] = [
    "Sorry, I did not understand. Could you tell me what kind of help you need, for example health, pension, ration or housing?",
    "Could you say that differently? You can ask about a scheme, a hospital, documents or a complaint.",
    "I am still not sure what you need. Reply HELP to see the topics I can answer, or name one service you are looking for.",
];

/// Clarification prompt for the given attempt, rotating through the fixed set.
pub fn clarification_prompt(attempt: u32) -> &'static str {
    CLARIFICATION_TEMPLATES[(attempt as usize) % CLARIFICATION_TEMPLATES.len()]
}

pub const UNHEARD_PROMPT: &str =
    "Sorry, I could not hear that clearly. Please say it again or send a text message.";

static STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "can", "how", "what", "where", "please", "find", "need", "want",
    "get", "about", "from", "this", "that", "you", "your", "are", "any", "show", "tell", "give",
    "mujhe", "kaise", "kya", "hai", "chahiye", "mera", "meri",
];

/// Content words of an utterance, lowercased and deduplicated.
pub fn extract_keywords(text: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .map(str::to_lowercase)
        .filter(|w| w.chars().count() >= 3 && !STOPWORDS.contains(&w.as_str()))
    {
        if !out.contains(&word) {
            out.push(word);
        }
    }
    out
}

/// Profile attributes stated in classifier slots.
pub fn profile_from_slots(slots: &BTreeMap<String, String>) -> UserProfile {
    let mut profile = UserProfile::default();
    for (key, raw) in slots {
        if let Ok(attribute) = key.parse::<ProfileAttribute>() {
            if let Some(value) = attribute.parse_value(raw) {
                profile.set(attribute, value);
            }
        }
    }
    profile
}

pub struct IntentDispatcher {
    primary: Arc<dyn IntentClassifier>,
    secondary: Arc<dyn IntentClassifier>,
    language: Arc<LanguageStateTracker>,
    primary_threshold: f32,
    secondary_threshold: f32,
    timeout: Duration,
}

impl IntentDispatcher {
    pub fn new(
        primary: Arc<dyn IntentClassifier>,
        secondary: Arc<dyn IntentClassifier>,
        language: Arc<LanguageStateTracker>,
        primary_threshold: f32,
        secondary_threshold: f32,
        timeout: Duration,
    ) -> Self {
        Self {
            primary,
            secondary,
            language,
            primary_threshold,
            secondary_threshold,
            timeout,
        }
    }

    async fn ask(
        &self,
        which: &'static str,
        classifier: &Arc<dyn IntentClassifier>,
        utterance: &str,
        language: &LanguageCode,
    ) -> Option<(IntentCandidate, IntentCategory)> {
        let result: Result<Vec<IntentCandidate>, ProviderError> =
            with_timeout(self.timeout, classifier.classify(utterance, language)).await;
        let mut candidates = match result {
            Ok(c) => c,
            Err(e) => {
                warn!(component = "intent", classifier = which, error = %e, "Fallback event: classifier failed");
                return None;
            }
        };
        candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        let top = candidates.into_iter().next()?;
        match top.intent.parse::<IntentCategory>() {
            Ok(category) => Some((top, category)),
            Err(_) => {
                debug!(classifier = which, label = %top.intent, "Top intent outside supported set");
                None
            }
        }
    }

    /// Classify an utterance and map it to a handler.
    pub async fn classify(&self, utterance: &str, language: &LanguageCode) -> IntentOutcome {
        let primary = self.ask("primary", &self.primary, utterance, language).await;
        let primary_conf = primary.as_ref().map_or(0.0, |(c, _)| c.confidence);

        let mut best = primary.map(|p| (p, false));
        let mut keyword_source = utterance.to_string();

        if primary_conf < self.primary_threshold {
            let default = self.language.default_language().clone();
            let translated = self.language.translate(utterance, language, &default).await;
            let secondary_language = if translated.degraded {
                language.clone()
            } else {
                default
            };
            warn!(
                component = "intent",
                primary_confidence = primary_conf,
                "Fallback event: consulting secondary classifier"
            );
            let secondary = self
                .ask("secondary", &self.secondary, &translated.text, &secondary_language)
                .await;
            if let Some(sec) = secondary {
                if sec.0.confidence > primary_conf {
                    best = Some((sec, true));
                    keyword_source = translated.text;
                }
            }
        }

        match best {
            Some(((candidate, category), from_secondary))
                if candidate.confidence >= self.secondary_threshold =>
            {
                IntentOutcome::Recognized(RecognizedIntent {
                    category,
                    handler: IntentHandler::for_category(category),
                    confidence: candidate.confidence,
                    slots: candidate.slots,
                    keywords: extract_keywords(&keyword_source),
                    from_secondary,
                })
            }
            Some(((candidate, _), _)) => IntentOutcome::Unknown {
                best_confidence: candidate.confidence,
            },
            None => IntentOutcome::Unknown {
                best_confidence: 0.0,
            },
        }
    }
}

// =============================================================================
// Keyword classifier
// =============================================================================

struct CategoryPatterns {
    category: IntentCategory,
    patterns: Vec<Regex>,
}

static CATEGORY_PATTERNS: LazyLock<Vec<CategoryPatterns>> = LazyLock::new(|| {
    let mk = |category: IntentCategory, pats: &[&str]| CategoryPatterns {
        category,
        patterns: pats
            .iter()
            .map(|p| Regex::new(p).expect("Invalid intent regex"))
            .collect(),
    };

    vec![
        mk(IntentCategory::HealthcareScheme, &[
            r"(?i)\bhealth\s*care\b",
            r"(?i)\bhealth\s+(?:scheme|insurance|card|cover)",
            r"(?i)\bayushman\b",
            r"(?i)\bmedical\s+(?:scheme|insurance|help)",
            r"स्वास्थ्य",
            r"आयुष्मान",
            r"इलाज",
        ]),
        mk(IntentCategory::HealthFacility, &[
            r"(?i)\bhospital",
            r"(?i)\bclinic",
            r"(?i)\bdoctor",
            r"(?i)\b(?:phc|chc)\b",
            r"(?i)\baspatal\b",
            r"अस्पताल",
            r"डॉक्टर",
        ]),
        mk(IntentCategory::Vaccination, &[
            r"(?i)\bvaccin",
            r"(?i)\bimmuni[sz]",
            r"(?i)\btika(?:karan)?\b",
            r"टीका",
        ]),
        mk(IntentCategory::MaternalHealth, &[
            r"(?i)\bpregnan",
            r"(?i)\bmaternity\b",
            r"(?i)\b(?:pre|ante)natal\b",
            r"(?i)\bgarbh",
            r"गर्भ",
        ]),
        mk(IntentCategory::MentalHealth, &[
            r"(?i)\bmental\s+health\b",
            r"(?i)\bdepress",
            r"(?i)\banxiety\b",
            r"(?i)\bcounsel",
            r"मानसिक",
        ]),
        mk(IntentCategory::FoodSecurity, &[
            r"(?i)\bration\b",
            r"(?i)\bfood\b",
            r"(?i)\bpds\b",
            r"(?i)\banaj\b",
            r"राशन",
            r"अनाज",
        ]),
        mk(IntentCategory::Pension, &[
            r"(?i)\bpension",
            r"(?i)\bold\s+age\b",
            r"(?i)\bvridh",
            r"पेंशन",
        ]),
        mk(IntentCategory::Housing, &[
            r"(?i)\bhous(?:e|ing)\b",
            r"(?i)\bawas\b",
            r"(?i)\bshelter\b",
            r"आवास",
            r"मकान",
        ]),
        mk(IntentCategory::Education, &[
            r"(?i)\bschool",
            r"(?i)\bscholarship",
            r"(?i)\beducation\b",
            r"(?i)\bshiksha\b",
            r"शिक्षा",
            r"छात्रवृत्ति",
        ]),
        mk(IntentCategory::Employment, &[
            r"(?i)\bjobs?\b",
            r"(?i)\bemployment\b",
            r"(?i)\bnaukri\b",
            r"(?i)\brozgar\b",
            r"(?i)\bmgnrega\b",
            r"नौकरी",
            r"रोजगार",
        ]),
        mk(IntentCategory::Agriculture, &[
            r"(?i)\bfarm",
            r"(?i)\bcrops?\b",
            r"(?i)\bkisan\b",
            r"(?i)\bfertili[sz]er",
            r"किसान",
            r"फसल",
        ]),
        mk(IntentCategory::DisabilitySupport, &[
            r"(?i)\bdisab",
            r"(?i)\bdivyang",
            r"(?i)\bwheelchair\b",
            r"दिव्यांग",
            r"विकलांग",
        ]),
        mk(IntentCategory::WomenWelfare, &[
            r"(?i)\bwom[ae]n\b",
            r"(?i)\bwidow",
            r"(?i)\bmahila\b",
            r"(?i)\bgirl\s+child\b",
            r"महिला",
        ]),
        mk(IntentCategory::IdentityDocuments, &[
            r"(?i)\baadh?aar\b",
            r"(?i)\bvoter\s+id\b",
            r"(?i)\bpan\s+card\b",
            r"(?i)\bbirth\s+certificate\b",
            r"(?i)\bpassport\b",
            r"आधार",
        ]),
        mk(IntentCategory::Taxation, &[
            r"(?i)\btax(?:es)?\b",
            r"(?i)\bgst\b",
            r"(?i)\bitr\b",
        ]),
        mk(IntentCategory::Utilities, &[
            r"(?i)\belectricity\b",
            r"(?i)\bwater\s+(?:supply|connection|bill)\b",
            r"(?i)\bgas\s+connection\b",
            r"(?i)\bbijli\b",
            r"बिजली",
        ]),
        mk(IntentCategory::DisasterRelief, &[
            r"(?i)\bflood",
            r"(?i)\bcyclone\b",
            r"(?i)\bdrought\b",
            r"(?i)\bdisaster\b",
            r"(?i)\bearthquake\b",
            r"बाढ़",
        ]),
        mk(IntentCategory::LegalAid, &[
            r"(?i)\blawyer\b",
            r"(?i)\blegal\b",
            r"(?i)\bcourt\b",
            r"(?i)\bvakil\b",
            r"वकील",
        ]),
        mk(IntentCategory::Grievance, &[
            r"(?i)\bcomplain",
            r"(?i)\bgrievance\b",
            r"(?i)\bshikayat\b",
            r"शिकायत",
        ]),
        mk(IntentCategory::Transport, &[
            r"(?i)\bbus\b",
            r"(?i)\btrain\b",
            r"(?i)\bdriving\s+licen[cs]e\b",
            r"(?i)\btransport\b",
        ]),
        mk(IntentCategory::Emergency, &[
            r"(?i)\bemergency\b",
            r"(?i)\bambulance\b",
            r"(?i)\bpolice\b",
            r"(?i)\bfire\b",
            r"(?i)\b112\b",
            r"आपात",
        ]),
        mk(IntentCategory::Greeting, &[
            r"(?i)^\s*(?:hi|hello|hey|namaste|namaskar|good\s+(?:morning|evening))\b",
            r"^\s*नमस्ते",
        ]),
        mk(IntentCategory::Help, &[
            r"(?i)^\s*help\b",
            r"(?i)\bwhat\s+can\s+you\s+do\b",
            r"(?i)\bmadad\b",
            r"मदद",
        ]),
        mk(IntentCategory::ChangeLanguage, &[
            r"(?i)\blanguage\b",
            r"(?i)\bbhasha\b",
            r"(?i)\b(?:speak|talk|reply)\s+in\b",
            r"भाषा",
        ]),
        mk(IntentCategory::EndConversation, &[
            r"(?i)^\s*(?:bye|goodbye|stop|quit|exit|end)\s*$",
            r"(?i)\bthat'?s\s+all\b",
            r"(?i)^\s*(?:thanks?|thank\s+you|dhanyavaad?)\s*,?\s*bye\b",
        ]),
    ]
});

static AGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:age[d]?\s*(?:is\s*)?(\d{1,3})|(\d{1,3})\s*(?:years?|yrs?|saal)(?:\s+old)?)\b")
        .expect("Invalid age regex")
});

static INCOME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bincome\s*(?:is|of)?\s*(?:rs\.?|inr|₹)?\s*(\d+(?:,\d+)*)").expect("Invalid income regex")
});

static BPL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:bpl|below\s+poverty\s+line)\b").expect("Invalid BPL regex"));

static LANGUAGE_NAMES: &[(&str, &str)] = &[
    ("english", "en"),
    ("hindi", "hi"),
    ("हिंदी", "hi"),
    ("हिन्दी", "hi"),
    ("bengali", "bn"),
    ("bangla", "bn"),
    ("tamil", "ta"),
    ("telugu", "te"),
    ("marathi", "mr"),
    ("gujarati", "gu"),
    ("kannada", "kn"),
    ("malayalam", "ml"),
    ("punjabi", "pa"),
    ("odia", "or"),
    ("urdu", "ur"),
];

/// Regex classifier over English, romanized Hindi and Devanagari keywords.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeywordClassifier;

impl KeywordClassifier {
    pub fn new() -> Self {
        Self
    }

    fn slots(utterance: &str) -> BTreeMap<String, String> {
        let mut slots = BTreeMap::new();
        if let Some(caps) = AGE_RE.captures(utterance) {
            if let Some(m) = caps.get(1).or_else(|| caps.get(2)) {
                slots.insert("age".to_string(), m.as_str().to_string());
            }
        }
        if let Some(caps) = INCOME_RE.captures(utterance) {
            slots.insert("annual_income".to_string(), caps[1].to_string());
        }
        if BPL_RE.is_match(utterance) {
            slots.insert("below_poverty_line".to_string(), "yes".to_string());
        }
        let lower = utterance.to_lowercase();
        if let Some((_, code)) = LANGUAGE_NAMES.iter().find(|(name, _)| lower.contains(name)) {
            slots.insert("language".to_string(), code.to_string());
        }
        slots
    }

    /// Candidates by pattern hits; one hit scores 0.75, each extra adds 0.1.
    pub fn rank(&self, utterance: &str) -> Vec<IntentCandidate> {
        let slots = Self::slots(utterance);
        let mut candidates: Vec<IntentCandidate> = CATEGORY_PATTERNS
            .iter()
            .filter_map(|cp| {
                let hits = cp.patterns.iter().filter(|p| p.is_match(utterance)).count();
                (hits > 0).then(|| IntentCandidate {
                    intent: cp.category.as_str().to_string(),
                    confidence: (0.65 + 0.1 * hits as f32).min(0.95),
                    slots: slots.clone(),
                })
            })
            .collect();

        // A bare language name is a language switch.
        if candidates.is_empty() && slots.contains_key("language") && utterance.split_whitespace().count() <= 2 {
            candidates.push(IntentCandidate {
                intent: IntentCategory::ChangeLanguage.as_str().to_string(),
                confidence: 0.8,
                slots: slots.clone(),
            });
        }

        candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        candidates
    }
}

#[async_trait]
impl IntentClassifier for KeywordClassifier {
    async fn classify(
        &self,
        utterance: &str,
        _language: &LanguageCode,
    ) -> Result<Vec<IntentCandidate>, ProviderError> {
        Ok(self.rank(utterance))
    }
}
