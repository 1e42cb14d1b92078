//! Response Composer.
//!
//! A response is a list of sections with a priority. When the rendered text
//! exceeds the channel's payload limit, sections are kept in priority order
//! (contact details, then next steps, then notices, then prose) and the first
//! one that does not fit is cut at a word boundary.

use std::sync::Arc;
use std::time::Duration;

use civicline_core::config::ComposerConfig;
use civicline_core::{
    with_timeout, ActionKind, ChannelCapabilities, ChannelKind, IntentCategory, LanguageCode,
    OutboundPayload, SpeechProvider, SuggestedAction,
};
use tracing::warn;

use crate::channel::truncate_bytes;
use crate::language::LanguageStateTracker;
use crate::matcher::ScoredResource;

const SEPARATOR: &str = "\n";
const ELLIPSIS: &str = "...";
/// Below this many free bytes a partial section is not worth appending.
const MIN_PARTIAL_BYTES: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SectionPriority {
    Contact = 0,
    NextStep = 1,
    Notice = 2,
    Description = 3,
}

#[derive(Debug, Clone, PartialEq)]
struct Section {
    priority: SectionPriority,
    text: String,
}

/// A provider-dependent part of the response that could not be produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Degradation {
    Translation,
    Speech,
}

/// What the turn wants to say, before rendering.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Resources(Vec<ScoredResource>),
    NoMatches(IntentCategory),
    /// A fixed prompt in the default language (greeting, help, clarification).
    Prompt(String),
}

/// A rendered response that fits one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundResponse {
    pub channel: ChannelKind,
    pub text: String,
    pub audio_ref: Option<String>,
    pub actions: Vec<SuggestedAction>,
    pub language: LanguageCode,
    pub resource_ids: Vec<String>,
    pub degradations: Vec<Degradation>,
    pub truncated: bool,
}

impl OutboundResponse {
    pub fn degraded(&self) -> bool {
        !self.degradations.is_empty()
    }

    pub fn payload(&self) -> OutboundPayload {
        OutboundPayload {
            text: self.text.clone(),
            audio_ref: self.audio_ref.clone(),
            actions: self.actions.clone(),
        }
    }

    fn add_degradation(&mut self, d: Degradation) {
        if !self.degradations.contains(&d) {
            self.degradations.push(d);
        }
    }
}

/// Cut `text` to `max_bytes`, preferring a word boundary, marking the cut.
pub fn truncate_words(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    if max_bytes <= ELLIPSIS.len() {
        return truncate_bytes(text, max_bytes).to_string();
    }
    let cut = truncate_bytes(text, max_bytes - ELLIPSIS.len());
    let at_boundary = text[cut.len()..].starts_with(char::is_whitespace);
    let kept = if at_boundary {
        cut
    } else {
        match cut.rfind(char::is_whitespace) {
            Some(idx) if idx > 0 => &cut[..idx],
            _ => cut,
        }
    };
    let kept = kept.trim_end_matches(|c: char| c.is_whitespace() || c == ',' || c == ':' || c == ';');
    format!("{}{}", kept, ELLIPSIS)
}

/// Keep sections in priority order within `limit` bytes.
fn fit_sections(sections: &[Section], limit: usize) -> (String, bool) {
    let mut ordered: Vec<&Section> = sections.iter().collect();
    ordered.sort_by_key(|s| s.priority);

    let mut out = String::new();
    let mut truncated = false;
    for section in ordered {
        let sep = if out.is_empty() { 0 } else { SEPARATOR.len() };
        if out.len() + sep + section.text.len() <= limit {
            if sep > 0 {
                out.push_str(SEPARATOR);
            }
            out.push_str(&section.text);
            continue;
        }
        truncated = true;
        let room = limit.saturating_sub(out.len() + sep);
        if out.is_empty() || room >= MIN_PARTIAL_BYTES {
            if sep > 0 {
                out.push_str(SEPARATOR);
            }
            out.push_str(&truncate_words(&section.text, room));
        }
        break;
    }
    (out, truncated)
}

const APOLOGIES: &[(&str, &str, &str)] = &[
    (
        "en",
        "Sorry, we could not complete your request right now. Please try again in a few minutes.",
        "You can also reach us on {channel}.",
    ),
    (
        "hi",
        "क्षमा करें, हम अभी आपका अनुरोध पूरा नहीं कर सके। कृपया कुछ मिनट बाद फिर से प्रयास करें।",
        "आप हमसे {channel} पर भी संपर्क कर सकते हैं।",
    ),
];

const FAILURE_NOTICES: &[(&str, &str)] = &[
    ("en", "We could not reach you on {channel}. Here is your answer:"),
    ("hi", "हम आपसे {channel} पर संपर्क नहीं कर सके। आपका उत्तर यह है:"),
];

fn channel_label(kind: ChannelKind, language: &LanguageCode) -> &'static str {
    match (language.as_str(), kind) {
        ("hi", ChannelKind::InteractiveWeb) => "वेब",
        ("hi", ChannelKind::Voice) => "फ़ोन कॉल",
        ("hi", ChannelKind::RichMessaging) => "मैसेजिंग ऐप",
        ("hi", ChannelKind::ShortText) => "एसएमएस",
        (_, ChannelKind::InteractiveWeb) => "the website",
        (_, ChannelKind::Voice) => "a phone call",
        (_, ChannelKind::RichMessaging) => "the messaging app",
        (_, ChannelKind::ShortText) => "SMS",
    }
}

/// Fixed apology for a turn that could not complete. Hindi or English.
pub fn apology(language: &LanguageCode, fallback: Option<ChannelKind>) -> String {
    let (code, base, suggestion) = APOLOGIES
        .iter()
        .find(|(code, _, _)| *code == language.as_str())
        .copied()
        .unwrap_or(APOLOGIES[0]);
    let label_language = LanguageCode::new(code);
    match fallback {
        Some(kind) => format!(
            "{} {}",
            base,
            suggestion.replace("{channel}", channel_label(kind, &label_language))
        ),
        None => base.to_string(),
    }
}

/// Notice prepended when re-sending after a permanent failure on `failed`.
pub fn failure_notice(language: &LanguageCode, failed: ChannelKind) -> String {
    let (code, template) = FAILURE_NOTICES
        .iter()
        .find(|(code, _)| *code == language.as_str())
        .copied()
        .unwrap_or(FAILURE_NOTICES[0]);
    template.replace("{channel}", channel_label(failed, &LanguageCode::new(code)))
}

pub const GREETING_PROMPT: &str = "Namaste! I can help you find government schemes, health services, documents and more. What do you need?";
pub const HELP_PROMPT: &str = "You can ask about health schemes, hospitals, vaccination, pension, ration, housing, education, jobs, farming, documents, complaints and emergencies. Say the topic in your own words.";
pub const LANGUAGE_CHANGED_PROMPT: &str = "Okay, I will reply in this language from now on. What do you need?";
pub const LANGUAGE_ASK_PROMPT: &str = "Which language would you like? For example: English, Hindi, Tamil, Bengali.";
pub const GOODBYE_PROMPT: &str = "Thank you for contacting us. Message again any time you need help.";

pub struct ResponseComposer {
    language: Arc<LanguageStateTracker>,
    speech: Arc<dyn SpeechProvider>,
    config: ComposerConfig,
    timeout: Duration,
}

impl ResponseComposer {
    pub fn new(
        language: Arc<LanguageStateTracker>,
        speech: Arc<dyn SpeechProvider>,
        config: ComposerConfig,
        timeout: Duration,
    ) -> Self {
        Self {
            language,
            speech,
            config,
            timeout,
        }
    }

    fn more_info_link(&self, resource_id: &str) -> String {
        format!("{}{}", self.config.more_info_base_url, resource_id)
    }

    fn sections(&self, body: &ResponseBody) -> Vec<Section> {
        match body {
            ResponseBody::Prompt(text) => vec![Section {
                priority: SectionPriority::Contact,
                text: text.clone(),
            }],
            ResponseBody::NoMatches(category) => vec![Section {
                priority: SectionPriority::Contact,
                text: format!(
                    "I could not find a {} service right now. Please try describing what you need in another way.",
                    category.as_str().replace('_', " ")
                ),
            }],
            ResponseBody::Resources(matches) => {
                let mut sections = Vec::new();
                for m in matches {
                    let r = &m.resource;
                    let mut contact = r.title.clone();
                    let mut reach = Vec::new();
                    if let Some(phone) = &r.contact.phone {
                        reach.push(format!("call {}", phone));
                    }
                    if let Some(site) = &r.contact.website {
                        reach.push(site.clone());
                    }
                    if let Some(office) = &r.contact.office_address {
                        reach.push(office.clone());
                    }
                    if !reach.is_empty() {
                        contact = format!("{}: {}", contact, reach.join(", "));
                    }
                    sections.push(Section {
                        priority: SectionPriority::Contact,
                        text: contact,
                    });

                    if m.superseded {
                        let replacement = r
                            .superseded_by
                            .as_deref()
                            .map(|s| format!(" It has been replaced by {}.", s))
                            .unwrap_or_default();
                        sections.push(Section {
                            priority: SectionPriority::Notice,
                            text: format!("Note: {} is no longer active.{}", r.title, replacement),
                        });
                    } else if !r.application_process.trim().is_empty() {
                        sections.push(Section {
                            priority: SectionPriority::NextStep,
                            text: format!("Next step: {}", r.application_process.trim()),
                        });
                    }

                    if !m.missing.is_empty() {
                        let names: Vec<String> = m
                            .missing
                            .iter()
                            .map(|a| a.as_str().replace('_', " "))
                            .collect();
                        sections.push(Section {
                            priority: SectionPriority::Notice,
                            text: format!(
                                "Eligibility not confirmed for {}: we need your {}.",
                                r.title,
                                names.join(", ")
                            ),
                        });
                    }

                    if !r.description.trim().is_empty() {
                        sections.push(Section {
                            priority: SectionPriority::Description,
                            text: r.description.trim().to_string(),
                        });
                    }
                }
                sections
            }
        }
    }

    fn actions(&self, body: &ResponseBody) -> Vec<SuggestedAction> {
        let ResponseBody::Resources(matches) = body else {
            return Vec::new();
        };
        let mut actions = Vec::new();
        for m in matches.iter().filter(|m| !m.superseded) {
            let r = &m.resource;
            if let Some(phone) = &r.contact.phone {
                actions.push(SuggestedAction {
                    label: format!("Call {}", r.title),
                    action: ActionKind::Call {
                        number: phone.clone(),
                    },
                });
            }
            if let Some(site) = &r.contact.website {
                actions.push(SuggestedAction {
                    label: format!("Open {}", r.title),
                    action: ActionKind::OpenLink { url: site.clone() },
                });
            }
        }
        actions.truncate(self.config.max_suggested_actions);
        actions
    }

    /// Render `body` in `target` language within `caps`.
    pub async fn compose(
        &self,
        body: &ResponseBody,
        target: &LanguageCode,
        channel: ChannelKind,
        caps: &ChannelCapabilities,
    ) -> OutboundResponse {
        self.compose_with_notice(body, target, channel, caps, None).await
    }

    /// As [`compose`](Self::compose), with a fixed notice placed first.
    pub async fn compose_with_notice(
        &self,
        body: &ResponseBody,
        target: &LanguageCode,
        channel: ChannelKind,
        caps: &ChannelCapabilities,
        notice: Option<&str>,
    ) -> OutboundResponse {
        let source = self.language.default_language().clone();
        let resource_ids: Vec<String> = match body {
            ResponseBody::Resources(m) => m.iter().map(|s| s.resource.id.clone()).collect(),
            _ => Vec::new(),
        };
        let mut response = OutboundResponse {
            channel,
            text: String::new(),
            audio_ref: None,
            actions: Vec::new(),
            language: target.clone(),
            resource_ids,
            degradations: Vec::new(),
            truncated: false,
        };

        let mut sections = Vec::new();
        for section in self.sections(body) {
            let translated = self.language.translate(&section.text, &source, target).await;
            if translated.degraded {
                response.add_degradation(Degradation::Translation);
            }
            sections.push(Section {
                priority: section.priority,
                text: translated.text,
            });
        }
        if response.degraded() {
            response.language = source.clone();
        }

        let mut limit = caps.max_payload_bytes;
        let mut prefix = String::new();
        if let Some(notice) = notice {
            prefix = truncate_words(notice, limit);
            limit = limit.saturating_sub(prefix.len() + SEPARATOR.len());
        }

        let link = if caps.supports_links {
            response
                .resource_ids
                .first()
                .map(|id| format!("More info: {}", self.more_info_link(id)))
                .filter(|l| l.len() + SEPARATOR.len() <= limit / 2)
        } else {
            None
        };
        let reserve = link.as_ref().map_or(0, |l| l.len() + SEPARATOR.len());

        let (mut text, truncated) = fit_sections(&sections, limit.saturating_sub(reserve));
        response.truncated = truncated;
        if let Some(link) = link {
            if text.len() + SEPARATOR.len() + link.len() <= limit {
                text.push_str(SEPARATOR);
                text.push_str(&link);
            }
        }
        if !prefix.is_empty() {
            text = if text.is_empty() {
                prefix
            } else {
                format!("{}{}{}", prefix, SEPARATOR, text)
            };
        }
        response.text = text;

        if caps.supports_interactive_buttons {
            for mut action in self.actions(body) {
                let label = self.language.translate(&action.label, &source, target).await;
                if label.degraded {
                    response.add_degradation(Degradation::Translation);
                }
                action.label = label.text;
                response.actions.push(action);
            }
        }

        if caps.supports_voice {
            match with_timeout(self.timeout, self.speech.synthesize(&response.text, &response.language)).await {
                Ok(audio_ref) => response.audio_ref = Some(audio_ref),
                Err(e) => {
                    warn!(
                        component = "speech",
                        channel = %channel,
                        error = %e,
                        "Fallback event: synthesis failed, sending text only"
                    );
                    response.add_degradation(Degradation::Speech);
                }
            }
        }

        response
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::language::tests::{DownTranslator, PrefixTranslator};
    use crate::matcher::tests::resource;
    use crate::translation::TranslationCache;
    use async_trait::async_trait;
    use civicline_core::{
        LanguageRegistry, ProfileAttribute, ProviderError, Transcript, TranslationProvider,
    };

    pub(crate) struct EchoSpeech {
        pub fail: bool,
    }

    #[async_trait]
    impl SpeechProvider for EchoSpeech {
        async fn transcribe(
            &self,
            _audio: &[u8],
            _hint: &LanguageCode,
        ) -> Result<Transcript, ProviderError> {
            if self.fail {
                return Err(ProviderError::Unavailable("asr down".into()));
            }
            Ok(Transcript {
                text: "pension".into(),
                confidence: 0.9,
            })
        }

        async fn synthesize(&self, text: &str, language: &LanguageCode) -> Result<String, ProviderError> {
            if self.fail {
                return Err(ProviderError::Unavailable("tts down".into()));
            }
            Ok(format!("audio://{}/{}", language, text.len()))
        }
    }

    fn composer(translator: Arc<dyn TranslationProvider>, speech_fails: bool) -> ResponseComposer {
        let tracker = Arc::new(LanguageStateTracker::new(
            Arc::new(LanguageRegistry::default()),
            Arc::new(TranslationCache::new(Duration::from_secs(60), 100)),
            translator,
            0.6,
            Duration::from_millis(100),
        ));
        ResponseComposer::new(
            tracker,
            Arc::new(EchoSpeech { fail: speech_fails }),
            ComposerConfig::default(),
            Duration::from_millis(100),
        )
    }

    fn scored(id: &str) -> ScoredResource {
        let mut r = resource(id, "healthcare_scheme", 1);
        r.title = format!("Health Scheme {}", id);
        r.description = "This scheme provides cashless treatment up to five lakh rupees per family per year at empanelled public and private hospitals across the country, covering hospitalisation, surgery and follow-up care.".into();
        r.application_process = "Visit the nearest Common Service Centre with your Aadhaar card and ration card.".into();
        r.contact.website = Some("https://health.example.gov".into());
        ScoredResource {
            resource: r,
            completeness: 1.0,
            category_strength: 1.0,
            missing: Vec::new(),
            superseded: false,
        }
    }

    fn en() -> LanguageCode {
        LanguageCode::new("en")
    }

    #[test]
    fn test_truncate_words_avoids_mid_word() {
        let out = truncate_words("call the health helpline today", 20);
        assert!(out.len() <= 20);
        assert_eq!(out, "call the health...");
    }

    #[test]
    fn test_truncate_words_no_whitespace_cuts_hard() {
        let out = truncate_words("abcdefghijklmnopqrstuvwxyz", 10);
        assert_eq!(out, "abcdefg...");
    }

    #[test]
    fn test_truncate_words_fits_untouched() {
        assert_eq!(truncate_words("short text", 160), "short text");
    }

    #[tokio::test]
    async fn test_short_text_contact_first_within_limit() {
        let c = composer(Arc::new(PrefixTranslator::new()), false);
        let body = ResponseBody::Resources(vec![scored("a"), scored("b")]);
        let caps = ChannelCapabilities::short_text();
        let out = c.compose(&body, &en(), ChannelKind::ShortText, &caps).await;

        assert!(out.text.len() <= 160, "len {}", out.text.len());
        assert!(out.text.starts_with("Health Scheme a: call 104"));
        assert!(out.truncated);
        assert!(!out.text.contains("More info"));
        assert!(out.actions.is_empty());
        assert!(out.audio_ref.is_none());
    }

    #[tokio::test]
    async fn test_web_includes_everything_link_and_actions() {
        let c = composer(Arc::new(PrefixTranslator::new()), false);
        let mut first = scored("a");
        first.missing = vec![ProfileAttribute::Age];
        let body = ResponseBody::Resources(vec![first]);
        let caps = ChannelCapabilities::interactive_web();
        let out = c.compose(&body, &en(), ChannelKind::InteractiveWeb, &caps).await;

        assert!(!out.truncated);
        assert!(out.text.contains("Next step:"));
        assert!(out.text.contains("Eligibility not confirmed"));
        assert!(out.text.contains("cashless treatment"));
        assert!(out.text.ends_with("More info: https://civicline.example.org/r/a"));
        assert_eq!(out.actions.len(), 2);
        assert_eq!(out.resource_ids, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_actions_capped() {
        let c = composer(Arc::new(PrefixTranslator::new()), false);
        let body = ResponseBody::Resources(vec![scored("a"), scored("b"), scored("c")]);
        let caps = ChannelCapabilities::interactive_web();
        let out = c.compose(&body, &en(), ChannelKind::InteractiveWeb, &caps).await;
        assert_eq!(out.actions.len(), 3);
    }

    #[tokio::test]
    async fn test_translated_to_target() {
        let c = composer(Arc::new(PrefixTranslator::new()), false);
        let body = ResponseBody::Prompt(GREETING_PROMPT.to_string());
        let hi = LanguageCode::new("hi");
        let out = c
            .compose(&body, &hi, ChannelKind::InteractiveWeb, &ChannelCapabilities::interactive_web())
            .await;
        assert!(out.text.starts_with("[hi] Namaste!"));
        assert_eq!(out.language, hi);
        assert!(!out.degraded());
    }

    #[tokio::test]
    async fn test_translation_outage_marks_degraded_original_text() {
        let c = composer(Arc::new(DownTranslator), false);
        let body = ResponseBody::Prompt(HELP_PROMPT.to_string());
        let out = c
            .compose(&body, &LanguageCode::new("hi"), ChannelKind::InteractiveWeb, &ChannelCapabilities::interactive_web())
            .await;
        assert!(out.degraded());
        assert_eq!(out.degradations, vec![Degradation::Translation]);
        assert_eq!(out.text, HELP_PROMPT);
        assert_eq!(out.language, en());
    }

    #[tokio::test]
    async fn test_voice_attaches_audio() {
        let c = composer(Arc::new(PrefixTranslator::new()), false);
        let body = ResponseBody::Prompt(GREETING_PROMPT.to_string());
        let out = c
            .compose(&body, &en(), ChannelKind::Voice, &ChannelCapabilities::voice())
            .await;
        assert!(out.audio_ref.as_deref().unwrap().starts_with("audio://en/"));
    }

    #[tokio::test]
    async fn test_voice_synthesis_failure_degrades_to_text() {
        let c = composer(Arc::new(PrefixTranslator::new()), true);
        let body = ResponseBody::Prompt(GREETING_PROMPT.to_string());
        let out = c
            .compose(&body, &en(), ChannelKind::Voice, &ChannelCapabilities::voice())
            .await;
        assert!(out.audio_ref.is_none());
        assert_eq!(out.text, GREETING_PROMPT);
        assert_eq!(out.degradations, vec![Degradation::Speech]);
    }

    #[tokio::test]
    async fn test_superseded_notice() {
        let c = composer(Arc::new(PrefixTranslator::new()), false);
        let mut old = scored("old");
        old.superseded = true;
        old.resource.active = false;
        old.resource.superseded_by = Some("Health Scheme new".into());
        let out = c
            .compose(
                &ResponseBody::Resources(vec![old]),
                &en(),
                ChannelKind::InteractiveWeb,
                &ChannelCapabilities::interactive_web(),
            )
            .await;
        assert!(out.text.contains("no longer active"));
        assert!(out.text.contains("replaced by Health Scheme new"));
        assert!(out.actions.is_empty());
    }

    #[tokio::test]
    async fn test_notice_placed_first() {
        let c = composer(Arc::new(PrefixTranslator::new()), false);
        let notice = failure_notice(&en(), ChannelKind::RichMessaging);
        let out = c
            .compose_with_notice(
                &ResponseBody::Resources(vec![scored("a")]),
                &en(),
                ChannelKind::ShortText,
                &ChannelCapabilities::short_text(),
                Some(&notice),
            )
            .await;
        assert!(out.text.starts_with("We could not reach you on the messaging app."));
        assert!(out.text.len() <= 160);
    }

    #[test]
    fn test_apology_table() {
        let en_text = apology(&en(), Some(ChannelKind::ShortText));
        assert!(en_text.starts_with("Sorry"));
        assert!(en_text.ends_with("You can also reach us on SMS."));

        let hi_text = apology(&LanguageCode::new("hi"), None);
        assert!(hi_text.starts_with("क्षमा करें"));

        let ta_text = apology(&LanguageCode::new("ta"), None);
        assert!(ta_text.starts_with("Sorry"));
    }
}
