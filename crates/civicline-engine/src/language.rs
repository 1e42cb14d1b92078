//! Language State Tracker.
//!
//! Resolves the effective language of each turn and translates text through
//! the shared [`TranslationCache`]. Translation never fails: provider errors,
//! timeouts and low-confidence results return the original text marked
//! `degraded`.

use std::sync::Arc;
use std::time::Duration;

use civicline_core::{
    with_timeout, Conversation, LanguageCode, LanguageRegistry, LanguageSource, ProviderError,
    TranslationProvider, User,
};
use tracing::{debug, warn};

use crate::translation::TranslationCache;

/// Language information that arrived with an inbound message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LanguageHint {
    pub code: Option<String>,
    /// Stated by the user rather than guessed by the transport.
    pub explicit: bool,
}

impl LanguageHint {
    pub fn explicit(code: &str) -> Self {
        Self {
            code: Some(code.to_string()),
            explicit: true,
        }
    }

    pub fn inferred(code: &str) -> Self {
        Self {
            code: Some(code.to_string()),
            explicit: false,
        }
    }

    pub fn none() -> Self {
        Self::default()
    }
}

/// Text in a known language, flagged when translation was skipped on failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslatedText {
    pub text: String,
    pub language: LanguageCode,
    pub degraded: bool,
}

pub struct LanguageStateTracker {
    registry: Arc<LanguageRegistry>,
    cache: Arc<TranslationCache>,
    provider: Arc<dyn TranslationProvider>,
    confidence_threshold: f32,
    timeout: Duration,
}

impl LanguageStateTracker {
    pub fn new(
        registry: Arc<LanguageRegistry>,
        cache: Arc<TranslationCache>,
        provider: Arc<dyn TranslationProvider>,
        confidence_threshold: f32,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            cache,
            provider,
            confidence_threshold,
            timeout,
        }
    }

    pub fn registry(&self) -> &LanguageRegistry {
        &self.registry
    }

    pub fn default_language(&self) -> &LanguageCode {
        self.registry.default_language()
    }

    /// Effective language for a turn.
    ///
    /// Precedence: explicit hint, the conversation's negotiated language,
    /// the user's stored preference, an inferred transport hint, the system
    /// default. Unsupported codes are skipped at every level.
    pub fn resolve_language(
        &self,
        conversation: Option<&Conversation>,
        user: Option<&User>,
        hint: &LanguageHint,
    ) -> (LanguageCode, LanguageSource) {
        let hinted = hint.code.as_deref().and_then(|raw| {
            let code = self.registry.lookup(raw);
            if code.is_none() {
                debug!(hint = raw, "Ignoring unsupported language hint");
            }
            code
        });

        if hint.explicit {
            if let Some(code) = hinted.clone() {
                return (code, LanguageSource::Explicit);
            }
        }

        if let Some(conv) = conversation {
            if conv.language.source != LanguageSource::SystemDefault
                && self.registry.is_supported(&conv.language.resolved)
            {
                return (conv.language.resolved.clone(), LanguageSource::Negotiated);
            }
        }

        if let Some(pref) = user.and_then(|u| u.preferred_language.as_ref()) {
            if self.registry.is_supported(pref) {
                return (pref.clone(), LanguageSource::UserPreference);
            }
        }

        if let Some(code) = hinted {
            return (code, LanguageSource::Inferred);
        }

        (
            self.registry.default_language().clone(),
            LanguageSource::SystemDefault,
        )
    }

    /// Translate `text` from `source` to `target`, consulting the cache first.
    pub async fn translate(
        &self,
        text: &str,
        source: &LanguageCode,
        target: &LanguageCode,
    ) -> TranslatedText {
        if source == target || text.trim().is_empty() {
            return TranslatedText {
                text: text.to_string(),
                language: target.clone(),
                degraded: false,
            };
        }

        if let Some(cached) = self.cache.get(text, source, target) {
            return TranslatedText {
                text: cached.to_string(),
                language: target.clone(),
                degraded: false,
            };
        }

        let result = with_timeout(self.timeout, self.provider.translate(text, source, target))
            .await
            .and_then(|t| {
                if t.confidence < self.confidence_threshold {
                    Err(ProviderError::LowConfidence(t.confidence))
                } else {
                    Ok(t)
                }
            });

        match result {
            Ok(translation) => {
                let value = self
                    .cache
                    .insert_if_absent(text, source, target, &translation.text);
                TranslatedText {
                    text: value.to_string(),
                    language: target.clone(),
                    degraded: false,
                }
            }
            Err(e) => {
                warn!(
                    component = "translation",
                    source_language = %source,
                    target_language = %target,
                    error = %e,
                    "Fallback event: returning untranslated text"
                );
                TranslatedText {
                    text: text.to_string(),
                    language: source.clone(),
                    degraded: true,
                }
            }
        }
    }
}
