//! Contracts with external collaborators.
//!
//! Every call into a provider is asynchronous I/O and is wrapped by the
//! engine in [`with_timeout`]; an elapsed timeout is reported as
//! [`ProviderError::Timeout`] and handled like any other provider failure.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{ChannelKind, LanguageCode, MediaKind, OutboundPayload, RawInbound, Resource};

/// Failure of a speech, translation, NLU or catalog provider.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProviderError {
    #[error("provider timed out after {0} ms")]
    Timeout(u64),

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("provider confidence too low: {0:.2}")]
    LowConfidence(f32),

    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
}

/// Failure reported by the messaging gateway.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// The channel may work again shortly; try the next channel.
    #[error("transient delivery failure: {0}")]
    Transient(String),

    /// The recipient cannot be reached on this channel.
    #[error("permanent delivery failure: {0}")]
    Permanent(String),
}

impl DeliveryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DeliveryError::Transient(_))
    }
}

/// Output of the translation provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Translation {
    pub text: String,
    pub confidence: f32,
}

/// One ranked classification result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentCandidate {
    /// Intent label as reported by the classifier.
    pub intent: String,
    pub confidence: f32,
    #[serde(default)]
    pub slots: BTreeMap<String, String>,
}

/// Output of the speech-to-text provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub text: String,
    pub confidence: f32,
}

/// Gateway acknowledgement of a delivered payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub channel: ChannelKind,
    pub gateway_message_id: Option<String>,
}

#[async_trait]
pub trait TranslationProvider: Send + Sync {
    async fn translate(
        &self,
        text: &str,
        source: &LanguageCode,
        target: &LanguageCode,
    ) -> Result<Translation, ProviderError>;
}

#[async_trait]
pub trait IntentClassifier: Send + Sync {
    /// Candidates in any order; callers rank them by confidence.
    async fn classify(
        &self,
        utterance: &str,
        language: &LanguageCode,
    ) -> Result<Vec<IntentCandidate>, ProviderError>;
}

#[async_trait]
pub trait SpeechProvider: Send + Sync {
    async fn transcribe(
        &self,
        audio: &[u8],
        language_hint: &LanguageCode,
    ) -> Result<Transcript, ProviderError>;

    /// Returns a reference to the synthesized audio.
    async fn synthesize(&self, text: &str, language: &LanguageCode)
        -> Result<String, ProviderError>;
}

/// Read-only view of the materialized resource catalog.
#[async_trait]
pub trait CatalogProvider: Send + Sync {
    async fn list_active_resources(
        &self,
        category: Option<&str>,
    ) -> Result<Vec<Resource>, ProviderError>;

    /// Inactive entries, used only for "superseded by" suggestions.
    async fn list_retired_resources(
        &self,
        _category: Option<&str>,
    ) -> Result<Vec<Resource>, ProviderError> {
        Ok(Vec::new())
    }
}

#[async_trait]
pub trait MessagingGateway: Send + Sync {
    async fn deliver(
        &self,
        channel: ChannelKind,
        recipient: &str,
        payload: &OutboundPayload,
    ) -> Result<DeliveryReceipt, DeliveryError>;

    /// Parse a raw webhook body into an inbound event.
    fn parse_webhook(
        &self,
        channel: ChannelKind,
        body: &serde_json::Value,
    ) -> Result<RawInbound, ProviderError>;

    /// Download media referenced by an inbound event.
    async fn fetch_media(&self, media_ref: &str) -> Result<Vec<u8>, ProviderError> {
        Err(ProviderError::Unavailable(format!(
            "media fetch not supported for {}",
            media_ref
        )))
    }
}

/// Run a provider call with a bounded timeout.
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, ProviderError>
where
    F: Future<Output = Result<T, ProviderError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout(limit.as_millis() as u64)),
    }
}

/// Parse the JSON webhook shape shared by the built-in gateways.
///
/// Accepts `{from|sender, text|body, language?, language_selected?,
/// media_url?, media_type?}`.
pub fn parse_standard_webhook(body: &serde_json::Value) -> Result<RawInbound, ProviderError> {
    let field = |names: &[&str]| {
        names
            .iter()
            .find_map(|n| body.get(*n).and_then(|v| v.as_str()))
            .map(str::to_string)
    };

    let sender = field(&["from", "sender"])
        .ok_or_else(|| ProviderError::InvalidResponse("webhook missing sender".to_string()))?;
    let media_ref = field(&["media_url", "media_ref"]);
    let media_kind = match field(&["media_type"]).as_deref() {
        Some(t) if t.starts_with("audio") => Some(MediaKind::Audio),
        Some(t) if t.starts_with("image") => Some(MediaKind::Image),
        _ if media_ref.is_some() => Some(MediaKind::Audio),
        _ => None,
    };

    Ok(RawInbound {
        sender,
        body: field(&["text", "body"]).unwrap_or_default(),
        language: field(&["language", "lang"]),
        explicit_language: body
            .get("language_selected")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        media_ref,
        media_kind,
        received_at: Some(chrono::Utc::now()),
    })
}
