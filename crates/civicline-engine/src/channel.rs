//! Channel adapters.
//!
//! Each transport is a [`ChannelAdapter`] with declared capabilities. The
//! engine never branches on the channel name: composition reads the
//! capabilities and delivery goes through the adapter.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use civicline_core::config::ChannelsConfig;
use civicline_core::{
    ChannelCapabilities, ChannelKind, DeliveryError, DeliveryReceipt, MediaKind, MessageKind,
    MessagingGateway, OutboundPayload, RawInbound,
};
use tracing::{debug, warn};

use crate::language::LanguageHint;

/// Inbound event after adapter normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub sender: String,
    pub channel: ChannelKind,
    pub kind: MessageKind,
    /// Trimmed and length-capped text. Empty for pure media messages.
    pub text: String,
    pub media_ref: Option<String>,
    pub language: LanguageHint,
    pub received_at: DateTime<Utc>,
}

#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn kind(&self) -> ChannelKind;

    fn capabilities(&self) -> &ChannelCapabilities;

    fn normalize(&self, raw: RawInbound) -> InboundMessage;

    async fn deliver(
        &self,
        recipient: &str,
        payload: &OutboundPayload,
    ) -> Result<DeliveryReceipt, DeliveryError>;
}

/// Cut `text` to at most `max_bytes` bytes on a char boundary.
pub fn truncate_bytes(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

/// Drop anything the channel cannot carry. The composer already sizes text;
/// this is the last guard before the gateway.
pub fn fit_payload(payload: &OutboundPayload, caps: &ChannelCapabilities) -> OutboundPayload {
    OutboundPayload {
        text: truncate_bytes(&payload.text, caps.max_payload_bytes).to_string(),
        audio_ref: if caps.supports_voice || caps.supports_media {
            payload.audio_ref.clone()
        } else {
            None
        },
        actions: if caps.supports_interactive_buttons {
            payload.actions.clone()
        } else {
            Vec::new()
        },
    }
}

struct GatewayLink {
    gateway: Arc<dyn MessagingGateway>,
    timeout: Duration,
    max_message_chars: usize,
}

impl GatewayLink {
    async fn send(
        &self,
        kind: ChannelKind,
        recipient: &str,
        payload: OutboundPayload,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        match tokio::time::timeout(self.timeout, self.gateway.deliver(kind, recipient, &payload))
            .await
        {
            Ok(result) => result,
            Err(_) => {
                warn!(channel = %kind, timeout_ms = self.timeout.as_millis() as u64, "Delivery timed out");
                Err(DeliveryError::Transient(format!(
                    "delivery timed out after {} ms",
                    self.timeout.as_millis()
                )))
            }
        }
    }

    fn normalize(
        &self,
        kind: ChannelKind,
        caps: &ChannelCapabilities,
        raw: RawInbound,
    ) -> InboundMessage {
        let body = raw.body.trim();
        let text = truncate_chars(body, self.max_message_chars);
        if text.len() < body.len() {
            debug!(
                channel = %kind,
                max_chars = self.max_message_chars,
                dropped_bytes = body.len() - text.len(),
                "Inbound body capped"
            );
        }
        let (message_kind, media_ref) = match (raw.media_kind, raw.media_ref) {
            (Some(MediaKind::Audio), Some(r)) if caps.supports_voice || caps.supports_media => {
                (MessageKind::AudioReference, Some(r))
            }
            (Some(MediaKind::Image), Some(r)) if caps.supports_media => {
                (MessageKind::ImageReference, Some(r))
            }
            (Some(media), Some(_)) => {
                debug!(channel = %kind, media = ?media, "Dropping media the channel cannot carry");
                (MessageKind::Text, None)
            }
            _ => (MessageKind::Text, None),
        };

        InboundMessage {
            sender: raw.sender.trim().to_string(),
            channel: kind,
            kind: message_kind,
            text,
            media_ref,
            language: LanguageHint {
                code: raw.language.filter(|l| !l.trim().is_empty()),
                explicit: raw.explicit_language,
            },
            received_at: raw.received_at.unwrap_or_else(Utc::now),
        }
    }
}

// =============================================================================
// Concrete adapters
// =============================================================================

/// Browser or app session. Carries buttons, links and media.
pub struct InteractiveWebAdapter {
    caps: ChannelCapabilities,
    link: GatewayLink,
}

impl InteractiveWebAdapter {
    pub fn new(
        caps: ChannelCapabilities,
        gateway: Arc<dyn MessagingGateway>,
        timeout: Duration,
        max_message_chars: usize,
    ) -> Self {
        Self {
            caps,
            link: GatewayLink {
                gateway,
                timeout,
                max_message_chars,
            },
        }
    }
}

#[async_trait]
impl ChannelAdapter for InteractiveWebAdapter {
    fn kind(&self) -> ChannelKind {
        ChannelKind::InteractiveWeb
    }

    fn capabilities(&self) -> &ChannelCapabilities {
        &self.caps
    }

    fn normalize(&self, raw: RawInbound) -> InboundMessage {
        self.link.normalize(self.kind(), &self.caps, raw)
    }

    async fn deliver(
        &self,
        recipient: &str,
        payload: &OutboundPayload,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        self.link
            .send(self.kind(), recipient, fit_payload(payload, &self.caps))
            .await
    }
}

/// Phone call. Text is spoken; the audio reference is what the caller hears.
pub struct VoiceAdapter {
    caps: ChannelCapabilities,
    link: GatewayLink,
}

impl VoiceAdapter {
    pub fn new(
        caps: ChannelCapabilities,
        gateway: Arc<dyn MessagingGateway>,
        timeout: Duration,
        max_message_chars: usize,
    ) -> Self {
        Self {
            caps,
            link: GatewayLink {
                gateway,
                timeout,
                max_message_chars,
            },
        }
    }
}

#[async_trait]
impl ChannelAdapter for VoiceAdapter {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Voice
    }

    fn capabilities(&self) -> &ChannelCapabilities {
        &self.caps
    }

    fn normalize(&self, raw: RawInbound) -> InboundMessage {
        self.link.normalize(self.kind(), &self.caps, raw)
    }

    async fn deliver(
        &self,
        recipient: &str,
        payload: &OutboundPayload,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        let mut payload = fit_payload(payload, &self.caps);
        if payload.audio_ref.is_none() {
            debug!("Voice delivery without audio; gateway will read text aloud");
        }
        payload.actions.clear();
        self.link.send(self.kind(), recipient, payload).await
    }
}

/// Store-and-forward messaging, rich (media, buttons) or plain short text,
/// depending on the capabilities it is built with.
pub struct StoreAndForwardAdapter {
    kind: ChannelKind,
    caps: ChannelCapabilities,
    link: GatewayLink,
}

impl StoreAndForwardAdapter {
    pub fn rich(
        caps: ChannelCapabilities,
        gateway: Arc<dyn MessagingGateway>,
        timeout: Duration,
        max_message_chars: usize,
    ) -> Self {
        Self::with_kind(ChannelKind::RichMessaging, caps, gateway, timeout, max_message_chars)
    }

    pub fn short_text(
        caps: ChannelCapabilities,
        gateway: Arc<dyn MessagingGateway>,
        timeout: Duration,
        max_message_chars: usize,
    ) -> Self {
        Self::with_kind(ChannelKind::ShortText, caps, gateway, timeout, max_message_chars)
    }

    fn with_kind(
        kind: ChannelKind,
        caps: ChannelCapabilities,
        gateway: Arc<dyn MessagingGateway>,
        timeout: Duration,
        max_message_chars: usize,
    ) -> Self {
        Self {
            kind,
            caps,
            link: GatewayLink {
                gateway,
                timeout,
                max_message_chars,
            },
        }
    }
}

#[async_trait]
impl ChannelAdapter for StoreAndForwardAdapter {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    fn capabilities(&self) -> &ChannelCapabilities {
        &self.caps
    }

    fn normalize(&self, raw: RawInbound) -> InboundMessage {
        self.link.normalize(self.kind, &self.caps, raw)
    }

    async fn deliver(
        &self,
        recipient: &str,
        payload: &OutboundPayload,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        self.link
            .send(self.kind, recipient, fit_payload(payload, &self.caps))
            .await
    }
}

// =============================================================================
// Registry
// =============================================================================

/// The adapters available to the engine, keyed by channel.
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    adapters: BTreeMap<ChannelKind, Arc<dyn ChannelAdapter>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// All four standard adapters over one gateway.
    pub fn standard(
        config: &ChannelsConfig,
        gateway: Arc<dyn MessagingGateway>,
        max_message_chars: usize,
    ) -> Self {
        let timeout = config.delivery_timeout();
        let mut registry = Self::new();
        registry.register(Arc::new(InteractiveWebAdapter::new(
            config.interactive_web.clone(),
            Arc::clone(&gateway),
            timeout,
            max_message_chars,
        )));
        registry.register(Arc::new(VoiceAdapter::new(
            config.voice.clone(),
            Arc::clone(&gateway),
            timeout,
            max_message_chars,
        )));
        registry.register(Arc::new(StoreAndForwardAdapter::rich(
            config.rich_messaging.clone(),
            Arc::clone(&gateway),
            timeout,
            max_message_chars,
        )));
        registry.register(Arc::new(StoreAndForwardAdapter::short_text(
            config.short_text.clone(),
            gateway,
            timeout,
            max_message_chars,
        )));
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn ChannelAdapter>) {
        self.adapters.insert(adapter.kind(), adapter);
    }

    pub fn get(&self, kind: ChannelKind) -> Option<Arc<dyn ChannelAdapter>> {
        self.adapters.get(&kind).cloned()
    }

    pub fn contains(&self, kind: ChannelKind) -> bool {
        self.adapters.contains_key(&kind)
    }
}
