//! Provider wiring for the binary.
//!
//! `offline` mode needs no network: the keyword classifier handles NLU,
//! translation and speech always report unavailable, and outbound messages
//! are only logged. `http` mode talks JSON to the configured endpoints.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use civicline_core::config::{ProviderMode, ProvidersConfig};
use civicline_core::providers::parse_standard_webhook;
use civicline_core::{
    CatalogProvider, ChannelKind, CivicError, DeliveryError, DeliveryReceipt, IntentCandidate,
    IntentClassifier, LanguageCode, MessagingGateway, OutboundPayload, ProviderError, RawInbound,
    SpeechProvider, Transcript, Translation, TranslationProvider,
};
use civicline_engine::{KeywordClassifier, Providers};

/// Build the provider set for `config.mode`.
pub fn build_providers(
    config: &ProvidersConfig,
    catalog: Arc<dyn CatalogProvider>,
) -> Result<Providers, CivicError> {
    let keyword: Arc<dyn IntentClassifier> = Arc::new(KeywordClassifier::new());
    match config.mode {
        ProviderMode::Offline => {
            info!("Using offline providers");
            Ok(Providers {
                translation: Arc::new(UnavailableTranslator),
                primary_nlu: Arc::clone(&keyword),
                secondary_nlu: keyword,
                speech: Arc::new(UnavailableSpeech),
                catalog,
                gateway: Arc::new(LoggingGateway),
            })
        }
        ProviderMode::Http => {
            let endpoint = |name: &str, value: &Option<String>| {
                value
                    .as_deref()
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(|v| v.trim_end_matches('/').to_string())
                    .ok_or_else(|| {
                        CivicError::Config(format!("providers.endpoints.{} is required", name))
                    })
            };
            let client = reqwest::Client::builder()
                .timeout(config.timeout())
                .build()
                .map_err(|e| CivicError::Config(format!("Failed to build HTTP client: {}", e)))?;
            let timeout_ms = config.timeout_ms;
            let endpoints = &config.endpoints;

            info!("Using HTTP providers");
            Ok(Providers {
                translation: Arc::new(HttpTranslator {
                    http: HttpEndpoint::new(client.clone(), endpoint("translation", &endpoints.translation)?, timeout_ms),
                }),
                primary_nlu: Arc::new(HttpClassifier {
                    http: HttpEndpoint::new(client.clone(), endpoint("nlu", &endpoints.nlu)?, timeout_ms),
                }),
                secondary_nlu: keyword,
                speech: Arc::new(HttpSpeech {
                    http: HttpEndpoint::new(client.clone(), endpoint("speech", &endpoints.speech)?, timeout_ms),
                }),
                catalog,
                gateway: Arc::new(HttpGateway {
                    http: HttpEndpoint::new(client, endpoint("messaging", &endpoints.messaging)?, timeout_ms),
                }),
            })
        }
    }
}

// =============================================================================
// Offline providers
// =============================================================================

pub struct UnavailableTranslator;

#[async_trait]
impl TranslationProvider for UnavailableTranslator {
    async fn translate(
        &self,
        _text: &str,
        _source: &LanguageCode,
        _target: &LanguageCode,
    ) -> Result<Translation, ProviderError> {
        Err(ProviderError::Unavailable("translation is not configured".to_string()))
    }
}

pub struct UnavailableSpeech;

#[async_trait]
impl SpeechProvider for UnavailableSpeech {
    async fn transcribe(
        &self,
        _audio: &[u8],
        _language_hint: &LanguageCode,
    ) -> Result<Transcript, ProviderError> {
        Err(ProviderError::Unavailable("speech is not configured".to_string()))
    }

    async fn synthesize(&self, _text: &str, _language: &LanguageCode) -> Result<String, ProviderError> {
        Err(ProviderError::Unavailable("speech is not configured".to_string()))
    }
}

/// Accepts every delivery and logs its shape, never its text.
pub struct LoggingGateway;

#[async_trait]
impl MessagingGateway for LoggingGateway {
    async fn deliver(
        &self,
        channel: ChannelKind,
        recipient: &str,
        payload: &OutboundPayload,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        info!(
            channel = %channel,
            recipient,
            bytes = payload.text.len(),
            actions = payload.actions.len(),
            audio = payload.audio_ref.is_some(),
            "Outbound message"
        );
        Ok(DeliveryReceipt {
            channel,
            gateway_message_id: None,
        })
    }

    fn parse_webhook(
        &self,
        _channel: ChannelKind,
        body: &serde_json::Value,
    ) -> Result<RawInbound, ProviderError> {
        parse_standard_webhook(body)
    }
}

// =============================================================================
// HTTP providers
// =============================================================================

struct HttpEndpoint {
    client: reqwest::Client,
    base: String,
    timeout_ms: u64,
}

impl HttpEndpoint {
    fn new(client: reqwest::Client, base: String, timeout_ms: u64) -> Self {
        Self {
            client,
            base,
            timeout_ms,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path)
    }

    fn provider_error(&self, err: reqwest::Error) -> ProviderError {
        if err.is_timeout() {
            ProviderError::Timeout(self.timeout_ms)
        } else if err.is_decode() {
            ProviderError::InvalidResponse(err.to_string())
        } else {
            ProviderError::Unavailable(err.to_string())
        }
    }

    async fn post_json<B, R>(&self, path: &str, body: &B) -> Result<R, ProviderError>
    where
        B: Serialize + ?Sized,
        R: serde::de::DeserializeOwned,
    {
        let resp = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(|e| self.provider_error(e))?;
        if !resp.status().is_success() {
            let status = resp.status();
            return Err(ProviderError::Unavailable(format!("{} returned {}", path, status)));
        }
        resp.json::<R>().await.map_err(|e| self.provider_error(e))
    }
}

pub struct HttpTranslator {
    http: HttpEndpoint,
}

#[derive(Serialize)]
struct TranslateRequest<'a> {
    text: &'a str,
    source: &'a str,
    target: &'a str,
}

#[async_trait]
impl TranslationProvider for HttpTranslator {
    async fn translate(
        &self,
        text: &str,
        source: &LanguageCode,
        target: &LanguageCode,
    ) -> Result<Translation, ProviderError> {
        let request = TranslateRequest {
            text,
            source: source.as_str(),
            target: target.as_str(),
        };
        self.http.post_json("translate", &request).await
    }
}

pub struct HttpClassifier {
    http: HttpEndpoint,
}

#[derive(Serialize)]
struct ClassifyRequest<'a> {
    utterance: &'a str,
    language: &'a str,
}

#[derive(Deserialize)]
struct ClassifyResponse {
    #[serde(default)]
    candidates: Vec<IntentCandidate>,
}

#[async_trait]
impl IntentClassifier for HttpClassifier {
    async fn classify(
        &self,
        utterance: &str,
        language: &LanguageCode,
    ) -> Result<Vec<IntentCandidate>, ProviderError> {
        let request = ClassifyRequest {
            utterance,
            language: language.as_str(),
        };
        let response: ClassifyResponse = self.http.post_json("classify", &request).await?;
        debug!(candidates = response.candidates.len(), "NLU response");
        Ok(response.candidates)
    }
}

pub struct HttpSpeech {
    http: HttpEndpoint,
}

#[derive(Serialize)]
struct SynthesizeRequest<'a> {
    text: &'a str,
    language: &'a str,
}

#[derive(Deserialize)]
struct SynthesizeResponse {
    audio_ref: String,
}

#[async_trait]
impl SpeechProvider for HttpSpeech {
    async fn transcribe(
        &self,
        audio: &[u8],
        language_hint: &LanguageCode,
    ) -> Result<Transcript, ProviderError> {
        let resp = self
            .http
            .client
            .post(self.http.url("transcribe"))
            .query(&[("language", language_hint.as_str())])
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(audio.to_vec())
            .send()
            .await
            .map_err(|e| self.http.provider_error(e))?;
        if !resp.status().is_success() {
            return Err(ProviderError::Unavailable(format!(
                "transcribe returned {}",
                resp.status()
            )));
        }
        resp.json::<Transcript>()
            .await
            .map_err(|e| self.http.provider_error(e))
    }

    async fn synthesize(&self, text: &str, language: &LanguageCode) -> Result<String, ProviderError> {
        let request = SynthesizeRequest {
            text,
            language: language.as_str(),
        };
        let response: SynthesizeResponse = self.http.post_json("synthesize", &request).await?;
        Ok(response.audio_ref)
    }
}

pub struct HttpGateway {
    http: HttpEndpoint,
}

#[derive(Serialize)]
struct SendRequest<'a> {
    channel: ChannelKind,
    recipient: &'a str,
    payload: &'a OutboundPayload,
}

#[derive(Deserialize, Default)]
struct SendResponse {
    #[serde(default)]
    message_id: Option<String>,
}

/// Client errors mean the recipient or payload is unacceptable on this
/// channel; everything else may clear up on retry.
fn delivery_error(status: reqwest::StatusCode) -> DeliveryError {
    if status.is_client_error() && status != reqwest::StatusCode::TOO_MANY_REQUESTS {
        DeliveryError::Permanent(format!("gateway returned {}", status))
    } else {
        DeliveryError::Transient(format!("gateway returned {}", status))
    }
}

#[async_trait]
impl MessagingGateway for HttpGateway {
    async fn deliver(
        &self,
        channel: ChannelKind,
        recipient: &str,
        payload: &OutboundPayload,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        let request = SendRequest {
            channel,
            recipient,
            payload,
        };
        let resp = self
            .http
            .client
            .post(self.http.url("send"))
            .json(&request)
            .send()
            .await
            .map_err(|e| DeliveryError::Transient(e.to_string()))?;
        if !resp.status().is_success() {
            let error = delivery_error(resp.status());
            warn!(channel = %channel, error = %error, "Gateway rejected message");
            return Err(error);
        }
        let body: SendResponse = resp.json().await.unwrap_or_default();
        Ok(DeliveryReceipt {
            channel,
            gateway_message_id: body.message_id,
        })
    }

    fn parse_webhook(
        &self,
        _channel: ChannelKind,
        body: &serde_json::Value,
    ) -> Result<RawInbound, ProviderError> {
        parse_standard_webhook(body)
    }

    async fn fetch_media(&self, media_ref: &str) -> Result<Vec<u8>, ProviderError> {
        let resp = self
            .http
            .client
            .get(media_ref)
            .send()
            .await
            .map_err(|e| self.http.provider_error(e))?;
        if !resp.status().is_success() {
            return Err(ProviderError::Unavailable(format!(
                "media fetch returned {}",
                resp.status()
            )));
        }
        let bytes = resp.bytes().await.map_err(|e| self.http.provider_error(e))?;
        Ok(bytes.to_vec())
    }
}

/// Interval at which the catalog file is re-read; zero disables refresh.
pub fn catalog_refresh_interval(config: &ProvidersConfig) -> Option<Duration> {
    (config.catalog_refresh_secs > 0).then(|| Duration::from_secs(config.catalog_refresh_secs))
}
