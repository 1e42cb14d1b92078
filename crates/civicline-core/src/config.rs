use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{CivicError, Result};
use crate::types::{ChannelCapabilities, ChannelKind};

/// Top-level configuration for civicline.
///
/// Loaded from `~/.civicline/config.toml` by default. Every section has
/// defaults, so a partial file is valid.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CivicConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub language: LanguageConfig,
    #[serde(default)]
    pub intent: IntentConfig,
    #[serde(default)]
    pub matcher: MatcherConfig,
    #[serde(default)]
    pub composer: ComposerConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
}

impl CivicConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: CivicConfig = toml::from_str(&content)?;
        info!(path = %path.display(), "Configuration loaded");
        Ok(config)
    }

    /// Load configuration, falling back to defaults if the file is missing
    /// or unparsable.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "Failed to load config, using defaults"
                );
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        info!(path = %path.display(), "Configuration saved");
        Ok(())
    }

    /// Check cross-field constraints. A failure here is fatal at startup.
    pub fn validate(&self) -> Result<()> {
        let unit = |name: &str, v: f32| {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(CivicError::Config(format!("{} must be within 0..=1, got {}", name, v)))
            }
        };
        unit("intent.primary_threshold", self.intent.primary_threshold)?;
        unit("intent.secondary_threshold", self.intent.secondary_threshold)?;
        unit(
            "language.translation_confidence_threshold",
            self.language.translation_confidence_threshold,
        )?;
        if self.intent.secondary_threshold > self.intent.primary_threshold {
            return Err(CivicError::Config(
                "intent.secondary_threshold must not exceed intent.primary_threshold".to_string(),
            ));
        }

        if !self.language.supported.contains_key(&self.language.default_language) {
            return Err(CivicError::Config(format!(
                "default language '{}' is not in language.supported",
                self.language.default_language
            )));
        }
        if self.language.cache_capacity == 0 {
            return Err(CivicError::Config("language.cache_capacity must be > 0".to_string()));
        }

        if self.session.idle_timeout_minutes == 0 {
            return Err(CivicError::Config(
                "session.idle_timeout_minutes must be > 0".to_string(),
            ));
        }
        if self.session.max_message_chars == 0 {
            return Err(CivicError::Config("session.max_message_chars must be > 0".to_string()));
        }

        for kind in ChannelKind::ALL {
            if self.channels.capabilities(kind).max_payload_bytes == 0 {
                return Err(CivicError::Config(format!(
                    "channels.{}.max_payload_bytes must be > 0",
                    kind
                )));
            }
        }
        if self.channels.default_fallback_order.is_empty() {
            return Err(CivicError::Config(
                "channels.default_fallback_order must not be empty".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for kind in &self.channels.default_fallback_order {
            if !seen.insert(*kind) {
                return Err(CivicError::Config(format!(
                    "channel '{}' appears twice in channels.default_fallback_order",
                    kind
                )));
            }
        }
        if self.channels.delivery_timeout_ms == 0 || self.providers.timeout_ms == 0 {
            return Err(CivicError::Config("provider timeouts must be > 0".to_string()));
        }

        if self.providers.mode == ProviderMode::Http {
            let endpoints = &self.providers.endpoints;
            let required = [
                ("providers.endpoints.translation", &endpoints.translation),
                ("providers.endpoints.nlu", &endpoints.nlu),
                ("providers.endpoints.speech", &endpoints.speech),
                ("providers.endpoints.messaging", &endpoints.messaging),
            ];
            for (name, value) in required {
                if value.as_deref().map_or(true, |v| v.trim().is_empty()) {
                    return Err(CivicError::Config(format!(
                        "{} is required when providers.mode = \"http\"",
                        name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Directory holding the SQLite database.
    pub data_dir: String,
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
    /// HTTP listen port.
    pub port: u16,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/.civicline/data".to_string(),
            log_level: "info".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Inactivity before an active conversation becomes idle.
    pub idle_timeout_minutes: u64,
    /// Inbound text longer than this is truncated.
    pub max_message_chars: usize,
    /// How long a conflicting create waits for the winner before giving up.
    pub join_wait_ms: u64,
    /// Interval of the background idle sweep. Zero disables it.
    pub sweep_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_minutes: 15,
            max_message_chars: 2000,
            join_wait_ms: 2000,
            sweep_interval_secs: 60,
        }
    }
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.idle_timeout_minutes as i64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LanguageConfig {
    pub default_language: String,
    /// Supported languages, `code = "Display name"`.
    pub supported: BTreeMap<String, String>,
    /// Translations below this confidence are treated as failures.
    pub translation_confidence_threshold: f32,
    pub cache_ttl_secs: u64,
    pub cache_capacity: usize,
}

impl Default for LanguageConfig {
    fn default() -> Self {
        let supported = [
            ("en", "English"),
            ("hi", "Hindi"),
            ("bn", "Bengali"),
            ("ta", "Tamil"),
            ("te", "Telugu"),
            ("mr", "Marathi"),
            ("gu", "Gujarati"),
            ("kn", "Kannada"),
            ("ml", "Malayalam"),
            ("pa", "Punjabi"),
            ("or", "Odia"),
            ("ur", "Urdu"),
        ]
        .into_iter()
        .map(|(code, name)| (code.to_string(), name.to_string()))
        .collect();

        Self {
            default_language: "en".to_string(),
            supported,
            translation_confidence_threshold: 0.6,
            cache_ttl_secs: 24 * 60 * 60,
            cache_capacity: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntentConfig {
    /// Below this the secondary classifier is consulted (T1).
    pub primary_threshold: f32,
    /// Below this the intent is unknown (T2).
    pub secondary_threshold: f32,
}

impl Default for IntentConfig {
    fn default() -> Self {
        Self {
            primary_threshold: 0.7,
            secondary_threshold: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    pub max_results: usize,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self { max_results: 3 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ComposerConfig {
    pub max_suggested_actions: usize,
    /// Resource ids are appended to this to form "more info" links.
    pub more_info_base_url: String,
}

impl Default for ComposerConfig {
    fn default() -> Self {
        Self {
            max_suggested_actions: 3,
            more_info_base_url: "https://civicline.example.org/r/".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelsConfig {
    pub interactive_web: ChannelCapabilities,
    pub voice: ChannelCapabilities,
    pub rich_messaging: ChannelCapabilities,
    pub short_text: ChannelCapabilities,
    /// Used for users without their own fallback order.
    pub default_fallback_order: Vec<ChannelKind>,
    pub delivery_timeout_ms: u64,
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            interactive_web: ChannelCapabilities::interactive_web(),
            voice: ChannelCapabilities::voice(),
            rich_messaging: ChannelCapabilities::rich_messaging(),
            short_text: ChannelCapabilities::short_text(),
            default_fallback_order: vec![
                ChannelKind::InteractiveWeb,
                ChannelKind::RichMessaging,
                ChannelKind::ShortText,
            ],
            delivery_timeout_ms: 5000,
        }
    }
}

impl ChannelsConfig {
    pub fn capabilities(&self, kind: ChannelKind) -> &ChannelCapabilities {
        match kind {
            ChannelKind::InteractiveWeb => &self.interactive_web,
            ChannelKind::Voice => &self.voice,
            ChannelKind::RichMessaging => &self.rich_messaging,
            ChannelKind::ShortText => &self.short_text,
        }
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderMode {
    /// Built-in keyword classifier; translation and speech always degrade.
    Offline,
    /// JSON-over-HTTP providers at the configured endpoints.
    Http,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderEndpoints {
    pub translation: Option<String>,
    pub nlu: Option<String>,
    pub speech: Option<String>,
    pub messaging: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    pub mode: ProviderMode,
    pub endpoints: ProviderEndpoints,
    /// Bound on every translation, NLU, speech and catalog call.
    pub timeout_ms: u64,
    /// JSON file holding the materialized catalog.
    pub catalog_path: String,
    pub catalog_refresh_secs: u64,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            mode: ProviderMode::Offline,
            endpoints: ProviderEndpoints::default(),
            timeout_ms: 3000,
            catalog_path: "~/.civicline/catalog.json".to_string(),
            catalog_refresh_secs: 3600,
        }
    }
}

impl ProvidersConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
