use std::collections::BTreeMap;

use crate::config::LanguageConfig;
use crate::types::LanguageCode;

/// Supported languages, `code -> display name`.
///
/// Built once at startup and shared read-only.
#[derive(Debug, Clone)]
pub struct LanguageRegistry {
    languages: BTreeMap<LanguageCode, String>,
    default: LanguageCode,
}

impl LanguageRegistry {
    pub fn new(
        languages: impl IntoIterator<Item = (LanguageCode, String)>,
        default: LanguageCode,
    ) -> Self {
        let mut languages: BTreeMap<LanguageCode, String> = languages.into_iter().collect();
        languages
            .entry(default.clone())
            .or_insert_with(|| default.to_string());
        Self { languages, default }
    }

    pub fn from_config(config: &LanguageConfig) -> Self {
        Self::new(
            config
                .supported
                .iter()
                .map(|(code, name)| (LanguageCode::new(code), name.clone())),
            LanguageCode::new(&config.default_language),
        )
    }

    pub fn default_language(&self) -> &LanguageCode {
        &self.default
    }

    pub fn is_supported(&self, code: &LanguageCode) -> bool {
        self.languages.contains_key(code)
    }

    pub fn display_name(&self, code: &LanguageCode) -> Option<&str> {
        self.languages.get(code).map(String::as_str)
    }

    /// Parse a raw hint such as `"hi-IN"` or `"Hindi"` into a supported code.
    pub fn lookup(&self, raw: &str) -> Option<LanguageCode> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        let primary = raw
            .split(['-', '_'])
            .next()
            .unwrap_or(raw);
        let code = LanguageCode::new(primary);
        if self.is_supported(&code) {
            return Some(code);
        }
        self.languages
            .iter()
            .find(|(_, name)| name.eq_ignore_ascii_case(raw))
            .map(|(code, _)| code.clone())
    }

    pub fn codes(&self) -> impl Iterator<Item = &LanguageCode> {
        self.languages.keys()
    }

    pub fn len(&self) -> usize {
        self.languages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.languages.is_empty()
    }
}

impl Default for LanguageRegistry {
    fn default() -> Self {
        Self::from_config(&LanguageConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry_languages() {
        let registry = LanguageRegistry::default();
        assert_eq!(registry.default_language().as_str(), "en");
        assert!(registry.is_supported(&LanguageCode::new("hi")));
        assert!(registry.is_supported(&LanguageCode::new("ta")));
        assert_eq!(registry.len(), 12);
        assert_eq!(registry.display_name(&LanguageCode::new("bn")), Some("Bengali"));
    }

    #[test]
    fn test_lookup_region_subtag_and_name() {
        let registry = LanguageRegistry::default();
        assert_eq!(registry.lookup("hi-IN"), Some(LanguageCode::new("hi")));
        assert_eq!(registry.lookup("HI"), Some(LanguageCode::new("hi")));
        assert_eq!(registry.lookup("hindi"), Some(LanguageCode::new("hi")));
        assert_eq!(registry.lookup("fr"), None);
        assert_eq!(registry.lookup("  "), None);
    }

    #[test]
    fn test_default_always_registered() {
        let registry = LanguageRegistry::new(
            vec![(LanguageCode::new("hi"), "Hindi".to_string())],
            LanguageCode::new("en"),
        );
        assert!(registry.is_supported(&LanguageCode::new("en")));
        assert_eq!(registry.len(), 2);
    }
}
