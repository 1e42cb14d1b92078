pub mod config;
pub mod error;
pub mod language;
pub mod providers;
pub mod store;
pub mod types;

pub use config::CivicConfig;
pub use error::{CivicError, Result};
pub use language::LanguageRegistry;
pub use providers::{
    with_timeout, CatalogProvider, DeliveryError, DeliveryReceipt, IntentCandidate,
    IntentClassifier, MessagingGateway, ProviderError, SpeechProvider, Transcript, Translation,
    TranslationProvider,
};
pub use store::ConversationStore;
pub use types::*;
