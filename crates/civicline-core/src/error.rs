use thiserror::Error;
use uuid::Uuid;

/// Top-level error type for civicline.
///
/// Subsystem crates define their own error types and implement
/// `From<CivicError>` so that storage and configuration failures propagate
/// with `?` across crate boundaries. Provider failures never surface here:
/// they are converted to degraded results inside the engine.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CivicError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Stale write for conversation {id}: expected version {expected}, found {found}")]
    StaleWrite { id: Uuid, expected: u64, found: u64 },

    #[error("Append-only violation for conversation {0}: stored messages were modified")]
    AppendOnly(Uuid),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<toml::de::Error> for CivicError {
    fn from(err: toml::de::Error) -> Self {
        CivicError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for CivicError {
    fn from(err: toml::ser::Error) -> Self {
        CivicError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for CivicError {
    fn from(err: serde_json::Error) -> Self {
        CivicError::Serialization(err.to_string())
    }
}

/// A specialized `Result` type for civicline operations.
pub type Result<T> = std::result::Result<T, CivicError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CivicError::Config("missing field".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing field");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: CivicError = io_err.into();
        assert!(matches!(err, CivicError::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_stale_write_display() {
        let id = Uuid::nil();
        let err = CivicError::StaleWrite {
            id,
            expected: 3,
            found: 4,
        };
        let msg = err.to_string();
        assert!(msg.contains("expected version 3"));
        assert!(msg.contains("found 4"));
    }

    #[test]
    fn test_error_from_toml_de() {
        let err: std::result::Result<toml::Value, _> = toml::from_str("invalid = [[[");
        let civic: CivicError = err.unwrap_err().into();
        assert!(matches!(civic, CivicError::Config(_)));
    }

    #[test]
    fn test_error_from_serde_json() {
        let err: std::result::Result<serde_json::Value, _> = serde_json::from_str("{ nope }");
        let civic: CivicError = err.unwrap_err().into();
        assert!(matches!(civic, CivicError::Serialization(_)));
    }

    #[test]
    fn test_result_type_with_question_mark() {
        fn inner() -> Result<String> {
            let io_result: std::result::Result<i32, std::io::Error> = Ok(42);
            let value = io_result?;
            Ok(value.to_string())
        }

        assert_eq!(inner().unwrap(), "42");
    }
}
