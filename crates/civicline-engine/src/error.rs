//! Errors from the session layer.
//!
//! Provider failures never appear here; they are absorbed into degraded
//! responses before reaching the session manager's callers.

use civicline_core::{ChannelKind, CivicError, ConversationState};
use uuid::Uuid;

/// Errors turning a transport event into an inbound message.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("no adapter registered for channel {0}")]
    Unsupported(ChannelKind),
    #[error("invalid inbound payload: {0}")]
    InvalidPayload(String),
}

/// Errors from the conversation engine.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Another request is creating the conversation for this key.
    #[error("conversation for user {user_id} on {channel} is being created concurrently")]
    Conflict { user_id: Uuid, channel: ChannelKind },
    #[error("conversation not found: {0}")]
    NotFound(Uuid),
    #[error("conversation {0} has ended")]
    Ended(Uuid),
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition {
        from: ConversationState,
        to: ConversationState,
    },
    #[error("message cannot be empty")]
    EmptyMessage,
    #[error("message exceeds maximum length of {0} characters")]
    MessageTooLong(usize),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("storage error: {0}")]
    Storage(#[from] CivicError),
}

impl SessionError {
    /// Whether the caller supplied bad input, as opposed to a system failure.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            SessionError::EmptyMessage
                | SessionError::MessageTooLong(_)
                | SessionError::Channel(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_error_display() {
        let id = Uuid::nil();
        let err = SessionError::Conflict {
            user_id: id,
            channel: ChannelKind::ShortText,
        };
        assert!(err.to_string().contains("short_text"));

        let err = SessionError::InvalidTransition {
            from: ConversationState::Ended,
            to: ConversationState::Active,
        };
        assert_eq!(err.to_string(), "invalid state transition: ended -> active");

        assert_eq!(
            SessionError::MessageTooLong(2000).to_string(),
            "message exceeds maximum length of 2000 characters"
        );
    }

    #[test]
    fn test_session_error_from_civic_error() {
        let err: SessionError = CivicError::Storage("disk full".to_string()).into();
        assert!(matches!(err, SessionError::Storage(_)));
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn test_validation_errors() {
        assert!(SessionError::EmptyMessage.is_validation());
        assert!(!SessionError::NotFound(Uuid::nil()).is_validation());
        let err: SessionError = ChannelError::InvalidPayload("missing sender".into()).into();
        assert!(err.is_validation());
        assert_eq!(err.to_string(), "invalid inbound payload: missing sender");
    }
}
