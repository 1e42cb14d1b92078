//! Conversation state machine with validated transitions.
//!
//! Created -> Active <-> Idle, and any open state -> Ended.

use civicline_core::{Conversation, ConversationState, EndReason};
use chrono::{DateTime, Duration, Utc};

use crate::error::SessionError;

/// Validate that a state transition is allowed.
pub fn validate_transition(
    from: ConversationState,
    to: ConversationState,
) -> Result<(), SessionError> {
    use civicline_core::ConversationState::*;

    let valid = matches!(
        (from, to),
        (Created, Active) | (Active, Idle) | (Idle, Active) | (Created | Active | Idle, Ended)
    );

    if valid {
        Ok(())
    } else {
        Err(SessionError::InvalidTransition { from, to })
    }
}

/// Apply a validated transition to a conversation.
pub fn transition(
    conversation: &mut Conversation,
    to: ConversationState,
) -> Result<(), SessionError> {
    validate_transition(conversation.state, to)?;
    conversation.state = to;
    Ok(())
}

/// Move a conversation to `Ended`, stamping the reason and time.
pub fn end(
    conversation: &mut Conversation,
    reason: EndReason,
    at: DateTime<Utc>,
) -> Result<(), SessionError> {
    transition(conversation, ConversationState::Ended)?;
    conversation.ended_at = Some(at);
    conversation.end_reason = Some(reason);
    Ok(())
}

/// Whether an active conversation has been quiet for longer than `timeout`.
pub fn is_idle_expired(conversation: &Conversation, timeout: Duration, now: DateTime<Utc>) -> bool {
    conversation.state == ConversationState::Active && now - conversation.last_activity_at > timeout
}
