use uuid::Uuid;

use crate::error::{CivicError, Result};
use crate::types::{ChannelKind, Conversation, Interaction, User};

/// Durable home of users, conversations and interaction records.
///
/// Implementations must make `save_conversation` an atomic
/// compare-and-swap on `version`, and must reject any change to messages
/// that were already stored.
pub trait ConversationStore: Send + Sync {
    fn get_user(&self, id: Uuid) -> Result<Option<User>>;

    fn find_user_by_contact(&self, contact_handle: &str) -> Result<Option<User>>;

    fn upsert_user(&self, user: &User) -> Result<()>;

    /// Remove a user with their conversations. Interaction records are kept
    /// with the user link cleared. Returns `false` if the user did not exist.
    fn delete_user(&self, id: Uuid) -> Result<bool>;

    /// The non-ended conversation for `(user, channel)`, if any.
    fn find_open_conversation(&self, user_id: Uuid, channel: ChannelKind)
        -> Result<Option<Conversation>>;

    fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>>;

    /// Store a new conversation. Fails with `Conflict` if an open
    /// conversation already exists for the same `(user, channel)`.
    fn insert_conversation(&self, conversation: &Conversation) -> Result<()>;

    /// Replace a stored conversation whose version is `conversation.version - 1`.
    fn save_conversation(&self, conversation: &Conversation) -> Result<()>;

    fn list_open_conversations(&self) -> Result<Vec<Conversation>>;

    fn record_interaction(&self, interaction: &Interaction) -> Result<()>;

    fn interactions_for_user(&self, user_id: Uuid) -> Result<Vec<Interaction>>;
}

/// Version and append-only checks every `save_conversation` must apply.
pub fn check_save(stored: &Conversation, new: &Conversation) -> Result<()> {
    if stored.version + 1 != new.version {
        return Err(CivicError::StaleWrite {
            id: new.id,
            expected: new.version.saturating_sub(1),
            found: stored.version,
        });
    }
    if new.messages.len() < stored.messages.len()
        || stored
            .messages
            .iter()
            .zip(new.messages.iter())
            .any(|(a, b)| a != b)
    {
        return Err(CivicError::AppendOnly(new.id));
    }
    Ok(())
}
