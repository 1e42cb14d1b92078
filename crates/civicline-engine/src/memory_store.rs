//! In-memory [`ConversationStore`] for tests and storage-less deployments.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use civicline_core::store::check_save;
use civicline_core::{
    ChannelKind, CivicError, Conversation, ConversationStore, Interaction, Result, User,
};
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    users: HashMap<Uuid, User>,
    conversations: HashMap<Uuid, Conversation>,
    interactions: Vec<Interaction>,
}

#[derive(Default)]
pub struct InMemoryConversationStore {
    tables: Mutex<Tables>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|e| CivicError::Storage(format!("store lock poisoned: {}", e)))
    }

    /// Every interaction record, including unlinked ones.
    pub fn all_interactions(&self) -> Result<Vec<Interaction>> {
        Ok(self.lock()?.interactions.clone())
    }

    pub fn conversation_count(&self) -> Result<usize> {
        Ok(self.lock()?.conversations.len())
    }
}

impl ConversationStore for InMemoryConversationStore {
    fn get_user(&self, id: Uuid) -> Result<Option<User>> {
        Ok(self.lock()?.users.get(&id).cloned())
    }

    fn find_user_by_contact(&self, contact_handle: &str) -> Result<Option<User>> {
        Ok(self
            .lock()?
            .users
            .values()
            .find(|u| u.contact_handle == contact_handle)
            .cloned())
    }

    fn upsert_user(&self, user: &User) -> Result<()> {
        let mut tables = self.lock()?;
        if tables
            .users
            .values()
            .any(|u| u.id != user.id && u.contact_handle == user.contact_handle)
        {
            return Err(CivicError::Conflict(format!(
                "contact handle already registered to another user than {}",
                user.id
            )));
        }
        tables.users.insert(user.id, user.clone());
        Ok(())
    }

    fn delete_user(&self, id: Uuid) -> Result<bool> {
        let mut tables = self.lock()?;
        if tables.users.remove(&id).is_none() {
            return Ok(false);
        }
        tables.conversations.retain(|_, c| c.user_id != id);
        for interaction in tables.interactions.iter_mut() {
            if interaction.user_id == Some(id) {
                interaction.user_id = None;
            }
        }
        Ok(true)
    }

    fn find_open_conversation(
        &self,
        user_id: Uuid,
        channel: ChannelKind,
    ) -> Result<Option<Conversation>> {
        Ok(self
            .lock()?
            .conversations
            .values()
            .find(|c| c.user_id == user_id && c.channel == channel && c.is_open())
            .cloned())
    }

    fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>> {
        Ok(self.lock()?.conversations.get(&id).cloned())
    }

    fn insert_conversation(&self, conversation: &Conversation) -> Result<()> {
        let mut tables = self.lock()?;
        let duplicate = tables.conversations.values().any(|c| {
            c.user_id == conversation.user_id && c.channel == conversation.channel && c.is_open()
        });
        if duplicate {
            return Err(CivicError::Conflict(format!(
                "open conversation exists for user {} on {}",
                conversation.user_id, conversation.channel
            )));
        }
        if tables.conversations.contains_key(&conversation.id) {
            return Err(CivicError::Conflict(format!(
                "conversation {} already exists",
                conversation.id
            )));
        }
        tables
            .conversations
            .insert(conversation.id, conversation.clone());
        Ok(())
    }

    fn save_conversation(&self, conversation: &Conversation) -> Result<()> {
        let mut tables = self.lock()?;
        let stored = tables
            .conversations
            .get(&conversation.id)
            .ok_or_else(|| CivicError::NotFound(format!("conversation {}", conversation.id)))?;
        check_save(stored, conversation)?;
        tables
            .conversations
            .insert(conversation.id, conversation.clone());
        Ok(())
    }

    fn list_open_conversations(&self) -> Result<Vec<Conversation>> {
        Ok(self
            .lock()?
            .conversations
            .values()
            .filter(|c| c.is_open())
            .cloned()
            .collect())
    }

    fn record_interaction(&self, interaction: &Interaction) -> Result<()> {
        let mut tables = self.lock()?;
        if tables.interactions.iter().any(|i| i.id == interaction.id) {
            return Err(CivicError::Conflict(format!(
                "interaction {} already recorded",
                interaction.id
            )));
        }
        tables.interactions.push(interaction.clone());
        Ok(())
    }

    fn interactions_for_user(&self, user_id: Uuid) -> Result<Vec<Interaction>> {
        Ok(self
            .lock()?
            .interactions
            .iter()
            .filter(|i| i.user_id == Some(user_id))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use civicline_core::{
        ConversationState, InteractionAction, LanguageCode, LanguageProfile, LanguageSource,
        MessageKind, Sender,
    };

    fn conversation(user_id: Uuid, channel: ChannelKind) -> Conversation {
        Conversation::new(
            user_id,
            channel,
            LanguageProfile::new(LanguageCode::new("en"), LanguageSource::SystemDefault),
        )
    }

    #[test]
    fn test_insert_rejects_second_open_conversation() {
        let store = InMemoryConversationStore::new();
        let user = Uuid::new_v4();
        store.insert_conversation(&conversation(user, ChannelKind::ShortText)).unwrap();
        let err = store
            .insert_conversation(&conversation(user, ChannelKind::ShortText))
            .unwrap_err();
        assert!(matches!(err, CivicError::Conflict(_)));
        // Other channel is independent.
        store.insert_conversation(&conversation(user, ChannelKind::Voice)).unwrap();
    }

    #[test]
    fn test_insert_allowed_after_end() {
        let store = InMemoryConversationStore::new();
        let user = Uuid::new_v4();
        let mut first = conversation(user, ChannelKind::ShortText);
        store.insert_conversation(&first).unwrap();
        first.state = ConversationState::Ended;
        first.version = 1;
        store.save_conversation(&first).unwrap();
        store.insert_conversation(&conversation(user, ChannelKind::ShortText)).unwrap();
        assert!(store.find_open_conversation(user, ChannelKind::ShortText).unwrap().is_some());
    }

    #[test]
    fn test_save_requires_next_version() {
        let store = InMemoryConversationStore::new();
        let mut conv = conversation(Uuid::new_v4(), ChannelKind::InteractiveWeb);
        store.insert_conversation(&conv).unwrap();

        conv.version = 2;
        let err = store.save_conversation(&conv).unwrap_err();
        assert!(matches!(err, CivicError::StaleWrite { found: 0, .. }));

        conv.version = 1;
        store.save_conversation(&conv).unwrap();
        assert!(store.save_conversation(&conv).is_err());
    }

    #[test]
    fn test_save_rejects_mutated_messages() {
        let store = InMemoryConversationStore::new();
        let mut conv = conversation(Uuid::new_v4(), ChannelKind::InteractiveWeb);
        let en = LanguageCode::new("en");
        conv.append_message(Sender::User, MessageKind::Text, "hello", en.clone(), None);
        store.insert_conversation(&conv).unwrap();

        let mut edited = conv.clone();
        edited.version = 1;
        edited.messages[0].content = "changed".into();
        assert!(matches!(
            store.save_conversation(&edited),
            Err(CivicError::AppendOnly(_))
        ));

        let mut truncated = conv.clone();
        truncated.version = 1;
        truncated.messages.clear();
        assert!(matches!(
            store.save_conversation(&truncated),
            Err(CivicError::AppendOnly(_))
        ));

        let mut appended = conv.clone();
        appended.version = 1;
        appended.append_message(Sender::System, MessageKind::Text, "hi", en, None);
        store.save_conversation(&appended).unwrap();
    }

    #[test]
    fn test_delete_user_unlinks_interactions() {
        let store = InMemoryConversationStore::new();
        let user = User::new(Uuid::new_v4(), "+91");
        store.upsert_user(&user).unwrap();
        store.insert_conversation(&conversation(user.id, ChannelKind::ShortText)).unwrap();
        store
            .record_interaction(&Interaction::new(user.id, InteractionAction::TurnCompleted))
            .unwrap();

        assert!(store.delete_user(user.id).unwrap());
        assert!(store.get_user(user.id).unwrap().is_none());
        assert_eq!(store.conversation_count().unwrap(), 0);
        assert!(store.interactions_for_user(user.id).unwrap().is_empty());
        let all = store.all_interactions().unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].user_id.is_none());

        assert!(!store.delete_user(user.id).unwrap());
    }

    #[test]
    fn test_interactions_are_write_once() {
        let store = InMemoryConversationStore::new();
        let interaction = Interaction::new(Uuid::new_v4(), InteractionAction::ResourceOffered);
        store.record_interaction(&interaction).unwrap();
        assert!(store.record_interaction(&interaction).is_err());
    }

    #[test]
    fn test_find_user_by_contact() {
        let store = InMemoryConversationStore::new();
        let user = User::new(Uuid::new_v4(), "+915550001");
        store.upsert_user(&user).unwrap();
        assert_eq!(
            store.find_user_by_contact("+915550001").unwrap().map(|u| u.id),
            Some(user.id)
        );
        assert!(store.find_user_by_contact("+000").unwrap().is_none());
    }

    #[test]
    fn test_upsert_rejects_duplicate_contact_handle() {
        let store = InMemoryConversationStore::new();
        let mut first = User::new(Uuid::new_v4(), "+915550002");
        store.upsert_user(&first).unwrap();

        let second = User::new(Uuid::new_v4(), "+915550002");
        assert!(matches!(store.upsert_user(&second), Err(CivicError::Conflict(_))));

        // Updating the owner of the handle is still allowed.
        first.preferred_language = Some(civicline_core::LanguageCode::new("ta"));
        store.upsert_user(&first).unwrap();
        assert_eq!(
            store.find_user_by_contact("+915550002").unwrap().map(|u| u.id),
            Some(first.id)
        );
    }
}
