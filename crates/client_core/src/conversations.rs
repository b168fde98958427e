use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use shared::{
    domain::{ChatId, MessageId},
    protocol::{ConversationPayload, LatestMessage},
};
use tracing::debug;

use crate::{
    error::StaleStateError,
    reconciler::{ChatMessage, TOMBSTONE},
};

pub type Conversation = ConversationPayload;

/// Per-chat ids remembered for duplicate detection.
const RECENT_IDS_PER_CHAT: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexUpdate {
    Updated,
    Unchanged,
    /// No conversation is cached for the message's chat; the list must be
    /// fetched again.
    RefetchRequired(StaleStateError),
}

#[derive(Debug, Default)]
pub struct ConversationIndex {
    conversations: Vec<Conversation>,
    by_subject: HashMap<String, ChatId>,
    active_chat: Option<ChatId>,
    recent_ids: HashMap<ChatId, VecDeque<MessageId>>,
}

impl ConversationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn get(&self, chat_id: &ChatId) -> Option<&Conversation> {
        self.conversations
            .iter()
            .find(|conversation| &conversation.chat_id == chat_id)
    }

    pub fn total_unread(&self) -> u32 {
        self.conversations
            .iter()
            .fold(0u32, |total, conversation| {
                total.saturating_add(conversation.unread_count)
            })
    }

    pub fn active_chat(&self) -> Option<&ChatId> {
        self.active_chat.as_ref()
    }

    /// Messages for the active chat do not count as unread.
    pub fn set_active_chat(&mut self, chat_id: Option<ChatId>) {
        self.active_chat = chat_id;
    }

    /// Direct chat with the user named `username`, if one is cached.
    pub fn chat_for_subject(&self, username: &str) -> Option<&ChatId> {
        self.by_subject.get(username)
    }

    pub fn replace_all(&mut self, conversations: Vec<Conversation>) {
        self.conversations = conversations;
        self.rebuild_subject_index();
        self.sort();
    }

    pub fn on_message(&mut self, message: &ChatMessage) -> IndexUpdate {
        let is_active = self.active_chat.as_ref() == Some(&message.chat_id);
        let Some(conversation) = self
            .conversations
            .iter_mut()
            .find(|conversation| conversation.chat_id == message.chat_id)
        else {
            debug!(chat_id = %message.chat_id, "conversations: message for uncached chat");
            return IndexUpdate::RefetchRequired(StaleStateError {
                chat_id: message.chat_id.clone(),
            });
        };

        // The same message can arrive on the chat topic and the user topic.
        let is_latest = conversation
            .latest_message
            .as_ref()
            .is_some_and(|latest| latest.id == message.id);
        let recent = self.recent_ids.entry(message.chat_id.clone()).or_default();
        if is_latest || recent.contains(&message.id) {
            return IndexUpdate::Unchanged;
        }
        if recent.len() == RECENT_IDS_PER_CHAT {
            recent.pop_front();
        }
        recent.push_back(message.id.clone());

        let counts_unread = !message.is_own_message && !is_active;
        if counts_unread {
            conversation.unread_count = conversation.unread_count.saturating_add(1);
        }
        let is_newer = conversation
            .latest_message
            .as_ref()
            .map_or(true, |latest| latest.sent_at <= message.sent_at);
        if is_newer {
            conversation.latest_message = Some(message.latest_snapshot());
            conversation.updated_at = Some(message.sent_at);
        } else if !counts_unread {
            return IndexUpdate::Unchanged;
        }
        self.sort();
        IndexUpdate::Updated
    }

    pub fn on_message_edited(&mut self, chat_id: &ChatId, message_id: &MessageId, content: &str) -> bool {
        match self.latest_mut(chat_id, message_id) {
            Some(latest) if !latest.deleted && latest.content != content => {
                latest.content = content.to_string();
                true
            }
            _ => false,
        }
    }

    pub fn on_message_deleted(&mut self, chat_id: &ChatId, message_id: &MessageId) -> bool {
        match self.latest_mut(chat_id, message_id) {
            Some(latest) if !latest.deleted => {
                latest.deleted = true;
                latest.content = TOMBSTONE.to_string();
                latest.attachment = None;
                true
            }
            _ => false,
        }
    }

    /// Optimistic; never rolled back. The next full fetch reconciles.
    pub fn mark_read(&mut self, chat_id: &ChatId) -> bool {
        let Some(conversation) = self
            .conversations
            .iter_mut()
            .find(|conversation| &conversation.chat_id == chat_id)
        else {
            return false;
        };
        conversation.unread_count = 0;
        self.sort();
        true
    }

    pub fn on_conversation_created(&mut self, conversation: Conversation) {
        self.conversations
            .retain(|existing| existing.chat_id != conversation.chat_id);
        if let Some(target) = &conversation.target {
            self.by_subject
                .insert(target.username.clone(), conversation.chat_id.clone());
        }
        self.conversations.insert(0, conversation);
        self.sort();
    }

    fn latest_mut(
        &mut self,
        chat_id: &ChatId,
        message_id: &MessageId,
    ) -> Option<&mut LatestMessage> {
        self.conversations
            .iter_mut()
            .find(|conversation| &conversation.chat_id == chat_id)?
            .latest_message
            .as_mut()
            .filter(|latest| &latest.id == message_id)
    }

    fn rebuild_subject_index(&mut self) {
        self.by_subject = self
            .conversations
            .iter()
            .filter_map(|conversation| {
                let target = conversation.target.as_ref()?;
                Some((target.username.clone(), conversation.chat_id.clone()))
            })
            .collect();
    }

    /// Most recent first; undated conversations last. Stable, so a freshly
    /// prepended conversation stays ahead of equally dated ones.
    fn sort(&mut self) {
        self.conversations
            .sort_by(|a, b| activity_at(b).cmp(&activity_at(a)));
    }
}

fn activity_at(conversation: &Conversation) -> Option<DateTime<Utc>> {
    conversation.updated_at.or_else(|| {
        conversation
            .latest_message
            .as_ref()
            .map(|latest| latest.sent_at)
    })
}

#[cfg(test)]
#[path = "tests/conversations_tests.rs"]
mod tests;
