use chrono::{DateTime, Utc};
use shared::{
    domain::{ChatCommand, ChatId, MessageId, MessageType, UserId},
    protocol::{AttachmentPayload, LatestMessage, MessageEnvelope, UserSummary},
};
use tracing::{debug, warn};

use crate::error::ProtocolError;

/// Content shown in place of a soft-deleted message.
pub const TOMBSTONE: &str = "This message was deleted";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub sender: UserSummary,
    pub content: String,
    pub attachment: Option<AttachmentPayload>,
    pub message_type: MessageType,
    pub sent_at: DateTime<Utc>,
    pub edited: bool,
    pub edited_at: Option<DateTime<Utc>>,
    pub deleted: bool,
    /// Fixed at ingestion.
    pub is_own_message: bool,
}

impl ChatMessage {
    pub fn latest_snapshot(&self) -> LatestMessage {
        LatestMessage {
            id: self.id.clone(),
            content: self.content.clone(),
            sender: self.sender.clone(),
            sent_at: self.sent_at,
            message_type: self.message_type,
            attachment: self.attachment.clone(),
            deleted: self.deleted,
        }
    }

    fn sort_key(&self) -> (DateTime<Utc>, &MessageId) {
        (self.sent_at, &self.id)
    }

    fn tombstone(&mut self) {
        self.deleted = true;
        self.content = TOMBSTONE.to_string();
        self.attachment = None;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    New(ChatMessage),
    Edit {
        id: MessageId,
        content: String,
        edited_at: Option<DateTime<Utc>>,
    },
    Delete {
        id: MessageId,
    },
}

impl ChatEvent {
    pub fn message_id(&self) -> &MessageId {
        match self {
            Self::New(message) => &message.id,
            Self::Edit { id, .. } | Self::Delete { id } => id,
        }
    }
}

/// Turns an inbound envelope into the chat it belongs to and the event to
/// apply. `topic_chat` is used when the payload omits `chatId`.
pub fn parse_event(
    envelope: MessageEnvelope,
    topic_chat: Option<&ChatId>,
    subject_id: Option<&UserId>,
) -> Result<(ChatId, ChatEvent), ProtocolError> {
    let chat_id = envelope
        .chat_id
        .clone()
        .or_else(|| topic_chat.cloned())
        .ok_or_else(|| missing(&envelope.id, "chatId"))?;

    let event = match envelope.command {
        Some(ChatCommand::Edit) => {
            let content = envelope
                .content
                .ok_or_else(|| missing(&envelope.id, "message"))?;
            ChatEvent::Edit {
                id: envelope.id,
                content,
                edited_at: envelope.edited_at,
            }
        }
        Some(ChatCommand::Delete) => ChatEvent::Delete { id: envelope.id },
        None => ChatEvent::New(message_from_envelope(envelope, &chat_id, subject_id)?),
    };
    Ok((chat_id, event))
}

fn message_from_envelope(
    envelope: MessageEnvelope,
    chat_id: &ChatId,
    subject_id: Option<&UserId>,
) -> Result<ChatMessage, ProtocolError> {
    let sender = envelope
        .sender
        .ok_or_else(|| missing(&envelope.id, "sender"))?;
    let sent_at = envelope
        .sent_at
        .ok_or_else(|| missing(&envelope.id, "sentAt"))?;
    let is_own_message = subject_id.is_some_and(|subject| *subject == sender.id);

    let mut message = ChatMessage {
        id: envelope.id,
        chat_id: chat_id.clone(),
        sender,
        content: envelope.content.unwrap_or_default(),
        attachment: envelope.attachment,
        message_type: envelope.message_type.unwrap_or_default(),
        sent_at,
        edited: envelope.edited || envelope.edited_at.is_some(),
        edited_at: envelope.edited_at,
        deleted: false,
        is_own_message,
    };
    if envelope.deleted {
        message.tombstone();
    }
    Ok(message)
}

fn missing(id: &MessageId, field: &'static str) -> ProtocolError {
    ProtocolError::MissingField {
        id: id.to_string(),
        field,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Inserted,
    Duplicate,
    Edited,
    Deleted,
    /// The event was already reflected (older edit, repeated delete).
    Unchanged,
    /// The target id is not loaded; tolerated.
    Missing,
}

impl ApplyOutcome {
    pub fn changed(self) -> bool {
        matches!(self, Self::Inserted | Self::Edited | Self::Deleted)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistoryMerge {
    pub inserted: usize,
    pub duplicates: usize,
    pub dropped: usize,
}

#[derive(Debug, Clone)]
pub struct MessageReconciler {
    chat_id: ChatId,
    subject_id: Option<UserId>,
    messages: Vec<ChatMessage>,
    next_page: u32,
    has_more: bool,
}

impl MessageReconciler {
    pub fn new(chat_id: ChatId, subject_id: Option<UserId>) -> Self {
        Self {
            chat_id,
            subject_id,
            messages: Vec::new(),
            next_page: 0,
            has_more: true,
        }
    }

    pub fn chat_id(&self) -> &ChatId {
        &self.chat_id
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn get(&self, id: &MessageId) -> Option<&ChatMessage> {
        self.messages.iter().find(|message| &message.id == id)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn latest(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }

    pub fn next_page(&self) -> u32 {
        self.next_page
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    /// Merges one history page. Entries already present win over the page
    /// copy; malformed entries are logged and skipped.
    pub fn merge_history(
        &mut self,
        page: u32,
        page_size: u32,
        envelopes: Vec<MessageEnvelope>,
    ) -> HistoryMerge {
        let mut report = HistoryMerge::default();
        let received = envelopes.len();
        for envelope in envelopes {
            let id = envelope.id.clone();
            match message_from_envelope(envelope, &self.chat_id, self.subject_id.as_ref()) {
                Ok(message) => match self.insert(message) {
                    ApplyOutcome::Inserted => report.inserted += 1,
                    _ => report.duplicates += 1,
                },
                Err(err) => {
                    warn!(chat_id = %self.chat_id, message_id = %id, "reconciler: dropping history entry: {err}");
                    report.dropped += 1;
                }
            }
        }
        if page >= self.next_page {
            self.next_page = page + 1;
            self.has_more = received as u64 >= u64::from(page_size.max(1));
        }
        debug!(
            chat_id = %self.chat_id,
            page,
            inserted = report.inserted,
            duplicates = report.duplicates,
            "reconciler: history merged"
        );
        report
    }

    pub fn apply(&mut self, event: ChatEvent) -> ApplyOutcome {
        self.apply_at(event, Utc::now())
    }

    /// `now` stands in for a missing `editedAt`.
    pub fn apply_at(&mut self, event: ChatEvent, now: DateTime<Utc>) -> ApplyOutcome {
        match event {
            ChatEvent::New(message) => self.insert(message),
            ChatEvent::Edit {
                id,
                content,
                edited_at,
            } => self.edit(&id, content, edited_at.unwrap_or(now)),
            ChatEvent::Delete { id } => self.delete(&id),
        }
    }

    fn insert(&mut self, message: ChatMessage) -> ApplyOutcome {
        if self.get(&message.id).is_some() {
            debug!(chat_id = %self.chat_id, message_id = %message.id, "reconciler: duplicate ignored");
            return ApplyOutcome::Duplicate;
        }
        let position = self
            .messages
            .partition_point(|existing| existing.sort_key() <= message.sort_key());
        self.messages.insert(position, message);
        ApplyOutcome::Inserted
    }

    /// Last writer wins by `editedAt`, content breaking ties. A tombstoned
    /// message only records the edit time.
    fn edit(&mut self, id: &MessageId, content: String, edited_at: DateTime<Utc>) -> ApplyOutcome {
        let Some(message) = self.messages.iter_mut().find(|message| &message.id == id) else {
            debug!(chat_id = %self.chat_id, message_id = %id, "reconciler: edit for unknown message ignored");
            return ApplyOutcome::Missing;
        };

        if message.deleted {
            if message.edited_at.is_some_and(|current| current >= edited_at) {
                return ApplyOutcome::Unchanged;
            }
            message.edited = true;
            message.edited_at = Some(edited_at);
            return ApplyOutcome::Edited;
        }

        if let Some(current) = message.edited_at {
            if (edited_at, content.as_str()) <= (current, message.content.as_str()) {
                return ApplyOutcome::Unchanged;
            }
        }
        message.content = content;
        message.edited = true;
        message.edited_at = Some(edited_at);
        ApplyOutcome::Edited
    }

    fn delete(&mut self, id: &MessageId) -> ApplyOutcome {
        let Some(message) = self.messages.iter_mut().find(|message| &message.id == id) else {
            debug!(chat_id = %self.chat_id, message_id = %id, "reconciler: delete for unknown message ignored");
            return ApplyOutcome::Missing;
        };
        if message.deleted {
            return ApplyOutcome::Unchanged;
        }
        message.tombstone();
        ApplyOutcome::Deleted
    }
}

#[cfg(test)]
#[path = "tests/reconciler_tests.rs"]
mod tests;
