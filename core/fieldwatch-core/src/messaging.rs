//! Conversations between supervisors and workers.
//!
//! Messages are ordered by send time with an insertion sequence as the
//! tie-break. Send times are clamped so they never run backwards within a
//! conversation, which keeps timestamp order identical to send order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use crate::error::{FieldwatchError, Result};
use crate::registry::validate_id;
use crate::types::new_id;

const MAX_MESSAGE_CHARS: usize = 4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    Direct,
    Group,
}

impl ConversationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationKind::Direct => "direct",
            ConversationKind::Group => "group",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "direct" => Some(ConversationKind::Direct),
            "group" => Some(ConversationKind::Group),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub kind: ConversationKind,
    pub participants: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    pub sent_at: DateTime<Utc>,
    pub seq: u64,
    pub delivered: bool,
    /// True once every other participant has read it.
    pub read: bool,
    #[serde(default)]
    pub read_by: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationSummary {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub unread: u32,
}

#[derive(Debug)]
struct Thread {
    conversation: Conversation,
    messages: Vec<Message>,
    unread: BTreeMap<String, u32>,
}

impl Thread {
    fn require_participant(&self, participant_id: &str) -> Result<()> {
        if self.conversation.participants.iter().any(|p| p == participant_id) {
            Ok(())
        } else {
            Err(FieldwatchError::NotParticipant {
                conversation_id: self.conversation.id.clone(),
                participant_id: participant_id.to_string(),
            })
        }
    }

    fn refresh_read(&self, message: &mut Message) {
        message.read = self
            .conversation
            .participants
            .iter()
            .filter(|p| **p != message.sender_id)
            .all(|p| message.read_by.contains(p));
    }
}

#[derive(Debug, Default)]
struct Ledger {
    threads: HashMap<String, Thread>,
    next_seq: u64,
}

#[derive(Debug, Default)]
pub struct MessagingStore {
    ledger: Mutex<Ledger>,
}

impl MessagingStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Creates a conversation. A direct conversation between the same pair is
    /// returned as-is instead of being duplicated.
    pub fn create_conversation(
        &self,
        kind: ConversationKind,
        participants: Vec<String>,
        name: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Conversation> {
        let mut unique: Vec<String> = Vec::new();
        for participant in participants {
            validate_id(&participant, "participant id")?;
            if !unique.contains(&participant) {
                unique.push(participant);
            }
        }
        match kind {
            ConversationKind::Direct if unique.len() != 2 => {
                return Err(FieldwatchError::InvalidConversation(
                    "direct conversations need exactly two participants".to_string(),
                ));
            }
            ConversationKind::Group if unique.len() < 2 => {
                return Err(FieldwatchError::InvalidConversation(
                    "group conversations need at least two participants".to_string(),
                ));
            }
            _ => {}
        }

        let mut ledger = self.ledger();
        if kind == ConversationKind::Direct {
            if let Some(existing) = find_direct_in(&ledger, &unique[0], &unique[1]) {
                return Ok(existing);
            }
        }

        let conversation = Conversation {
            id: new_id("conv"),
            kind,
            participants: unique,
            name: name.filter(|n| !n.trim().is_empty()),
            created_at: now,
            last_message: None,
            last_message_at: None,
        };
        tracing::info!(
            conversation_id = %conversation.id,
            kind = kind.as_str(),
            participants = conversation.participants.len(),
            "Conversation created"
        );
        ledger.threads.insert(
            conversation.id.clone(),
            Thread {
                conversation: conversation.clone(),
                messages: Vec::new(),
                unread: BTreeMap::new(),
            },
        );
        Ok(conversation)
    }

    pub fn find_direct(&self, a: &str, b: &str) -> Option<Conversation> {
        find_direct_in(&self.ledger(), a, b)
    }

    pub fn conversation(&self, conversation_id: &str) -> Result<Conversation> {
        self.ledger()
            .threads
            .get(conversation_id)
            .map(|thread| thread.conversation.clone())
            .ok_or_else(|| FieldwatchError::UnknownConversation(conversation_id.to_string()))
    }

    /// Appends a message and bumps unread counters for everyone but the sender.
    pub fn send(
        &self,
        conversation_id: &str,
        sender_id: &str,
        content: &str,
        now: DateTime<Utc>,
    ) -> Result<Message> {
        let content = content.trim();
        if content.is_empty() {
            return Err(FieldwatchError::InvalidRequest(
                "message content is required".to_string(),
            ));
        }
        if content.chars().count() > MAX_MESSAGE_CHARS {
            return Err(FieldwatchError::InvalidRequest(format!(
                "message content must be {} characters or fewer",
                MAX_MESSAGE_CHARS
            )));
        }

        let mut ledger = self.ledger();
        let seq = ledger.next_seq;
        let thread = ledger
            .threads
            .get_mut(conversation_id)
            .ok_or_else(|| FieldwatchError::UnknownConversation(conversation_id.to_string()))?;
        thread.require_participant(sender_id)?;

        let sent_at = thread
            .messages
            .last()
            .map_or(now, |last| last.sent_at.max(now));
        let mut message = Message {
            id: new_id("msg"),
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            content: content.to_string(),
            sent_at,
            seq,
            delivered: true,
            read: false,
            read_by: BTreeSet::new(),
        };
        thread.refresh_read(&mut message);

        for participant in &thread.conversation.participants {
            if participant != sender_id {
                *thread.unread.entry(participant.clone()).or_insert(0) += 1;
            }
        }
        thread.conversation.last_message = Some(message.content.clone());
        thread.conversation.last_message_at = Some(sent_at);
        thread.messages.push(message.clone());
        ledger.next_seq = seq + 1;

        tracing::debug!(
            conversation_id = %conversation_id,
            sender_id = %sender_id,
            seq,
            "Message sent"
        );
        Ok(message)
    }

    /// Marks every message not sent by `reader_id` as read by them.
    /// Returns how many messages changed.
    pub fn mark_read(&self, conversation_id: &str, reader_id: &str) -> Result<usize> {
        let mut ledger = self.ledger();
        let thread = ledger
            .threads
            .get_mut(conversation_id)
            .ok_or_else(|| FieldwatchError::UnknownConversation(conversation_id.to_string()))?;
        thread.require_participant(reader_id)?;

        let mut messages = std::mem::take(&mut thread.messages);
        let mut changed = 0;
        for message in messages.iter_mut() {
            if message.sender_id == reader_id || message.read_by.contains(reader_id) {
                continue;
            }
            message.read_by.insert(reader_id.to_string());
            thread.refresh_read(message);
            changed += 1;
        }
        thread.messages = messages;
        thread.unread.insert(reader_id.to_string(), 0);
        Ok(changed)
    }

    pub fn unread_count(&self, conversation_id: &str, participant_id: &str) -> Result<u32> {
        let ledger = self.ledger();
        let thread = ledger
            .threads
            .get(conversation_id)
            .ok_or_else(|| FieldwatchError::UnknownConversation(conversation_id.to_string()))?;
        Ok(thread.unread.get(participant_id).copied().unwrap_or(0))
    }

    /// Conversations `participant_id` belongs to, most recent activity first.
    pub fn list_conversations(&self, participant_id: &str) -> Vec<ConversationSummary> {
        let ledger = self.ledger();
        let mut summaries: Vec<ConversationSummary> = ledger
            .threads
            .values()
            .filter(|thread| thread.conversation.participants.iter().any(|p| p == participant_id))
            .map(|thread| ConversationSummary {
                conversation: thread.conversation.clone(),
                unread: thread.unread.get(participant_id).copied().unwrap_or(0),
            })
            .collect();
        summaries.sort_by(|a, b| {
            let a_at = a.conversation.last_message_at.unwrap_or(a.conversation.created_at);
            let b_at = b.conversation.last_message_at.unwrap_or(b.conversation.created_at);
            b_at.cmp(&a_at)
                .then_with(|| a.conversation.id.cmp(&b.conversation.id))
        });
        summaries
    }

    /// Messages in send order.
    pub fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let ledger = self.ledger();
        let thread = ledger
            .threads
            .get(conversation_id)
            .ok_or_else(|| FieldwatchError::UnknownConversation(conversation_id.to_string()))?;
        let mut messages = thread.messages.clone();
        messages.sort_by(|a, b| a.sent_at.cmp(&b.sent_at).then(a.seq.cmp(&b.seq)));
        Ok(messages)
    }

    /// Reloads a persisted conversation with its messages; unread counters are rebuilt.
    pub fn restore(&self, conversation: Conversation, mut messages: Vec<Message>) {
        messages.sort_by(|a, b| a.sent_at.cmp(&b.sent_at).then(a.seq.cmp(&b.seq)));
        let mut unread = BTreeMap::new();
        for message in &messages {
            for participant in &conversation.participants {
                if *participant != message.sender_id && !message.read_by.contains(participant) {
                    *unread.entry(participant.clone()).or_insert(0) += 1;
                }
            }
        }

        let mut ledger = self.ledger();
        let max_seq = messages.iter().map(|m| m.seq + 1).max().unwrap_or(0);
        ledger.next_seq = ledger.next_seq.max(max_seq);
        ledger.threads.insert(
            conversation.id.clone(),
            Thread {
                conversation,
                messages,
                unread,
            },
        );
    }
}

fn find_direct_in(ledger: &Ledger, a: &str, b: &str) -> Option<Conversation> {
    ledger
        .threads
        .values()
        .map(|thread| &thread.conversation)
        .find(|conversation| {
            conversation.kind == ConversationKind::Direct
                && conversation.participants.len() == 2
                && conversation.participants.iter().any(|p| p == a)
                && conversation.participants.iter().any(|p| p == b)
        })
        .cloned()
}
